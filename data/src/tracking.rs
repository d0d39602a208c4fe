//! Error tracking around service calls.

use serde_json::Value;
use std::future::Future;

/// A failed operation, as seen by a tracker.
#[derive(Debug)]
pub struct ErrorReport<'a> {
    pub operation: &'a str,
    pub metadata: &'a Value,
    pub error: &'a (dyn std::error::Error + 'static),
}

/// Receives failures from tracked operations.
pub trait ErrorTracker: Send + Sync {
    fn track(&self, report: &ErrorReport<'_>);
}

/// Logs tracked failures through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTracker;

impl ErrorTracker for TracingTracker {
    fn track(&self, report: &ErrorReport<'_>) {
        tracing::error!(
            operation = report.operation,
            metadata = %report.metadata,
            error = %report.error,
            "Operation failed"
        );
    }
}

/// Await `fut`, forwarding any error to `tracker` before returning it.
pub async fn tracked<T, E, F>(
    tracker: &dyn ErrorTracker,
    operation: &str,
    metadata: Value,
    fut: F,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + 'static,
{
    let result = fut.await;
    if let Err(error) = &result {
        tracker.track(&ErrorReport {
            operation,
            metadata: &metadata,
            error,
        });
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DataError;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collecting {
        seen: Mutex<Vec<(String, Value, String)>>,
    }

    impl ErrorTracker for Collecting {
        fn track(&self, report: &ErrorReport<'_>) {
            self.seen.lock().unwrap().push((
                report.operation.to_string(),
                report.metadata.clone(),
                report.error.to_string(),
            ));
        }
    }

    #[tokio::test]
    async fn errors_are_reported_and_returned() {
        let tracker = Collecting::default();
        let result: Result<(), DataError> = tracked(
            &tracker,
            "customers.create",
            json!({"document": "DOC123"}),
            async { Err(DataError::duplicate("document", "DOC123")) },
        )
        .await;

        assert!(result.unwrap_err().is_conflict());
        let seen = tracker.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "customers.create");
        assert_eq!(seen[0].1["document"], "DOC123");
    }

    #[tokio::test]
    async fn success_is_not_reported() {
        let tracker = Collecting::default();
        let value = tracked(&tracker, "products.get", Value::Null, async {
            Ok::<_, DataError>(7)
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert!(tracker.seen.lock().unwrap().is_empty());
    }
}
