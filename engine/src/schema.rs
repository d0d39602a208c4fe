//! Document body schemas.
//!
//! A schema lists the fields a body must or may carry. Validation runs before
//! a write reaches the store, so a malformed body never costs a store round
//! trip.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    /// Milliseconds since epoch
    Timestamp,
    Array,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FieldType::String => "String",
            FieldType::Int => "Int",
            FieldType::Float => "Float",
            FieldType::Bool => "Bool",
            FieldType::Timestamp => "Timestamp",
            FieldType::Array => "Array",
            FieldType::Json => "Json",
        };
        f.write_str(name)
    }
}

/// Definition of a field in a document body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
    /// Closed set of accepted string values, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<String>>,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
            allowed: None,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            allowed: None,
        }
    }

    /// Required string field restricted to a fixed set of values.
    pub fn one_of(name: impl Into<String>, values: &[&str]) -> Self {
        Self {
            allowed: Some(values.iter().map(|v| v.to_string()).collect()),
            ..Self::required(name, FieldType::String)
        }
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&serde_json::Value>) -> Result<()> {
        match value {
            None | Some(serde_json::Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            None | Some(serde_json::Value::Null) => Ok(()),
            Some(v) => {
                self.validate_type(v)?;
                self.validate_allowed(v)
            }
        }
    }

    fn validate_type(&self, value: &serde_json::Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64() || value.is_i64(),
            FieldType::Array => value.is_array(),
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }

    fn validate_allowed(&self, value: &serde_json::Value) -> Result<()> {
        let Some(allowed) = &self.allowed else {
            return Ok(());
        };
        match value.as_str() {
            Some(s) if allowed.iter().any(|a| a == s) => Ok(()),
            _ => Err(Error::NotAllowed {
                field: self.name.clone(),
                allowed: allowed.join(", "),
                got: value.to_string(),
            }),
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "Null",
        serde_json::Value::Bool(_) => "Bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        serde_json::Value::Number(_) => "Float",
        serde_json::Value::String(_) => "String",
        serde_json::Value::Array(_) => "Array",
        serde_json::Value::Object(_) => "Object",
    }
}

/// Schema for the bodies of one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    pub name: String,
    pub fields: Vec<FieldDef>,
}

impl Schema {
    pub fn new(name: impl Into<String>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// Validate a body against this schema.
    ///
    /// Fields not listed in the schema are accepted as-is.
    pub fn validate(&self, body: &serde_json::Value) -> Result<()> {
        let obj = body
            .as_object()
            .ok_or_else(|| Error::InvalidDocument("body must be an object".into()))?;

        for field in &self.fields {
            field.validate(obj.get(&field.name))?;
        }

        Ok(())
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn order_schema() -> Schema {
        Schema::new(
            "orders",
            vec![
                FieldDef::one_of("status", &["pending", "completed", "cancelled"]),
                FieldDef::required("terminalId", FieldType::String),
                FieldDef::required("total", FieldType::Float),
                FieldDef::optional("items", FieldType::Array),
            ],
        )
    }

    #[test]
    fn validate_valid_body() {
        let schema = order_schema();
        let body = json!({"status": "pending", "terminalId": "T1", "total": 12.5});
        assert!(schema.validate(&body).is_ok());

        let with_optional = json!({"status": "completed", "terminalId": "T1", "total": 3, "items": []});
        assert!(schema.validate(&with_optional).is_ok());
    }

    #[test]
    fn validate_missing_required_field() {
        let schema = order_schema();
        let result = schema.validate(&json!({"status": "pending", "total": 1}));
        assert!(matches!(result, Err(Error::MissingRequiredField(f)) if f == "terminalId"));
    }

    #[test]
    fn validate_wrong_type() {
        let schema = order_schema();
        let result = schema.validate(&json!({"status": "pending", "terminalId": 7, "total": 1}));
        assert!(matches!(result, Err(Error::TypeMismatch { field, .. }) if field == "terminalId"));
    }

    #[test]
    fn validate_null_required_field() {
        let schema = order_schema();
        let result = schema.validate(&json!({"status": null, "terminalId": "T1", "total": 1}));
        assert!(matches!(result, Err(Error::MissingRequiredField(f)) if f == "status"));
    }

    #[test]
    fn validate_value_outside_allowed_set() {
        let schema = order_schema();
        let result = schema.validate(&json!({"status": "refunded", "terminalId": "T1", "total": 1}));
        assert!(matches!(result, Err(Error::NotAllowed { field, .. }) if field == "status"));
    }

    #[test]
    fn body_must_be_object() {
        let schema = order_schema();
        assert!(matches!(
            schema.validate(&json!(["status"])),
            Err(Error::InvalidDocument(_))
        ));
    }

    #[test]
    fn json_field_accepts_any() {
        let schema = Schema::new("events", vec![FieldDef::required("data", FieldType::Json)]);
        for data in [json!("s"), json!(1), json!(true), json!([1]), json!({"a": 1})] {
            assert!(schema.validate(&json!({ "data": data })).is_ok());
        }
    }

    #[test]
    fn schema_serialization() {
        let schema = order_schema();
        let text = serde_json::to_string(&schema).unwrap();
        let parsed: Schema = serde_json::from_str(&text).unwrap();
        assert_eq!(schema, parsed);
    }
}
