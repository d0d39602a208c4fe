//! Replication primitive and remote collections.

mod remote;
mod replicator;
mod retry;

pub use remote::{
    DeniedDoc, Endpoint, MemoryRemote, MemoryServer, PushResponse, Remote, RemoteConnector,
};
pub use replicator::{
    Direction, DocFilter, Flow, PassReport, Replication, ReplicationEvent, ReplicationObserver,
    SyncOptions,
};
pub use retry::RetryPolicy;
