//! snapship: scheduled, incremental replication of btrfs subvolume snapshots
//! to a remote host over ssh, with independent local/remote retention.

// Base: configuration, errors, time
pub mod config;
pub mod error;
pub mod timestamp;

// Host plumbing: processes, cancellation, local btrfs, remote over ssh
pub mod btrfs;
pub mod cancel;
pub mod exec;
pub mod remote;

// Backup engine
pub mod orchestrator;
pub mod parent;
pub mod probe;
pub mod retention;
pub mod snapshot;
pub mod transfer;

// Run support
pub mod lock;
pub mod logging;
pub mod metrics;
pub mod report;

pub use config::{BackupConfig, RetentionPolicy, Subvolume};
pub use error::{RunError, SnapshotError, Stage, TransferFailed};
pub use orchestrator::{Backend, BackupOutcome, Orchestrator, RunSummary};
pub use snapshot::{Side, Snapshot, SnapshotHistory, SnapshotManager};
pub use timestamp::{Clock, NameCodec, Timestamp};
pub use transfer::TransferMode;
