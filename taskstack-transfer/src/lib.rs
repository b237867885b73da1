//! Attachment transfers for TaskStack.
//!
//! [`TransferCoordinator`] moves attachment bytes between the local
//! [`LocalCache`] and a [`RemoteObjectStore`], separately from event sync:
//!
//! - quota and cellular gates that ask the user through [`DecisionRequest`]s
//!   instead of failing silently
//! - a [`WifiQueue`] drained when [`NetworkMonitor`] reports WiFi
//! - chunked, resumable transfers bounded by a semaphore, with progress on a
//!   `watch` channel and state persisted in a SQLite [`TransferStore`]

mod cache;
mod config;
mod coordinator;
mod decision;
mod error;
mod network;
mod policy;
mod queue;
mod remote;
mod store;
mod types;

pub use cache::LocalCache;
pub use config::TransferConfig;
pub use coordinator::TransferCoordinator;
pub use decision::{decision_channel, CellularDecision, DecisionRequest, QuotaDecision};
pub use error::{TransferError, TransferResult};
pub use network::{NetworkMonitor, NetworkStatus};
pub use policy::{check_quota, should_prompt_cellular, QuotaCheck};
pub use queue::WifiQueue;
pub use remote::{HttpObjectStore, RemoteObjectStore, OBJECT_SIZE_HEADER};
pub use store::TransferStore;
pub use types::{
    Attachment, Direction, DownloadOutcome, TransferKey, TransferProgress, TransferRecord,
    TransferState, UploadOutcome, ATTACHMENT_ENTITY,
};
