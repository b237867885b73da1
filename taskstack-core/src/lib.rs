//! TaskStack core.
//!
//! Opens the local store and wires the sync manager, initial-sync
//! bootstrapper and attachment transfer coordinator around it:
//!
//! ```text
//!   CoreConfig ──▶ Core::open ──▶ LocalStore (DuckDB)
//!                              ├─▶ SyncManager + Bootstrapper ──▶ sync service
//!                              └─▶ TransferCoordinator ──▶ object service
//! ```
//!
//! Hosts call [`init_logging`] once, open a [`Core`], [`Core::start`] it,
//! and write through [`Core::ledger`].

mod config;
mod error;
mod lifecycle;
mod logging;

pub use config::CoreConfig;
pub use error::{CoreError, CoreResult};
pub use lifecycle::{Core, Host};
pub use logging::{init_logging, init_logging_with};

pub use taskstack_storage as storage;
pub use taskstack_sync as sync;
pub use taskstack_transfer as transfer;
pub use taskstack_types as types;
