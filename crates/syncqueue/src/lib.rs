//! `syncqueue` - An offline-resilient write queue
//!
//! This library records write intents in durable local storage, dispatches
//! them to a remote persistence service when the device is online, and
//! retries failed writes with progressive backoff.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod cli;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod item;
pub mod logging;
pub mod progress;
pub mod queue;
pub mod remote;
pub mod storage;

pub use config::Config;
pub use connectivity::{ConnectivityHandle, ConnectivityObserver, ConnectivityState};
pub use error::{Error, Result};
pub use item::{ItemId, OperationKind, QueueItem, WriteRequest};
pub use logging::init_logging;
pub use progress::{OnboardingProgress, ProgressStore};
pub use queue::{DurableQueue, QueueSettings, QueueStatus, RetrySchedule};
pub use remote::{FileDocumentStore, RemotePersistence};
pub use storage::{LocalStorage, MemoryStore, SqliteStore};
