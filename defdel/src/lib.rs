//! Persistent, fault-tolerant deferred VM stop/delete worker.
//!
//! The engine ([`engine::DeletionEngine`]) drives a durable four-state
//! lifecycle (`TO_STOP` → `STOPPING` → `TO_DELETE` → `DELETING`) across
//! whatever hypervisor backends implement [`driver::ServiceDriver`],
//! absorbing transient errors, bounding retries, and stretching its own
//! polling interval when a backend is slow.

pub mod clock;
pub mod config;
pub mod driver;
pub mod engine;
pub mod errors;
pub mod model;
pub mod report;
pub mod storage;

pub use clock::{Clock, ExecutionTimer, SystemClock, TestClock};
pub use config::EngineConfig;
pub use driver::{mock, DriverIdentity, ResolutionError, ServiceDriver, ServiceRegistry};
pub use engine::DeletionEngine;
pub use errors::{ConfigError, DriverError, EngineError, StorageError};
pub use model::{DeletionInfo, Group};
pub use storage::{DeferredStorage, FileDeferredStorage, MemoryDeferredStorage, SharedStorage};
