use defer_ids::{ServiceUuid, VmId};
use thiserror::Error;

/// The taxonomy a [`crate::driver::ServiceDriver`] call must be classified
/// into. The engine never matches on a driver's concrete error type: drivers
/// report one of these three kinds and the engine applies uniform retry
/// policy on top.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The VM is gone. Always terminal success: nothing to clean up.
    #[error("vm not found")]
    NotFound,

    /// Transient failure (network blip, throttling, backend busy). Retrying
    /// later is expected to succeed.
    #[error("retryable backend error: {0}")]
    Retryable(String),

    /// Structural failure (auth failed, malformed response, driver bug).
    /// Retrying immediately won't help; the engine backs off harder.
    #[error("fatal backend error: {0}")]
    Fatal(String),
}

impl DriverError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }
}

/// Errors from the deferred storage layer. These always abort the current
/// tick phase rather than risk corrupting group state.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error persisting group {group}: {source}")]
    Io {
        group: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to (de)serialize deletion record: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors surfaced by [`crate::engine::DeletionEngine`] itself, as opposed to
/// its drivers or storage.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The owning service could not be instantiated. The caller already
    /// logged and dropped the item; this variant exists for callers (e.g.
    /// tests) that want to observe the orphan rather than only a log line.
    #[error("service {service_uuid} could not be instantiated for vm {vmid}")]
    OrphanedService {
        service_uuid: ServiceUuid,
        vmid: VmId,
    },
}

/// Errors loading [`crate::config::EngineConfig`] from a TOML file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}
