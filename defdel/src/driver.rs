//! The capability contract the engine expects from any hypervisor service
//! driver (`spec.md` §4.3), plus the narrow `Service` repository lookup
//! (`spec.md` §6 "Consumed from DB").
//!
//! Kept as a small trait rather than an inheritance tree, per DESIGN NOTES:
//! "Avoid inheritance trees — prefer small composition." `async_trait` lets
//! concrete hypervisor drivers (Xen/VMware/etc., out of scope here) implement
//! this with ordinary `async fn`s.

use std::sync::Arc;

use async_trait::async_trait;
use defer_ids::{ServiceUuid, VmId};
use thiserror::Error;

use crate::errors::DriverError;

/// Identity of a driver, for logging and keying. Mirrors the original's
/// `service.db_obj()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverIdentity {
    pub uuid: ServiceUuid,
    pub name: String,
}

/// The polymorphic backend adapter for one hypervisor instance.
///
/// `NotFound` from any operation is always terminal success: the VM is gone.
/// This is not this trait's concern to encode specially — the engine treats
/// `DriverError::NotFound` uniformly for every call site.
#[async_trait]
pub trait ServiceDriver: Send + Sync {
    /// If true, the engine enters the STOP sequence before deletion; else it
    /// jumps straight to delete.
    fn must_stop_before_deletion(&self) -> bool;

    /// Policy hint: attempt a graceful `shutdown` before a hard `stop`.
    fn should_try_soft_shutdown(&self) -> bool;

    /// Is the VM currently powered on?
    async fn is_running(&self, vmid: &VmId) -> Result<bool, DriverError>;

    /// Initiate a graceful power-down. Returns promptly; does not wait for
    /// completion.
    async fn shutdown(&self, vmid: &VmId) -> Result<(), DriverError>;

    /// Initiate a hard power-off. Returns promptly; does not wait for
    /// completion.
    async fn stop(&self, vmid: &VmId) -> Result<(), DriverError>;

    /// Initiate deletion of the VM resource. Returns promptly.
    async fn execute_delete(&self, vmid: &VmId) -> Result<(), DriverError>;

    /// Is the VM fully removed?
    async fn is_deleted(&self, vmid: &VmId) -> Result<bool, DriverError>;

    /// Identity for logging and keying.
    fn db_obj(&self) -> DriverIdentity;
}

/// Returned by [`ServiceRegistry::get_instance`] when a `service_uuid` can't
/// be resolved to a live driver (DB miss, deserialization failure on the
/// service record, etc). The engine only logs this and drops the item — the
/// variant carries just enough to say which service, matching `DriverError`'s
/// own posture of tagged, minimal error data rather than an opaque `anyhow`.
#[derive(Debug, Error)]
#[error("service {0} could not be instantiated")]
pub struct ResolutionError(pub ServiceUuid);

/// The narrow slice of the `Service` repository the engine consumes:
/// `Service.objects.get(uuid=...).get_instance()` in the original. Failure
/// means the owning service can no longer be instantiated, and the item is
/// orphan-dropped rather than retried (`spec.md` §3 invariants, §7).
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    async fn get_instance(&self, service_uuid: &ServiceUuid) -> Result<Arc<dyn ServiceDriver>, ResolutionError>;
}

/// In-memory [`ServiceDriver`]/[`ServiceRegistry`] doubles, exported
/// unconditionally (not `cfg(test)`-gated) so both unit tests and the
/// `tests/` integration suite can drive the engine without a real
/// hypervisor backend.
pub mod mock {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Scripted responses for one driver call, consumed in order. The last
    /// entry repeats once exhausted, so tests don't need to script every
    /// single poll of a long-running scenario.
    #[derive(Clone)]
    pub enum Script<T> {
        Fixed(T),
        Sequence(Arc<Mutex<Vec<T>>>),
    }

    impl<T: Clone> Script<T> {
        pub fn sequence(values: Vec<T>) -> Self {
            Self::Sequence(Arc::new(Mutex::new(values)))
        }

        fn next(&self) -> T {
            match self {
                Script::Fixed(v) => v.clone(),
                Script::Sequence(values) => {
                    let mut values = values.lock().expect("mock script mutex poisoned");
                    if values.len() > 1 {
                        values.remove(0)
                    } else {
                        values.last().expect("script must have at least one value").clone()
                    }
                }
            }
        }
    }

    type CallResult = Result<bool, DriverError>;
    type ActionResult = Result<(), DriverError>;

    /// A fully scriptable [`ServiceDriver`] for unit and integration tests.
    #[derive(Clone)]
    pub struct MockDriver {
        pub identity: DriverIdentity,
        pub must_stop_before_deletion: bool,
        pub should_try_soft_shutdown: bool,
        pub is_running: Script<CallResult>,
        pub is_deleted: Script<CallResult>,
        pub shutdown: Script<ActionResult>,
        pub stop: Script<ActionResult>,
        pub execute_delete: Script<ActionResult>,
        pub calls: Arc<Mutex<Vec<&'static str>>>,
    }

    impl MockDriver {
        pub fn new(uuid: &str, name: &str) -> Self {
            Self {
                identity: DriverIdentity {
                    uuid: ServiceUuid::from(uuid),
                    name: name.to_string(),
                },
                must_stop_before_deletion: false,
                should_try_soft_shutdown: false,
                is_running: Script::Fixed(Ok(false)),
                is_deleted: Script::Fixed(Ok(true)),
                shutdown: Script::Fixed(Ok(())),
                stop: Script::Fixed(Ok(())),
                execute_delete: Script::Fixed(Ok(())),
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn must_stop(mut self, v: bool) -> Self {
            self.must_stop_before_deletion = v;
            self
        }

        pub fn soft_shutdown(mut self, v: bool) -> Self {
            self.should_try_soft_shutdown = v;
            self
        }

        pub fn call_count(&self, op: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| **c == op).count()
        }

        fn record(&self, op: &'static str) {
            self.calls.lock().unwrap().push(op);
        }
    }

    #[async_trait]
    impl ServiceDriver for MockDriver {
        fn must_stop_before_deletion(&self) -> bool {
            self.must_stop_before_deletion
        }

        fn should_try_soft_shutdown(&self) -> bool {
            self.should_try_soft_shutdown
        }

        async fn is_running(&self, _vmid: &VmId) -> Result<bool, DriverError> {
            self.record("is_running");
            self.is_running.next()
        }

        async fn shutdown(&self, _vmid: &VmId) -> Result<(), DriverError> {
            self.record("shutdown");
            self.shutdown.next()
        }

        async fn stop(&self, _vmid: &VmId) -> Result<(), DriverError> {
            self.record("stop");
            self.stop.next()
        }

        async fn execute_delete(&self, _vmid: &VmId) -> Result<(), DriverError> {
            self.record("execute_delete");
            self.execute_delete.next()
        }

        async fn is_deleted(&self, _vmid: &VmId) -> Result<bool, DriverError> {
            self.record("is_deleted");
            self.is_deleted.next()
        }

        fn db_obj(&self) -> DriverIdentity {
            self.identity.clone()
        }
    }

    /// An in-memory [`ServiceRegistry`] backed by a fixed map of drivers.
    /// A `service_uuid` absent from the map simulates a DB miss.
    #[derive(Default, Clone)]
    pub struct MockRegistry {
        drivers: Arc<Mutex<HashMap<ServiceUuid, Arc<dyn ServiceDriver>>>>,
    }

    impl MockRegistry {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, driver: Arc<dyn ServiceDriver>) {
            let uuid = driver.db_obj().uuid;
            self.drivers.lock().unwrap().insert(uuid, driver);
        }

        pub fn remove(&self, uuid: &ServiceUuid) {
            self.drivers.lock().unwrap().remove(uuid);
        }
    }

    #[async_trait]
    impl ServiceRegistry for MockRegistry {
        async fn get_instance(&self, service_uuid: &ServiceUuid) -> Result<Arc<dyn ServiceDriver>, ResolutionError> {
            self.drivers
                .lock()
                .unwrap()
                .get(service_uuid)
                .cloned()
                .ok_or_else(|| ResolutionError(service_uuid.clone()))
        }
    }
}
