//! The worker itself: `add`, the four-phase `run` tick, and the shared
//! exception-classification helper (`spec.md` §4.4, §4.5, §7).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use defer_ids::{ServiceUuid, VmId};
use tracing::{debug, info, instrument, warn};

use crate::clock::{next_execution_calculator, Clock, ExecutionTimer};
use crate::config::EngineConfig;
use crate::driver::{ServiceDriver, ServiceRegistry};
use crate::errors::{DriverError, EngineError};
use crate::model::{DeletionInfo, Group};
use crate::storage::SharedStorage;

/// The deletion engine: stateless apart from its collaborators, all state
/// lives in [`crate::storage::DeferredStorage`].
pub struct DeletionEngine {
    storage: SharedStorage,
    registry: Arc<dyn ServiceRegistry>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

/// Outcome of the eager first attempt in [`DeletionEngine::add`].
enum FirstStep {
    Stopping,
    Deleting,
}

impl DeletionEngine {
    pub fn new(storage: SharedStorage, registry: Arc<dyn ServiceRegistry>, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self {
            storage,
            registry,
            clock,
            config,
        }
    }

    /// Enqueue a stop-or-delete for `vmid` on `driver`.
    ///
    /// `execute_later = false` attempts the first step eagerly under an
    /// [`ExecutionTimer`]; `execute_later = true` persists directly into
    /// `TO_STOP`/`TO_DELETE` with no backend call (`spec.md` §4.4).
    #[instrument(skip(self, driver), fields(vmid = %vmid, service_uuid = %driver.db_obj().uuid))]
    pub async fn add(&self, driver: Arc<dyn ServiceDriver>, vmid: VmId, execute_later: bool) -> Result<(), EngineError> {
        let now = self.clock.now();
        let service_uuid = driver.db_obj().uuid;

        if execute_later {
            let group = if driver.must_stop_before_deletion() {
                Group::ToStop
            } else {
                Group::ToDelete
            };
            let info = DeletionInfo::new(vmid, service_uuid, now, now);
            debug!(%group, "deferred enqueue");
            self.storage.put(group, info).await?;
            return Ok(());
        }

        let timer = ExecutionTimer::start(&self.config);
        let outcome = Self::attempt_first_step(driver.as_ref(), &vmid).await;
        let rate = timer.finish();

        match outcome {
            Ok(FirstStep::Stopping) => {
                let next_check = next_execution_calculator(now, &self.config, false, rate);
                self.storage
                    .put(Group::Stopping, DeletionInfo::new(vmid, service_uuid, now, next_check))
                    .await?;
            }
            Ok(FirstStep::Deleting) => {
                let next_check = next_execution_calculator(now, &self.config, false, rate);
                self.storage
                    .put(Group::Deleting, DeletionInfo::new(vmid, service_uuid, now, next_check))
                    .await?;
            }
            Err(DriverError::NotFound) => {
                debug!("vm already gone on eager add, nothing to persist");
            }
            Err(other) => {
                warn!(error = %other, "eager add failed, deferring to TO_DELETE for retry");
                self.storage
                    .put(Group::ToDelete, DeletionInfo::new(vmid, service_uuid, now, now))
                    .await?;
            }
        }
        Ok(())
    }

    async fn attempt_first_step(driver: &dyn ServiceDriver, vmid: &VmId) -> Result<FirstStep, DriverError> {
        if driver.must_stop_before_deletion() && driver.is_running(vmid).await? {
            if driver.should_try_soft_shutdown() {
                driver.shutdown(vmid).await?;
            } else {
                driver.stop(vmid).await?;
            }
            return Ok(FirstStep::Stopping);
        }
        driver.execute_delete(vmid).await?;
        Ok(FirstStep::Deleting)
    }

    /// One tick: the four phases in order (`spec.md` §4.5, §5).
    pub async fn run(&self) -> Result<(), EngineError> {
        self.process_to_stop().await?;
        self.process_stopping().await?;
        self.process_to_delete().await?;
        self.process_deleting().await?;
        Ok(())
    }

    /// Acquires a due, budget-filtered batch from `group` and resolves each
    /// item's driver, caching resolution per `service_uuid` within the
    /// batch. Items whose service can no longer be instantiated are
    /// orphan-dropped here and never returned (`spec.md` §4.5, §8 scenario 6).
    async fn acquire_resolved(&self, group: Group) -> Result<Vec<(DeletionInfo, Arc<dyn ServiceDriver>)>, EngineError> {
        let now = self.clock.now();
        let raw = self
            .storage
            .acquire_batch(group, now, self.config.max_deletions_at_once, self.config.max_retryable_error_retries)
            .await?;

        let mut cache: HashMap<ServiceUuid, Option<Arc<dyn ServiceDriver>>> = HashMap::new();
        let mut resolved = Vec::with_capacity(raw.len());
        for info in raw {
            let driver = match cache.get(&info.service_uuid) {
                Some(cached) => cached.clone(),
                None => {
                    let looked_up = self.registry.get_instance(&info.service_uuid).await.ok();
                    cache.insert(info.service_uuid.clone(), looked_up.clone());
                    looked_up
                }
            };
            match driver {
                Some(driver) => resolved.push((info, driver)),
                None => {
                    warn!(service_uuid = %info.service_uuid, vmid = %info.vmid, group = %group, "service could not be instantiated, dropping orphaned item");
                }
            }
        }
        Ok(resolved)
    }

    /// `TO_STOP → STOPPING | TO_DELETE` (`spec.md` §4.5).
    #[instrument(skip(self))]
    async fn process_to_stop(&self) -> Result<(), EngineError> {
        for (mut info, driver) in self.acquire_resolved(Group::ToStop).await? {
            let now = self.clock.now();
            let escalate = info.retries >= self.config.retries_to_retry;

            let timer = ExecutionTimer::start(&self.config);
            let outcome: Result<bool, DriverError> = async {
                if driver.is_running(&info.vmid).await? {
                    if escalate {
                        driver.stop(&info.vmid).await?;
                    } else if driver.should_try_soft_shutdown() {
                        driver.shutdown(&info.vmid).await?;
                    } else {
                        driver.stop(&info.vmid).await?;
                    }
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            .await;
            let rate = timer.finish();

            match outcome {
                Ok(true) => {
                    if escalate {
                        info.total_retries += 1;
                        info.retries = 0;
                    } else {
                        info.fatal_retries = 0;
                        info.total_retries = 0;
                    }
                    info.next_check = next_execution_calculator(now, &self.config, false, rate);
                    self.storage.put(Group::Stopping, info).await?;
                }
                Ok(false) => {
                    // Not running: move straight to TO_DELETE, picked up
                    // promptly (the source bumps no `next_check` here —
                    // see DESIGN.md's open-question resolution).
                    self.storage.put(Group::ToDelete, info).await?;
                }
                Err(err) => {
                    self.classify_and_persist(Group::ToStop, info, err, rate).await?;
                }
            }
        }
        Ok(())
    }

    /// `STOPPING → TO_STOP | TO_DELETE | STOPPING` (`spec.md` §4.5).
    #[instrument(skip(self))]
    async fn process_stopping(&self) -> Result<(), EngineError> {
        for (mut info, driver) in self.acquire_resolved(Group::Stopping).await? {
            info.retries += 1;
            let now = self.clock.now();

            if info.retries > self.config.retries_to_retry {
                info.total_retries += 1;
                info.next_check = next_execution_calculator(now, &self.config, false, 1.0);
                self.storage.put(Group::ToStop, info).await?;
                continue;
            }

            let timer = ExecutionTimer::start(&self.config);
            let result = driver.is_running(&info.vmid).await;
            let rate = timer.finish();

            match result {
                Ok(true) => {
                    info.total_retries += 1;
                    info.next_check = next_execution_calculator(now, &self.config, false, rate);
                    self.storage.put(Group::Stopping, info).await?;
                }
                Ok(false) => {
                    info.fatal_retries = 0;
                    info.total_retries = 0;
                    info.next_check = next_execution_calculator(now, &self.config, false, rate);
                    self.storage.put(Group::ToDelete, info).await?;
                }
                Err(err) => {
                    self.classify_and_persist(Group::Stopping, info, err, rate).await?;
                }
            }
        }
        Ok(())
    }

    /// `TO_DELETE → TO_STOP | DELETING` (`spec.md` §4.5).
    #[instrument(skip(self))]
    async fn process_to_delete(&self) -> Result<(), EngineError> {
        for (mut info, driver) in self.acquire_resolved(Group::ToDelete).await? {
            let now = self.clock.now();
            let must_stop = driver.must_stop_before_deletion();

            let timer = ExecutionTimer::start(&self.config);
            let outcome: Result<bool, DriverError> = async {
                if must_stop && driver.is_running(&info.vmid).await? {
                    return Ok(true);
                }
                driver.execute_delete(&info.vmid).await?;
                Ok(false)
            }
            .await;
            let rate = timer.finish();

            match outcome {
                Ok(true) => {
                    // Lost the race with a power-on: back to TO_STOP.
                    self.storage.put(Group::ToStop, info).await?;
                }
                Ok(false) => {
                    info.retries = 0;
                    info.total_retries += 1;
                    info.next_check = next_execution_calculator(now, &self.config, false, rate);
                    self.storage.put(Group::Deleting, info).await?;
                }
                Err(err) => {
                    self.classify_and_persist(Group::ToDelete, info, err, rate).await?;
                }
            }
        }
        Ok(())
    }

    /// `DELETING → TO_DELETE | (dropped) | DELETING` (`spec.md` §4.5).
    #[instrument(skip(self))]
    async fn process_deleting(&self) -> Result<(), EngineError> {
        for (mut info, driver) in self.acquire_resolved(Group::Deleting).await? {
            info.retries += 1;
            let now = self.clock.now();

            if info.retries > self.config.retries_to_retry {
                info.total_retries += 1;
                info.next_check = next_execution_calculator(now, &self.config, false, 1.0);
                self.storage.put(Group::ToDelete, info).await?;
                continue;
            }

            let timer = ExecutionTimer::start(&self.config);
            let result = driver.is_deleted(&info.vmid).await;
            let rate = timer.finish();

            match result {
                Ok(true) => {
                    info!(vmid = %info.vmid, service_uuid = %info.service_uuid, "vm deleted");
                }
                Ok(false) => {
                    info.total_retries += 1;
                    info.next_check = next_execution_calculator(now, &self.config, false, rate);
                    self.storage.put(Group::Deleting, info).await?;
                }
                Err(err) => {
                    self.classify_and_persist(Group::Deleting, info, err, rate).await?;
                }
            }
        }
        Ok(())
    }

    /// Shared exception handler for all four phases (`spec.md` §4.5 "Exception
    /// handling within a phase", §7). Re-persists into the *current* group —
    /// a phase never advances on failure, only on success.
    async fn classify_and_persist(&self, group: Group, mut info: DeletionInfo, err: DriverError, rate: f64) -> Result<(), EngineError> {
        let now = self.clock.now();
        match err {
            DriverError::NotFound => {
                debug!(vmid = %info.vmid, service_uuid = %info.service_uuid, %group, "vm not found, dropping");
                Ok(())
            }
            DriverError::Retryable(reason) => {
                info.total_retries += 1;
                if info.total_retries >= self.config.max_retryable_error_retries {
                    warn!(vmid = %info.vmid, service_uuid = %info.service_uuid, %group, %reason, "retryable budget exhausted, dropping");
                    return Ok(());
                }
                info.next_check = next_execution_calculator(now, &self.config, false, rate);
                debug!(vmid = %info.vmid, service_uuid = %info.service_uuid, %group, %reason, next_check = %info.next_check, "retryable error, rescheduled");
                self.storage.put(group, info).await?;
                Ok(())
            }
            DriverError::Fatal(reason) => {
                info.fatal_retries += 1;
                if info.fatal_retries >= self.config.max_fatal_error_retries {
                    warn!(vmid = %info.vmid, service_uuid = %info.service_uuid, %group, %reason, "fatal budget exhausted, dropping");
                    return Ok(());
                }
                info.total_retries += 1;
                info.next_check = next_execution_calculator(now, &self.config, true, rate);
                warn!(vmid = %info.vmid, service_uuid = %info.service_uuid, %group, %reason, next_check = %info.next_check, "fatal error, backing off");
                self.storage.put(group, info).await?;
                Ok(())
            }
        }
    }
}
