//! The durable unit of work (`spec.md` §3) and the four lifecycle groups it
//! moves through.

use chrono::{DateTime, Utc};
use defer_ids::{ServiceUuid, VmId};
use serde::{Deserialize, Serialize};

/// The four states a [`DeletionInfo`] passes through. Each variant names a
/// partition of the deferred store, persisted under its own namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Group {
    ToStop,
    Stopping,
    ToDelete,
    Deleting,
}

impl Group {
    /// All four groups, in the order a tick processes them
    /// (`spec.md` §4.5, §5).
    pub const ALL: [Group; 4] = [Group::ToStop, Group::Stopping, Group::ToDelete, Group::Deleting];

    /// Storage namespace this group is persisted under, within the engine's
    /// top-level `deferdel_worker` namespace.
    pub fn namespace(self) -> &'static str {
        match self {
            Group::ToStop => "to_stop",
            Group::Stopping => "stopping",
            Group::ToDelete => "to_delete",
            Group::Deleting => "deleting",
        }
    }
}

impl std::fmt::Display for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.namespace())
    }
}

/// Record schema version. Bump this whenever a field is added or changes
/// meaning; old records keep deserializing because every new field carries
/// a `#[serde(default)]`.
fn current_record_version() -> u32 {
    1
}

/// One pending stop-or-delete task for one VM on one service.
///
/// Primary key within a group is `"{service_uuid}_{vmid}"` ([`Self::key`]):
/// the same (service, vmid) pair is only ever present in one group at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletionInfo {
    #[serde(default = "current_record_version")]
    pub version: u32,

    pub vmid: VmId,
    pub service_uuid: ServiceUuid,

    pub created: DateTime<Utc>,
    pub next_check: DateTime<Utc>,

    /// Count of non-retryable failures observed.
    #[serde(default)]
    pub fatal_retries: u32,

    /// Count of all processing attempts (retryable + fatal).
    #[serde(default)]
    pub total_retries: u32,

    /// Count of repeated polls within the *current* group, used by
    /// STOPPING/DELETING to decide when to re-issue the stop/delete command.
    #[serde(default)]
    pub retries: u32,
}

impl DeletionInfo {
    pub fn new(vmid: VmId, service_uuid: ServiceUuid, created: DateTime<Utc>, next_check: DateTime<Utc>) -> Self {
        Self {
            version: current_record_version(),
            vmid,
            service_uuid,
            created,
            next_check,
            fatal_retries: 0,
            total_retries: 0,
            retries: 0,
        }
    }

    /// Primary key within a group: `"{service_uuid}_{vmid}"`.
    pub fn key(&self) -> String {
        Self::generate_key(&self.service_uuid, &self.vmid)
    }

    pub fn generate_key(service_uuid: &ServiceUuid, vmid: &VmId) -> String {
        format!("{service_uuid}_{vmid}")
    }

    /// One CSV row, for [`crate::report`]:
    /// `vmid,created,next_check,service_uuid,fatal_retries,total_retries,retries`.
    pub fn as_csv(&self) -> String {
        format!(
            "{},{},{},{},{},{},{}",
            self.vmid, self.created, self.next_check, self.service_uuid, self.fatal_retries, self.total_retries, self.retries
        )
    }

    pub fn csv_header() -> &'static str {
        "vmid,created,next_check,service_uuid,fatal_retries,total_retries,retries"
    }
}
