//! Read-only CSV diagnostics (`spec.md` §4.6). Never takes an atomic lock:
//! it reads a consistent [`crate::storage::DeferredStorage::snapshot`] per
//! group, which races harmlessly with concurrent ticks.

use std::io::Write;

use crate::errors::EngineError;
use crate::model::Group;
use crate::storage::SharedStorage;

/// Writes the CSV header once, then every group's rows in turn, then a
/// trailing blank line — matching the original's `report()` byte for byte.
pub async fn report(storage: &SharedStorage, out: &mut impl Write) -> Result<(), EngineError> {
    writeln!(out, "{}", crate::model::DeletionInfo::csv_header()).map_err(write_err)?;
    for group in Group::ALL {
        for info in storage.snapshot(group).await? {
            writeln!(out, "{}", info.as_csv()).map_err(write_err)?;
        }
    }
    writeln!(out).map_err(write_err)?;
    Ok(())
}

fn write_err(source: std::io::Error) -> EngineError {
    EngineError::Storage(crate::errors::StorageError::Io {
        group: "report",
        source,
    })
}
