//! On-disk schema versioning for the RocksDB backend

use rocksdb::DB;

use crate::error::{GraphError, Result};

/// Key holding the little-endian `u32` schema version
pub const SCHEMA_VERSION_KEY: &[u8] = b"_schema_version";
pub const CURRENT_VERSION: u32 = 1;

/// Read the stored schema version; `None` for a fresh database
pub fn stored_version(db: &DB) -> Result<Option<u32>> {
    match db.get(SCHEMA_VERSION_KEY)? {
        Some(bytes) => {
            let raw: [u8; 4] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| GraphError::store("invalid schema version format"))?;
            Ok(Some(u32::from_le_bytes(raw)))
        }
        None => Ok(None),
    }
}

/// Stamp a fresh database and refuse ones written by a newer release.
///
/// Idempotent.
pub fn ensure_current(db: &DB) -> Result<()> {
    match stored_version(db)? {
        None => {
            log::info!("Initialising graph schema v{}", CURRENT_VERSION);
            db.put(SCHEMA_VERSION_KEY, CURRENT_VERSION.to_le_bytes())?;
            db.flush()?;
            Ok(())
        }
        Some(v) if v == CURRENT_VERSION => Ok(()),
        Some(v) if v > CURRENT_VERSION => Err(GraphError::store(format!(
            "database schema v{} is newer than supported v{}",
            v, CURRENT_VERSION
        ))),
        Some(v) => {
            log::warn!(
                "Database schema v{} predates v{}; no migration is defined",
                v,
                CURRENT_VERSION
            );
            Err(GraphError::store(format!(
                "unsupported database schema v{}",
                v
            )))
        }
    }
}
