//! Persistent Session Store: a single global slot holding the one pending
//! generation so it can be recovered after a reload or restart.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{GenerationError, Result};
use crate::models::GenerationRequestDescriptor;

/// Well-known key (file stem) of the pending-generation slot.
pub const PENDING_GENERATION_KEY: &str = "pending_generation";
pub const RECORD_VERSION: u32 = 1;

/// On-disk shape of the slot: descriptor plus a write timestamp in epoch ms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredDescriptor {
    pub version: u32,
    #[serde(flatten)]
    pub descriptor: GenerationRequestDescriptor,
    pub timestamp: i64,
}

impl StoredDescriptor {
    pub fn new(descriptor: GenerationRequestDescriptor, now: DateTime<Utc>) -> Self {
        Self {
            version: RECORD_VERSION,
            descriptor,
            timestamp: now.timestamp_millis(),
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>, max_age: std::time::Duration) -> bool {
        let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        now.timestamp_millis().saturating_sub(self.timestamp) > max_age_ms
    }
}

/// Source of "now" for staleness checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// One-slot key-value persistence. `save` overwrites whatever was there.
pub trait SessionStore: Send + Sync {
    fn load(&self) -> Result<Option<StoredDescriptor>>;
    fn save(&self, record: &StoredDescriptor) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    slot: Mutex<Option<StoredDescriptor>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Result<Option<StoredDescriptor>> {
        Ok(self.slot.lock().clone())
    }

    fn save(&self, record: &StoredDescriptor) -> Result<()> {
        *self.slot.lock() = Some(record.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.slot.lock().take();
        Ok(())
    }
}

/// JSON file under a directory, written atomically via temp file + rename.
#[derive(Debug)]
pub struct FileSessionStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSessionStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(format!("{PENDING_GENERATION_KEY}.json")),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn discard(&self, reason: &str) -> Result<Option<StoredDescriptor>> {
        warn!(path = %self.path.display(), reason, "discarding unreadable pending generation");
        self.clear()?;
        Ok(None)
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Result<Option<StoredDescriptor>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let value: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(_) => return self.discard("corrupt json"),
        };
        match value.get("version").and_then(|v| v.as_u64()) {
            Some(v) if v == u64::from(RECORD_VERSION) => {}
            _ => return self.discard("unsupported record version"),
        }
        match serde_json::from_value(value) {
            Ok(record) => Ok(Some(record)),
            Err(_) => self.discard("record does not match descriptor shape"),
        }
    }

    fn save(&self, record: &StoredDescriptor) -> Result<()> {
        let _guard = self.write_lock.lock();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self
            .path
            .with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        let body = serde_json::to_vec_pretty(record)
            .map_err(|e| GenerationError::Storage(e.to_string()))?;
        fs::write(&tmp, body)?;
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        debug!(request_id = %record.descriptor.request_id, "persisted pending generation");
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
