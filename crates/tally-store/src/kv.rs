use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use rusqlite::{Connection, OptionalExtension};
use tracing::{info, warn};

use crate::migrations;

/// Minimal durable string store. Values are opaque to the backend.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

// -- SQLite --

pub struct SqliteKv {
    conn: Mutex<Connection>,
}

impl SqliteKv {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening sqlite store at {}", path.display()))?;

        // WAL mode so the message and settlement stores can share a file
        conn.pragma_update(None, "journal_mode", "WAL")?;

        migrations::run(&conn)?;

        info!("Sqlite store opened at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrations::run(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow!("Store lock poisoned: {}", e))?;
        f(&conn)
    }
}

impl KvStore for SqliteKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let value = conn
                .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
                .optional()?;
            Ok(value)
        })
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                (key, value),
            )?;
            Ok(())
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
            Ok(())
        })
    }
}

// -- Directory of files --

/// One JSON file per key. Used where SQLite cannot be opened.
pub struct FileKv {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileKv {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

        // Prove the directory is writable now rather than on first save
        let probe = dir.join(".probe");
        fs::write(&probe, b"ok").with_context(|| format!("writing to {}", dir.display()))?;
        fs::remove_file(&probe).ok();

        info!("File store directory: {}", dir.display());
        Ok(Self {
            dir: dir.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", name))
    }
}

impl KvStore for FileKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading key {}", key)),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| anyhow!("File store lock poisoned: {}", e))?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value).with_context(|| format!("writing key {}", key))?;
        fs::rename(&tmp, &path).with_context(|| format!("committing key {}", key))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing key {}", key)),
        }
    }
}

// -- Process memory --

/// Volatile store; contents are lost when the process exits.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().map_err(|e| anyhow!("Memory store lock poisoned: {}", e))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|e| anyhow!("Memory store lock poisoned: {}", e))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|e| anyhow!("Memory store lock poisoned: {}", e))?;
        entries.remove(key);
        Ok(())
    }
}

// -- Backend selection --

#[derive(Debug, Clone)]
pub enum StorageTier {
    Sqlite(PathBuf),
    Files(PathBuf),
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierKind {
    Sqlite,
    Files,
    Memory,
}

impl StorageTier {
    pub fn kind(&self) -> TierKind {
        match self {
            Self::Sqlite(_) => TierKind::Sqlite,
            Self::Files(_) => TierKind::Files,
            Self::Memory => TierKind::Memory,
        }
    }

    fn open(&self) -> Result<Arc<dyn KvStore>> {
        Ok(match self {
            Self::Sqlite(path) => Arc::new(SqliteKv::open(path)?),
            Self::Files(dir) => Arc::new(FileKv::open(dir)?),
            Self::Memory => Arc::new(MemoryKv::new()),
        })
    }
}

/// Open the first tier that works. Selection happens once; callers keep the
/// returned store for the life of the process instead of retrying tiers on
/// every operation.
pub fn open_first(tiers: &[StorageTier]) -> (Arc<dyn KvStore>, TierKind) {
    for tier in tiers {
        match tier.open() {
            Ok(store) => {
                info!("Using {:?} storage tier", tier.kind());
                return (store, tier.kind());
            }
            Err(e) => warn!("{:?} storage tier unavailable: {:#}", tier.kind(), e),
        }
    }

    warn!("No durable storage tier could be opened, data will not survive restart");
    (Arc::new(MemoryKv::new()), TierKind::Memory)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("tally_kv_{}_{}", label, uuid::Uuid::new_v4()))
    }

    fn exercise(store: &dyn KvStore) {
        assert_eq!(store.get("local_msgs_1").unwrap(), None);
        store.set("local_msgs_1", "[1]").unwrap();
        assert_eq!(store.get("local_msgs_1").unwrap().as_deref(), Some("[1]"));
        store.set("local_msgs_1", "[1,2]").unwrap();
        assert_eq!(store.get("local_msgs_1").unwrap().as_deref(), Some("[1,2]"));
        store.remove("local_msgs_1").unwrap();
        assert_eq!(store.get("local_msgs_1").unwrap(), None);
        // removing twice is fine
        store.remove("local_msgs_1").unwrap();
    }

    #[test]
    fn sqlite_backend_roundtrip() {
        exercise(&SqliteKv::open_in_memory().unwrap());
    }

    #[test]
    fn file_backend_roundtrip() {
        let dir = temp_dir("files");
        exercise(&FileKv::open(&dir).unwrap());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn memory_backend_roundtrip() {
        exercise(&MemoryKv::new());
    }

    #[test]
    fn sqlite_file_survives_reopen() {
        let dir = temp_dir("reopen");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tally.db");
        SqliteKv::open(&path).unwrap().set("k", "v").unwrap();
        let reopened = SqliteKv::open(&path).unwrap();
        assert_eq!(reopened.get("k").unwrap().as_deref(), Some("v"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn open_first_skips_broken_tiers() {
        let root = temp_dir("fallback");
        fs::create_dir_all(&root).unwrap();
        let blocker = root.join("not-a-dir");
        fs::write(&blocker, b"x").unwrap();

        let tiers = [
            StorageTier::Sqlite(root.join("missing").join("tally.db")),
            StorageTier::Files(blocker.join("store")),
            StorageTier::Memory,
        ];
        let (store, kind) = open_first(&tiers);
        assert_eq!(kind, TierKind::Memory);
        exercise(store.as_ref());

        let tiers = [
            StorageTier::Sqlite(root.join("missing").join("tally.db")),
            StorageTier::Files(root.join("store")),
        ];
        let (_, kind) = open_first(&tiers);
        assert_eq!(kind, TierKind::Files);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn file_keys_are_sanitised() {
        let dir = temp_dir("sanitise");
        let store = FileKv::open(&dir).unwrap();
        store.set("../escape/attempt", "v").unwrap();
        assert!(dir.join("___escape_attempt.json").exists());
        assert_eq!(store.get("../escape/attempt").unwrap().as_deref(), Some("v"));
        let _ = fs::remove_dir_all(&dir);
    }
}
