use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};

use super::cache::{expiry, glob_match, CacheStore};

/// Log length at which compaction is first considered.
const COMPACT_AFTER_LINES: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileEntry {
    key: String,
    #[serde(default)]
    value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
    /// Tombstone written by `delete`.
    #[serde(default, skip_serializing_if = "is_false")]
    deleted: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Replayed view of the log.
#[derive(Debug, Default)]
struct Loaded {
    entries: HashMap<String, FileEntry>,
    /// Lines in the log, live or not.
    lines: usize,
    /// Byte length of the log as of the last read or own write.
    len: u64,
}

/// Durable cache backed by one append-only JSONL log.
///
/// `set` appends the new entry and `delete` appends a tombstone; reading
/// replays the log with the last line per key winning. The log is re-read
/// whenever its length differs from what this handle last saw, so several
/// handles (or processes) can share one file. Once dead lines outnumber live
/// entries the log is compacted by write-then-rename.
pub struct JsonFileCacheStore {
    path: PathBuf,
    state: Mutex<Option<Loaded>>,
    clock: Arc<dyn Clock>,
    compact_after: usize,
}

impl JsonFileCacheStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            state: Mutex::new(None),
            clock: Arc::new(SystemClock),
            compact_after: COMPACT_AFTER_LINES,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_live(&self, entry: &FileEntry) -> bool {
        entry.expires_at.map_or(true, |at| at > self.clock.now())
    }

    async fn file_len(&self) -> Result<u64> {
        match fs::metadata(&self.path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to stat cache file {}", self.path.display())),
        }
    }

    async fn load(&self) -> Result<Loaded> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Loaded::default()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read cache file {}", self.path.display()))
            }
        };

        let mut loaded = Loaded {
            len: content.len() as u64,
            ..Loaded::default()
        };
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            loaded.lines += 1;
            match serde_json::from_str::<FileEntry>(line) {
                Ok(entry) if entry.deleted => {
                    loaded.entries.remove(&entry.key);
                }
                Ok(entry) => {
                    loaded.entries.insert(entry.key.clone(), entry);
                }
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "skipping corrupt cache line")
                }
            }
        }
        loaded.entries.retain(|_, entry| self.is_live(entry));
        Ok(loaded)
    }

    /// Current view, re-read if the log changed underneath this handle.
    async fn refresh<'a>(&self, slot: &'a mut Option<Loaded>) -> Result<&'a mut Loaded> {
        let len = self.file_len().await?;
        if slot.as_ref().map_or(true, |loaded| loaded.len != len) {
            debug!(path = %self.path.display(), "cache log changed, reloading");
            *slot = Some(self.load().await?);
        }
        Ok(slot.get_or_insert_with(Loaded::default))
    }

    async fn append(&self, loaded: &mut Loaded, entry: &FileEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create cache directory")?;
        }
        let mut line =
            serde_json::to_string(entry).context("Failed to serialize cache entry")?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .context("Failed to open cache file for append")?;
        file.write_all(line.as_bytes())
            .await
            .context("Failed to append to cache file")?;
        file.flush().await?;

        loaded.lines += 1;
        loaded.len += line.len() as u64;
        Ok(())
    }

    async fn maybe_compact(&self, loaded: &mut Loaded) -> Result<()> {
        if loaded.lines <= self.compact_after || loaded.lines <= loaded.entries.len() * 2 {
            return Ok(());
        }

        let mut keys: Vec<&String> = loaded.entries.keys().collect();
        keys.sort();
        let mut content = String::new();
        for key in keys {
            let entry = &loaded.entries[key];
            content.push_str(
                &serde_json::to_string(entry).context("Failed to serialize cache entry")?,
            );
            content.push('\n');
        }

        // Write-then-rename so a crash never leaves a truncated log.
        let tmp = self.path.with_extension("jsonl.tmp");
        fs::write(&tmp, &content)
            .await
            .context("Failed to write cache file")?;
        fs::rename(&tmp, &self.path)
            .await
            .context("Failed to replace cache file")?;

        debug!(
            path = %self.path.display(),
            from = loaded.lines,
            to = loaded.entries.len(),
            "cache log compacted"
        );
        loaded.lines = loaded.entries.len();
        loaded.len = content.len() as u64;
        Ok(())
    }
}

#[async_trait::async_trait]
impl CacheStore for JsonFileCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut guard = self.state.lock().await;
        let loaded = self.refresh(&mut guard).await?;
        Ok(loaded
            .entries
            .get(key)
            .filter(|entry| self.is_live(entry))
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let mut guard = self.state.lock().await;
        let loaded = self.refresh(&mut guard).await?;
        let entry = FileEntry {
            key: key.to_string(),
            value,
            expires_at: expiry(self.clock.now(), ttl),
            deleted: false,
        };
        self.append(loaded, &entry).await?;
        loaded.entries.insert(entry.key.clone(), entry);
        loaded.entries.retain(|_, entry| self.is_live(entry));
        self.maybe_compact(loaded).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut guard = self.state.lock().await;
        let loaded = self.refresh(&mut guard).await?;
        if loaded.entries.remove(key).is_none() {
            return Ok(());
        }
        let tombstone = FileEntry {
            key: key.to_string(),
            value: String::new(),
            expires_at: None,
            deleted: true,
        };
        self.append(loaded, &tombstone).await?;
        self.maybe_compact(loaded).await
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let mut guard = self.state.lock().await;
        let loaded = self.refresh(&mut guard).await?;
        let mut keys: Vec<String> = loaded
            .entries
            .values()
            .filter(|entry| self.is_live(entry) && glob_match(pattern, &entry.key))
            .map(|entry| entry.key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
