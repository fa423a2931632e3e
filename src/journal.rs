//! Append-only per-item journals of workflow transitions.
//!
//! Every transition is appended before it is applied, so folding a journal
//! through [`WorkflowState::apply`] rebuilds the workflow exactly as it was
//! when the process stopped.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::JournalError;
use crate::state_machine::{ItemId, Transition, WorkItem, WorkflowState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalEvent {
    Admitted { item: WorkItem },
    Transitioned(Transition),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub at: DateTime<Utc>,
    pub event: JournalEvent,
}

impl JournalEntry {
    pub fn admitted(item: WorkItem) -> Self {
        Self {
            at: Utc::now(),
            event: JournalEvent::Admitted { item },
        }
    }

    pub fn transitioned(transition: Transition) -> Self {
        Self {
            at: Utc::now(),
            event: JournalEvent::Transitioned(transition),
        }
    }
}

#[async_trait]
pub trait Journal: Send + Sync {
    /// Durably record `entry`. Returns only once the entry survives a crash.
    async fn append(&self, item: &ItemId, entry: &JournalEntry) -> Result<(), JournalError>;

    /// Entries of `item` in append order; empty if it was never journaled.
    async fn replay(&self, item: &ItemId) -> Result<Vec<JournalEntry>, JournalError>;

    async fn discard(&self, item: &ItemId) -> Result<(), JournalError>;

    async fn item_ids(&self) -> Result<Vec<ItemId>, JournalError>;
}

/// Rebuild a workflow from its journal. `None` when nothing was journaled.
pub fn recover(
    item: &ItemId,
    entries: &[JournalEntry],
) -> Result<Option<WorkflowState>, JournalError> {
    let mut entries = entries.iter();
    let mut wf = match entries.next() {
        None => return Ok(None),
        Some(JournalEntry {
            event: JournalEvent::Admitted { item },
            ..
        }) => WorkflowState::new(item.clone()),
        Some(_) => return Err(JournalError::MissingAdmission(item.to_string())),
    };

    for entry in entries {
        match &entry.event {
            JournalEvent::Transitioned(transition) => wf.apply(transition),
            JournalEvent::Admitted { .. } => {
                warn!(item = %item, "ignoring repeated admission record");
            }
        }
    }
    Ok(Some(wf))
}

/// One JSON-lines file per item under a directory.
pub struct FileJournal {
    dir: PathBuf,
}

impl FileJournal {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, item: &ItemId) -> PathBuf {
        self.dir.join(format!("{item}.jsonl"))
    }
}

async fn blocking<T, F>(f: F) -> Result<T, JournalError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, JournalError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| JournalError::Io(io::Error::other(err)))?
}

#[async_trait]
impl Journal for FileJournal {
    async fn append(&self, item: &ItemId, entry: &JournalEntry) -> Result<(), JournalError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let dir = self.dir.clone();
        let path = self.path_for(item);

        blocking(move || {
            fs::create_dir_all(&dir)?;
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(&line)?;
            file.sync_data()?;
            Ok(())
        })
        .await?;
        debug!(item = %item, "journal entry appended");
        Ok(())
    }

    async fn replay(&self, item: &ItemId) -> Result<Vec<JournalEntry>, JournalError> {
        let path = self.path_for(item);
        let item_id = item.to_string();

        blocking(move || {
            let contents = match fs::read_to_string(&path) {
                Ok(contents) => contents,
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(err) => return Err(err.into()),
            };
            parse_lines(&item_id, &contents)
        })
        .await
    }

    async fn discard(&self, item: &ItemId) -> Result<(), JournalError> {
        let path = self.path_for(item);
        blocking(move || match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        })
        .await
    }

    async fn item_ids(&self) -> Result<Vec<ItemId>, JournalError> {
        let dir = self.dir.clone();
        blocking(move || {
            let read_dir = match fs::read_dir(&dir) {
                Ok(read_dir) => read_dir,
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(err) => return Err(err.into()),
            };
            let mut ids = Vec::new();
            for entry in read_dir {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                    continue;
                }
                if let Some(id) = path.file_stem().and_then(|s| s.to_str()).and_then(ItemId::parse) {
                    ids.push(id);
                }
            }
            ids.sort();
            Ok(ids)
        })
        .await
    }
}

/// Parse JSON lines. A final line without its newline is a write torn by a
/// crash and is dropped; any other bad line is corruption.
fn parse_lines(item_id: &str, contents: &str) -> Result<Vec<JournalEntry>, JournalError> {
    let complete = contents.ends_with('\n');
    let lines: Vec<&str> = contents.lines().collect();
    let mut entries = Vec::with_capacity(lines.len());

    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(entry) => entries.push(entry),
            Err(_) if !complete && idx + 1 == lines.len() => {
                warn!(item = %item_id, line = idx + 1, "dropping torn journal tail");
            }
            Err(source) => {
                return Err(JournalError::Corrupt {
                    item_id: item_id.to_string(),
                    line: idx + 1,
                    source,
                });
            }
        }
    }
    Ok(entries)
}

/// Journal kept in memory; nothing survives the process.
#[derive(Default)]
pub struct MemoryJournal {
    entries: Mutex<HashMap<ItemId, Vec<JournalEntry>>>,
}

#[async_trait]
impl Journal for MemoryJournal {
    async fn append(&self, item: &ItemId, entry: &JournalEntry) -> Result<(), JournalError> {
        let mut entries = self.entries.lock().await;
        entries.entry(*item).or_default().push(entry.clone());
        Ok(())
    }

    async fn replay(&self, item: &ItemId) -> Result<Vec<JournalEntry>, JournalError> {
        let entries = self.entries.lock().await;
        Ok(entries.get(item).cloned().unwrap_or_default())
    }

    async fn discard(&self, item: &ItemId) -> Result<(), JournalError> {
        self.entries.lock().await.remove(item);
        Ok(())
    }

    async fn item_ids(&self) -> Result<Vec<ItemId>, JournalError> {
        let mut ids: Vec<ItemId> = self.entries.lock().await.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}
