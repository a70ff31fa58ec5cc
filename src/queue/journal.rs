//! Append-only JSON-lines journal backing the transactional queue.
//!
//! One committed operation per line. On open the journal is replayed to
//! rebuild the live entry set and the sequence counter, then compacted so
//! dequeued entries stop occupying disk.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{QueueEntry, QueueError};

/// One committed queue operation.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub(crate) enum JournalOp {
    Enqueue { entry: QueueEntry },
    Dequeue { sequence: u64 },
}

pub(crate) struct Journal {
    writer: Mutex<BufWriter<File>>,
}

impl Journal {
    /// Open (or create) a journal, replaying and compacting its contents.
    ///
    /// Returns the journal plus the live entries and the next sequence
    /// number to hand out.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, BTreeMap<u64, QueueEntry>, u64), QueueError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }

        let mut live: BTreeMap<u64, QueueEntry> = BTreeMap::new();
        let mut next_sequence = 0u64;

        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<JournalOp>(&line) {
                    Ok(JournalOp::Enqueue { entry }) => {
                        next_sequence = next_sequence.max(entry.sequence + 1);
                        live.insert(entry.sequence, entry);
                    }
                    Ok(JournalOp::Dequeue { sequence }) => {
                        next_sequence = next_sequence.max(sequence + 1);
                        live.remove(&sequence);
                    }
                    Err(e) => {
                        // A torn trailing line from a crash mid-append;
                        // everything before it already committed.
                        warn!(path = %path.display(), error = %e, "Skipping unreadable journal line");
                    }
                }
            }
        }

        // Compact: rewrite only the live entries.
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let mut writer = BufWriter::new(file);
        for entry in live.values() {
            let op = JournalOp::Enqueue {
                entry: entry.clone(),
            };
            serde_json::to_writer(&mut writer, &op)?;
            writeln!(writer)?;
        }
        writer.flush()?;

        info!(path = %path.display(), entries = live.len(), "Queue journal opened");

        Ok((
            Self {
                writer: Mutex::new(writer),
            },
            live,
            next_sequence,
        ))
    }

    /// Append a committed transaction's operations.
    pub fn append(&self, ops: &[JournalOp]) -> Result<(), QueueError> {
        let mut writer = self.writer.lock().expect("journal writer lock");
        for op in ops {
            serde_json::to_writer(&mut *writer, op)?;
            writeln!(writer)?;
        }
        writer.flush()?;
        Ok(())
    }
}
