// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Append-only transaction log for the config store.
//!
//! One JSON record per line. Replaying the log from an empty tree
//! reproduces the exact tree, per-node timestamps included. Live tails
//! receive every committed record in commit order; a tail that cannot
//! keep up is disconnected instead of blocking the writer.

use crate::path::ConfigPath;
use crate::value::ConfigValue;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use thiserror::Error;
use tracing::warn;

/// Operation recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TlogOp {
    SetLeaf,
    SetContainer,
    Remove,
}

/// One committed mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlogRecord {
    pub seq: u64,
    /// Wall-clock milliseconds; meaningful across restarts.
    pub timestamp: u64,
    pub path: ConfigPath,
    pub op: TlogOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ConfigValue>,
}

/// Log errors.
#[derive(Debug, Error)]
pub enum TlogError {
    #[error("transaction log I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt record at line {line}: {message}")]
    Corrupt { line: usize, message: String },
}

/// Receiving end of a live tail.
pub type TailReceiver = Receiver<TlogRecord>;

struct TailSink {
    tx: SyncSender<TlogRecord>,
}

/// Append half of the transaction log.
pub struct Tlog {
    writer: BufWriter<File>,
    seq: u64,
    sinks: Vec<TailSink>,
}

impl Tlog {
    /// Open (or create) the log at `path`, scanning any existing
    /// records to continue the sequence.
    pub fn open(path: &Path) -> Result<Self, TlogError> {
        let seq = match File::open(path) {
            Ok(file) => {
                let mut last = 0;
                for line in BufReader::new(file).lines() {
                    let line = line?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    if let Ok(record) = serde_json::from_str::<TlogRecord>(&line) {
                        last = record.seq;
                    }
                }
                last
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { writer: BufWriter::new(file), seq, sinks: Vec::new() })
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Append one record, feed the tails, and return its sequence number.
    pub fn append(
        &mut self,
        timestamp: u64,
        path: ConfigPath,
        op: TlogOp,
        value: Option<ConfigValue>,
    ) -> Result<u64, TlogError> {
        self.seq += 1;
        let record = TlogRecord { seq: self.seq, timestamp, path, op, value };

        let line = serde_json::to_string(&record)
            .map_err(|e| TlogError::Corrupt { line: 0, message: e.to_string() })?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;

        // Never block on a slow tail: drop the sink instead.
        self.sinks.retain(|sink| match sink.tx.try_send(record.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(seq = record.seq, "transaction log tail fell behind; disconnecting");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        });

        Ok(self.seq)
    }

    pub fn flush(&mut self) -> Result<(), TlogError> {
        self.writer.flush()?;
        Ok(())
    }

    /// Register a live tail buffered up to `capacity` records.
    pub fn tail(&mut self, capacity: usize) -> TailReceiver {
        let (tx, rx) = sync_channel(capacity.max(1));
        self.sinks.push(TailSink { tx });
        rx
    }

    /// Read the whole log for replay.
    pub fn read_all(path: &Path) -> Result<Vec<TlogRecord>, TlogError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: TlogRecord = serde_json::from_str(&line).map_err(|e| {
                TlogError::Corrupt { line: index + 1, message: e.to_string() }
            })?;
            records.push(record);
        }
        Ok(records)
    }
}

#[cfg(test)]
#[path = "tlog_tests.rs"]
mod tests;
