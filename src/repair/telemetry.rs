use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use log::{error, info};

use crate::repair::transaction::RepairTransaction;

/// Destination of repair transaction records.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, tx: &RepairTransaction);
}

/// Logs each record as one `info!` line of JSON.
#[derive(Debug, Default)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn emit(&self, tx: &RepairTransaction) {
        match serde_json::to_string(tx) {
            Ok(line) => info!("repair transaction: {}", line),
            Err(err) => error!("cannot serialize repair transaction: {}", err),
        }
    }
}

/// Appends records to a JSON-lines file.
pub struct JsonlSink {
    writer: Mutex<BufWriter<File>>,
}

impl JsonlSink {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl TelemetrySink for JsonlSink {
    fn emit(&self, tx: &RepairTransaction) {
        let Ok(mut writer) = self.writer.lock() else {
            error!("telemetry writer poisoned, dropping record");
            return;
        };
        let written = serde_json::to_writer(&mut *writer, tx)
            .map_err(std::io::Error::from)
            .and_then(|_| writer.write_all(b"\n"))
            .and_then(|_| writer.flush());
        if let Err(err) = written {
            error!("failed to write repair transaction: {}", err);
        }
    }
}

/// Keeps every record in memory.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<RepairTransaction>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<RepairTransaction> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl TelemetrySink for MemorySink {
    fn emit(&self, tx: &RepairTransaction) {
        if let Ok(mut records) = self.records.lock() {
            records.push(tx.clone());
        }
    }
}
