use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::images::{EnhanceSettings, OperationKind};

/// Persisted records are capped; the oldest fall off the end.
pub const LEDGER_CAP: usize = 50;

/// One completed enhancement, as persisted between sessions. Handles are
/// process-local so only metadata is written out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub display_name: String,
    pub settings: EnhanceSettings,
    pub operation: OperationKind,
}

/// JSON-file-backed list of enhancement records, most recent first.
///
/// Loading is best-effort: a missing, unreadable, or unparseable file yields
/// an empty ledger rather than a startup failure. Every change rewrites the
/// whole file.
#[derive(Debug)]
pub struct HistoryLedger {
    path: PathBuf,
    records: Vec<LedgerRecord>,
}

impl HistoryLedger {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = read_records(&path).unwrap_or_default();
        Self { path, records }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[LedgerRecord] {
        &self.records
    }

    pub fn push(&mut self, record: LedgerRecord) -> anyhow::Result<()> {
        self.records.insert(0, record);
        self.records.truncate(LEDGER_CAP);
        self.flush()
    }

    pub fn clear(&mut self) -> anyhow::Result<()> {
        self.records.clear();
        self.flush()
    }

    fn flush(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&self.records)?)?;
        Ok(())
    }
}

fn read_records(path: &Path) -> Option<Vec<LedgerRecord>> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}
