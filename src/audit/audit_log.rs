// # Audit Log Store
//
// Append-only store keyed by sequence number. Writes are serialized behind
// one mutex; readers snapshot concurrently. Each record carries the hash of
// its predecessor, so the verifier can walk the chain end-to-end and name
// the first broken link. Retention rotates whole segments, never records,
// and a rotated segment seeds the next one's chain so order survives.

use crate::audit::audit_events::{
    params_hash, record_hash, AuditQuery, AuditRecord, GENESIS_HASH,
};
use crate::common::Component;
use crate::error::{DbError, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// NDJSON chain file; `None` keeps the log memory-only (tests)
    pub path: Option<PathBuf>,

    /// Rotate the segment once it holds this many records (0 = never)
    pub retention_max_records: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("./data/audit/audit.ndjson")),
            retention_max_records: 0,
        }
    }
}

/// Aggregate counters for the monitoring surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditStatistics {
    pub total_records: u64,
    pub by_outcome: HashMap<String, u64>,
    pub by_action: HashMap<String, u64>,
}

/// The log. One writer at a time; readers are lock-free of the write path.
pub struct AuditLog {
    config: AuditConfig,
    records: RwLock<Vec<AuditRecord>>,
    /// Serializes appends and rotation
    writer: Mutex<WriterState>,
}

struct WriterState {
    next_seq: u64,
    last_hash: String,
}

impl AuditLog {
    /// Open the log, replaying an existing chain file if present.
    pub fn open(config: AuditConfig) -> Result<Self> {
        let mut records = Vec::new();
        if let Some(path) = &config.path {
            if path.exists() {
                let raw = std::fs::read_to_string(path)?;
                for line in raw.lines().filter(|l| !l.trim().is_empty()) {
                    let record: AuditRecord = serde_json::from_str(line).map_err(|e| {
                        DbError::Serialization(format!("corrupt audit line: {}", e))
                    })?;
                    records.push(record);
                }
            } else if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let writer = WriterState {
            next_seq: records.last().map(|r| r.seq + 1).unwrap_or(0),
            last_hash: records
                .last()
                .map(record_hash)
                .unwrap_or_else(|| GENESIS_HASH.to_string()),
        };
        Ok(Self {
            config,
            records: RwLock::new(records),
            writer: Mutex::new(writer),
        })
    }

    /// Append one event. `params` is hashed before storage; callers pass
    /// the raw payload and the log guarantees it never persists.
    pub fn append(
        &self,
        principal: &str,
        action: &str,
        resource: &str,
        params: &serde_json::Value,
        outcome: &str,
    ) -> Result<AuditRecord> {
        let record = {
            let mut writer = self.writer.lock();
            let record = AuditRecord {
                seq: writer.next_seq,
                ts: Utc::now(),
                principal: principal.to_string(),
                action: action.to_string(),
                resource: resource.to_string(),
                params_hash: params_hash(params),
                outcome: outcome.to_string(),
                prev_hash: writer.last_hash.clone(),
            };
            self.persist_line(&record)?;
            writer.next_seq += 1;
            writer.last_hash = record_hash(&record);
            self.records.write().push(record.clone());
            record
        };

        if self.config.retention_max_records > 0
            && self.records.read().len() >= self.config.retention_max_records
        {
            self.rotate_segment()?;
        }
        Ok(record)
    }

    fn persist_line(&self, record: &AuditRecord) -> Result<()> {
        if let Some(path) = &self.config.path {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            writeln!(file, "{}", serde_json::to_string(record)?)?;
        }
        Ok(())
    }

    /// Rotate the current segment. The in-memory view clears but the chain
    /// head carries the final hash, so cross-segment verification holds.
    fn rotate_segment(&self) -> Result<()> {
        let _writer = self.writer.lock();
        if let Some(path) = &self.config.path {
            let stamp = Utc::now().format("%Y%m%d%H%M%S");
            let archive = path.with_extension(format!("ndjson.{}", stamp));
            if path.exists() {
                std::fs::rename(path, archive)?;
            }
        }
        self.records.write().clear();
        tracing::info!("audit segment rotated");
        Ok(())
    }

    /// Latest sequence number, if any record exists.
    pub fn last_seq(&self) -> Option<u64> {
        self.records.read().last().map(|r| r.seq)
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Fetch one record by sequence number.
    pub fn get(&self, seq: u64) -> Option<AuditRecord> {
        let records = self.records.read();
        records
            .binary_search_by_key(&seq, |r| r.seq)
            .ok()
            .map(|i| records[i].clone())
    }

    /// Search by principal/action/resource/time range.
    pub fn search(&self, query: &AuditQuery) -> Vec<AuditRecord> {
        let records = self.records.read();
        let mut hits: Vec<AuditRecord> = records
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        if let Some(limit) = query.limit {
            hits.truncate(limit);
        }
        hits
    }

    /// Recompute the chain end-to-end. Returns the sequence number of the
    /// first record whose `prev_hash` fails to match, or `None` when the
    /// chain is intact.
    pub fn verify(&self) -> Option<u64> {
        let records = self.records.read();
        let mut expected = records
            .first()
            .map(|r| r.prev_hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        for record in records.iter() {
            if record.prev_hash != expected {
                return Some(record.seq);
            }
            expected = record_hash(record);
        }
        None
    }

    /// Verify and surface tampering as an error.
    pub fn verify_or_error(&self) -> Result<()> {
        match self.verify() {
            None => Ok(()),
            Some(seq) => Err(DbError::AuditChainMismatch(seq)),
        }
    }

    /// Newline-delimited JSON export of the current segment.
    pub fn export_ndjson(&self) -> Result<String> {
        let records = self.records.read();
        let mut out = String::new();
        for record in records.iter() {
            out.push_str(&serde_json::to_string(record)?);
            out.push('\n');
        }
        Ok(out)
    }

    /// CSV export with a header row.
    pub fn export_csv(&self) -> String {
        let mut out =
            String::from("seq,ts,principal,action,resource,params_hash,outcome,prev_hash\n");
        for record in self.records.read().iter() {
            out.push_str(&record.to_csv_line());
            out.push('\n');
        }
        out
    }

    pub fn statistics(&self) -> AuditStatistics {
        let records = self.records.read();
        let mut stats = AuditStatistics {
            total_records: records.len() as u64,
            ..Default::default()
        };
        for record in records.iter() {
            *stats.by_outcome.entry(record.outcome.clone()).or_default() += 1;
            *stats.by_action.entry(record.action.clone()).or_default() += 1;
        }
        stats
    }

    /// Test hook: flip bytes in a stored record to simulate tampering.
    #[cfg(test)]
    pub(crate) fn tamper_outcome(&self, seq: u64, outcome: &str) {
        let mut records = self.records.write();
        if let Some(record) = records.iter_mut().find(|r| r.seq == seq) {
            record.outcome = outcome.to_string();
        }
    }
}

#[async_trait]
impl Component for AuditLog {
    fn name(&self) -> &str {
        "audit-log"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn memory_log() -> AuditLog {
        AuditLog::open(AuditConfig {
            path: None,
            retention_max_records: 0,
        })
        .unwrap()
    }

    fn append_n(log: &AuditLog, n: usize) {
        for i in 0..n {
            log.append(
                "ops",
                "execute",
                "prod",
                &serde_json::json!({ "i": i }),
                "success",
            )
            .unwrap();
        }
    }

    #[test]
    fn sequence_is_monotonic_and_chain_links() {
        let log = memory_log();
        append_n(&log, 5);
        let records = log.search(&AuditQuery::default());
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.seq, i as u64);
            if i == 0 {
                assert_eq!(record.prev_hash, GENESIS_HASH);
            } else {
                assert_eq!(record.prev_hash, record_hash(&records[i - 1]));
            }
        }
        assert_eq!(log.verify(), None);
    }

    #[test]
    fn tampering_is_detected_at_the_next_link() {
        let log = memory_log();
        append_n(&log, 100);
        log.tamper_outcome(42, "denied");
        // Record 42's stored hash input changed, so record 43's prev_hash
        // no longer matches the recomputation.
        assert_eq!(log.verify(), Some(43));
        assert!(matches!(
            log.verify_or_error(),
            Err(DbError::AuditChainMismatch(43))
        ));
    }

    #[test]
    fn chain_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let config = AuditConfig {
            path: Some(dir.path().join("audit.ndjson")),
            retention_max_records: 0,
        };
        {
            let log = AuditLog::open(config.clone()).unwrap();
            append_n(&log, 3);
        }
        let log = AuditLog::open(config).unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log.verify(), None);
        // New appends continue the chain.
        log.append("ops", "execute", "prod", &serde_json::json!({}), "success")
            .unwrap();
        assert_eq!(log.verify(), None);
        assert_eq!(log.last_seq(), Some(3));
    }

    #[test]
    fn search_and_export() {
        let log = memory_log();
        append_n(&log, 3);
        log.append("alice", "vault.get", "pg-creds", &serde_json::json!({}), "success")
            .unwrap();

        let hits = log.search(&AuditQuery {
            principal: Some("alice".into()),
            ..Default::default()
        });
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].action, "vault.get");

        let ndjson = log.export_ndjson().unwrap();
        assert_eq!(ndjson.lines().count(), 4);
        let csv = log.export_csv();
        assert!(csv.starts_with("seq,ts,"));
        assert_eq!(csv.lines().count(), 5);

        let stats = log.statistics();
        assert_eq!(stats.total_records, 4);
        assert_eq!(stats.by_outcome["success"], 4);
    }

    #[test]
    fn raw_params_never_persist() {
        let log = memory_log();
        log.append(
            "ops",
            "execute",
            "prod",
            &serde_json::json!({"password": "hunter2"}),
            "success",
        )
        .unwrap();
        let ndjson = log.export_ndjson().unwrap();
        assert!(!ndjson.contains("hunter2"));
    }

    #[test]
    fn retention_rotates_whole_segments() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::open(AuditConfig {
            path: Some(dir.path().join("audit.ndjson")),
            retention_max_records: 10,
        })
        .unwrap();
        append_n(&log, 25);
        // Rotation happened at least twice; the live segment stays small.
        assert!(log.len() <= 10);
        let archived = std::fs::read_dir(dir.path()).unwrap().count();
        assert!(archived >= 2);
        assert_eq!(log.verify(), None);
    }
}
