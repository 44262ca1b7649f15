//! In-memory run store
//!
//! Ephemeral by design: records do not survive process restarts. Writes
//! happen exactly once per run, at the end of the pipeline; there is no
//! iteration API and no eviction.

use std::collections::HashMap;

use tokio::sync::RwLock;

use runbox_core::RunRecord;

#[derive(Default)]
pub struct RunStore {
    inner: RwLock<HashMap<String, RunRecord>>,
}

impl RunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: RunRecord) {
        self.inner.write().await.insert(record.id.clone(), record);
    }

    pub async fn get(&self, id: &str) -> Option<RunRecord> {
        self.inner.read().await.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use runbox_core::{code_sha256, Language, RunLimits, RunStatus, Usage};

    fn record(id: &str) -> RunRecord {
        RunRecord {
            id: id.to_string(),
            status: RunStatus::Succeeded,
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            usage: Usage::default(),
            artifacts: Vec::new(),
            limits: RunLimits::default(),
            created_at: Utc::now(),
            language: Language::Python,
            code_sha256: code_sha256(""),
        }
    }

    #[tokio::test]
    async fn test_insert_then_get() {
        let store = RunStore::new();
        store.insert(record("run_aaaaaaaaaaaa")).await;
        let found = store.get("run_aaaaaaaaaaaa").await.unwrap();
        assert_eq!(found.id, "run_aaaaaaaaaaaa");
        assert!(store.get("run_bbbbbbbbbbbb").await.is_none());
    }
}
