//! State transition implementations for the run lifecycle.

use super::types::{Finished, Initializing, RunRecord, RunStats, Running};
use crate::error::Result;
use crate::store::RunStorage;

impl RunRecord<Initializing> {
    /// Transition from Initializing to Running.
    pub async fn start<S: RunStorage + ?Sized>(self, storage: &S) -> Result<RunRecord<Running>> {
        let record = RunRecord {
            data: self.data,
            state: Running {
                started_at: self.state.started_at,
                last_heartbeat: chrono::Utc::now(),
                stats: RunStats::default(),
            },
        };
        storage.persist_run(&record).await?;
        Ok(record)
    }
}

impl RunRecord<Running> {
    /// Refresh the heartbeat and statistics.
    pub async fn heartbeat<S: RunStorage + ?Sized>(
        self,
        stats: RunStats,
        storage: &S,
    ) -> Result<RunRecord<Running>> {
        let record = RunRecord {
            data: self.data,
            state: Running {
                started_at: self.state.started_at,
                last_heartbeat: chrono::Utc::now(),
                stats,
            },
        };
        storage.persist_run(&record).await?;
        Ok(record)
    }

    /// Close the run with its final statistics.
    pub async fn finish<S: RunStorage + ?Sized>(
        self,
        final_stats: RunStats,
        error: Option<String>,
        storage: &S,
    ) -> Result<RunRecord<Finished>> {
        let record = RunRecord {
            data: self.data,
            state: Finished {
                started_at: self.state.started_at,
                finished_at: chrono::Utc::now(),
                final_stats,
                error,
            },
        };
        storage.persist_run(&record).await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::super::types::{AnyRunRecord, RunData, RunId, RunState};
    use super::*;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    /// Mock storage for testing run state transitions.
    #[derive(Default, Clone)]
    struct MockRunStorage {
        records: Arc<Mutex<Vec<AnyRunRecord>>>,
    }

    #[async_trait]
    impl RunStorage for MockRunStorage {
        async fn persist_run<T: RunState + Clone>(&self, record: &RunRecord<T>) -> Result<()>
        where
            AnyRunRecord: From<RunRecord<T>>,
        {
            let any = AnyRunRecord::from(record.clone());
            let mut records = self.records.lock().unwrap();
            if let Some(existing) = records.iter_mut().find(|r| r.id() == any.id()) {
                *existing = any;
            } else {
                records.push(any);
            }
            Ok(())
        }

        async fn get_run(&self, run_id: RunId) -> Result<AnyRunRecord> {
            let records = self.records.lock().unwrap();
            records
                .iter()
                .find(|r| r.id() == run_id)
                .cloned()
                .ok_or_else(|| crate::error::TexpostError::Other(anyhow::anyhow!("Run not found")))
        }

        async fn list_runs(&self) -> Result<Vec<AnyRunRecord>> {
            Ok(self.records.lock().unwrap().clone())
        }
    }

    fn test_run_data() -> RunData {
        RunData {
            id: RunId::new(),
            hostname: "test-host".to_string(),
            pid: 12345,
            version: "test-v1".to_string(),
            watch: false,
            config_snapshot: serde_json::json!({"test": "config"}),
        }
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let storage = MockRunStorage::default();
        let data = test_run_data();
        let run_id = data.id;

        let initializing = RunRecord {
            data,
            state: Initializing {
                started_at: chrono::Utc::now(),
            },
        };
        let mut running = initializing.start(&storage).await.unwrap();
        assert!(matches!(
            storage.get_run(run_id).await.unwrap(),
            AnyRunRecord::Running(_)
        ));

        for i in 1..=3 {
            let stats = RunStats {
                batches: 1,
                records_sent: i * 10,
                records_failed: i,
                retries: 0,
                records_in_flight: 2,
            };
            running = running.heartbeat(stats, &storage).await.unwrap();
        }
        assert_eq!(running.state.stats.records_sent, 30);

        let started_at = running.state.started_at;
        let final_stats = running.state.stats.clone();
        let finished = running
            .finish(final_stats, Some("auth failed".into()), &storage)
            .await
            .unwrap();
        assert_eq!(finished.state.started_at, started_at);
        assert!(finished.state.finished_at >= started_at);

        match storage.get_run(run_id).await.unwrap() {
            AnyRunRecord::Finished(r) => {
                assert_eq!(r.state.final_stats.records_sent, 30);
                assert_eq!(r.state.error.as_deref(), Some("auth failed"));
            }
            other => panic!("Expected Finished state, got {}", other.status()),
        }
        assert_eq!(storage.list_runs().await.unwrap().len(), 1);
    }
}
