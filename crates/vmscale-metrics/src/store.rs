//! MetricsStore — per-host utilization samples in redb.
//!
//! Samples live in one table keyed `{subject}:{metric}:{timestamp:020}`, so
//! a subject/metric pair is a contiguous key range ordered by time.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::debug;

use crate::error::{MetricsError, MetricsResult};

macro_rules! map_err {
    ($variant:ident) => {
        |e| MetricsError::$variant(e.to_string())
    };
}

const SAMPLES: TableDefinition<&str, f64> = TableDefinition::new("samples");

/// One observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp: u64,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: u64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

fn series_prefix(subject: &str, metric: &str) -> String {
    format!("{subject}:{metric}:")
}

fn sample_key(subject: &str, metric: &str, timestamp: u64) -> String {
    format!("{subject}:{metric}:{timestamp:020}")
}

fn key_timestamp(key: &str) -> MetricsResult<u64> {
    key.rsplit(':')
        .next()
        .and_then(|ts| ts.parse().ok())
        .ok_or_else(|| MetricsError::BadKey(key.to_string()))
}

#[derive(Clone)]
pub struct MetricsStore {
    db: Arc<Database>,
}

impl MetricsStore {
    pub fn open(path: &Path) -> MetricsResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "metrics store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> MetricsResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        Ok(store)
    }

    fn ensure_tables(&self) -> MetricsResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(SAMPLES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Store one sample; a second sample at the same timestamp replaces it.
    pub fn record(&self, subject: &str, metric: &str, sample: Sample) -> MetricsResult<()> {
        let key = sample_key(subject, metric, sample.timestamp);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SAMPLES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), sample.value)
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// The most recent `n` samples of a series, oldest first.
    pub fn trailing_window(&self, subject: &str, metric: &str, n: usize) -> MetricsResult<Vec<Sample>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let start = series_prefix(subject, metric);
        // ';' sorts right after ':', closing the range over this series.
        let end = format!("{subject}:{metric};");

        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SAMPLES).map_err(map_err!(Table))?;
        let mut window = Vec::with_capacity(n);
        for entry in table
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
            .rev()
            .take(n)
        {
            let (key, value) = entry.map_err(map_err!(Read))?;
            window.push(Sample::new(key_timestamp(key.value())?, value.value()));
        }
        window.reverse();
        Ok(window)
    }

    /// Drop every sample older than `cutoff`. Returns how many were removed.
    pub fn prune_before(&self, cutoff: u64) -> MetricsResult<usize> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed;
        {
            let mut table = txn.open_table(SAMPLES).map_err(map_err!(Table))?;
            let mut stale = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, _) = entry.map_err(map_err!(Read))?;
                let key = key.value();
                if key_timestamp(key)? < cutoff {
                    stale.push(key.to_string());
                }
            }
            for key in &stale {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            removed = stale.len();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if removed > 0 {
            debug!(removed, cutoff, "pruned metric samples");
        }
        Ok(removed)
    }
}
