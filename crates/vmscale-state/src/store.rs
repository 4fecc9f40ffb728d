//! StateStore — redb-backed record of hosts, group membership, and domains.
//!
//! Callers treat every method as atomic: each one opens, uses, and commits
//! its own transaction.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use vmscale_core::ControllerConfig;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (dry runs and tests).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(HOSTS).map_err(map_err!(Table))?;
        txn.open_table(GROUP_MEMBERS).map_err(map_err!(Table))?;
        txn.open_table(DOMAINS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put<T: Serialize>(&self, table: Table, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn remove(&self, table: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Keys and decoded values whose key starts with `prefix`, in key order.
    fn scan<T: DeserializeOwned>(&self, table: Table, prefix: &str) -> StateResult<Vec<(String, T)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.range(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            let decoded = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push((key.to_string(), decoded));
        }
        Ok(results)
    }

    // ── Hosts ──────────────────────────────────────────────────────

    /// Insert or replace a host record.
    pub fn upsert_host(&self, host: &HostRecord) -> StateResult<()> {
        self.put(HOSTS, &host.name, host)?;
        debug!(host = %host.name, "host stored");
        Ok(())
    }

    pub fn get_host(&self, name: &str) -> StateResult<Option<HostRecord>> {
        self.get(HOSTS, name)
    }

    pub fn host_exists(&self, name: &str) -> StateResult<bool> {
        Ok(self.get_host(name)?.is_some())
    }

    pub fn list_hosts(&self) -> StateResult<Vec<HostRecord>> {
        Ok(self.scan(HOSTS, "")?.into_iter().map(|(_, h)| h).collect())
    }

    /// Record that `host` belongs to `group`. The host must already exist.
    pub fn add_group_member(&self, group: &str, host: &str) -> StateResult<()> {
        if !self.host_exists(host)? {
            return Err(StateError::UnknownHost(host.to_string()));
        }
        self.put(GROUP_MEMBERS, &member_key(group, host), &())?;
        debug!(%group, %host, "group member registered");
        Ok(())
    }

    /// Drop a host from a group. Returns true if it was a member.
    pub fn remove_group_member(&self, group: &str, host: &str) -> StateResult<bool> {
        self.remove(GROUP_MEMBERS, &member_key(group, host))
    }

    /// Host records for every member of `group`, sorted by host name.
    pub fn list_hosts_by_group(&self, group: &str) -> StateResult<Vec<HostRecord>> {
        let prefix = member_key(group, "");
        let mut hosts = Vec::new();
        for (key, ()) in self.scan::<()>(GROUP_MEMBERS, &prefix)? {
            let name = &key[prefix.len()..];
            if let Some(host) = self.get_host(name)? {
                hosts.push(host);
            }
        }
        Ok(hosts)
    }

    // ── Domains ────────────────────────────────────────────────────

    /// Insert or replace a domain record.
    pub fn upsert_domain(&self, domain: &DomainRecord) -> StateResult<()> {
        let key = domain.table_key();
        self.put(DOMAINS, &key, domain)?;
        debug!(%key, state = ?domain.state, host = %domain.host, "domain stored");
        Ok(())
    }

    pub fn get_domain(&self, group: &str, name: &str) -> StateResult<Option<DomainRecord>> {
        self.get(DOMAINS, &domain_key(group, name))
    }

    /// Delete a domain record. Returns true if it existed.
    pub fn delete_domain(&self, group: &str, name: &str) -> StateResult<bool> {
        let key = domain_key(group, name);
        let existed = self.remove(DOMAINS, &key)?;
        debug!(%key, existed, "domain deleted");
        Ok(existed)
    }

    /// Every domain record of `group`, sorted by name.
    pub fn list_domains_by_group(&self, group: &str) -> StateResult<Vec<DomainRecord>> {
        let prefix = domain_key(group, "");
        Ok(self.scan(DOMAINS, &prefix)?.into_iter().map(|(_, d)| d).collect())
    }

    /// Every domain placed on `host`, across all groups.
    pub fn list_domains_by_host(&self, host: &str) -> StateResult<Vec<DomainRecord>> {
        Ok(self
            .scan::<DomainRecord>(DOMAINS, "")?
            .into_iter()
            .map(|(_, d)| d)
            .filter(|d| d.host == host)
            .collect())
    }

    // ── Inventory ──────────────────────────────────────────────────

    /// Mirror the configured hosts and group membership.
    ///
    /// Hosts are upserted, keeping the recorded power state of hosts that
    /// are already known. Membership is set to exactly the configured host
    /// list of each group. Hosts and domains are never deleted here.
    pub fn sync_inventory(&self, config: &ControllerConfig, now: u64) -> StateResult<()> {
        let autoscale = &config.controller.autoscale;
        for host in &autoscale.hosts {
            let mut record = HostRecord::from_config(host, now);
            if let Some(existing) = self.get_host(&host.name)? {
                record.powered = existing.powered;
            }
            self.upsert_host(&record)?;
        }

        for (group, spec) in &autoscale.groups {
            for stale in self.list_hosts_by_group(group)? {
                if !spec.hosts.contains(&stale.name) {
                    self.remove_group_member(group, &stale.name)?;
                    info!(%group, host = %stale.name, "host left group");
                }
            }
            for host in &spec.hosts {
                self.add_group_member(group, host)?;
            }
        }
        info!(
            hosts = autoscale.hosts.len(),
            groups = autoscale.groups.len(),
            "inventory synchronized"
        );
        Ok(())
    }
}
