//! Server registry
//!
//! Tracks every known tool server: address, capabilities, tags, connection
//! status and rolling request metrics. The map itself sits behind a
//! read-write lock while each record has its own mutex, so outcome reports
//! for different servers never contend and reports for the same server are
//! applied one at a time.

use crate::Result;
use crate::config::{RegistryConfig, ServerAddress, ServerConfig};
use crate::discovery::DiscoveredServer;
use crate::error::MeshError;
use crate::events::{EventBus, MeshEvent};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Connection status of a server as seen by its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    #[default]
    Unknown,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// How a server entered the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerOrigin {
    /// Configured or registered explicitly; never auto-removed
    Static,
    /// Found by a discovery sweep
    Discovered,
}

/// Everything the registry knows about one server
#[derive(Debug, Clone, Serialize)]
pub struct ServerRecord {
    pub id: String,
    pub name: String,
    pub address: ServerAddress,
    pub capabilities: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    pub origin: ServerOrigin,
    pub status: ServerStatus,
    pub success_count: u64,
    pub error_count: u64,
    /// Exponential moving average of request latency
    pub ema_latency_ms: Option<f64>,
    pub last_seen: Option<DateTime<Utc>>,
    /// Consecutive discovery sweeps this server was absent from
    pub missed_sweeps: u32,
}

impl ServerRecord {
    pub fn new(id: impl Into<String>, address: ServerAddress) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            address,
            capabilities: BTreeSet::new(),
            tags: BTreeSet::new(),
            origin: ServerOrigin::Static,
            status: ServerStatus::Unknown,
            success_count: 0,
            error_count: 0,
            ema_latency_ms: None,
            last_seen: None,
            missed_sweeps: 0,
        }
    }

    pub fn from_config(id: impl Into<String>, config: &ServerConfig) -> Self {
        let mut record = Self::new(id, config.address.clone());
        if let Some(name) = &config.name {
            record.name.clone_from(name);
        }
        record.capabilities = config.capabilities.iter().cloned().collect();
        record.tags = config.tags.iter().cloned().collect();
        record
    }

    pub(crate) fn from_discovered(server: &DiscoveredServer) -> Self {
        let mut record = Self::new(server.id.clone(), server.address.clone());
        record.capabilities = server.capabilities.iter().cloned().collect();
        record.tags = server.tags.iter().cloned().collect();
        record.origin = ServerOrigin::Discovered;
        record
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_origin(mut self, origin: ServerOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn total_requests(&self) -> u64 {
        self.success_count + self.error_count
    }

    /// Share of failed requests over the record's lifetime
    pub fn error_rate(&self) -> f64 {
        match self.total_requests() {
            0 => 0.0,
            total => self.error_count as f64 / total as f64,
        }
    }
}

/// Result of reconciling the registry with a discovery source
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Discovered servers whose address changed since the last sweep
    pub readdressed: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.readdressed.is_empty()
    }
}

type Entry = Arc<Mutex<ServerRecord>>;

/// Registry of known servers
pub struct ServerRegistry {
    servers: RwLock<HashMap<String, Entry>>,
    config: RegistryConfig,
    events: Arc<EventBus>,
}

impl ServerRegistry {
    pub fn new(config: RegistryConfig, events: Arc<EventBus>) -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            config,
            events,
        }
    }

    fn entry(&self, id: &str) -> Option<Entry> {
        self.servers.read().get(id).cloned()
    }

    /// Add a server; its status always starts as `unknown`
    pub fn register(&self, mut record: ServerRecord) -> Result<()> {
        let id = record.id.clone();
        {
            let mut servers = self.servers.write();
            if servers.contains_key(&id) {
                return Err(MeshError::DuplicateServer(id));
            }
            record.status = ServerStatus::Unknown;
            servers.insert(id.clone(), Arc::new(Mutex::new(record)));
        }

        info!(server_id = %id, "Registered server");
        self.events
            .emit(MeshEvent::ServerRegistered { server_id: id });
        Ok(())
    }

    /// Remove a server; returns whether it was present
    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.servers.write().remove(id).is_some();
        if removed {
            info!(server_id = %id, "Unregistered server");
            self.events.emit(MeshEvent::ServerUnregistered {
                server_id: id.to_string(),
            });
        }
        removed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.servers.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.servers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.read().is_empty()
    }

    /// Copy of one record
    pub fn get(&self, id: &str) -> Option<ServerRecord> {
        self.entry(id).map(|e| e.lock().clone())
    }

    /// Sorted ids of every registered server
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.servers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Copies of every record, ordered by id
    pub fn snapshot(&self) -> Vec<ServerRecord> {
        let entries: Vec<Entry> = self.servers.read().values().cloned().collect();
        let mut records: Vec<ServerRecord> = entries.iter().map(|e| e.lock().clone()).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Servers declaring or advertising `capability`, ordered by id
    pub fn list_by_capability(&self, capability: &str) -> Vec<ServerRecord> {
        let entries: Vec<Entry> = self.servers.read().values().cloned().collect();
        let mut matches: Vec<ServerRecord> = entries
            .iter()
            .filter_map(|e| {
                let record = e.lock();
                record.has_capability(capability).then(|| record.clone())
            })
            .collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        matches
    }

    /// Set the connection status; returns whether it changed
    ///
    /// Unknown ids are logged and ignored.
    pub fn update_status(&self, id: &str, status: ServerStatus) -> bool {
        let Some(entry) = self.entry(id) else {
            debug!(server_id = %id, %status, "Status update for unknown server ignored");
            return false;
        };

        let previous = {
            let mut record = entry.lock();
            let previous = record.status;
            if previous == status {
                return false;
            }
            record.status = status;
            if status == ServerStatus::Connected {
                record.last_seen = Some(Utc::now());
            }
            previous
        };

        debug!(server_id = %id, from = %previous, to = %status, "Server status changed");
        self.events.emit(MeshEvent::ServerStatusChanged {
            server_id: id.to_string(),
            from: previous,
            to: status,
        });
        true
    }

    /// Fold one request outcome into the server's counters and latency EMA
    pub fn record_outcome(&self, id: &str, success: bool, latency: Duration) -> Result<()> {
        let entry = self
            .entry(id)
            .ok_or_else(|| MeshError::UnknownServer(id.to_string()))?;

        let sample = latency.as_secs_f64() * 1000.0;
        let alpha = self.config.ema_alpha;

        let mut record = entry.lock();
        if success {
            record.success_count += 1;
            record.last_seen = Some(Utc::now());
        } else {
            record.error_count += 1;
        }
        record.ema_latency_ms = Some(match record.ema_latency_ms {
            Some(prev) => alpha * sample + (1.0 - alpha) * prev,
            None => sample,
        });

        debug!(
            server_id = %id,
            success,
            latency_ms = sample,
            ema_ms = record.ema_latency_ms.unwrap_or(sample),
            "Recorded outcome"
        );
        Ok(())
    }

    /// Union advertised capabilities into a record; returns how many were new
    pub fn merge_capabilities<I, S>(&self, id: &str, capabilities: I) -> Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entry = self
            .entry(id)
            .ok_or_else(|| MeshError::UnknownServer(id.to_string()))?;

        let mut record = entry.lock();
        let before = record.capabilities.len();
        record
            .capabilities
            .extend(capabilities.into_iter().map(Into::into));
        Ok(record.capabilities.len() - before)
    }

    /// Reconcile against one discovery sweep
    ///
    /// New servers are registered as discovered. Discovered servers missing
    /// from the configured number of consecutive sweeps are removed; static
    /// servers are only refreshed, never removed.
    pub fn reconcile(&self, discovered: &[DiscoveredServer]) -> SweepReport {
        let mut report = SweepReport::default();
        let seen: HashSet<&str> = discovered.iter().map(|d| d.id.as_str()).collect();
        let threshold = self.config.missed_sweeps_before_removal.max(1);

        {
            let mut servers = self.servers.write();

            for server in discovered {
                match servers.get(&server.id) {
                    Some(entry) => {
                        let mut record = entry.lock();
                        record.missed_sweeps = 0;
                        record.last_seen = Some(Utc::now());
                        record
                            .capabilities
                            .extend(server.capabilities.iter().cloned());
                        record.tags.extend(server.tags.iter().cloned());
                        if record.origin == ServerOrigin::Discovered
                            && record.address != server.address
                        {
                            record.address = server.address.clone();
                            report.readdressed.push(server.id.clone());
                        }
                    }
                    None => {
                        let mut record = ServerRecord::from_discovered(server);
                        record.last_seen = Some(Utc::now());
                        servers.insert(server.id.clone(), Arc::new(Mutex::new(record)));
                        report.added.push(server.id.clone());
                    }
                }
            }

            let absent: Vec<String> = servers
                .iter()
                .filter(|(id, _)| !seen.contains(id.as_str()))
                .filter_map(|(id, entry)| {
                    let mut record = entry.lock();
                    if record.origin != ServerOrigin::Discovered {
                        return None;
                    }
                    record.missed_sweeps += 1;
                    (record.missed_sweeps >= threshold).then(|| id.clone())
                })
                .collect();

            for id in absent {
                servers.remove(&id);
                report.removed.push(id);
            }
        }

        report.added.sort();
        report.removed.sort();

        for id in &report.added {
            info!(server_id = %id, "Discovered server");
            self.events.emit(MeshEvent::ServerRegistered {
                server_id: id.clone(),
            });
        }
        for id in &report.removed {
            info!(server_id = %id, "Server vanished from discovery, unregistered");
            self.events.emit(MeshEvent::ServerUnregistered {
                server_id: id.clone(),
            });
        }

        report
    }
}
