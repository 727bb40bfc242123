//! Client registry and snapshot persistence
//!
//! The registry is owned by the broker's dispatcher and mutated from exactly
//! one place. Ids are `<type><NNN>` from a counter that is never reused, so
//! an id seen in a log always refers to the same client even across evictions
//! and re-registrations.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use fleetlink_shared::timing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    Vehicle,
    App,
    Hybrid,
}

impl ClientType {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Vehicle => "vehicle",
            Self::App => "app",
            Self::Hybrid => "hybrid",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRecord {
    pub name: String,
    pub desc: String,
    #[serde(rename = "type")]
    pub client_type: ClientType,
    /// Empty until the client binds its endpoint (two-phase registration)
    pub ip: String,
    pub port: u16,
    pub capabilities: Vec<String>,
    /// `"broker"` when unleased, otherwise the owning client id
    pub owner: String,
    /// Unix seconds of the last message received from this client
    pub last_seen: f64,
}

impl ClientRecord {
    pub fn is_bound(&self) -> bool {
        !self.ip.is_empty()
    }

    pub fn is_fresh(&self, now: f64) -> bool {
        now - self.last_seen < timing::LEASE_FRESH_S
    }

    pub fn is_stale(&self, now: f64) -> bool {
        now - self.last_seen > timing::CLIENT_STALE_S
    }

    /// Case-insensitive superset check against a requested capability list
    pub fn has_capabilities(&self, requested: &[String]) -> bool {
        requested.iter().all(|want| {
            self.capabilities
                .iter()
                .any(|have| have.eq_ignore_ascii_case(want))
        })
    }
}

/// Everything needed to resume after a restart
#[derive(Debug, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "nextIndex")]
    pub next_index: u32,
    pub clients: BTreeMap<String, ClientRecord>,
}

pub struct Registry {
    next_index: u32,
    clients: BTreeMap<String, ClientRecord>,
    snapshot_path: PathBuf,
}

impl Registry {
    /// Empty registry, counter at 1
    pub fn new(snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            next_index: 1,
            clients: BTreeMap::new(),
            snapshot_path: snapshot_path.into(),
        }
    }

    /// Resume from the snapshot file, or start virgin if there is none
    pub fn restore(snapshot_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let snapshot_path = snapshot_path.into();
        if !snapshot_path.exists() {
            info!("no snapshot at {}, starting virgin", snapshot_path.display());
            return Ok(Self::new(snapshot_path));
        }
        let data = fs::read_to_string(&snapshot_path)
            .with_context(|| format!("reading snapshot {}", snapshot_path.display()))?;
        let snapshot: Snapshot = serde_json::from_str(&data)
            .with_context(|| format!("parsing snapshot {}", snapshot_path.display()))?;
        info!(
            clients = snapshot.clients.len(),
            next_index = snapshot.next_index,
            "restored registry from {}",
            snapshot_path.display()
        );
        Ok(Self {
            next_index: snapshot.next_index,
            clients: snapshot.clients,
            snapshot_path,
        })
    }

    /// Write the full snapshot; called after every mutation, last write wins
    pub fn save(&self) {
        let snapshot = Snapshot {
            next_index: self.next_index,
            clients: self.clients.clone(),
        };
        let result = serde_json::to_string_pretty(&snapshot)
            .map_err(anyhow::Error::from)
            .and_then(|json| fs::write(&self.snapshot_path, json).map_err(anyhow::Error::from));
        if let Err(e) = result {
            warn!("failed to write snapshot {}: {e}", self.snapshot_path.display());
        }
    }

    /// Allocate the next id for a client type; the counter never goes back
    pub fn allocate_id(&mut self, client_type: ClientType) -> String {
        let id = format!("{}{:03}", client_type.prefix(), self.next_index);
        self.next_index += 1;
        id
    }

    pub fn next_index(&self) -> u32 {
        self.next_index
    }

    pub fn insert(&mut self, id: String, record: ClientRecord) {
        self.clients.insert(id, record);
    }

    pub fn remove(&mut self, id: &str) -> Option<ClientRecord> {
        self.clients.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&ClientRecord> {
        self.clients.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ClientRecord> {
        self.clients.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.clients.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ClientRecord)> {
        self.clients.iter()
    }

    pub fn touch(&mut self, id: &str, now: f64) {
        if let Some(record) = self.clients.get_mut(id) {
            record.last_seen = now;
        }
    }

    /// Live vehicle record currently registered on `ip`, if any
    pub fn live_vehicle_on_ip(&self, ip: &str, now: f64) -> Option<&str> {
        self.clients
            .iter()
            .find(|(_, r)| {
                r.client_type == ClientType::Vehicle && r.ip == ip && r.is_fresh(now)
            })
            .map(|(id, _)| id.as_str())
    }

    /// Stale vehicle records registered on `ip`
    pub fn stale_vehicles_on_ip(&self, ip: &str, now: f64) -> Vec<String> {
        self.clients
            .iter()
            .filter(|(_, r)| {
                r.client_type == ClientType::Vehicle && r.ip == ip && !r.is_fresh(now)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Tightest-fit capability match among fresh, bound, unleased vehicles
    ///
    /// Among candidates whose capability set is a superset of `requested`,
    /// pick the one with the fewest capabilities; ties resolve to the lowest
    /// id, which keeps allocation deterministic.
    pub fn find_available(&self, requested: &[String], now: f64) -> Option<&str> {
        self.clients
            .iter()
            .filter(|(_, r)| {
                r.client_type == ClientType::Vehicle
                    && r.owner == "broker"
                    && r.is_bound()
                    && r.is_fresh(now)
                    && r.has_capabilities(requested)
            })
            .min_by_key(|(id, r)| (r.capabilities.len(), id.as_str()))
            .map(|(id, _)| id.as_str())
    }

    /// Ids silent for longer than the staleness threshold
    pub fn stale_ids(&self, now: f64) -> Vec<String> {
        self.clients
            .iter()
            .filter(|(_, r)| r.is_stale(now))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Vehicles currently owned by `owner`
    pub fn vehicles_owned_by(&self, owner: &str) -> Vec<String> {
        self.clients
            .iter()
            .filter(|(_, r)| r.client_type == ClientType::Vehicle && r.owner == owner)
            .map(|(id, _)| id.clone())
            .collect()
    }
}
