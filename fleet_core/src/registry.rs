//! Agent Registry - the single source of truth for "where is agent X now".

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use crate::distance::Coordinate;
use crate::error::TrackerError;

/// Operational status reported alongside each position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Online,
    Busy,
    Offline,
}

impl AgentStatus {
    pub const ALL: [AgentStatus; 3] = [AgentStatus::Online, AgentStatus::Busy, AgentStatus::Offline];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Online => "online",
            AgentStatus::Busy => "busy",
            AgentStatus::Offline => "offline",
        }
    }

    pub(crate) fn slot(&self) -> usize {
        match self {
            AgentStatus::Online => 0,
            AgentStatus::Busy => 1,
            AgentStatus::Offline => 2,
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "online" => Ok(AgentStatus::Online),
            "busy" => Ok(AgentStatus::Busy),
            "offline" => Ok(AgentStatus::Offline),
            other => Err(TrackerError::InvalidStatus(other.to_string())),
        }
    }
}

/// The live state of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,

    /// Latitude at 6-decimal precision
    pub latitude: f64,

    /// Longitude at 6-decimal precision
    pub longitude: f64,

    pub status: AgentStatus,

    /// Context clock reading (monotonic) at the last update
    pub last_update: Duration,

    /// Wall-clock time of the last update
    pub reported_at: SystemTime,
}

impl AgentRecord {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }

    /// Time since the last update, saturating at zero.
    pub fn age(&self, now: Duration) -> Duration {
        now.saturating_sub(self.last_update)
    }

    /// Strictly older than `threshold`.
    pub fn is_stale(&self, now: Duration, threshold: Duration) -> bool {
        self.age(now) > threshold
    }
}

/// Number of live agents per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub online: usize,
    pub busy: usize,
    pub offline: usize,
}

impl StatusCounts {
    pub fn record(&mut self, status: AgentStatus) {
        match status {
            AgentStatus::Online => self.online += 1,
            AgentStatus::Busy => self.busy += 1,
            AgentStatus::Offline => self.offline += 1,
        }
    }

    pub fn merge(&mut self, other: StatusCounts) {
        self.online += other.online;
        self.busy += other.busy;
        self.offline += other.offline;
    }

    pub fn total(&self) -> usize {
        self.online + self.busy + self.offline
    }
}

/// Agent id → record map for one partition.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    records: HashMap<String, AgentRecord>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or overwrites the record for `agent_id`.
    ///
    /// Returns the record it replaced, if any.
    pub fn upsert(
        &mut self,
        agent_id: &str,
        position: Coordinate,
        status: AgentStatus,
        now: Duration,
        reported_at: SystemTime,
    ) -> Option<AgentRecord> {
        let record = AgentRecord {
            agent_id: agent_id.to_string(),
            latitude: position.latitude,
            longitude: position.longitude,
            status,
            last_update: now,
            reported_at,
        };

        match self.records.get_mut(agent_id) {
            Some(existing) => Some(std::mem::replace(existing, record)),
            None => {
                self.records.insert(record.agent_id.clone(), record);
                None
            }
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentRecord> {
        self.records.get(agent_id)
    }

    pub fn remove(&mut self, agent_id: &str) -> Option<AgentRecord> {
        self.records.remove(agent_id)
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.records.contains_key(agent_id)
    }

    /// Point-in-time copy of every record.
    pub fn snapshot(&self) -> Vec<AgentRecord> {
        self.records.values().cloned().collect()
    }

    /// Ids of records older than `threshold` at `now`.
    pub fn stale_ids(&self, now: Duration, threshold: Duration) -> Vec<String> {
        self.records
            .values()
            .filter(|record| record.is_stale(now, threshold))
            .map(|record| record.agent_id.clone())
            .collect()
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for record in self.records.values() {
            counts.record(record.status);
        }
        counts
    }

    pub fn records(&self) -> impl Iterator<Item = &AgentRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AT: Coordinate = Coordinate::new(25.0330, 121.5654);

    fn upsert(registry: &mut AgentRegistry, id: &str, status: AgentStatus, secs: u64) -> Option<AgentRecord> {
        registry.upsert(id, AT, status, Duration::from_secs(secs), SystemTime::UNIX_EPOCH)
    }

    #[test]
    fn test_first_upsert_has_no_previous() {
        let mut registry = AgentRegistry::new();
        assert!(upsert(&mut registry, "A", AgentStatus::Online, 0).is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("A").unwrap().coordinate(), AT);
    }

    #[test]
    fn test_upsert_returns_previous_and_overwrites() {
        let mut registry = AgentRegistry::new();
        upsert(&mut registry, "A", AgentStatus::Online, 1);

        let previous = upsert(&mut registry, "A", AgentStatus::Busy, 5).unwrap();
        assert_eq!(previous.status, AgentStatus::Online);
        assert_eq!(previous.last_update, Duration::from_secs(1));

        let current = registry.get("A").unwrap();
        assert_eq!(current.status, AgentStatus::Busy);
        assert_eq!(current.last_update, Duration::from_secs(5));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove() {
        let mut registry = AgentRegistry::new();
        upsert(&mut registry, "A", AgentStatus::Online, 0);

        assert!(registry.remove("A").is_some());
        assert!(registry.remove("A").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_staleness_is_strict() {
        let mut registry = AgentRegistry::new();
        upsert(&mut registry, "old", AgentStatus::Online, 0);
        upsert(&mut registry, "new", AgentStatus::Online, 30);

        let threshold = Duration::from_secs(60);
        // Exactly at the threshold is still fresh
        assert!(registry.stale_ids(Duration::from_secs(60), threshold).is_empty());
        assert_eq!(registry.stale_ids(Duration::from_secs(61), threshold), vec!["old".to_string()]);

        let mut both = registry.stale_ids(Duration::from_secs(100), threshold);
        both.sort();
        assert_eq!(both, vec!["new".to_string(), "old".to_string()]);
    }

    #[test]
    fn test_age_saturates() {
        let mut registry = AgentRegistry::new();
        upsert(&mut registry, "A", AgentStatus::Online, 10);
        let record = registry.get("A").unwrap();
        assert_eq!(record.age(Duration::from_secs(5)), Duration::ZERO);
    }

    #[test]
    fn test_snapshot_and_status_counts() {
        let mut registry = AgentRegistry::new();
        upsert(&mut registry, "A", AgentStatus::Online, 0);
        upsert(&mut registry, "B", AgentStatus::Busy, 0);
        upsert(&mut registry, "C", AgentStatus::Busy, 0);

        assert_eq!(registry.snapshot().len(), 3);
        let counts = registry.status_counts();
        assert_eq!(counts, StatusCounts { online: 1, busy: 2, offline: 0 });
        assert_eq!(counts.total(), 3);
    }

    #[test]
    fn test_status_parse_and_serde() {
        assert_eq!("busy".parse::<AgentStatus>().unwrap(), AgentStatus::Busy);
        assert_eq!("OFFLINE".parse::<AgentStatus>().unwrap(), AgentStatus::Offline);
        assert!("parked".parse::<AgentStatus>().is_err());

        assert_eq!(serde_json::to_string(&AgentStatus::Online).unwrap(), "\"online\"");
        let parsed: AgentStatus = serde_json::from_str("\"busy\"").unwrap();
        assert_eq!(parsed, AgentStatus::Busy);
        assert_eq!(AgentStatus::default(), AgentStatus::Online);
    }
}
