//! Fleet scenarios for DST.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// DST-001: Many moving drivers, every query checked against brute force
    RushHour,

    /// DST-002: A third of the fleet goes silent and must be reaped
    GhostTown,

    /// DST-003: Fast drivers on fine cells, constant cell crossings
    BorderRun,

    /// DST-004: Concurrent writer and reader threads
    Swarm,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::RushHour,
            ScenarioId::GhostTown,
            ScenarioId::BorderRun,
            ScenarioId::Swarm,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::RushHour => "rush_hour",
            ScenarioId::GhostTown => "ghost_town",
            ScenarioId::BorderRun => "border_run",
            ScenarioId::Swarm => "swarm",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::RushHour => "Moving fleet with GPS jitter, radius queries match brute force",
            ScenarioId::GhostTown => "Silenced drivers vanish within one sweep past the threshold",
            ScenarioId::BorderRun => "Fast drivers on 100m cells, one index entry per driver",
            ScenarioId::Swarm => "Parallel writers and readers, no torn records",
        }
    }

    /// Returns true if the scenario uses real threads and is therefore not
    /// bit-for-bit reproducible from the seed.
    pub fn is_concurrent(&self) -> bool {
        matches!(self, ScenarioId::Swarm)
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rush_hour" | "rushhour" | "dst-001" => Ok(ScenarioId::RushHour),
            "ghost_town" | "ghosttown" | "dst-002" => Ok(ScenarioId::GhostTown),
            "border_run" | "borderrun" | "dst-003" => Ok(ScenarioId::BorderRun),
            "swarm" | "dst-004" => Ok(ScenarioId::Swarm),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
