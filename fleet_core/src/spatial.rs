//! The "SPACE" Engine - H3 cell buckets for proximity candidate search
//!
//! Positions are quantized into H3 cells at a single resolution. A radius
//! query expands the center cell into a k-ring large enough to contain the
//! whole circle, then unions the member sets of those cells. The result is
//! a *superset* of the true answer; exact filtering happens afterwards with
//! the Distance Engine.

use h3o::{CellIndex, LatLng, Resolution};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::distance::Coordinate;
use crate::error::{Result, TrackerError};

/// Grid key of a cell.
pub type CellKey = CellIndex;

/// Extra rings searched beyond `radius / edge`.
///
/// H3 cells are not uniform in size across the globe, and a point can sit
/// anywhere inside its hexagon, so the ring needs slack on both ends.
pub const RING_MARGIN: u32 = 3;

/// Quantization rules for one resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellGrid {
    resolution: Resolution,
}

impl CellGrid {
    pub fn new(resolution: Resolution) -> Self {
        Self { resolution }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Average hexagon edge length at this resolution, in meters.
    pub fn edge_length_m(&self) -> f64 {
        self.resolution.edge_length_m()
    }

    /// Deterministic quantization of a position into its cell.
    pub fn cell_key_for(&self, latitude: f64, longitude: f64) -> Result<CellKey> {
        let lat_lng = LatLng::new(latitude, longitude)
            .map_err(|_| TrackerError::coordinate(latitude, longitude))?;
        Ok(lat_lng.to_cell(self.resolution))
    }

    /// Number of k-rings needed so the disk contains a circle of `radius_m`.
    pub fn ring_size_for(&self, radius_m: f64) -> u32 {
        let rings = (radius_m.max(0.0) / self.edge_length_m()).ceil();
        // Saturating float-to-int cast; absurd radii just mean a huge disk
        (rings as u32).saturating_add(RING_MARGIN)
    }

    /// The cells whose area may intersect the circle around `center`.
    ///
    /// Always materializes the full k-ring. Prefer
    /// [`covering_cells_within`](Self::covering_cells_within) when the number
    /// of populated cells is known.
    pub fn covering_cells(&self, center: Coordinate, radius_m: f64) -> Result<CellCover> {
        let center_cell = self.cell_key_for(center.latitude, center.longitude)?;
        let k = self.ring_size_for(radius_m);
        Ok(CellCover::from_cells(center_cell.grid_disk_safe(k)))
    }

    /// Like [`covering_cells`](Self::covering_cells), but gives up on the
    /// ring when it would hold more cells than are populated.
    ///
    /// The ring grows as 3k² + 3k + 1; past that point scanning every
    /// populated cell is cheaper and still a superset of the answer.
    pub fn covering_cells_within(
        &self,
        center: Coordinate,
        radius_m: f64,
        populated_cells: usize,
    ) -> Result<CellCover> {
        let center_cell = self.cell_key_for(center.latitude, center.longitude)?;
        let k = self.ring_size_for(radius_m);
        if ring_cell_count(k) > populated_cells as u64 {
            return Ok(CellCover::Everything);
        }
        Ok(CellCover::from_cells(center_cell.grid_disk_safe(k)))
    }
}

/// Number of cells in a k-ring disk: 3k² + 3k + 1.
pub fn ring_cell_count(k: u32) -> u64 {
    let k = u64::from(k);
    k.saturating_mul(k)
        .saturating_add(k)
        .saturating_mul(3)
        .saturating_add(1)
}

/// The cells a query has to look at.
///
/// Built once per query and reused against every partition.
#[derive(Debug, Clone)]
pub enum CellCover {
    /// An explicit, de-duplicated k-ring
    Ring {
        cells: Vec<CellKey>,
        lookup: HashSet<CellKey>,
    },

    /// Every populated cell is a candidate
    Everything,
}

impl CellCover {
    pub fn from_cells(cells: impl IntoIterator<Item = CellKey>) -> Self {
        let lookup: HashSet<CellKey> = cells.into_iter().collect();
        let cells = lookup.iter().copied().collect();
        CellCover::Ring { cells, lookup }
    }

    pub fn contains(&self, cell: &CellKey) -> bool {
        match self {
            CellCover::Ring { lookup, .. } => lookup.contains(cell),
            CellCover::Everything => true,
        }
    }

    /// Ring size; zero for [`CellCover::Everything`].
    pub fn len(&self) -> usize {
        match self {
            CellCover::Ring { cells, .. } => cells.len(),
            CellCover::Everything => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_everything(&self) -> bool {
        matches!(self, CellCover::Everything)
    }
}

/// Cell → agent membership for one partition.
///
/// Holds only back-references (agent id + cell). The record itself lives
/// in the registry.
#[derive(Debug)]
pub struct SpatialIndex {
    grid: CellGrid,

    /// Primary index: cell -> agents currently inside it
    cells: HashMap<CellKey, HashSet<String>>,

    /// Back-reference: agent -> the cell it is filed under
    locations: HashMap<String, CellKey>,
}

impl SpatialIndex {
    /// Creates an empty index at the given resolution.
    pub fn new(resolution: Resolution) -> Self {
        Self {
            grid: CellGrid::new(resolution),
            cells: HashMap::new(),
            locations: HashMap::new(),
        }
    }

    pub fn grid(&self) -> CellGrid {
        self.grid
    }

    /// Files `agent_id` under `cell`.
    pub fn insert(&mut self, cell: CellKey, agent_id: &str) {
        let previous = self.locations.insert(agent_id.to_string(), cell);
        debug_assert!(
            previous.is_none() || previous == Some(cell),
            "agent {agent_id} inserted while still indexed elsewhere"
        );
        self.cells
            .entry(cell)
            .or_default()
            .insert(agent_id.to_string());
    }

    /// Removes `agent_id` from `cell`. Returns whether it was there.
    pub fn remove(&mut self, cell: CellKey, agent_id: &str) -> bool {
        let Some(members) = self.cells.get_mut(&cell) else {
            return false;
        };
        let removed = members.remove(agent_id);
        // Clean up empty cells
        if members.is_empty() {
            self.cells.remove(&cell);
        }
        if removed && self.locations.get(agent_id) == Some(&cell) {
            self.locations.remove(agent_id);
        }
        removed
    }

    /// Removes `agent_id` from whatever cell it is filed under.
    pub fn remove_agent(&mut self, agent_id: &str) -> Option<CellKey> {
        let cell = self.cell_of(agent_id)?;
        self.remove(cell, agent_id);
        Some(cell)
    }

    /// Re-files an agent. No-op when the cell did not change.
    ///
    /// Returns `true` when membership actually moved.
    pub fn move_agent(&mut self, old_cell: CellKey, new_cell: CellKey, agent_id: &str) -> bool {
        if old_cell == new_cell {
            return false;
        }
        let removed = self.remove(old_cell, agent_id);
        debug_assert!(removed, "agent {agent_id} was not in its recorded cell");
        self.insert(new_cell, agent_id);
        true
    }

    /// The cell currently recorded for `agent_id`.
    pub fn cell_of(&self, agent_id: &str) -> Option<CellKey> {
        self.locations.get(agent_id).copied()
    }

    /// Members of a single cell.
    pub fn members(&self, cell: &CellKey) -> impl Iterator<Item = &str> {
        self.cells
            .get(cell)
            .into_iter()
            .flat_map(|members| members.iter().map(String::as_str))
    }

    /// Union of the members of every cell in `cover`.
    ///
    /// Walks whichever side is smaller: the ring's cells, or this
    /// partition's populated cells.
    pub fn candidates_in(&self, cover: &CellCover) -> HashSet<&str> {
        let mut result = HashSet::new();

        match cover {
            CellCover::Ring { cells, .. } if cells.len() <= self.cells.len() => {
                for cell in cells {
                    result.extend(self.members(cell));
                }
            }
            CellCover::Ring { lookup, .. } => {
                for (cell, members) in &self.cells {
                    if lookup.contains(cell) {
                        result.extend(members.iter().map(String::as_str));
                    }
                }
            }
            CellCover::Everything => {
                result.extend(self.locations.keys().map(String::as_str));
            }
        }

        result
    }

    /// Agents that may lie within `radius_m` of `center`.
    pub fn candidates_in_radius(&self, center: Coordinate, radius_m: f64) -> Result<HashSet<&str>> {
        let cover = self
            .grid
            .covering_cells_within(center, radius_m, self.cells.len())?;
        Ok(self.candidates_in(&cover))
    }

    /// Number of indexed agents.
    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    /// Number of non-empty cells.
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Get statistics about the spatial index
    pub fn stats(&self) -> SpatialStats {
        let total_entries: usize = self.cells.values().map(HashSet::len).sum();
        SpatialStats::from_totals(total_entries, self.cells.len(), self.grid.resolution)
    }

    /// Iterates `(agent_id, cell)` back-references.
    pub fn locations(&self) -> impl Iterator<Item = (&str, CellKey)> {
        self.locations.iter().map(|(id, cell)| (id.as_str(), *cell))
    }
}

/// Statistics about the spatial index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpatialStats {
    pub total_entries: usize,
    pub total_cells: usize,
    pub avg_entries_per_cell: f64,
    pub resolution: Resolution,
}

impl SpatialStats {
    pub(crate) fn from_totals(total_entries: usize, total_cells: usize, resolution: Resolution) -> Self {
        let avg_entries_per_cell = if total_cells > 0 {
            total_entries as f64 / total_cells as f64
        } else {
            0.0
        };

        Self {
            total_entries,
            total_cells,
            avg_entries_per_cell,
            resolution,
        }
    }
}
