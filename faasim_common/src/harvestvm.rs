//! Opaque Harvest-VM model providers.
//!
//! Two artifacts drive the Harvest-VM subsystem: a survival curve giving
//! the probability that a VM is still alive after a given lifetime, and a
//! cores table mapping VM hashes to per-second core schedules. Both are
//! fitted offline from production traces and consumed here as plain data.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ModelError;

// ─── Survival Model ─────────────────────────────────────────────────

/// Non-increasing step function over lifetime hours.
///
/// `predict(h)` returns the survival probability of the last point at or
/// before `h`, and `1.0` before the first point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurvivalModel {
    points: Vec<(f64, f64)>,
}

impl SurvivalModel {
    pub fn new(mut points: Vec<(f64, f64)>) -> Result<Self, ModelError> {
        if points.is_empty() {
            return Err(ModelError::EmptySurvivalModel);
        }
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(Self { points })
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let text = std::fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let model: SurvivalModel = serde_json::from_str(&text)?;
        Self::new(model.points)
    }

    /// Survival probability after `hours` of lifetime.
    pub fn predict(&self, hours: f64) -> f64 {
        let mut prob = 1.0;
        for &(h, p) in &self.points {
            if h > hours {
                break;
            }
            prob = p;
        }
        prob
    }

    /// A model that never dies, for tests and HVM-free runs.
    pub fn immortal() -> Self {
        Self {
            points: vec![(0.0, 1.0)],
        }
    }
}

// ─── Cores Table ────────────────────────────────────────────────────

/// Per-second core schedules keyed by Harvest-VM hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoresTable {
    entries: BTreeMap<String, Vec<u32>>,
}

impl CoresTable {
    pub fn new(entries: BTreeMap<String, Vec<u32>>) -> Result<Self, ModelError> {
        if entries.is_empty() {
            return Err(ModelError::EmptyCoresTable);
        }
        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let text = std::fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let table: CoresTable = serde_json::from_str(&text)?;
        info!(entries = table.entries.len(), path = %path.display(), "cores table loaded");
        Self::new(table.entries)
    }

    pub fn get(&self, hash: &str) -> Option<&[u32]> {
        self.entries.get(hash).map(Vec::as_slice)
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.entries.contains_key(hash)
    }

    /// Hashes in sorted order.
    pub fn hashes(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> SurvivalModel {
        SurvivalModel::new(vec![(0.0, 1.0), (1.0, 0.8), (2.0, 0.5), (10.0, 0.1)]).unwrap()
    }

    #[test]
    fn survival_step_lookup() {
        let m = model();
        assert_eq!(m.predict(0.0), 1.0);
        assert_eq!(m.predict(0.5), 1.0);
        assert_eq!(m.predict(1.0), 0.8);
        assert_eq!(m.predict(1.999), 0.8);
        assert_eq!(m.predict(5.0), 0.5);
        assert_eq!(m.predict(100.0), 0.1);
    }

    #[test]
    fn survival_before_first_point() {
        let m = SurvivalModel::new(vec![(2.0, 0.7)]).unwrap();
        assert_eq!(m.predict(1.0), 1.0);
        assert_eq!(m.predict(2.0), 0.7);
    }

    #[test]
    fn empty_model_rejected() {
        assert!(matches!(
            SurvivalModel::new(vec![]),
            Err(ModelError::EmptySurvivalModel)
        ));
    }

    #[test]
    fn cores_table_lookup() {
        let mut entries = BTreeMap::new();
        entries.insert("26ff823a8dd5".to_string(), vec![4, 4, 8, 2]);
        entries.insert("11ce77b9f010".to_string(), vec![16]);
        let table = CoresTable::new(entries).unwrap();

        assert_eq!(table.get("26ff823a8dd5"), Some([4, 4, 8, 2].as_slice()));
        assert!(table.get("missing").is_none());
        // Sorted hash order.
        let hashes: Vec<&str> = table.hashes().collect();
        assert_eq!(hashes, vec!["11ce77b9f010", "26ff823a8dd5"]);
    }

    #[test]
    fn table_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cores_table.json");
        std::fs::write(&path, r#"{"abc123": [2, 4, 6]}"#).unwrap();
        let table = CoresTable::load(&path).unwrap();
        assert_eq!(table.get("abc123"), Some([2, 4, 6].as_slice()));
    }
}
