//! Declarative inputs: warehouse map, deadlock table, and engine settings.
//!
//! These are plain serde shapes. Validation happens when they are turned into a
//! [`Warehouse`](crate::warehouse::Warehouse) or a
//! [`ResolutionTable`](crate::deadlock::ResolutionTable).

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_LOG_BATCH_SIZE: usize = 100;
pub const DEFAULT_LOW_BATTERY_THRESHOLD: f64 = 20.0;

/// How edge distances are derived when a neighbour list carries no weights.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Euclidean,
    Manhattan,
}

impl DistanceMetric {
    pub fn between(&self, (x1, y1): (f64, f64), (x2, y2): (f64, f64)) -> f64 {
        match self {
            DistanceMetric::Euclidean => ((x1 - x2).powi(2) + (y1 - y2).powi(2)).sqrt(),
            DistanceMetric::Manhattan => (x1 - x2).abs() + (y1 - y2).abs(),
        }
    }
}

/// Neighbour listing: bare names, or names with explicit distances.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NeighbourSpec {
    Names(Vec<String>),
    Weighted(BTreeMap<String, f64>),
}

impl Default for NeighbourSpec {
    fn default() -> Self {
        NeighbourSpec::Names(Vec::new())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub x: f64,
    pub y: f64,
    /// Category name, checked case-insensitively at load time.
    #[serde(rename = "type", default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub neighbours: NeighbourSpec,
}

fn default_category() -> String {
    "normal".to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShelfConfig {
    pub id: String,
    #[serde(default)]
    pub z_level: f64,
    #[serde(default)]
    pub current_weight: f64,
    #[serde(default)]
    pub locked: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RackConfig {
    pub id: String,
    /// Name of the CENTER node the rack occupies.
    pub center: String,
    #[serde(default)]
    pub frozen: bool,
    #[serde(default)]
    pub capacity: f64,
    #[serde(default)]
    pub shelves: Vec<ShelfConfig>,
}

/// Warehouse map as supplied by the layout tooling.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WarehouseConfig {
    #[serde(default)]
    pub distance: DistanceMetric,
    pub nodes: BTreeMap<String, NodeConfig>,
    #[serde(default)]
    pub racks: Vec<RackConfig>,
}

impl WarehouseConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        load_json(path)
    }

    /// Uniform 4-connected `width` x `height` grid of NORMAL nodes named `n_<x>_<y>`,
    /// every edge of weight 1.
    pub fn grid(width: u32, height: u32) -> Self {
        let mut nodes = BTreeMap::new();
        for x in 0..width {
            for y in 0..height {
                let mut neighbours = BTreeMap::new();
                let candidates = [
                    (x.checked_sub(1), Some(y)),
                    (Some(x + 1).filter(|&nx| nx < width), Some(y)),
                    (Some(x), y.checked_sub(1)),
                    (Some(x), Some(y + 1).filter(|&ny| ny < height)),
                ];
                for (nx, ny) in candidates {
                    if let (Some(nx), Some(ny)) = (nx, ny) {
                        neighbours.insert(grid_name(nx, ny), 1.0);
                    }
                }
                nodes.insert(
                    grid_name(x, y),
                    NodeConfig {
                        x: f64::from(x),
                        y: f64::from(y),
                        category: default_category(),
                        neighbours: NeighbourSpec::Weighted(neighbours),
                    },
                );
            }
        }
        Self {
            distance: DistanceMetric::Manhattan,
            nodes,
            racks: Vec::new(),
        }
    }
}

/// Node name used by [`WarehouseConfig::grid`].
pub fn grid_name(x: u32, y: u32) -> String {
    format!("n_{x}_{y}")
}

/// One deadlock scenario row before its action is resolved to a typed variant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    #[serde(default)]
    pub description: Option<String>,
    pub action: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeadlockTableConfig {
    #[serde(default)]
    pub deadlock_scenarios: BTreeMap<String, ScenarioConfig>,
    pub default_resolution: ScenarioConfig,
}

impl DeadlockTableConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        load_json(path)
    }
}

impl Default for DeadlockTableConfig {
    fn default() -> Self {
        let back_one = ScenarioConfig {
            description: Some("single agent blocked".to_string()),
            action: "move_agent_back".to_string(),
            parameters: serde_json::json!({ "steps": 1 }),
        };
        let mut deadlock_scenarios = BTreeMap::new();
        deadlock_scenarios.insert("agent_blocked".to_string(), back_one.clone());
        Self {
            deadlock_scenarios,
            default_resolution: ScenarioConfig {
                description: None,
                ..back_one
            },
        }
    }
}

/// Tunables that are not correctness properties.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Entries accumulated before the event log flushes a batch to its sink.
    pub log_batch_size: usize,
    /// Battery level below which `battery_low` is emitted.
    pub low_battery_threshold: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_batch_size: DEFAULT_LOG_BATCH_SIZE,
            low_battery_threshold: DEFAULT_LOW_BATTERY_THRESHOLD,
        }
    }
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_str(&text)?)
}
