//! Run configuration.
//!
//! Configuration is read from a `toml` (or, with the `yaml` feature,
//! `yaml`) file. Every section except `domain` can be left out.
//!
//! ```toml
//! [domain]
//! extent = [100, 100]
//! toroidal = true
//! aoi = 2
//! split = { uniform = { levels = 1 } }
//!
//! [balance]
//! interval = 100
//! step_size = 0.5
//!
//! [migration]
//! rounds = "dimensions"
//! ```

use std::path::Path;

use crate::error::{Error, Result};
use crate::geom::Region;
use crate::migrate::RoundPolicy;
use crate::tree::{PartitionTree, SplitScheme};
use crate::{util, Coord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub domain: DomainConfig,
    #[serde(default)]
    pub balance: BalanceConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Size of the domain along each dimension, starting at the origin
    pub extent: Vec<Coord>,
    #[serde(default)]
    pub toroidal: bool,
    /// Halo depth in cells
    #[serde(default = "default_aoi")]
    pub aoi: Coord,
    #[serde(default)]
    pub split: SplitScheme,
}

fn default_aoi() -> Coord {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalanceConfig {
    pub enabled: bool,
    /// Steps between balancing rounds
    pub interval: u64,
    /// Scales the proposed face move
    pub step_size: f64,
    /// Minimum expected gain for a proposal to be emitted
    pub overhead_threshold: f64,
    /// Number of recent steps averaged into the load
    pub window: usize,
    /// Smallest leaf width a move may leave behind
    pub min_extent: Coord,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        BalanceConfig {
            enabled: true,
            interval: 100,
            step_size: 1.,
            overhead_threshold: 1.,
            window: 10,
            min_extent: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    pub rounds: RoundPolicy,
}

impl Config {
    /// Minimal configuration for a domain of the given extent.
    pub fn new(extent: Vec<Coord>) -> Self {
        Config {
            domain: DomainConfig {
                extent,
                toroidal: false,
                aoi: default_aoi(),
                split: SplitScheme::default(),
            },
            balance: BalanceConfig::default(),
            migration: MigrationConfig::default(),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let config: Config = util::deser_struct_from_path(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.domain.extent.is_empty() || self.domain.extent.iter().any(|e| *e <= 0) {
            return Err(Error::ConfigError(format!(
                "domain extent must be positive, got {:?}",
                self.domain.extent
            )));
        }
        if self.domain.aoi < 0 {
            return Err(Error::ConfigError(format!(
                "aoi can't be negative, got {}",
                self.domain.aoi
            )));
        }
        if self.balance.enabled && self.balance.interval == 0 {
            return Err(Error::ConfigError(
                "balance interval must be at least 1".to_string(),
            ));
        }
        if let SplitScheme::Points(points) = &self.domain.split {
            if let Some(p) = points.iter().find(|p| p.len() != self.domain.extent.len()) {
                return Err(Error::ConfigError(format!(
                    "split point {:?} doesn't match domain dimensions",
                    p
                )));
            }
        }
        Ok(())
    }

    pub fn domain_region(&self) -> Result<Region> {
        Region::with_extent(&self.domain.extent)
    }

    /// Builds the initial tree for the given number of processes.
    pub fn build_tree(&self, procs: usize) -> Result<PartitionTree> {
        PartitionTree::build(self.domain_region()?, &self.domain.split, procs)
    }
}
