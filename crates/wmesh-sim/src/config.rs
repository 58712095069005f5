use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::impairment::{FilterAddress, FilterDirection};
use crate::loss::{LossBand, StepLossTable};
use crate::{Error, Result};

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SimConfigInput {
    pub version: u32,
    pub snapshot_path: Option<String>,
    pub override_snapshot: bool,
    pub seed: Option<u64>,
    pub discovery: DiscoveryConfigInput,
    pub mobility: MobilityConfigInput,
    pub loss: LossConfigInput,
    pub shaping: ShapingConfigInput,
    pub applier: ApplierConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfigInput {
    pub label_namespace: Option<String>,
    pub role: Option<String>,
    pub wireless_network: Option<String>,
    pub max_interfaces: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MobilityConfigInput {
    pub plane_max: Option<f64>,
    pub grid_width: Option<usize>,
    pub spacing: Option<f64>,
    pub max_speed: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LossConfigInput {
    pub bands: Option<Vec<LossBand>>,
    pub beyond: Option<u8>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ShapingConfigInput {
    pub device: Option<String>,
    pub ifb_device: Option<String>,
    pub rate: Option<String>,
    pub delay_ms: Option<u32>,
    pub filter_direction: Option<FilterDirection>,
    pub filter_address: Option<FilterAddress>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ApplierConfigInput {
    pub workers: Option<usize>,
    pub exec_timeout_ms: Option<u64>,
}

/// Label schema used to recognise wireless routers among running containers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    pub label_namespace: String,
    pub role: String,
    pub wireless_network: String,
    pub max_interfaces: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            label_namespace: "emu".into(),
            role: "wireless-router".into(),
            wireless_network: "wlan".into(),
            max_interfaces: 10,
        }
    }
}

impl DiscoveryConfig {
    pub fn role_label(&self) -> String {
        format!("{}.role", self.label_namespace)
    }

    pub fn name_label(&self) -> String {
        format!("{}.name", self.label_namespace)
    }

    pub fn net_name_label(&self, index: usize) -> String {
        format!("{}.net.{}.name", self.label_namespace, index)
    }

    pub fn net_address_label(&self, index: usize) -> String {
        format!("{}.net.{}.address", self.label_namespace, index)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MobilityConfig {
    pub plane_max: f64,
    pub grid_width: usize,
    pub spacing: f64,
    pub max_speed: f64,
}

impl Default for MobilityConfig {
    fn default() -> Self {
        Self {
            plane_max: 1000.0,
            grid_width: 5,
            spacing: 100.0,
            max_speed: 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapingConfig {
    /// Egress device; `None` means `eth<i>` of the discovered wireless interface.
    pub device: Option<String>,
    pub ifb_device: String,
    pub rate: String,
    pub delay_ms: u32,
    pub filter_direction: FilterDirection,
    pub filter_address: FilterAddress,
}

impl Default for ShapingConfig {
    fn default() -> Self {
        Self {
            device: None,
            ifb_device: "ifb0".into(),
            rate: "10gbit".into(),
            delay_ms: 0,
            filter_direction: FilterDirection::Both,
            filter_address: FilterAddress::Ip,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplierConfig {
    pub workers: usize,
    pub exec_timeout: Duration,
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            exec_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub version: u32,
    pub snapshot_path: PathBuf,
    pub override_snapshot: bool,
    pub seed: Option<u64>,
    pub discovery: DiscoveryConfig,
    pub mobility: MobilityConfig,
    pub loss: StepLossTable,
    pub shaping: ShapingConfig,
    pub applier: ApplierConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            snapshot_path: PathBuf::from("node_info.json"),
            override_snapshot: false,
            seed: None,
            discovery: DiscoveryConfig::default(),
            mobility: MobilityConfig::default(),
            loss: StepLossTable::default(),
            shaping: ShapingConfig::default(),
            applier: ApplierConfig::default(),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

impl SimConfigInput {
    pub fn resolve(self) -> std::result::Result<SimConfig, String> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(format!("Unsupported config version {}", version));
        }

        let defaults = SimConfig::default();

        let discovery = DiscoveryConfig {
            label_namespace: non_empty(self.discovery.label_namespace)
                .unwrap_or(defaults.discovery.label_namespace),
            role: non_empty(self.discovery.role).unwrap_or(defaults.discovery.role),
            wireless_network: non_empty(self.discovery.wireless_network)
                .unwrap_or(defaults.discovery.wireless_network),
            max_interfaces: self
                .discovery
                .max_interfaces
                .unwrap_or(defaults.discovery.max_interfaces)
                .max(1),
        };

        let mobility = MobilityConfig {
            plane_max: self
                .mobility
                .plane_max
                .unwrap_or(defaults.mobility.plane_max),
            grid_width: self
                .mobility
                .grid_width
                .unwrap_or(defaults.mobility.grid_width)
                .max(1),
            spacing: self.mobility.spacing.unwrap_or(defaults.mobility.spacing),
            max_speed: self
                .mobility
                .max_speed
                .unwrap_or(defaults.mobility.max_speed)
                .abs(),
        };
        if mobility.plane_max.is_nan() || mobility.plane_max <= 0.0 {
            return Err(format!("plane_max must be positive, got {}", mobility.plane_max));
        }

        let loss = match (self.loss.bands, self.loss.beyond) {
            (None, None) => defaults.loss,
            (bands, beyond) => StepLossTable::new(
                bands.unwrap_or_else(|| defaults.loss.bands().to_vec()),
                beyond.unwrap_or(defaults.loss.beyond()),
            )?,
        };

        let shaping = ShapingConfig {
            device: non_empty(self.shaping.device),
            ifb_device: non_empty(self.shaping.ifb_device)
                .unwrap_or(defaults.shaping.ifb_device),
            rate: non_empty(self.shaping.rate).unwrap_or(defaults.shaping.rate),
            delay_ms: self.shaping.delay_ms.unwrap_or(defaults.shaping.delay_ms),
            filter_direction: self
                .shaping
                .filter_direction
                .unwrap_or(defaults.shaping.filter_direction),
            filter_address: self
                .shaping
                .filter_address
                .unwrap_or(defaults.shaping.filter_address),
        };

        let applier = ApplierConfig {
            workers: self
                .applier
                .workers
                .unwrap_or(defaults.applier.workers)
                .max(1),
            exec_timeout: self
                .applier
                .exec_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.applier.exec_timeout),
        };

        Ok(SimConfig {
            version,
            snapshot_path: non_empty(self.snapshot_path)
                .map(PathBuf::from)
                .unwrap_or(defaults.snapshot_path),
            override_snapshot: self.override_snapshot,
            seed: self.seed,
            discovery,
            mobility,
            loss,
            shaping,
            applier,
        })
    }
}

impl SimConfig {
    pub fn from_toml_str(input: &str) -> std::result::Result<Self, String> {
        if input.trim().is_empty() {
            return Ok(SimConfig::default());
        }
        let parsed: SimConfigInput =
            toml::from_str(input).map_err(|e| format!("Invalid config TOML: {}", e))?;
        parsed.resolve()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw).map_err(Error::Config)
    }
}
