//! Device registry: configured bus addresses resolved to device types.
//!
//! Everything that can be wrong with a meter definition is reported here,
//! once, before the endpoint starts serving.

use std::collections::{BTreeMap, HashSet};

use thiserror::Error;
use tracing::debug;

use crate::catalog::{self, CatalogError, Metric, ReadBlock, RegisterMapEntry};
use crate::config::{DeviceTypeConfig, ExporterConfig, MeterEntry};

/// Lowest and highest unit ID a Modbus slave may use.
pub const MIN_ADDRESS: u8 = 1;
pub const MAX_ADDRESS: u8 = 247;

/// Device registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Meter {address}: unknown device type '{name}'")]
    UnknownDeviceType { address: u8, name: String },
    #[error("Meter address {0} out of range (1-247)")]
    InvalidAddress(u8),
    #[error("Meter address {0} configured more than once")]
    DuplicateAddress(u8),
    #[error("Meter {address}: device type '{device_type}' has no {metric} register")]
    UnknownMetric {
        address: u8,
        device_type: String,
        metric: Metric,
    },
    #[error("Device type '{0}' shadows a built-in device type")]
    ReservedName(String),
    #[error("Device type '{name}': {source}")]
    Catalog {
        name: String,
        #[source]
        source: CatalogError,
    },
}

/// A device type with a fixed register layout.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceType {
    Finder,
    Eastron,
    TaiyeDq,
    /// Table driven device read one metric per request.
    Generic {
        name: String,
        registers: Vec<RegisterMapEntry>,
    },
}

/// Built-in device type names.
pub const BUILTIN_NAMES: [&str; 4] = ["finder", "eastron", "taiyedq", "generic"];

impl DeviceType {
    /// Look up a device type by name, built-ins first.
    pub fn from_name(
        name: &str,
        custom: &BTreeMap<String, DeviceTypeConfig>,
    ) -> Option<DeviceType> {
        match name {
            "finder" => Some(DeviceType::Finder),
            "eastron" => Some(DeviceType::Eastron),
            "taiyedq" => Some(DeviceType::TaiyeDq),
            "generic" => Some(DeviceType::Generic {
                name: name.to_string(),
                registers: catalog::GENERIC_REGISTERS.to_vec(),
            }),
            _ => custom.get(name).map(|def| DeviceType::Generic {
                name: name.to_string(),
                registers: def.registers.clone(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            DeviceType::Finder => "finder",
            DeviceType::Eastron => "eastron",
            DeviceType::TaiyeDq => "taiyedq",
            DeviceType::Generic { name, .. } => name,
        }
    }

    /// Full register map, including disabled entries.
    pub fn catalog(&self) -> &[RegisterMapEntry] {
        match self {
            DeviceType::Finder => catalog::FINDER_REGISTERS,
            DeviceType::Eastron => catalog::EASTRON_REGISTERS,
            DeviceType::TaiyeDq => catalog::TAIYEDQ_REGISTERS,
            DeviceType::Generic { registers, .. } => registers,
        }
    }

    /// Batched read plan, for device types that support multi-register reads.
    pub fn read_plan(&self) -> Option<&'static [ReadBlock]> {
        match self {
            DeviceType::Finder => Some(catalog::FINDER_READ_PLAN),
            DeviceType::Eastron => Some(catalog::EASTRON_READ_PLAN),
            DeviceType::TaiyeDq | DeviceType::Generic { .. } => None,
        }
    }

    fn validate(&self) -> Result<(), RegistryError> {
        catalog::validate(self.catalog(), self.read_plan().unwrap_or(&[])).map_err(|source| {
            RegistryError::Catalog {
                name: self.name().to_string(),
                source,
            }
        })
    }
}

/// How a meter's registers are requested.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReadStrategy {
    /// A few multi-register block reads, sliced per metric.
    Batched(&'static [ReadBlock]),
    /// One request per register map entry.
    PerEntry,
}

/// A resolved meter, ready to be read.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterConfig {
    /// Modbus unit ID
    pub address: u8,
    pub device_type: DeviceType,
    /// Active register map entries, in catalog order
    pub registers: Vec<RegisterMapEntry>,
    pub strategy: ReadStrategy,
}

impl MeterConfig {
    /// Resolve a single configured meter.
    pub fn resolve(
        entry: &MeterEntry,
        custom: &BTreeMap<String, DeviceTypeConfig>,
    ) -> Result<Self, RegistryError> {
        if !(MIN_ADDRESS..=MAX_ADDRESS).contains(&entry.address) {
            return Err(RegistryError::InvalidAddress(entry.address));
        }

        let device_type = DeviceType::from_name(&entry.device_type, custom).ok_or_else(|| {
            RegistryError::UnknownDeviceType {
                address: entry.address,
                name: entry.device_type.clone(),
            }
        })?;
        device_type.validate()?;

        let catalog = device_type.catalog();
        if let Some(metric) = entry
            .enable
            .iter()
            .find(|m| !catalog.iter().any(|e| e.metric == **m))
        {
            return Err(RegistryError::UnknownMetric {
                address: entry.address,
                device_type: device_type.name().to_string(),
                metric: *metric,
            });
        }

        let registers = catalog
            .iter()
            .filter(|e| e.enabled || entry.enable.contains(&e.metric))
            .map(|e| RegisterMapEntry {
                enabled: true,
                ..e.clone()
            })
            .collect();

        let strategy = match device_type.read_plan() {
            Some(plan) => ReadStrategy::Batched(plan),
            None => ReadStrategy::PerEntry,
        };

        Ok(Self {
            address: entry.address,
            device_type,
            registers,
            strategy,
        })
    }
}

/// Resolve every configured meter, preserving configuration order.
pub fn resolve(config: &ExporterConfig) -> Result<Vec<MeterConfig>, RegistryError> {
    for (name, def) in &config.device_types {
        if BUILTIN_NAMES.contains(&name.as_str()) {
            return Err(RegistryError::ReservedName(name.clone()));
        }
        catalog::validate(&def.registers, &[]).map_err(|source| RegistryError::Catalog {
            name: name.clone(),
            source,
        })?;
    }

    let mut seen = HashSet::new();
    let mut meters = Vec::with_capacity(config.meters.len());

    for entry in &config.meters {
        if !seen.insert(entry.address) {
            return Err(RegistryError::DuplicateAddress(entry.address));
        }

        let meter = MeterConfig::resolve(entry, &config.device_types)?;
        debug!(
            address = meter.address,
            device_type = meter.device_type.name(),
            registers = meter.registers.len(),
            "Resolved meter"
        );
        meters.push(meter);
    }

    Ok(meters)
}
