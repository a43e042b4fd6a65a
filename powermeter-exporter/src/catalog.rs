//! Built-in register maps and batched read plans.
//!
//! A register map is plain data: each [`RegisterMapEntry`] names where a
//! metric lives, how many registers it spans and how to decode them. Entries
//! shipped disabled can be switched on per meter from the configuration.

use std::borrow::Cow;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::decode::Decoder;

/// Largest number of input registers one Modbus request may return.
pub const MAX_READ_COUNT: u16 = 125;

/// Catalog validation errors.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("{metric} @ {address}: {words} words declared but {decoder} consumes {expected}")]
    WordCount {
        metric: Metric,
        address: u16,
        words: u16,
        decoder: &'static str,
        expected: u16,
    },
    #[error("{metric} @ {address}: register range exceeds the 16-bit address space")]
    AddressOverflow { metric: Metric, address: u16 },
    #[error("{metric} appears more than once in the register map")]
    DuplicateMetric { metric: Metric },
    #[error("Read block @ {address}: count {count} must be 1-{max}", max = MAX_READ_COUNT)]
    BlockCount { address: u16, count: u16 },
    #[error("{metric} @ {address}: straddles read block {block_address}+{block_count}")]
    Straddle {
        metric: Metric,
        address: u16,
        block_address: u16,
        block_count: u16,
    },
}

/// Known metric families, in exposition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Frequency,
    Voltage,
    Current,
    PowerActive,
    PowerReactive,
    PowerApparent,
    CounterN1,
    CounterN2,
    CounterN3,
    CounterN4,
}

impl Metric {
    /// Every family, in the order the preamble lists them.
    pub const ALL: [Metric; 10] = [
        Metric::Frequency,
        Metric::Voltage,
        Metric::Current,
        Metric::PowerActive,
        Metric::PowerReactive,
        Metric::PowerApparent,
        Metric::CounterN1,
        Metric::CounterN2,
        Metric::CounterN3,
        Metric::CounterN4,
    ];

    /// Metric name without prefix.
    pub fn as_str(self) -> &'static str {
        match self {
            Metric::Frequency => "frequency",
            Metric::Voltage => "voltage",
            Metric::Current => "current",
            Metric::PowerActive => "power_active",
            Metric::PowerReactive => "power_reactive",
            Metric::PowerApparent => "power_apparent",
            Metric::CounterN1 => "counter_n1",
            Metric::CounterN2 => "counter_n2",
            Metric::CounterN3 => "counter_n3",
            Metric::CounterN4 => "counter_n4",
        }
    }

    /// HELP text for the exposition preamble.
    pub fn help(self) -> &'static str {
        match self {
            Metric::Frequency => "AC frequency [Hz]",
            Metric::Voltage => "Phase to neutral AC voltage [V]",
            Metric::Current => "Current [A]",
            Metric::PowerActive => "Active power [W]",
            Metric::PowerReactive => "Reactive power [var]",
            Metric::PowerApparent => "Apparent power [VA]",
            Metric::CounterN1 => "Energy counter n1 state",
            Metric::CounterN2 => "Energy counter n2 state",
            Metric::CounterN3 => "Energy counter n3 state",
            Metric::CounterN4 => "Energy counter n4 state",
        }
    }

    /// Prometheus metric type.
    pub fn kind(self) -> &'static str {
        match self {
            Metric::CounterN1 | Metric::CounterN2 | Metric::CounterN3 | Metric::CounterN4 => {
                "counter"
            }
            _ => "gauge",
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a metric lives in a meter's input register space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterMapEntry {
    /// Starting input register address (0-based).
    pub address: u16,

    /// Number of consecutive registers; must match the decoder.
    pub words: u16,

    /// Register encoding.
    pub decoder: Decoder,

    /// Published metric family.
    pub metric: Metric,

    /// Unit of the published value (informational).
    #[serde(default)]
    pub unit: Cow<'static, str>,

    /// Multiplier applied after decoding.
    #[serde(default = "default_scale")]
    pub scale: f64,

    /// Whether the entry is read by default.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_scale() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

impl RegisterMapEntry {
    const fn new(
        address: u16,
        words: u16,
        decoder: Decoder,
        metric: Metric,
        unit: &'static str,
        scale: f64,
    ) -> Self {
        Self {
            address,
            words,
            decoder,
            metric,
            unit: Cow::Borrowed(unit),
            scale,
            enabled: true,
        }
    }

    const fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// One past the last register of this entry.
    pub fn end(&self) -> u32 {
        u32::from(self.address) + u32::from(self.words)
    }
}

/// One multi-register request of a batched read plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadBlock {
    pub address: u16,
    pub count: u16,
}

impl ReadBlock {
    pub const fn new(address: u16, count: u16) -> Self {
        Self { address, count }
    }

    /// One past the last register of this block.
    pub fn end(&self) -> u32 {
        u32::from(self.address) + u32::from(self.count)
    }

    /// Whether `entry` lies completely inside this block.
    pub fn contains(&self, entry: &RegisterMapEntry) -> bool {
        entry.address >= self.address && entry.end() <= self.end()
    }

    /// Whether `entry` shares at least one register with this block.
    pub fn overlaps(&self, entry: &RegisterMapEntry) -> bool {
        u32::from(entry.address) < self.end() && entry.end() > u32::from(self.address)
    }
}

use Decoder::{DelegatedFloat32, Float32Be, T3, T5, T6};
use Metric::*;

/// Finder 7M series.
pub const FINDER_REGISTERS: &[RegisterMapEntry] = &[
    RegisterMapEntry::new(105, 2, T5, Frequency, "Hz", 1.0),
    RegisterMapEntry::new(107, 2, T5, Voltage, "V", 1.0),
    RegisterMapEntry::new(126, 2, T5, Current, "A", 1.0).disabled(),
    RegisterMapEntry::new(140, 2, T6, PowerActive, "W", 1.0),
    RegisterMapEntry::new(148, 2, T6, PowerReactive, "var", 1.0).disabled(),
    RegisterMapEntry::new(156, 2, T5, PowerApparent, "VA", 1.0).disabled(),
    // Counters count in 0.1 Wh / 0.1 varh
    RegisterMapEntry::new(462, 2, T3, CounterN1, "Wh", 0.1),
    RegisterMapEntry::new(464, 2, T3, CounterN2, "Wh", 0.1),
    RegisterMapEntry::new(466, 2, T3, CounterN3, "varh", 0.1),
    RegisterMapEntry::new(468, 2, T3, CounterN4, "varh", 0.1),
];

pub const FINDER_READ_PLAN: &[ReadBlock] = &[
    ReadBlock::new(105, 4),
    ReadBlock::new(140, 2),
    ReadBlock::new(462, 8),
];

/// Eastron SDM series (kWh counters).
pub const EASTRON_REGISTERS: &[RegisterMapEntry] = &[
    RegisterMapEntry::new(0, 2, DelegatedFloat32, Voltage, "V", 1.0),
    RegisterMapEntry::new(6, 2, DelegatedFloat32, Current, "A", 1.0).disabled(),
    RegisterMapEntry::new(12, 2, DelegatedFloat32, PowerActive, "W", 1.0),
    RegisterMapEntry::new(24, 2, DelegatedFloat32, PowerReactive, "var", 1.0).disabled(),
    RegisterMapEntry::new(18, 2, DelegatedFloat32, PowerApparent, "VA", 1.0).disabled(),
    RegisterMapEntry::new(70, 2, DelegatedFloat32, Frequency, "Hz", 1.0),
    RegisterMapEntry::new(72, 2, DelegatedFloat32, CounterN1, "Wh", 1000.0),
    RegisterMapEntry::new(74, 2, DelegatedFloat32, CounterN2, "Wh", 1000.0),
    RegisterMapEntry::new(76, 2, DelegatedFloat32, CounterN3, "varh", 1000.0),
    RegisterMapEntry::new(78, 2, DelegatedFloat32, CounterN4, "varh", 1000.0),
];

pub const EASTRON_READ_PLAN: &[ReadBlock] = &[
    ReadBlock::new(0, 2),
    ReadBlock::new(12, 2),
    ReadBlock::new(70, 10),
];

/// Taiye DQ series. Multi-register reads across metrics are not supported.
pub const TAIYEDQ_REGISTERS: &[RegisterMapEntry] = &[
    RegisterMapEntry::new(0x00, 2, DelegatedFloat32, Voltage, "V", 1.0),
    RegisterMapEntry::new(0x06, 2, DelegatedFloat32, Current, "A", 1.0).disabled(),
    RegisterMapEntry::new(0x0C, 2, DelegatedFloat32, PowerActive, "W", 1.0),
    RegisterMapEntry::new(0x12, 2, DelegatedFloat32, PowerReactive, "var", 1.0).disabled(),
    RegisterMapEntry::new(0x18, 2, DelegatedFloat32, PowerApparent, "VA", 1.0).disabled(),
    RegisterMapEntry::new(0x30, 2, DelegatedFloat32, Frequency, "Hz", 1.0),
    RegisterMapEntry::new(0x500, 2, DelegatedFloat32, CounterN1, "Wh", 1000.0),
    RegisterMapEntry::new(0x502, 2, DelegatedFloat32, CounterN2, "Wh", 1000.0),
    RegisterMapEntry::new(0x508, 2, DelegatedFloat32, CounterN3, "varh", 1000.0),
    RegisterMapEntry::new(0x50A, 2, DelegatedFloat32, CounterN4, "varh", 1000.0),
];

/// Fallback for SDM-compatible meters, read one metric per request.
pub const GENERIC_REGISTERS: &[RegisterMapEntry] = &[
    RegisterMapEntry::new(0, 2, Float32Be, Voltage, "V", 1.0),
    RegisterMapEntry::new(6, 2, Float32Be, Current, "A", 1.0).disabled(),
    RegisterMapEntry::new(12, 2, Float32Be, PowerActive, "W", 1.0),
    RegisterMapEntry::new(18, 2, Float32Be, PowerApparent, "VA", 1.0).disabled(),
    RegisterMapEntry::new(24, 2, Float32Be, PowerReactive, "var", 1.0).disabled(),
    RegisterMapEntry::new(70, 2, Float32Be, Frequency, "Hz", 1.0),
    RegisterMapEntry::new(72, 2, Float32Be, CounterN1, "Wh", 1000.0),
    RegisterMapEntry::new(74, 2, Float32Be, CounterN2, "Wh", 1000.0),
    RegisterMapEntry::new(76, 2, Float32Be, CounterN3, "varh", 1000.0),
    RegisterMapEntry::new(78, 2, Float32Be, CounterN4, "varh", 1000.0),
];

/// Check a register map, and optionally its batched read plan, for
/// decoder/word-count mismatches and plan coverage errors.
pub fn validate(entries: &[RegisterMapEntry], plan: &[ReadBlock]) -> Result<(), CatalogError> {
    let mut seen = HashSet::new();

    for entry in entries {
        let expected = entry.decoder.word_count();
        if entry.words != expected {
            return Err(CatalogError::WordCount {
                metric: entry.metric,
                address: entry.address,
                words: entry.words,
                decoder: entry.decoder.as_str(),
                expected,
            });
        }

        if entry.end() > 0x1_0000 {
            return Err(CatalogError::AddressOverflow {
                metric: entry.metric,
                address: entry.address,
            });
        }

        if !seen.insert(entry.metric) {
            return Err(CatalogError::DuplicateMetric {
                metric: entry.metric,
            });
        }
    }

    for block in plan {
        if block.count == 0 || block.count > MAX_READ_COUNT || block.end() > 0x1_0000 {
            return Err(CatalogError::BlockCount {
                address: block.address,
                count: block.count,
            });
        }

        if let Some(entry) = entries
            .iter()
            .find(|e| block.overlaps(e) && !block.contains(e))
        {
            return Err(CatalogError::Straddle {
                metric: entry.metric,
                address: entry.address,
                block_address: block.address,
                block_count: block.count,
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalogs_are_valid() {
        validate(FINDER_REGISTERS, FINDER_READ_PLAN).unwrap();
        validate(EASTRON_REGISTERS, EASTRON_READ_PLAN).unwrap();
        validate(TAIYEDQ_REGISTERS, &[]).unwrap();
        validate(GENERIC_REGISTERS, &[]).unwrap();
    }

    #[test]
    fn test_builtin_catalogs_default_metrics() {
        let defaults = [
            Frequency, Voltage, PowerActive, CounterN1, CounterN2, CounterN3, CounterN4,
        ];
        for catalog in [
            FINDER_REGISTERS,
            EASTRON_REGISTERS,
            TAIYEDQ_REGISTERS,
            GENERIC_REGISTERS,
        ] {
            let mut enabled: Vec<Metric> = catalog
                .iter()
                .filter(|e| e.enabled)
                .map(|e| e.metric)
                .collect();
            enabled.sort();
            assert_eq!(enabled, defaults);
            assert_eq!(catalog.len(), 10);
        }
    }

    #[test]
    fn test_read_plans_cover_enabled_entries() {
        for (entries, plan) in [
            (FINDER_REGISTERS, FINDER_READ_PLAN),
            (EASTRON_REGISTERS, EASTRON_READ_PLAN),
        ] {
            for entry in entries.iter().filter(|e| e.enabled) {
                assert!(
                    plan.iter().any(|b| b.contains(entry)),
                    "{} not covered",
                    entry.metric
                );
            }
        }
    }

    #[test]
    fn test_word_count_mismatch_rejected() {
        let entries = [RegisterMapEntry::new(0, 1, T3, CounterN1, "Wh", 0.1)];
        let err = validate(&entries, &[]).unwrap_err();
        assert!(matches!(err, CatalogError::WordCount { expected: 2, .. }));
        assert!(err.to_string().contains("t3 consumes 2"));
    }

    #[test]
    fn test_straddling_entry_rejected() {
        let entries = [RegisterMapEntry::new(104, 2, T5, Frequency, "Hz", 1.0)];
        let err = validate(&entries, &[ReadBlock::new(105, 4)]).unwrap_err();
        assert!(matches!(err, CatalogError::Straddle { .. }));
    }

    #[test]
    fn test_block_count_limits() {
        assert!(matches!(
            validate(&[], &[ReadBlock::new(0, 0)]),
            Err(CatalogError::BlockCount { .. })
        ));
        assert!(matches!(
            validate(&[], &[ReadBlock::new(0, 126)]),
            Err(CatalogError::BlockCount { .. })
        ));
        validate(&[], &[ReadBlock::new(0, 125)]).unwrap();
    }

    #[test]
    fn test_duplicate_metric_rejected() {
        let entries = [
            RegisterMapEntry::new(0, 2, Float32Be, Voltage, "V", 1.0),
            RegisterMapEntry::new(2, 2, Float32Be, Voltage, "V", 1.0),
        ];
        assert!(matches!(
            validate(&entries, &[]),
            Err(CatalogError::DuplicateMetric { metric: Voltage })
        ));
    }

    #[test]
    fn test_address_overflow_rejected() {
        let entries = [RegisterMapEntry::new(0xFFFF, 2, Float32Be, Voltage, "V", 1.0)];
        assert!(matches!(
            validate(&entries, &[]),
            Err(CatalogError::AddressOverflow { .. })
        ));
    }

    #[test]
    fn test_metric_names_and_kinds() {
        assert_eq!(PowerActive.as_str(), "power_active");
        assert_eq!(CounterN3.kind(), "counter");
        assert_eq!(Voltage.kind(), "gauge");
        assert_eq!(Metric::ALL.len(), 10);
    }

    #[test]
    fn test_entry_deserialize_defaults() {
        let entry: RegisterMapEntry =
            json5::from_str(r#"{ address: 12, words: 2, decoder: "t6", metric: "power_active" }"#)
                .unwrap();
        assert_eq!(entry.scale, 1.0);
        assert!(entry.enabled);
        assert_eq!(entry.unit, "");
        assert_eq!(entry.decoder, T6);
    }
}
