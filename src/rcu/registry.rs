//! Parameter registry: a process-wide immutable catalog mapping a one-byte
//! parameter index to its name, width, scaling, and optional bitfields,
//! plus the pure decode-to-engineering-value projection.

use crate::rcu::constants::DEFAULT_UNKNOWN_PARAMETER_WIDTH;
use crate::rcu::error::RcuError;
use crate::utils::{ctz, sign_extend};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

/// A decoded engineering value.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedValue {
    Integer(i64),
    Real(f64, String),
    Enumerated(u32, Option<String>),
    Boolean(bool),
}

/// One named subfield of a register's raw integer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BitfieldDefinition {
    pub name: String,
    pub mask: u16,
    pub sort_order: i32,
    #[serde(default)]
    pub value_map: BTreeMap<u32, String>,
}

impl BitfieldDefinition {
    /// `(raw & mask) >> trailing_zeros(mask)`.
    pub fn project(&self, raw: u32) -> u32 {
        (raw & u32::from(self.mask)) >> ctz(self.mask)
    }
}

/// Immutable record describing one parameter index.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ParameterDefinition {
    pub index: u8,
    pub name: String,
    /// 1 or 2 bytes.
    pub size: u8,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub writable: bool,
    #[serde(default)]
    pub menu: Option<String>,
    #[serde(default)]
    pub min: Option<i64>,
    #[serde(default)]
    pub max: Option<i64>,
    #[serde(default)]
    pub step: Option<i64>,
    #[serde(default, rename = "bit_fields")]
    pub bitfields: Vec<BitfieldDefinition>,
}

fn default_factor() -> f64 {
    1.0
}

impl ParameterDefinition {
    /// The writable range, defaulting to the full signed range for the
    /// parameter's width when not declared explicitly.
    pub fn effective_range(&self) -> (i64, i64) {
        match (self.min, self.max) {
            (Some(min), Some(max)) => (min, max),
            _ => {
                let bits = self.size as u32 * 8;
                let half = 1i64 << (bits - 1);
                (-half, half - 1)
            }
        }
    }

    fn validate(&self) -> Result<(), RcuError> {
        if self.size != 1 && self.size != 2 {
            return Err(RcuError::Config(format!(
                "parameter {:#04x}: size must be 1 or 2, got {}",
                self.index, self.size
            )));
        }
        let bits = self.size as u32 * 8;
        for bf in &self.bitfields {
            if bf.mask == 0 {
                return Err(RcuError::Config(format!(
                    "parameter {:#04x} bitfield {}: mask must be non-zero",
                    self.index, bf.name
                )));
            }
            if u32::from(bf.mask) >= (1u32 << bits) {
                return Err(RcuError::Config(format!(
                    "parameter {:#04x} bitfield {}: mask {:#06x} does not fit in {} bits",
                    self.index, bf.name, bf.mask, bits
                )));
            }
        }
        Ok(())
    }

    /// Projects a raw integer into one or more decoded values.
    ///
    /// If `bitfields` is non-empty, `factor` is ignored and one value is
    /// produced per bitfield, sorted by `sort_order`. Otherwise the raw bits
    /// are interpreted as signed two's complement at the declared width and
    /// divided by `factor`.
    pub fn project(&self, raw: u32) -> Projection {
        if !self.bitfields.is_empty() {
            let mut ordered: Vec<&BitfieldDefinition> = self.bitfields.iter().collect();
            ordered.sort_by_key(|bf| bf.sort_order);
            let fields = ordered
                .into_iter()
                .map(|bf| (bf.name.clone(), project_bitfield(bf, raw)))
                .collect();
            Projection::Bitfields(fields)
        } else {
            let signed = sign_extend(raw, self.size as u32 * 8);
            let value = if self.factor > 1.0 {
                DecodedValue::Real(signed as f64 / self.factor, self.unit.clone())
            } else {
                DecodedValue::Integer(signed)
            };
            Projection::Scalar(value)
        }
    }
}

/// Result of [`ParameterDefinition::project`].
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Scalar(DecodedValue),
    /// `(bitfield name, value)` pairs, already sorted by `sort_order`.
    Bitfields(Vec<(String, DecodedValue)>),
}

fn project_bitfield(bf: &BitfieldDefinition, raw: u32) -> DecodedValue {
    let value = bf.project(raw);
    if let Some(label) = bf.value_map.get(&value) {
        return DecodedValue::Enumerated(value, Some(label.clone()));
    }
    if bf.mask.count_ones() == 1 {
        DecodedValue::Boolean(value != 0)
    } else {
        DecodedValue::Integer(value as i64)
    }
}

/// The process-wide immutable parameter catalog.
#[derive(Debug, Clone)]
pub struct Registry {
    definitions: HashMap<u8, ParameterDefinition>,
    /// Fallback width assumed for an index not in `definitions`. Kept as a
    /// per-catalog field rather than a constant since different pumps have
    /// been observed to disagree on the right default.
    pub unknown_parameter_width: u8,
}

impl Registry {
    /// A small built-in catalog covering a handful of common registers,
    /// usable without an external configuration document.
    pub fn built_in() -> Self {
        let registers = vec![
            ParameterDefinition {
                index: 0x01,
                name: "Outdoor Temperature".into(),
                size: 2,
                factor: 10.0,
                unit: "°C".into(),
                writable: false,
                menu: None,
                min: None,
                max: None,
                step: None,
                bitfields: vec![],
            },
            ParameterDefinition {
                index: 0x02,
                name: "Supply Line Temperature".into(),
                size: 2,
                factor: 10.0,
                unit: "°C".into(),
                writable: false,
                menu: None,
                min: None,
                max: None,
                step: None,
                bitfields: vec![],
            },
            ParameterDefinition {
                index: 0x06,
                name: "Hot Water Temperature".into(),
                size: 2,
                factor: 10.0,
                unit: "°C".into(),
                writable: false,
                menu: None,
                min: None,
                max: None,
                step: None,
                bitfields: vec![],
            },
            ParameterDefinition {
                index: 0x0B,
                name: "Heating Curve Offset".into(),
                size: 1,
                factor: 1.0,
                unit: "".into(),
                writable: true,
                menu: Some("Heating".into()),
                min: Some(-10),
                max: Some(10),
                step: Some(1),
                bitfields: vec![],
            },
            ParameterDefinition {
                index: 0x13,
                name: "Compressor Status".into(),
                size: 1,
                factor: 1.0,
                unit: "".into(),
                writable: false,
                menu: None,
                min: None,
                max: None,
                step: None,
                bitfields: vec![
                    BitfieldDefinition {
                        name: "Kompressor".into(),
                        mask: 0x02,
                        sort_order: 0,
                        value_map: BTreeMap::new(),
                    },
                    BitfieldDefinition {
                        name: "CP1".into(),
                        mask: 0x40,
                        sort_order: 1,
                        value_map: BTreeMap::new(),
                    },
                    BitfieldDefinition {
                        name: "CP2".into(),
                        mask: 0x01,
                        sort_order: 2,
                        value_map: BTreeMap::new(),
                    },
                ],
            },
        ];
        Self::new(registers, DEFAULT_UNKNOWN_PARAMETER_WIDTH).expect("built-in catalog is valid")
    }

    fn new(registers: Vec<ParameterDefinition>, unknown_parameter_width: u8) -> Result<Self, RcuError> {
        let mut definitions = HashMap::with_capacity(registers.len());
        for def in registers {
            def.validate()?;
            if def.bitfields.iter().any(|bf| bf.name.is_empty()) {
                return Err(RcuError::Config(format!(
                    "parameter {:#04x}: bitfield name must not be empty",
                    def.index
                )));
            }
            definitions.insert(def.index, def);
        }
        Ok(Self {
            definitions,
            unknown_parameter_width,
        })
    }

    /// Loads a registry from a human-editable configuration document,
    /// selecting the pump keyed by `pump_name`.
    pub fn from_document(doc: &ConfigDocument, pump_name: &str) -> Result<Self, RcuError> {
        let pump = doc.pumps.get(pump_name).ok_or_else(|| {
            RcuError::Config(format!("no pump named {pump_name:?} in configuration"))
        })?;
        let width = pump
            .unknown_parameter_width
            .unwrap_or(DEFAULT_UNKNOWN_PARAMETER_WIDTH);
        Self::new(pump.registers.clone(), width)
    }

    pub fn size(&self, index: u8) -> Option<u8> {
        self.definitions.get(&index).map(|d| d.size)
    }

    pub fn definition(&self, index: u8) -> Option<&ParameterDefinition> {
        self.definitions.get(&index)
    }

    pub fn writable(&self, index: u8) -> bool {
        self.definitions.get(&index).is_some_and(|d| d.writable)
    }

    pub fn bitfields(&self, index: u8) -> &[BitfieldDefinition] {
        self.definitions
            .get(&index)
            .map(|d| d.bitfields.as_slice())
            .unwrap_or(&[])
    }

    pub fn indices(&self) -> impl Iterator<Item = u8> + '_ {
        self.definitions.keys().copied()
    }
}

/// Top-level parsed form of the configuration document: a map keyed by
/// logical pump name.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigDocument {
    #[serde(flatten)]
    pub pumps: HashMap<String, PumpConfig>,
}

impl ConfigDocument {
    pub fn from_toml_str(s: &str) -> Result<Self, RcuError> {
        toml::from_str(s).map_err(|e| RcuError::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PumpConfig {
    pub baudrate: u32,
    #[serde(default)]
    pub bit_mode: Option<u8>,
    #[serde(default)]
    pub parity: Option<String>,
    pub cmd_data: u8,
    pub master_addr: u8,
    pub rcu_addr: u8,
    pub ack: u8,
    pub enq: u8,
    pub nak: u8,
    pub etx: u8,
    #[serde(default)]
    pub unknown_parameter_width: Option<u8>,
    #[serde(default, rename = "register")]
    pub registers: Vec<ParameterDefinition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_big_endian_decode() {
        // 0xFFCB = -53 two's complement; at factor 10 that's -5.3.
        let def = ParameterDefinition {
            index: 0x99,
            name: "Test".into(),
            size: 2,
            factor: 10.0,
            unit: "°C".into(),
            writable: false,
            menu: None,
            min: None,
            max: None,
            step: None,
            bitfields: vec![],
        };
        match def.project(0xFFCB) {
            Projection::Scalar(DecodedValue::Real(v, unit)) => {
                assert!((v - (-5.3)).abs() < 1e-9);
                assert_eq!(unit, "°C");
            }
            other => panic!("unexpected projection: {other:?}"),
        }
    }

    #[test]
    fn bitfield_projection_and_labels() {
        // mask 0x38 over raw 0x1A projects to 3; value_map labels it "High".
        let mut value_map = BTreeMap::new();
        value_map.insert(0, "Off".to_string());
        value_map.insert(1, "Low".to_string());
        value_map.insert(2, "Medium".to_string());
        value_map.insert(3, "High".to_string());
        let bf = BitfieldDefinition {
            name: "Fan".into(),
            mask: 0x38,
            sort_order: 0,
            value_map,
        };
        assert_eq!(bf.project(0x1A), 3);
        match project_bitfield(&bf, 0x1A) {
            DecodedValue::Enumerated(3, Some(label)) => assert_eq!(label, "High"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn bitfield_ordering_independent_of_mask_or_declaration_order() {
        let registry = Registry::built_in();
        let def = registry.definition(0x13).unwrap();
        match def.project(0x43) {
            Projection::Bitfields(fields) => {
                let names: Vec<_> = fields.iter().map(|(n, _)| n.as_str()).collect();
                assert_eq!(names, vec!["Kompressor", "CP1", "CP2"]);
                assert_eq!(fields[0].1, DecodedValue::Boolean(true));
                assert_eq!(fields[1].1, DecodedValue::Boolean(true));
                assert_eq!(fields[2].1, DecodedValue::Boolean(true));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn validation_rejects_mask_outside_width() {
        let def = ParameterDefinition {
            index: 0x01,
            name: "Bad".into(),
            size: 1,
            factor: 1.0,
            unit: "".into(),
            writable: false,
            menu: None,
            min: None,
            max: None,
            step: None,
            bitfields: vec![BitfieldDefinition {
                name: "TooWide".into(),
                mask: 0x1FF,
                sort_order: 0,
                value_map: BTreeMap::new(),
            }],
        };
        assert!(Registry::new(vec![def], 2).is_err());
    }

    #[test]
    fn writable_parameter_defaults_to_full_signed_range() {
        let def = ParameterDefinition {
            index: 0x0B,
            name: "Offset".into(),
            size: 1,
            factor: 1.0,
            unit: "".into(),
            writable: true,
            menu: None,
            min: None,
            max: None,
            step: None,
            bitfields: vec![],
        };
        assert_eq!(def.effective_range(), (-128, 127));
    }

    #[test]
    fn config_document_round_trip() {
        let toml_src = r#"
            [demo]
            baudrate = 19200
            cmd_data = 0xC0
            master_addr = 0x24
            rcu_addr = 0x14
            ack = 0x06
            enq = 0x05
            nak = 0x15
            etx = 0x03

            [[demo.register]]
            index = 1
            name = "Outdoor Temperature"
            size = 2
            factor = 10.0
            unit = "°C"
        "#;
        let doc = ConfigDocument::from_toml_str(toml_src).unwrap();
        let registry = Registry::from_document(&doc, "demo").unwrap();
        assert_eq!(registry.size(0x01), Some(2));
        assert_eq!(registry.definition(0x01).unwrap().name, "Outdoor Temperature");
    }
}
