//! YAML bus configuration.
//!
//! Lets deployments describe a bus (pipe bound, poll timing, error-frame
//! opt-in, software filter rules) in a file instead of code. CAN IDs accept
//! decimal or hex (`0x` prefix) notation.

use serde::de::{self, Visitor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use crate::bus::BusOptions;
use crate::error::CanError;
use crate::filter::FilterRule;
use crate::frame::IdType;

/// Whole configuration file.
#[derive(Debug, Serialize, Deserialize)]
pub struct BusConfig {
    /// Receive pipe bound; omit for unbounded.
    #[serde(default)]
    pub pipe_capacity: Option<usize>,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default)]
    pub receive_error_frames: bool,
    #[serde(default = "default_true")]
    pub allow_software_periodic: bool,
    /// Rules the hardware could not accept; enforced in software.
    #[serde(default)]
    pub software_filters: Vec<FilterEntry>,
}

fn default_poll_timeout_ms() -> u64 {
    100
}

fn default_stop_grace_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

/// One filter rule as written in YAML.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FilterEntry {
    Mask {
        #[serde(deserialize_with = "deserialize_hex_or_decimal")]
        code: u32,
        #[serde(deserialize_with = "deserialize_hex_or_decimal")]
        mask: u32,
        #[serde(default)]
        extended: bool,
    },
    Range {
        #[serde(deserialize_with = "deserialize_hex_or_decimal")]
        from: u32,
        #[serde(deserialize_with = "deserialize_hex_or_decimal")]
        to: u32,
        #[serde(default)]
        extended: bool,
    },
}

fn id_type(extended: bool) -> IdType {
    if extended {
        IdType::Extended
    } else {
        IdType::Standard
    }
}

impl From<&FilterEntry> for FilterRule {
    fn from(entry: &FilterEntry) -> Self {
        match *entry {
            FilterEntry::Mask { code, mask, extended } => FilterRule::Mask {
                code,
                mask,
                id_type: id_type(extended),
            },
            FilterEntry::Range { from, to, extended } => FilterRule::Range {
                from,
                to,
                id_type: id_type(extended),
            },
        }
    }
}

impl BusConfig {
    /// Load and deserialize a YAML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CanError> {
        let file = File::open(path.as_ref())
            .map_err(|e| CanError::Config(format!("cannot open config file: {e}")))?;
        let reader = BufReader::new(file);
        serde_yaml::from_reader(reader)
            .map_err(|e| CanError::Config(format!("invalid config file: {e}")))
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, CanError> {
        serde_yaml::from_str(yaml).map_err(|e| CanError::Config(format!("invalid config: {e}")))
    }

    /// Convert into [`BusOptions`]. Rule validation happens when the bus
    /// compiles the filter at open time.
    pub fn to_options(&self) -> BusOptions {
        BusOptions {
            pipe_capacity: self.pipe_capacity,
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            stop_grace: Duration::from_millis(self.stop_grace_ms),
            receive_error_frames: self.receive_error_frames,
            allow_software_periodic: self.allow_software_periodic,
            software_filters: self.software_filters.iter().map(FilterRule::from).collect(),
        }
    }
}

/// Visitor parsing a u32 from decimal or hex notation (e.g. `0x1F2`).
struct HexOrDecimalVisitor;

impl<'de> Visitor<'de> for HexOrDecimalVisitor {
    type Value = u32;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a u32 integer in decimal or hex format")
    }

    fn visit_u64<E>(self, value: u64) -> Result<u32, E>
    where
        E: de::Error,
    {
        u32::try_from(value).map_err(E::custom)
    }

    fn visit_str<E>(self, value: &str) -> Result<u32, E>
    where
        E: de::Error,
    {
        if let Some(hex) = value.strip_prefix("0x") {
            u32::from_str_radix(hex, 16).map_err(E::custom)
        } else {
            value.parse::<u32>().map_err(E::custom)
        }
    }
}

pub fn deserialize_hex_or_decimal<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    deserializer.deserialize_any(HexOrDecimalVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config_with_hex_ids() {
        let yaml = r#"
pipe_capacity: 4096
poll_timeout_ms: 50
receive_error_frames: true
software_filters:
  - kind: mask
    code: "0x100"
    mask: "0x700"
  - kind: range
    from: 512
    to: "0x2FF"
    extended: true
"#;
        let config = BusConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.pipe_capacity, Some(4096));
        assert_eq!(config.poll_timeout_ms, 50);
        assert!(config.receive_error_frames);
        assert!(config.allow_software_periodic);

        let options = config.to_options();
        assert_eq!(options.poll_timeout, Duration::from_millis(50));
        assert_eq!(
            options.software_filters,
            vec![
                FilterRule::Mask { code: 0x100, mask: 0x700, id_type: IdType::Standard },
                FilterRule::Range { from: 0x200, to: 0x2FF, id_type: IdType::Extended },
            ]
        );
    }

    #[test]
    fn defaults_apply_to_empty_config() {
        let config = BusConfig::from_yaml("{}").unwrap();
        assert_eq!(config.pipe_capacity, None);
        assert_eq!(config.poll_timeout_ms, 100);
        assert_eq!(config.stop_grace_ms, 1000);
        assert!(!config.receive_error_frames);
        assert!(config.software_filters.is_empty());
    }

    #[test]
    fn bad_hex_is_a_config_error() {
        let yaml = r#"
software_filters:
  - kind: mask
    code: "0xZZ"
    mask: "0x700"
"#;
        assert!(matches!(
            BusConfig::from_yaml(yaml).unwrap_err(),
            CanError::Config(_)
        ));
    }
}
