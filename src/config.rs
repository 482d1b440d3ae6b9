//! Acquisition configuration and the partial updates accepted by setup

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Inclusive bounds of the timer trigger period, in seconds
pub const TRIGGER_PERIOD_BOUNDS: (f64, f64) = (122e-6, 2.79);
/// The instrument buffers at most this many samples per axis
pub const MAX_BLOCK_SIZE: u32 = 4096;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Trigger period {value}s is out of range. Allowed range is [{min}, {max}]")]
    TriggerPeriodOutOfRange { value: f64, min: f64, max: f64 },
    #[error("Block size {0} is out of range. Allowed range is [1, 4096]")]
    BlockSizeOutOfRange(u32),
    #[error("Average count must be at least 1")]
    ZeroAverageCount,
    #[error("Unknown sense range `{0}`, expected one of 0.1T, 0.3T, 1T, 3T")]
    UnknownRange(String),
    #[error("Unknown data format `{0}`, expected ASCII or INTEGER")]
    UnknownFormat(String),
    #[error("Could not parse configuration")]
    Toml(#[from] toml::de::Error),
}

/// Full-scale sense range of the probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Range {
    #[default]
    #[serde(rename = "0.1T")]
    Tesla0_1,
    #[serde(rename = "0.3T")]
    Tesla0_3,
    #[serde(rename = "1T")]
    Tesla1,
    #[serde(rename = "3T")]
    Tesla3,
}

impl Range {
    pub const ALL: [Range; 4] = [
        Range::Tesla0_1,
        Range::Tesla0_3,
        Range::Tesla1,
        Range::Tesla3,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Range::Tesla0_1 => "0.1T",
            Range::Tesla0_3 => "0.3T",
            Range::Tesla1 => "1T",
            Range::Tesla3 => "3T",
        }
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Range {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Range::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ConfigError::UnknownRange(s.to_string()))
    }
}

/// Wire format of fetch replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DataFormat {
    #[serde(rename = "ASCII")]
    Ascii,
    /// Binary IEEE blocks of big-endian `i32`
    #[default]
    #[serde(rename = "INTEGER", alias = "BINARY")]
    Integer,
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DataFormat::Ascii => "ASCII",
            DataFormat::Integer => "INTEGER",
        })
    }
}

impl FromStr for DataFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ASCII" => Ok(DataFormat::Ascii),
            "INTEGER" | "BINARY" => Ok(DataFormat::Integer),
            _ => Err(ConfigError::UnknownFormat(s.to_string())),
        }
    }
}

/// Check a trigger period against [`TRIGGER_PERIOD_BOUNDS`]
pub fn validate_trigger_period(period: f64) -> Result<f64, ConfigError> {
    let (min, max) = TRIGGER_PERIOD_BOUNDS;
    // NaN fails both comparisons
    if (min..=max).contains(&period) {
        Ok(period)
    } else {
        Err(ConfigError::TriggerPeriodOutOfRange {
            value: period,
            min,
            max,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Samples per axis returned by one fetch
    pub block_size: u32,
    /// Seconds between successive timer triggers
    pub trigger_period: f64,
    pub range: Range,
    pub average_count: u32,
    pub format: DataFormat,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            block_size: 10,
            trigger_period: 0.5,
            range: Range::Tesla0_1,
            average_count: 1,
            format: DataFormat::Integer,
        }
    }
}

impl Configuration {
    /// Merge a partial update into this configuration.
    ///
    /// Absent fields keep their value. Invalid fields are rejected and
    /// returned as warnings; a rejected trigger period falls back to the
    /// default rather than the previous value.
    pub fn apply(&mut self, update: ConfigUpdate) -> Vec<ConfigError> {
        let mut warnings = vec![];

        if let Some(block_size) = update.block_size {
            if (1..=MAX_BLOCK_SIZE).contains(&block_size) {
                self.block_size = block_size;
            } else {
                warnings.push(ConfigError::BlockSizeOutOfRange(block_size));
            }
        }

        if let Some(period) = update.trigger_period {
            self.trigger_period = match validate_trigger_period(period) {
                Ok(period) => period,
                Err(e) => {
                    warnings.push(e);
                    Configuration::default().trigger_period
                }
            };
        }

        if let Some(range) = update.range {
            self.range = range;
        }

        if let Some(average_count) = update.average_count {
            if average_count == 0 {
                warnings.push(ConfigError::ZeroAverageCount);
            } else {
                self.average_count = average_count;
            }
        }

        if let Some(format) = update.format {
            self.format = format;
        }

        for w in &warnings {
            tracing::warn!("{w}");
        }
        warnings
    }
}

/// A partial configuration; `None` fields are left untouched by
/// [`Configuration::apply`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigUpdate {
    pub block_size: Option<u32>,
    pub trigger_period: Option<f64>,
    pub range: Option<Range>,
    pub average_count: Option<u32>,
    pub format: Option<DataFormat>,
}

impl ConfigUpdate {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn block_size(mut self, block_size: u32) -> Self {
        self.block_size = Some(block_size);
        self
    }

    pub fn trigger_period(mut self, period: f64) -> Self {
        self.trigger_period = Some(period);
        self
    }

    pub fn range(mut self, range: Range) -> Self {
        self.range = Some(range);
        self
    }

    pub fn average_count(mut self, average_count: u32) -> Self {
        self.average_count = Some(average_count);
        self
    }

    pub fn format(mut self, format: DataFormat) -> Self {
        self.format = Some(format);
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn trigger_period_bounds_are_inclusive() {
        assert!(validate_trigger_period(122e-6).is_ok());
        assert!(validate_trigger_period(2.79).is_ok());
        assert!(validate_trigger_period(0.5).is_ok());
        assert!(validate_trigger_period(121e-6).is_err());
        assert!(validate_trigger_period(2.8).is_err());
        assert!(validate_trigger_period(f64::NAN).is_err());
    }

    #[test]
    fn update_only_touches_supplied_fields() {
        let mut cfg = Configuration::default();
        let warnings = cfg.apply(ConfigUpdate::default().block_size(5).average_count(4));
        assert!(warnings.is_empty());
        assert_eq!(cfg.block_size, 5);
        assert_eq!(cfg.average_count, 4);
        assert_eq!(cfg.trigger_period, 0.5);
        assert_eq!(cfg.range, Range::Tesla0_1);
        assert_eq!(cfg.format, DataFormat::Integer);
    }

    #[test]
    fn invalid_trigger_period_reverts_to_default() {
        let mut cfg = Configuration::default();
        cfg.apply(ConfigUpdate::default().trigger_period(0.05));
        assert_eq!(cfg.trigger_period, 0.05);

        let warnings = cfg.apply(ConfigUpdate::default().trigger_period(10.0));
        assert_eq!(cfg.trigger_period, 0.5);
        assert!(matches!(
            warnings.as_slice(),
            [ConfigError::TriggerPeriodOutOfRange { value, .. }] if *value == 10.0
        ));
    }

    #[test]
    fn invalid_block_size_keeps_previous() {
        let mut cfg = Configuration::default();
        cfg.apply(ConfigUpdate::default().block_size(7));
        let warnings = cfg.apply(ConfigUpdate::default().block_size(0));
        assert_eq!(cfg.block_size, 7);
        assert_eq!(warnings.len(), 1);
        let warnings = cfg.apply(ConfigUpdate::default().block_size(MAX_BLOCK_SIZE + 1));
        assert_eq!(cfg.block_size, 7);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn zero_average_rejected() {
        let mut cfg = Configuration::default();
        let warnings = cfg.apply(ConfigUpdate::default().average_count(0));
        assert_eq!(cfg.average_count, 1);
        assert!(matches!(warnings.as_slice(), [ConfigError::ZeroAverageCount]));
    }

    #[test]
    fn parse_update_from_toml() {
        let update = ConfigUpdate::from_toml_str(
            r#"
            block_size = 5
            trigger_period = 0.05
            range = "1T"
            average_count = 4
            format = "ASCII"
            "#,
        )
        .unwrap();
        assert_eq!(
            update,
            ConfigUpdate::default()
                .block_size(5)
                .trigger_period(0.05)
                .range(Range::Tesla1)
                .average_count(4)
                .format(DataFormat::Ascii)
        );

        let partial = ConfigUpdate::from_toml_str("format = \"BINARY\"").unwrap();
        assert_eq!(partial.format, Some(DataFormat::Integer));
        assert_eq!(partial.block_size, None);

        assert!(ConfigUpdate::from_toml_str("range = \"2T\"").is_err());
        assert!(ConfigUpdate::from_toml_str("speed = 3").is_err());
    }

    #[test]
    fn range_and_format_from_str() {
        assert_eq!("0.3T".parse::<Range>().unwrap(), Range::Tesla0_3);
        assert_eq!("3t".parse::<Range>().unwrap(), Range::Tesla3);
        assert!("5T".parse::<Range>().is_err());
        assert_eq!("integer".parse::<DataFormat>().unwrap(), DataFormat::Integer);
        assert_eq!("ASCII".parse::<DataFormat>().unwrap(), DataFormat::Ascii);
        assert!("FLOAT".parse::<DataFormat>().is_err());
    }
}
