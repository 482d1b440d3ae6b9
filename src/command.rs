//! Instrument commands and how they are rendered on the wire

use crate::{
    config::{validate_trigger_period, ConfigError, Configuration, DataFormat, Range},
    sample::FetchKind,
};
use std::fmt;

/// Significant digits requested for every array fetch
pub const FETCH_DIGITS: u32 = 5;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Format(DataFormat),
    Range(Range),
    AverageCount(u32),
    TriggerSourceTimer,
    /// Timer trigger period in seconds
    TriggerTimer(f64),
    TriggerCount(u32),
    InitContinuous,
    /// Arm the trigger system
    Initiate,
    /// Abort acquisition and query the status byte
    AbortStatus,
    /// Pop one entry of the error queue and query the status byte
    ErrorStatus,
    Identify,
    /// Fetch one block of every [`FetchKind`] plus the status byte
    Fetch { block_size: u32 },
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Format(format) => write!(f, ":FORMAT:DATA {format}"),
            Command::Range(range) => write!(f, ":SENSe:FLUX:RANGe {range}"),
            Command::AverageCount(n) => write!(f, ":AVERAGE:COUNT {n}"),
            Command::TriggerSourceTimer => f.write_str(":TRIGger:SOURce TIMer"),
            Command::TriggerTimer(period) => write!(f, ":TRIGger:TIMer {period:.6}S"),
            Command::TriggerCount(n) => write!(f, ":TRIG:COUNT {n}"),
            Command::InitContinuous => f.write_str(":INIT:CONTINUOUS ON"),
            Command::Initiate => f.write_str(":INIT"),
            Command::AbortStatus => f.write_str(":ABORT;*STB?"),
            Command::ErrorStatus => f.write_str(":SYSTEM:ERROR?;*STB?"),
            Command::Identify => f.write_str("*IDN?"),
            Command::Fetch { block_size } => {
                for kind in FetchKind::ALL {
                    match kind.axis() {
                        Some(axis) => {
                            write!(f, ":FETCh:ARRay:{axis}? {block_size},{FETCH_DIGITS};")?
                        }
                        None => write!(f, ":FETCH:{}?;", kind.query_name())?,
                    }
                }
                f.write_str("*STB?")
            }
        }
    }
}

/// The commands that bring the instrument into a given configuration
#[derive(Debug)]
pub struct SetupPlan {
    pub commands: Vec<Command>,
    /// Why the periodic trigger sequence was left out, if it was
    pub trigger_warning: Option<ConfigError>,
}

impl SetupPlan {
    pub fn periodic_trigger(&self) -> bool {
        self.trigger_warning.is_none()
    }
}

/// The timer-triggered continuous acquisition sequence, if the period is valid
pub fn periodic_trigger(config: &Configuration) -> Result<[Command; 4], ConfigError> {
    let period = validate_trigger_period(config.trigger_period)?;
    Ok([
        Command::TriggerSourceTimer,
        Command::TriggerTimer(period),
        Command::TriggerCount(config.block_size),
        Command::InitContinuous,
    ])
}

/// Build the setup sequence: format, range, averaging and, when the trigger
/// period validates, the periodic trigger
pub fn setup_plan(config: &Configuration) -> SetupPlan {
    let mut commands = vec![
        Command::Format(config.format),
        Command::Range(config.range),
        Command::AverageCount(config.average_count),
    ];
    let trigger_warning = match periodic_trigger(config) {
        Ok(trigger) => {
            commands.extend(trigger);
            None
        }
        Err(e) => {
            tracing::warn!("Invalid trigger period value, periodic trigger not set: {e}");
            Some(e)
        }
    };
    SetupPlan {
        commands,
        trigger_warning,
    }
}

pub fn fetch_command(config: &Configuration) -> Command {
    Command::Fetch {
        block_size: config.block_size,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn rendered(plan: &SetupPlan) -> Vec<String> {
        plan.commands.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn default_setup_sequence() {
        let plan = setup_plan(&Configuration::default());
        assert!(plan.periodic_trigger());
        assert_eq!(
            rendered(&plan),
            vec![
                ":FORMAT:DATA INTEGER",
                ":SENSe:FLUX:RANGe 0.1T",
                ":AVERAGE:COUNT 1",
                ":TRIGger:SOURce TIMer",
                ":TRIGger:TIMer 0.500000S",
                ":TRIG:COUNT 10",
                ":INIT:CONTINUOUS ON",
            ]
        );
    }

    #[test]
    fn trigger_included_across_valid_periods() {
        for period in [122e-6, 1e-3, 0.05, 1.0, 2.0, 2.79] {
            let config = Configuration {
                trigger_period: period,
                ..Default::default()
            };
            let plan = setup_plan(&config);
            assert!(plan.periodic_trigger(), "period {period}");
            assert_eq!(plan.commands.len(), 7);
            assert!(plan.commands.contains(&Command::TriggerTimer(period)));
        }
    }

    #[test]
    fn trigger_omitted_for_invalid_periods() {
        for period in [0.0, 100e-6, 121.9e-6, 2.7901, 10.0, -1.0, f64::NAN] {
            let config = Configuration {
                trigger_period: period,
                ..Default::default()
            };
            let plan = setup_plan(&config);
            assert!(!plan.periodic_trigger(), "period {period}");
            assert_eq!(
                rendered(&plan),
                vec![
                    ":FORMAT:DATA INTEGER",
                    ":SENSe:FLUX:RANGe 0.1T",
                    ":AVERAGE:COUNT 1"
                ]
            );
            assert!(matches!(
                plan.trigger_warning,
                Some(ConfigError::TriggerPeriodOutOfRange { .. })
            ));
        }
    }

    #[test]
    fn smallest_period_keeps_its_digits() {
        assert_eq!(
            Command::TriggerTimer(122e-6).to_string(),
            ":TRIGger:TIMer 0.000122S"
        );
    }

    #[test]
    fn fetch_command_string() {
        let config = Configuration {
            block_size: 10,
            ..Default::default()
        };
        assert_eq!(
            fetch_command(&config).to_string(),
            ":FETCh:ARRay:X? 10,5;:FETCh:ARRay:Y? 10,5;:FETCh:ARRay:Z? 10,5;\
             :FETCH:TIMESTAMP?;:FETCH:TEMPERATURE?;*STB?"
        );
    }

    #[test]
    fn ascii_setup() {
        let config = Configuration {
            format: DataFormat::Ascii,
            range: Range::Tesla3,
            average_count: 400,
            block_size: 5,
            trigger_period: 0.05,
        };
        assert_eq!(
            rendered(&setup_plan(&config)),
            vec![
                ":FORMAT:DATA ASCII",
                ":SENSe:FLUX:RANGe 3T",
                ":AVERAGE:COUNT 400",
                ":TRIGger:SOURce TIMer",
                ":TRIGger:TIMer 0.050000S",
                ":TRIG:COUNT 5",
                ":INIT:CONTINUOUS ON",
            ]
        );
    }

    #[test]
    fn queries() {
        assert_eq!(Command::Identify.to_string(), "*IDN?");
        assert_eq!(Command::AbortStatus.to_string(), ":ABORT;*STB?");
        assert_eq!(Command::ErrorStatus.to_string(), ":SYSTEM:ERROR?;*STB?");
    }
}
