//! Engine configuration validation.
//!
//! Every field is checked and every violation reported, so a user fixing a
//! config file sees all problems at once.
//!
//! # Example
//!
//! ```rust
//! use rivulet_config::{EngineConfig, validate_engine_config};
//!
//! let mut config = EngineConfig::default();
//! config.quantum_frames = 100;
//! assert!(validate_engine_config(&config).is_err());
//! ```

use std::ops::RangeInclusive;

use thiserror::Error;

use crate::engine::EngineConfig;

/// Accepted sample rates, in Hz.
pub const SAMPLE_RATE_RANGE: RangeInclusive<u64> = 44_100..=96_000;
/// Accepted render quantum sizes, in frames. Must also be a power of two.
pub const QUANTUM_FRAMES_RANGE: RangeInclusive<u64> = 64..=4096;
/// Accepted channel limits.
pub const MAX_CHANNELS_RANGE: RangeInclusive<u64> = 1..=32;
/// Accepted live-session caps.
pub const MAX_LIVE_SESSIONS_RANGE: RangeInclusive<u64> = 1..=64;
/// Accepted control queue depths.
pub const CONTROL_QUEUE_DEPTH_RANGE: RangeInclusive<u64> = 4..=4096;
/// Accepted driver periods, in milliseconds.
pub const DRIVER_PERIOD_MS_RANGE: RangeInclusive<u64> = 1..=1000;

/// Validation error types.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    /// Value outside its accepted range.
    #[error("'{field}' value {value} out of range [{min}, {max}]")]
    OutOfRange {
        /// Name of the field.
        field: &'static str,
        /// The rejected value.
        value: u64,
        /// Minimum allowed value.
        min: u64,
        /// Maximum allowed value.
        max: u64,
    },

    /// Value that must be a power of two.
    #[error("'{field}' must be a power of two, got {value}")]
    NotPowerOfTwo {
        /// Name of the field.
        field: &'static str,
        /// The rejected value.
        value: u64,
    },

    /// Output channels above the channel limit.
    #[error("output_channels {output} exceeds max_channels {max}")]
    OutputChannels {
        /// Configured output channels.
        output: u64,
        /// Configured channel limit.
        max: u64,
    },

    /// Multiple validation errors.
    #[error("multiple validation errors: {}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

fn check_range(
    errors: &mut Vec<ValidationError>,
    field: &'static str,
    value: u64,
    range: &RangeInclusive<u64>,
) {
    if !range.contains(&value) {
        errors.push(ValidationError::OutOfRange {
            field,
            value,
            min: *range.start(),
            max: *range.end(),
        });
    }
}

/// Validates every field of `config`.
///
/// Returns the single error when one field is wrong and
/// [`ValidationError::Multiple`] otherwise.
pub fn validate_engine_config(config: &EngineConfig) -> ValidationResult<()> {
    let mut errors = Vec::new();

    check_range(&mut errors, "sample_rate", u64::from(config.sample_rate), &SAMPLE_RATE_RANGE);

    let quantum = config.quantum_frames as u64;
    check_range(&mut errors, "quantum_frames", quantum, &QUANTUM_FRAMES_RANGE);
    if !quantum.is_power_of_two() {
        errors.push(ValidationError::NotPowerOfTwo {
            field: "quantum_frames",
            value: quantum,
        });
    }

    let max_channels = config.max_channels as u64;
    check_range(&mut errors, "max_channels", max_channels, &MAX_CHANNELS_RANGE);
    let output = config.output_channels as u64;
    if output == 0 {
        errors.push(ValidationError::OutOfRange {
            field: "output_channels",
            value: 0,
            min: 1,
            max: max_channels,
        });
    } else if output > max_channels {
        errors.push(ValidationError::OutputChannels {
            output,
            max: max_channels,
        });
    }

    check_range(
        &mut errors,
        "max_live_sessions",
        config.max_live_sessions as u64,
        &MAX_LIVE_SESSIONS_RANGE,
    );
    check_range(
        &mut errors,
        "control_queue_depth",
        config.control_queue_depth as u64,
        &CONTROL_QUEUE_DEPTH_RANGE,
    );
    check_range(
        &mut errors,
        "driver.period_ms",
        config.driver.period_ms,
        &DRIVER_PERIOD_MS_RANGE,
    );

    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(ValidationError::Multiple(errors)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(validate_engine_config(&EngineConfig::default()), Ok(()));
    }

    #[test]
    fn test_sample_rate_bounds() {
        for (rate, ok) in [(44_100, true), (96_000, true), (22_050, false), (192_000, false)] {
            let config = EngineConfig {
                sample_rate: rate,
                ..EngineConfig::default()
            };
            assert_eq!(validate_engine_config(&config).is_ok(), ok, "rate {rate}");
        }
    }

    #[test]
    fn test_quantum_must_be_power_of_two() {
        let config = EngineConfig {
            quantum_frames: 96,
            ..EngineConfig::default()
        };
        assert_eq!(
            validate_engine_config(&config),
            Err(ValidationError::NotPowerOfTwo {
                field: "quantum_frames",
                value: 96
            })
        );
    }

    #[test]
    fn test_quantum_above_range() {
        let config = EngineConfig {
            quantum_frames: 8192,
            ..EngineConfig::default()
        };
        assert!(matches!(
            validate_engine_config(&config),
            Err(ValidationError::OutOfRange {
                field: "quantum_frames",
                ..
            })
        ));
    }

    #[test]
    fn test_output_channels_above_max() {
        let config = EngineConfig {
            max_channels: 2,
            output_channels: 6,
            ..EngineConfig::default()
        };
        assert_eq!(
            validate_engine_config(&config),
            Err(ValidationError::OutputChannels { output: 6, max: 2 })
        );
    }

    #[test]
    fn test_collects_every_error() {
        let mut config = EngineConfig::default();
        config.sample_rate = 8000;
        config.control_queue_depth = 1;
        config.driver.period_ms = 0;
        let Err(ValidationError::Multiple(errors)) = validate_engine_config(&config) else {
            panic!("expected multiple errors");
        };
        assert_eq!(errors.len(), 3);
        let msg = ValidationError::Multiple(errors).to_string();
        assert!(msg.contains("sample_rate"), "got: {msg}");
        assert!(msg.contains("driver.period_ms"), "got: {msg}");
    }
}
