//! Configuration types
//!
//! Per-prompt generation options and how they layer over defaults.

use serde::{Deserialize, Serialize};

use crate::error::MlcError;

/// Default cap on generated output when nothing else sets one
pub const DEFAULT_MAX_GEN_LEN: u32 = 512;

/// Sampling options for a single generation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Higher values give more diverse output (0.0 - 1.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Nucleus sampling threshold (0.0 - 1.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Penalty applied to repeated text (0.0 - 1.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f32>,
    /// Maximum length of the output text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_gen_len: Option<u32>,
}

impl GenerationOptions {
    /// Reject values outside the ranges the runtime accepts
    pub fn validate(&self) -> Result<(), MlcError> {
        check_unit("temperature", self.temperature)?;
        check_unit("top_p", self.top_p)?;
        check_unit("repetition_penalty", self.repetition_penalty)?;
        if self.max_gen_len == Some(0) {
            return Err(MlcError::InvalidOption(
                "max_gen_len must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Fill unset fields from `fallback`
    pub fn or(&self, fallback: &GenerationOptions) -> GenerationOptions {
        GenerationOptions {
            temperature: self.temperature.or(fallback.temperature),
            top_p: self.top_p.or(fallback.top_p),
            repetition_penalty: self.repetition_penalty.or(fallback.repetition_penalty),
            max_gen_len: self.max_gen_len.or(fallback.max_gen_len),
        }
    }

    /// Effective output cap
    pub fn max_gen_len_or_default(&self) -> u32 {
        self.max_gen_len.unwrap_or(DEFAULT_MAX_GEN_LEN)
    }

    /// Apply a `key=value` pair as given on the command line
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), MlcError> {
        let bad = |e: &dyn std::fmt::Display| {
            MlcError::InvalidOption(format!("{}={}: {}", key, value, e))
        };
        match key {
            "temperature" => self.temperature = Some(value.parse().map_err(|e| bad(&e))?),
            "top_p" => self.top_p = Some(value.parse().map_err(|e| bad(&e))?),
            "repetition_penalty" => {
                self.repetition_penalty = Some(value.parse().map_err(|e| bad(&e))?)
            }
            "max_gen_len" => self.max_gen_len = Some(value.parse().map_err(|e| bad(&e))?),
            other => {
                return Err(MlcError::InvalidOption(format!(
                    "unknown option '{}' (expected temperature, top_p, repetition_penalty or max_gen_len)",
                    other
                )))
            }
        }
        self.validate()
    }
}

fn check_unit(name: &str, value: Option<f32>) -> Result<(), MlcError> {
    match value {
        Some(v) if !(0.0..=1.0).contains(&v) => Err(MlcError::InvalidOption(format!(
            "{} must be between 0 and 1, got {}",
            name, v
        ))),
        _ => Ok(()),
    }
}
