//! Hardware temperature sensors via `sensors -j`.
//!
//! lm-sensors emits a nested chip → feature → subfeature JSON object; every
//! `*_input` subfeature under a temperature feature becomes one reading.

use std::sync::Arc;

use serde_json::Value;

use crate::error::ProbeError;
use crate::types::{SensorReading, SensorSnapshot};

use super::command::CommandRunner;

pub struct SensorsProbe {
    runner: Arc<dyn CommandRunner>,
    bin: String,
}

impl std::fmt::Debug for SensorsProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorsProbe")
            .field("bin", &self.bin)
            .finish()
    }
}

impl SensorsProbe {
    pub fn new(runner: Arc<dyn CommandRunner>, bin: impl Into<String>) -> Self {
        Self {
            runner,
            bin: bin.into(),
        }
    }

    pub async fn collect(&self) -> Result<SensorSnapshot, ProbeError> {
        let args = ["-j".to_string()];
        let output = self
            .runner
            .run(&self.bin, &args)
            .await?
            .require_success(&self.bin)?;
        parse_sensors_json(&output.stdout)
    }
}

pub fn parse_sensors_json(raw: &str) -> Result<SensorSnapshot, ProbeError> {
    let root: Value = serde_json::from_str(raw)
        .map_err(|err| ProbeError::Parse(format!("sensors json: {err}")))?;
    let chips = root
        .as_object()
        .ok_or_else(|| ProbeError::Parse("sensors json is not an object".into()))?;

    let mut readings = Vec::new();
    for (chip, features) in chips {
        let Some(features) = features.as_object() else {
            continue;
        };
        for (label, subfeatures) in features {
            if label == "Adapter" {
                continue;
            }
            let Some(subfeatures) = subfeatures.as_object() else {
                continue;
            };
            for (name, value) in subfeatures {
                if name.starts_with("temp") && name.ends_with("_input") {
                    if let Some(temperature_c) = value.as_f64() {
                        readings.push(SensorReading {
                            chip: chip.clone(),
                            label: label.clone(),
                            temperature_c,
                        });
                    }
                }
            }
        }
    }

    readings.sort_by(|a, b| (&a.chip, &a.label).cmp(&(&b.chip, &b.label)));
    Ok(SensorSnapshot { readings })
}
