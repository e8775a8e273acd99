//! SMART health via `smartctl -j`.
//!
//! One invocation per configured device. `smartctl` sets exit-status bits for
//! failing drives, so a non-zero exit with parseable JSON is still a report.

use std::sync::Arc;

use serde_json::Value;

use crate::error::ProbeError;
use crate::types::SmartReport;

use super::command::CommandRunner;

pub struct SmartProbe {
    runner: Arc<dyn CommandRunner>,
    bin: String,
}

impl std::fmt::Debug for SmartProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartProbe").field("bin", &self.bin).finish()
    }
}

impl SmartProbe {
    pub fn new(runner: Arc<dyn CommandRunner>, bin: impl Into<String>) -> Self {
        Self {
            runner,
            bin: bin.into(),
        }
    }

    pub async fn collect(&self, device: &str) -> Result<SmartReport, ProbeError> {
        let args = [
            "-j".to_string(),
            "-H".to_string(),
            "-A".to_string(),
            "-i".to_string(),
            device.to_string(),
        ];
        let output = self.runner.run(&self.bin, &args).await?;
        if output.stdout.trim().is_empty() {
            return Err(ProbeError::Command(format!(
                "smartctl produced no output for {device}: {}",
                output.stderr.trim()
            )));
        }
        parse_smartctl(device, &output.stdout)
    }
}

pub fn parse_smartctl(device: &str, raw: &str) -> Result<SmartReport, ProbeError> {
    let root: Value = serde_json::from_str(raw)
        .map_err(|err| ProbeError::Parse(format!("smartctl json: {err}")))?;

    let healthy = root
        .pointer("/smart_status/passed")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let temperature_c = root
        .pointer("/temperature/current")
        .and_then(Value::as_i64);

    let power_on_hours = root
        .pointer("/power_on_time/hours")
        .and_then(Value::as_i64)
        .or_else(|| attribute_raw(&root, 9));

    let reallocated_sectors = attribute_raw(&root, 5);

    let model = root
        .pointer("/model_name")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(SmartReport {
        device: device.to_string(),
        healthy,
        temperature_c,
        power_on_hours,
        reallocated_sectors,
        model,
    })
}

/// Raw value of an ATA attribute by id, if the table is present.
fn attribute_raw(root: &Value, id: u64) -> Option<i64> {
    root.pointer("/ata_smart_attributes/table")?
        .as_array()?
        .iter()
        .find(|attr| attr.get("id").and_then(Value::as_u64) == Some(id))?
        .pointer("/raw/value")
        .and_then(Value::as_i64)
}

#[cfg(test)]
mod tests {
    use super::super::command::test_support;
    use super::*;

    const SMARTCTL_JSON: &str = r#"{
  "model_name": "WDC WD80EFAX",
  "smart_status": { "passed": true },
  "temperature": { "current": 34 },
  "power_on_time": { "hours": 21341 },
  "ata_smart_attributes": {
    "table": [
      { "id": 5, "name": "Reallocated_Sector_Ct", "raw": { "value": 0 } },
      { "id": 9, "name": "Power_On_Hours", "raw": { "value": 21341 } }
    ]
  }
}"#;

    #[test]
    fn parses_healthy_report() {
        let report = parse_smartctl("/dev/sda", SMARTCTL_JSON).unwrap();
        assert!(report.healthy);
        assert_eq!(report.temperature_c, Some(34));
        assert_eq!(report.power_on_hours, Some(21_341));
        assert_eq!(report.reallocated_sectors, Some(0));
        assert_eq!(report.model.as_deref(), Some("WDC WD80EFAX"));
    }

    #[test]
    fn failed_status_reads_unhealthy() {
        let raw = r#"{ "smart_status": { "passed": false } }"#;
        let report = parse_smartctl("/dev/sdb", raw).unwrap();
        assert!(!report.healthy);
        assert!(report.temperature_c.is_none());
    }

    #[test]
    fn non_json_output_is_parse_error() {
        let err = parse_smartctl("/dev/sda", "Smartctl open failed").unwrap_err();
        assert!(matches!(err, ProbeError::Parse(_)));
    }

    #[tokio::test]
    async fn collect_queries_device() {
        let runner = test_support::canned("smartctl", SMARTCTL_JSON);
        let probe = SmartProbe::new(Arc::new(runner), "smartctl");
        let report = probe.collect("/dev/sda").await.unwrap();
        assert_eq!(report.device, "/dev/sda");
    }
}
