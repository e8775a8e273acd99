//! UPS state via `apcaccess status`.
//!
//! apcupsd prints `KEY      : value` lines; units are stripped from the
//! numeric fields (`CHARGE   : 100.0 Percent`, `TIMELEFT : 44.1 Minutes`).

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ProbeError;
use crate::types::UpsStatus;

use super::command::CommandRunner;

pub struct UpsProbe {
    runner: Arc<dyn CommandRunner>,
    bin: String,
}

impl std::fmt::Debug for UpsProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpsProbe").field("bin", &self.bin).finish()
    }
}

impl UpsProbe {
    pub fn new(runner: Arc<dyn CommandRunner>, bin: impl Into<String>) -> Self {
        Self {
            runner,
            bin: bin.into(),
        }
    }

    pub async fn collect(&self) -> Result<UpsStatus, ProbeError> {
        let args = ["status".to_string()];
        let output = self
            .runner
            .run(&self.bin, &args)
            .await?
            .require_success(&self.bin)?;
        parse_apcaccess(&output.stdout)
    }
}

pub fn parse_apcaccess(raw: &str) -> Result<UpsStatus, ProbeError> {
    let fields: HashMap<&str, &str> = raw
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            Some((key.trim(), value.trim()))
        })
        .collect();

    let status = fields
        .get("STATUS")
        .ok_or_else(|| ProbeError::Parse("apcaccess output missing STATUS".into()))?
        .to_string();

    let numeric = |key: &str| -> Option<f64> {
        fields
            .get(key)?
            .split_whitespace()
            .next()?
            .parse::<f64>()
            .ok()
    };

    Ok(UpsStatus {
        status,
        charge_percent: numeric("BCHARGE"),
        load_percent: numeric("LOADPCT"),
        runtime_left_secs: numeric("TIMELEFT").map(|mins| (mins * 60.0) as u64),
        model: fields.get("MODEL").map(|m| m.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::super::command::test_support;
    use super::*;

    const APCACCESS_OUTPUT: &str = "\
APC      : 001,036,0879
DATE     : 2024-03-02 10:00:00 +0000
HOSTNAME : tower
MODEL    : Back-UPS RS 1500G
STATUS   : ONLINE
LINEV    : 230.0 Volts
LOADPCT  : 23.0 Percent
BCHARGE  : 100.0 Percent
TIMELEFT : 44.1 Minutes
";

    #[test]
    fn parses_status_fields_with_units() {
        let ups = parse_apcaccess(APCACCESS_OUTPUT).unwrap();
        assert_eq!(ups.status, "ONLINE");
        assert_eq!(ups.charge_percent, Some(100.0));
        assert_eq!(ups.load_percent, Some(23.0));
        assert_eq!(ups.runtime_left_secs, Some(2646));
        assert_eq!(ups.model.as_deref(), Some("Back-UPS RS 1500G"));
    }

    #[test]
    fn missing_status_is_parse_error() {
        let err = parse_apcaccess("MODEL : X\n").unwrap_err();
        assert!(matches!(err, ProbeError::Parse(_)));
    }

    #[tokio::test]
    async fn collect_invokes_apcaccess() {
        let runner = test_support::canned("apcaccess", APCACCESS_OUTPUT);
        let probe = UpsProbe::new(Arc::new(runner), "apcaccess");
        let ups = probe.collect().await.unwrap();
        assert_eq!(ups.status, "ONLINE");
    }
}
