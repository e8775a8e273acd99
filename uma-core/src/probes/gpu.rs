//! GPU utilization via `nvidia-smi` CSV queries.

use std::sync::Arc;

use crate::error::ProbeError;
use crate::types::{GpuInfo, GpuSnapshot};

use super::command::CommandRunner;

const QUERY_FIELDS: &str =
    "index,name,utilization.gpu,memory.used,memory.total,temperature.gpu";

pub struct GpuProbe {
    runner: Arc<dyn CommandRunner>,
    bin: String,
}

impl std::fmt::Debug for GpuProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuProbe").field("bin", &self.bin).finish()
    }
}

impl GpuProbe {
    pub fn new(runner: Arc<dyn CommandRunner>, bin: impl Into<String>) -> Self {
        Self {
            runner,
            bin: bin.into(),
        }
    }

    pub async fn collect(&self) -> Result<GpuSnapshot, ProbeError> {
        let args = [
            format!("--query-gpu={QUERY_FIELDS}"),
            "--format=csv,noheader,nounits".to_string(),
        ];
        let output = self
            .runner
            .run(&self.bin, &args)
            .await?
            .require_success(&self.bin)?;
        parse_nvidia_smi_csv(&output.stdout)
    }
}

pub fn parse_nvidia_smi_csv(raw: &str) -> Result<GpuSnapshot, ProbeError> {
    let mut gpus = Vec::new();

    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 6 {
            return Err(ProbeError::Parse(format!(
                "nvidia-smi row `{line}`: {} fields, expected 6",
                fields.len()
            )));
        }

        let parse_f64 = |s: &str, what: &str| -> Result<f64, ProbeError> {
            s.parse().map_err(|err| {
                ProbeError::Parse(format!("nvidia-smi {what} `{s}`: {err}"))
            })
        };

        gpus.push(GpuInfo {
            index: parse_f64(fields[0], "index")? as u32,
            name: fields[1].to_string(),
            utilization_percent: parse_f64(fields[2], "utilization")?,
            memory_used_mb: parse_f64(fields[3], "memory.used")? as u64,
            memory_total_mb: parse_f64(fields[4], "memory.total")? as u64,
            temperature_c: parse_f64(fields[5], "temperature")?,
        });
    }

    Ok(GpuSnapshot { gpus })
}

#[cfg(test)]
mod tests {
    use super::super::command::test_support;
    use super::*;

    const SMI_OUTPUT: &str = "\
0, NVIDIA GeForce GTX 1660, 12, 1024, 6144, 46
1, NVIDIA T400, 0, 128, 2048, 38
";

    #[test]
    fn parses_csv_rows() {
        let snapshot = parse_nvidia_smi_csv(SMI_OUTPUT).unwrap();
        assert_eq!(snapshot.gpus.len(), 2);
        let first = &snapshot.gpus[0];
        assert_eq!(first.index, 0);
        assert_eq!(first.name, "NVIDIA GeForce GTX 1660");
        assert!((first.utilization_percent - 12.0).abs() < f64::EPSILON);
        assert_eq!(first.memory_total_mb, 6144);
    }

    #[test]
    fn short_row_is_parse_error() {
        let err = parse_nvidia_smi_csv("0, broken\n").unwrap_err();
        assert!(matches!(err, ProbeError::Parse(_)));
    }

    #[tokio::test]
    async fn collect_queries_gpus() {
        let runner = test_support::canned("nvidia-smi", SMI_OUTPUT);
        let probe = GpuProbe::new(Arc::new(runner), "nvidia-smi");
        let snapshot = probe.collect().await.unwrap();
        assert_eq!(snapshot.gpus.len(), 2);
    }
}
