//! Network interface throughput from `/proc/net/dev`.
//!
//! Rates are per-second deltas between successive counter snapshots; the
//! first cycle reports totals with zero rates. The loopback interface is
//! skipped.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use parking_lot::Mutex;

use crate::error::ProbeError;
use crate::types::{InterfaceRates, NetworkSnapshot};

use super::read_proc_file;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceCounters {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

pub struct NetworkProbe {
    proc_root: PathBuf,
    previous: Mutex<Option<(Instant, HashMap<String, InterfaceCounters>)>>,
}

impl std::fmt::Debug for NetworkProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkProbe")
            .field("proc_root", &self.proc_root)
            .finish()
    }
}

impl NetworkProbe {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            previous: Mutex::new(None),
        }
    }

    pub async fn collect(&self) -> Result<NetworkSnapshot, ProbeError> {
        let raw = read_proc_file(&self.proc_root, "net/dev").await?;
        let counters = parse_net_dev(&raw)?;
        let now = Instant::now();

        let mut previous = self.previous.lock();
        let interfaces = match previous.as_ref() {
            Some((then, last)) => {
                let elapsed = now.duration_since(*then).as_secs_f64().max(1e-3);
                counters
                    .iter()
                    .map(|(name, current)| {
                        let rate = |cur: u64, prev: Option<u64>| match prev {
                            Some(prev) => cur.saturating_sub(prev) as f64 / elapsed,
                            None => 0.0,
                        };
                        let last = last.get(name);
                        InterfaceRates {
                            name: name.clone(),
                            rx_bytes_total: current.rx_bytes,
                            tx_bytes_total: current.tx_bytes,
                            rx_bytes_per_sec: rate(
                                current.rx_bytes,
                                last.map(|l| l.rx_bytes),
                            ),
                            tx_bytes_per_sec: rate(
                                current.tx_bytes,
                                last.map(|l| l.tx_bytes),
                            ),
                            rx_packets_per_sec: rate(
                                current.rx_packets,
                                last.map(|l| l.rx_packets),
                            ),
                            tx_packets_per_sec: rate(
                                current.tx_packets,
                                last.map(|l| l.tx_packets),
                            ),
                        }
                    })
                    .collect()
            }
            None => counters
                .iter()
                .map(|(name, current)| InterfaceRates {
                    name: name.clone(),
                    rx_bytes_total: current.rx_bytes,
                    tx_bytes_total: current.tx_bytes,
                    ..Default::default()
                })
                .collect(),
        };
        *previous = Some((now, counters));

        let mut interfaces: Vec<InterfaceRates> = interfaces;
        interfaces.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(NetworkSnapshot { interfaces })
    }
}

/// Parse `/proc/net/dev`, skipping the two header lines and loopback.
pub fn parse_net_dev(
    raw: &str,
) -> Result<HashMap<String, InterfaceCounters>, ProbeError> {
    let mut counters = HashMap::new();

    for line in raw.lines().skip(2) {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name == "lo" {
            continue;
        }

        let fields: Vec<u64> = rest
            .split_whitespace()
            .map(|f| f.parse::<u64>())
            .collect::<Result<_, _>>()
            .map_err(|err| {
                ProbeError::Parse(format!("/proc/net/dev {name}: {err}"))
            })?;
        if fields.len() < 10 {
            return Err(ProbeError::Parse(format!(
                "/proc/net/dev {name}: {} fields, expected 16",
                fields.len()
            )));
        }

        counters.insert(
            name.to_string(),
            InterfaceCounters {
                rx_bytes: fields[0],
                rx_packets: fields[1],
                tx_bytes: fields[8],
                tx_packets: fields[9],
            },
        );
    }

    Ok(counters)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NET_DEV: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:    1000      10    0    0    0     0          0         0     1000      10    0    0    0     0       0          0
  eth0:  100000     500    0    0    0     0          0         0    50000     250    0    0    0     0       0          0
";

    fn write_fixture(dir: &tempfile::TempDir, contents: &str) {
        std::fs::create_dir_all(dir.path().join("net")).unwrap();
        std::fs::write(dir.path().join("net/dev"), contents).unwrap();
    }

    #[test]
    fn parses_interfaces_and_skips_loopback() {
        let counters = parse_net_dev(NET_DEV).unwrap();
        assert!(!counters.contains_key("lo"));
        let eth0 = &counters["eth0"];
        assert_eq!(eth0.rx_bytes, 100_000);
        assert_eq!(eth0.tx_bytes, 50_000);
        assert_eq!(eth0.rx_packets, 500);
        assert_eq!(eth0.tx_packets, 250);
    }

    #[tokio::test]
    async fn first_collect_has_totals_without_rates() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(&dir, NET_DEV);
        let probe = NetworkProbe::new(dir.path());

        let snapshot = probe.collect().await.unwrap();
        let eth0 = &snapshot.interfaces[0];
        assert_eq!(eth0.rx_bytes_total, 100_000);
        assert_eq!(eth0.rx_bytes_per_sec, 0.0);
    }

    #[tokio::test]
    async fn rates_derive_from_counter_deltas() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(&dir, NET_DEV);
        let probe = NetworkProbe::new(dir.path());
        probe.collect().await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        write_fixture(
            &dir,
            "\
Inter-| Receive | Transmit
 face |bytes packets errs drop fifo frame compressed multicast|bytes packets errs drop fifo colls carrier compressed
  eth0:  200000    1000    0    0    0     0          0         0   150000     750    0    0    0     0       0          0
",
        );

        let snapshot = probe.collect().await.unwrap();
        let eth0 = &snapshot.interfaces[0];
        assert_eq!(eth0.rx_bytes_total, 200_000);
        // 100 kB in ~0.1 s: on the order of 1 MB/s.
        assert!(eth0.rx_bytes_per_sec > 100_000.0);
        assert!(eth0.tx_bytes_per_sec > 100_000.0);
    }

    #[tokio::test]
    async fn missing_net_dev_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let probe = NetworkProbe::new(dir.path());
        let err = probe.collect().await.unwrap_err();
        assert!(matches!(err, ProbeError::Unavailable(_)));
    }
}
