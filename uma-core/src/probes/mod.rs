//! Leaf probe readers.
//!
//! Each probe reads one system source (a procfs file or an external tool)
//! and returns a typed record or a [`ProbeError`]. Probes are stateless
//! except for the previous counter snapshots used for rate math. File probes
//! read under a configurable `proc_root`; tool probes go through the
//! [`CommandRunner`] trait so tests can feed canned stdout.

pub mod command;
pub mod docker;
pub mod gpu;
pub mod network;
pub mod scripts;
pub mod sensors;
pub mod smart;
pub mod spindown;
pub mod storage;
pub mod system;
pub mod ups;
pub mod vm;

pub use command::{CommandOutput, CommandRunner, ShellCommandRunner};

use std::path::{Path, PathBuf};

use crate::error::ProbeError;

/// Read a file under the probe's proc root, mapping a missing file to
/// [`ProbeError::Unavailable`].
pub(crate) async fn read_proc_file(
    proc_root: &Path,
    relative: &str,
) -> Result<String, ProbeError> {
    let path: PathBuf = proc_root.join(relative);
    tokio::fs::read_to_string(&path).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            ProbeError::Unavailable(format!("{} not present", path.display()))
        } else {
            ProbeError::Command(format!("reading {}: {err}", path.display()))
        }
    })
}
