use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;

use crate::resources::{Constraints, PERIOD_USEC};
use crate::{PledgeBoxError, SetupStage};

/// Access to the control files of one cgroup v2 directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupController {
  path: PathBuf,
}

/// Directory descriptor of a cgroup, handed to clone so the child starts
/// inside it.
#[derive(Debug)]
pub struct CgroupFd(OwnedFd);

impl CgroupFd {
  pub fn as_raw_fd(&self) -> RawFd {
    self.0.as_raw_fd()
  }
}

impl CgroupController {
  pub fn new<P: Into<PathBuf>>(path: P) -> Self {
    CgroupController { path: path.into() }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Whether the host mounts the unified cgroup v2 hierarchy
  pub fn is_unified() -> bool {
    cgroups_rs::hierarchies::is_cgroup2_unified_mode()
  }

  pub fn open(&self) -> Result<CgroupFd, PledgeBoxError> {
    let fd = open(
      &self.path,
      OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
      Mode::empty(),
    )
    .map_err(|errno| {
      PledgeBoxError::setup(
        SetupStage::Cgroup,
        format!("failed to open cgroup {}: {}", self.path.to_string_lossy(), errno),
      )
    })?;
    debug!("Open cgroup {} (fd = {})", self.path.to_string_lossy(), fd);
    Ok(CgroupFd(unsafe { OwnedFd::from_raw_fd(fd) }))
  }

  /// Read a control file with trailing whitespace trimmed
  pub fn read(&self, file: &str) -> io::Result<String> {
    let content = fs::read_to_string(self.path.join(file))?;
    Ok(content.trim_end().to_string())
  }

  /// Write a control file; the file must already exist
  pub fn write(&self, file: &str, content: &str) -> io::Result<()> {
    let mut handle = OpenOptions::new().write(true).open(self.path.join(file))?;
    handle.write_all(content.as_bytes())?;
    handle.flush()
  }

  /// Apply constraints in order, cpu quota, memory, then priority. Missing
  /// controllers only produce a warning.
  pub fn constrain(&self, constraints: &Constraints) {
    let mut writes = vec![];
    if constraints.bandwidth > 0 {
      writes.push(("cpu.max", format!("{} {}", constraints.bandwidth, PERIOD_USEC)));
    }
    if let Some(memory) = constraints.memory {
      if let Some(low) = memory.low {
        writes.push(("memory.low", low.to_string()));
      }
      writes.push(("memory.max", memory.max.to_string()));
    }
    if let Some(nice) = constraints.nice {
      writes.push(("cpu.weight.nice", nice.to_string()));
    }

    for (file, content) in writes {
      match self.write(file, &content) {
        Ok(_) => debug!("Set {} = {}", file, content),
        Err(err) => warn!(
          "Set {} = {} in {} fails: {}",
          file,
          content,
          self.path.to_string_lossy(),
          err
        ),
      }
    }
  }

  /// Number of live processes, `None` when the counter cannot be read
  pub fn pids_current(&self) -> Option<u64> {
    match self.read("pids.current") {
      Ok(text) if text.is_empty() => Some(0),
      Ok(text) => text.parse().ok(),
      Err(err) => {
        warn!("Read pids.current fails: {}", err);
        None
      }
    }
  }

  /// Kill every process in the cgroup
  pub fn kill(&self) -> io::Result<()> {
    info!("Kill all processes in cgroup {}", self.path.to_string_lossy());
    self.write("cgroup.kill", "1")
  }
}
