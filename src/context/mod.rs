use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use crate::resources::{Constraints, Importance, MemoryThresholds};

pub use builder::{EnvironmentBuilder, OptionsBuilder};

mod builder;

/// Write-only output stream of a task, closed at most once
pub struct Sink {
  state: Mutex<SinkState>,
}

enum SinkState {
  Open(OwnedFd),
  Null,
  Closed,
}

/// Per-launch isolation context
#[derive(Debug)]
pub struct Environment {
  user: String,
  out: Sink,
  err: Sink,
  env: BTreeMap<String, String>,
  dir: PathBuf,
  cgroup: PathBuf,
  net: Option<PathBuf>,
  memory: u64,
  memory_max: u64,
  bandwidth: u64,
}

/// The command to run and its sandbox restrictions
#[derive(Debug, Clone)]
pub struct Options {
  command: String,
  arguments: Vec<String>,
  promises: String,
  unveil: Vec<String>,
  importance: Importance,
}

impl Sink {
  /// A sink with nothing behind it; the child gets `/dev/null`
  pub fn null() -> Self {
    Sink {
      state: Mutex::new(SinkState::Null),
    }
  }

  /// Close the underlying descriptor. Returns whether this call closed it.
  pub fn close(&self) -> bool {
    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    match std::mem::replace(&mut *state, SinkState::Closed) {
      SinkState::Open(fd) => {
        drop(fd);
        true
      }
      SinkState::Null | SinkState::Closed => false,
    }
  }

  pub fn is_closed(&self) -> bool {
    let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    matches!(*state, SinkState::Closed)
  }

  pub(crate) fn raw_fd(&self) -> Option<RawFd> {
    let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    match &*state {
      SinkState::Open(fd) => Some(fd.as_raw_fd()),
      SinkState::Null | SinkState::Closed => None,
    }
  }
}

impl From<OwnedFd> for Sink {
  fn from(fd: OwnedFd) -> Self {
    Sink {
      state: Mutex::new(SinkState::Open(fd)),
    }
  }
}

impl From<File> for Sink {
  fn from(file: File) -> Self {
    Sink::from(OwnedFd::from(file))
  }
}

impl Debug for Sink {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    match &*state {
      SinkState::Open(fd) => write!(f, "Sink({})", fd.as_raw_fd()),
      SinkState::Null => f.write_str("Sink(null)"),
      SinkState::Closed => f.write_str("Sink(closed)"),
    }
  }
}

impl Environment {
  pub fn builder<US: Into<String>, CP: Into<PathBuf>>(user: US, cgroup: CP) -> EnvironmentBuilder {
    EnvironmentBuilder::new(user.into(), cgroup.into())
  }

  pub fn user(&self) -> &str {
    &self.user
  }

  pub fn out(&self) -> &Sink {
    &self.out
  }

  pub fn err(&self) -> &Sink {
    &self.err
  }

  pub fn env(&self) -> &BTreeMap<String, String> {
    &self.env
  }

  pub fn dir(&self) -> &PathBuf {
    &self.dir
  }

  pub fn cgroup(&self) -> &PathBuf {
    &self.cgroup
  }

  pub fn net(&self) -> Option<&PathBuf> {
    self.net.as_ref()
  }

  pub fn memory(&self) -> u64 {
    self.memory
  }

  pub fn memory_max(&self) -> u64 {
    self.memory_max
  }

  pub fn bandwidth(&self) -> u64 {
    self.bandwidth
  }

  /// Close both output sinks; repeated calls are no-ops
  pub fn close(&self) {
    self.out.close();
    self.err.close();
  }

  /// Cgroup constraints for a launch with the given options
  pub fn constraints(&self, options: Option<&Options>) -> Constraints {
    Constraints {
      bandwidth: self.bandwidth,
      memory: MemoryThresholds::new(self.memory, self.memory_max),
      nice: options.map(|o| o.importance().nice()),
    }
  }
}

impl Options {
  pub fn builder<CS: Into<String>>(command: CS) -> OptionsBuilder {
    OptionsBuilder::new(command.into())
  }

  pub fn command(&self) -> &str {
    &self.command
  }

  pub fn arguments(&self) -> &Vec<String> {
    &self.arguments
  }

  pub fn promises(&self) -> &str {
    &self.promises
  }

  pub fn unveil(&self) -> &Vec<String> {
    &self.unveil
  }

  pub fn importance(&self) -> &Importance {
    &self.importance
  }
}

#[cfg(test)]
mod tests {
  use std::io::{Read, Seek, SeekFrom};

  use super::*;

  #[test]
  fn sink_closes_once() {
    let file = tempfile::tempfile().unwrap();
    let sink = Sink::from(file);
    assert!(sink.raw_fd().is_some());
    assert!(!sink.is_closed());
    assert!(sink.close());
    assert!(sink.is_closed());
    assert!(!sink.close());
    assert_eq!(sink.raw_fd(), None);
  }

  #[test]
  fn null_sink_has_no_fd() {
    let sink = Sink::null();
    assert_eq!(sink.raw_fd(), None);
    assert!(!sink.close());
  }

  #[test]
  fn sink_keeps_writes_until_closed() {
    let mut file = tempfile::tempfile().unwrap();
    let sink = Sink::from(file.try_clone().unwrap());
    let fd = sink.raw_fd().unwrap();
    nix::unistd::write(fd, b"hello").unwrap();
    sink.close();
    file.seek(SeekFrom::Start(0)).unwrap();
    let mut text = String::new();
    file.read_to_string(&mut text).unwrap();
    assert_eq!(text, "hello");
  }

  #[test]
  fn constraints_from_environment() {
    let env = Environment::builder("nobody", "/sys/fs/cgroup/test.scope")
      .memory(100)
      .memory_max(200)
      .bandwidth(25_000)
      .build();
    let options = Options::builder("echo").importance("low").unwrap().build();
    let constraints = env.constraints(Some(&options));
    assert_eq!(constraints.bandwidth, 25_000);
    assert_eq!(constraints.memory, MemoryThresholds::new(100, 200));
    assert_eq!(constraints.nice, Some(10));
    assert_eq!(env.constraints(None).nice, None);
  }
}
