use std::os::unix::prelude::RawFd;

use nix::{
  fcntl::OFlag,
  unistd::{self, close, pipe2},
};

use crate::error::PledgeBoxError;

/// Close-on-exec pipe carrying an exec failure from the cloned child back to
/// the supervisor. A successful exec closes the write end, so the parent reads
/// end-of-file.
pub struct ExecPipe(RawFd, RawFd);

pub struct ExecReadPipe(RawFd);

pub struct ExecWritePipe(RawFd);

impl ExecPipe {
  pub fn new() -> Result<Self, PledgeBoxError> {
    let result = pipe2(OFlag::O_CLOEXEC)?;
    Ok(ExecPipe(result.0, result.1))
  }

  pub fn read(self) -> Result<ExecReadPipe, PledgeBoxError> {
    let (read, write) = (self.0, self.1);
    std::mem::forget(self);
    close(write)?;
    Ok(ExecReadPipe(read))
  }

  /// Only called in the child between clone and exec, so nothing here may
  /// allocate.
  pub fn write(self) -> ExecWritePipe {
    let (read, write) = (self.0, self.1);
    std::mem::forget(self);
    let _ = close(read);
    ExecWritePipe(write)
  }
}

impl Drop for ExecPipe {
  fn drop(&mut self) {
    let _ = close(self.0);
    let _ = close(self.1);
  }
}

impl ExecReadPipe {
  /// Blocks until the child either execs (empty message) or reports why it
  /// could not.
  pub fn read(&self) -> Result<Option<String>, PledgeBoxError> {
    let mut message = vec![];
    let mut buf = [0u8; 256];
    loop {
      match unistd::read(self.0, &mut buf) {
        Ok(0) => break,
        Ok(size) => message.extend_from_slice(&buf[..size]),
        Err(nix::errno::Errno::EINTR) => continue,
        Err(errno) => return Err(errno.into()),
      }
    }
    if message.is_empty() {
      Ok(None)
    } else {
      // 忽略 UTF-8 parse 错误
      Ok(Some(String::from_utf8_lossy(&message).into_owned()))
    }
  }
}

impl Drop for ExecReadPipe {
  fn drop(&mut self) {
    let _ = close(self.0);
  }
}

impl ExecWritePipe {
  pub fn write(&self, bytes: &[u8]) {
    let _ = unistd::write(self.0, bytes);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn message_reads_as_exec_failure() {
    let pipe = ExecPipe::new().unwrap();
    let (read, write) = (pipe.0, pipe.1);
    std::mem::forget(pipe);
    let reader = ExecReadPipe(read);
    let writer = ExecWritePipe(write);
    writer.write(b"Exec fails: ENOENT");
    close(writer.0).unwrap();
    assert_eq!(reader.read().unwrap().as_deref(), Some("Exec fails: ENOENT"));
  }

  #[test]
  fn closed_pipe_reads_none() {
    let pipe = ExecPipe::new().unwrap();
    let reader = pipe.read().unwrap();
    assert_eq!(reader.read().unwrap(), None);
  }
}
