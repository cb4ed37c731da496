use std::{
  error::Error,
  fmt::{Debug, Display},
  process::{ExitCode, Termination},
};

use flexi_logger::FlexiLoggerError;
use nix::{errno::Errno, libc::STDOUT_FILENO, unistd::isatty};

/// The launch step that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStage {
  Prepare,
  Cgroup,
  Spawn,
  Exec,
  Cancelled,
}

pub enum PledgeBoxError {
  NotFound(String),
  Configuration(String),
  Invalid(String),
  Setup(SetupStage, String),
  State(String),
  Wait(String),
  Nix(Errno),
  Io(String),
  Logger(FlexiLoggerError),
}

pub enum PledgeBoxExit {
  Ok(i32),
  Err(PledgeBoxError),
}

impl PledgeBoxError {
  pub fn not_found<MS: Into<String>>(msg: MS) -> PledgeBoxError {
    PledgeBoxError::NotFound(msg.into())
  }

  pub fn configuration<MS: Into<String>>(msg: MS) -> PledgeBoxError {
    PledgeBoxError::Configuration(msg.into())
  }

  pub fn invalid<MS: Into<String>>(msg: MS) -> PledgeBoxError {
    PledgeBoxError::Invalid(msg.into())
  }

  pub fn setup<MS: Into<String>>(stage: SetupStage, msg: MS) -> PledgeBoxError {
    PledgeBoxError::Setup(stage, msg.into())
  }

  pub fn state<MS: Into<String>>(msg: MS) -> PledgeBoxError {
    PledgeBoxError::State(msg.into())
  }

  pub fn wait<MS: Into<String>>(msg: MS) -> PledgeBoxError {
    PledgeBoxError::Wait(msg.into())
  }

  /// The failing launch stage, for setup errors
  pub fn stage(&self) -> Option<SetupStage> {
    match self {
      PledgeBoxError::Setup(stage, _) => Some(*stage),
      _ => None,
    }
  }
}

impl Display for SetupStage {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      SetupStage::Prepare => "prepare",
      SetupStage::Cgroup => "cgroup",
      SetupStage::Spawn => "spawn",
      SetupStage::Exec => "exec",
      SetupStage::Cancelled => "cancelled",
    };
    f.write_str(name)
  }
}

impl Debug for PledgeBoxError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    std::fmt::Display::fmt(&self, f)
  }
}

impl Display for PledgeBoxError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match &self {
      PledgeBoxError::NotFound(msg) => f.write_fmt(format_args!("PledgeBox Not Found Error: {}", msg)),
      PledgeBoxError::Configuration(msg) => {
        f.write_fmt(format_args!("PledgeBox Configuration Error: {}", msg))
      }
      PledgeBoxError::Invalid(msg) => f.write_fmt(format_args!("PledgeBox Invalid Error: {}", msg)),
      PledgeBoxError::Setup(stage, msg) => {
        f.write_fmt(format_args!("PledgeBox Setup Error: ({}) {}", stage, msg))
      }
      PledgeBoxError::State(msg) => f.write_fmt(format_args!("PledgeBox State Error: {}", msg)),
      PledgeBoxError::Wait(msg) => f.write_fmt(format_args!("PledgeBox Wait Error: {}", msg)),
      PledgeBoxError::Nix(errno) => f.write_fmt(format_args!("PledgeBox Nix Error: {}", errno)),
      PledgeBoxError::Io(msg) => f.write_fmt(format_args!("PledgeBox File System Error: {}", msg)),
      PledgeBoxError::Logger(err) => f.write_fmt(format_args!("PledgeBox Logger Error: {}", err)),
    }
  }
}

impl From<Errno> for PledgeBoxError {
  fn from(errno: Errno) -> Self {
    PledgeBoxError::Nix(errno)
  }
}

impl From<std::io::Error> for PledgeBoxError {
  fn from(err: std::io::Error) -> Self {
    PledgeBoxError::Io(err.to_string())
  }
}

impl From<FlexiLoggerError> for PledgeBoxError {
  fn from(err: FlexiLoggerError) -> Self {
    PledgeBoxError::Logger(err)
  }
}

impl Error for PledgeBoxError {}

impl Termination for PledgeBoxExit {
  fn report(self) -> ExitCode {
    match self {
      PledgeBoxExit::Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
      PledgeBoxExit::Err(err) => {
        let text = format!("{}", err);
        let text = match text.split_once(": ") {
          Some((prefix, message)) => {
            let is_tty = isatty(STDOUT_FILENO).unwrap_or(false);
            if is_tty {
              format!("\x1b[1m\x1b[91m{}\x1b[39m\x1b[22m  {}", prefix, message)
            } else {
              format!(
                "{{\n  \"ok\": false,\n  \"type\": \"{}\",\n  \"message\": \"{}\"\n}}",
                prefix,
                message.replace('\\', "\\\\").replace('"', "\\\"")
              )
            }
          }
          None => text,
        };
        eprintln!("{}", text);
        ExitCode::FAILURE
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn setup_error_names_its_stage() {
    let err = PledgeBoxError::setup(SetupStage::Prepare, "launcher exited with 1");
    assert_eq!(err.stage(), Some(SetupStage::Prepare));
    assert_eq!(
      err.to_string(),
      "PledgeBox Setup Error: (prepare) launcher exited with 1"
    );
    assert_eq!(PledgeBoxError::invalid("x").stage(), None);
  }
}
