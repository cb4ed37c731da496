use std::env;
use std::ffi::CString;

use flexi_logger::DeferredNow;
use log::{error, info, Record};

pub use pipe::{ExecPipe, ExecReadPipe, ExecWritePipe};
pub use user::{ensure_home, ensure_home_in, lookup, Identity};

use crate::PledgeBoxError;

pub mod pipe;
pub mod user;

/// A logline-formatter that produces log lines like <br>
/// ```[datetime: INFO] Task successfully read from conf.json```
pub fn default_format(
  w: &mut dyn std::io::Write,
  now: &mut DeferredNow,
  record: &Record,
) -> Result<(), std::io::Error> {
  write!(
    w,
    "[{}: {:5}] {}",
    now.format("%Y-%m-%d %H:%M:%S"),
    record.level(),
    record.args()
  )
}

pub(crate) fn into_c_string<S: AsRef<str>>(string: S) -> Result<CString, PledgeBoxError> {
  let string = string.as_ref();
  CString::new(string)
    .map_err(|_| PledgeBoxError::invalid(format!("argument contains a NUL byte: {:?}", string)))
}

/// Parse `KEY=VALUE`, or a bare `KEY` that copies the host value
pub fn parse_env<S: AsRef<str>>(text: S) -> Result<(String, String), PledgeBoxError> {
  let text = text.as_ref();
  match text.split_once('=') {
    Some((key, _)) if key.is_empty() => {
      error!("Wrong environment variable string ({}) format", text);
      Err(PledgeBoxError::invalid("Wrong environment variable string format"))
    }
    Some((key, value)) => Ok((key.to_string(), value.to_string())),
    None if text.is_empty() => Err(PledgeBoxError::invalid("Empty environment variable string")),
    None => {
      let value = env::var(text).unwrap_or_default();
      info!("Read environment variable {} = {}", text, value);
      Ok((text.to_string(), value))
    }
  }
}
