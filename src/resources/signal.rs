use std::str::FromStr;

use nix::sys::signal::Signal;

use crate::PledgeBoxError;

/// Normalize a free-form signal name (`term`, `SIGTERM`, `sigterm`, `15`).
/// Unknown names are rejected rather than mapped to some default.
pub fn parse_signal<S: AsRef<str>>(text: S) -> Result<Signal, PledgeBoxError> {
  let text = text.as_ref().trim();
  if let Ok(number) = text.parse::<i32>() {
    return Signal::try_from(number)
      .map_err(|_| PledgeBoxError::invalid(format!("signal {} not recognized", number)));
  }

  let upper = text.to_uppercase();
  let name = if upper.starts_with("SIG") {
    upper
  } else {
    format!("SIG{}", upper)
  };
  Signal::from_str(&name)
    .map_err(|_| PledgeBoxError::invalid(format!("signal {:?} not recognized", text)))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_names() {
    assert_eq!(parse_signal("sigterm").unwrap(), Signal::SIGTERM);
    assert_eq!(parse_signal("SIGINT").unwrap(), Signal::SIGINT);
    assert_eq!(parse_signal("hup").unwrap(), Signal::SIGHUP);
    assert_eq!(parse_signal(" SigUsr1 ").unwrap(), Signal::SIGUSR1);
    assert_eq!(parse_signal("9").unwrap(), Signal::SIGKILL);
  }

  #[test]
  fn unknown_names_fail_closed() {
    for text in ["", "sigfoo", "terminate", "999"] {
      assert!(parse_signal(text).is_err(), "{:?} should be rejected", text);
    }
  }
}
