use log::error;

use crate::PledgeBoxError;

const VOCABULARY: [&str; 21] = [
  "stdio", "rpath", "wpath", "cpath", "dpath", "chown", "flock", "tty", "recvfd", "sendfd",
  "fattr", "inet", "unix", "dns", "proc", "thread", "id", "exec", "prot_exec", "tmppath", "vminfo",
];

/// Validate a space separated promise list and return it normalized to
/// single spaces. An empty list means no restrictions are requested.
pub fn check<S: AsRef<str>>(promises: S) -> Result<String, PledgeBoxError> {
  let mut result = vec![];
  for token in promises.as_ref().split_whitespace() {
    if !VOCABULARY.contains(&token) {
      error!("Unknown promise {}", token);
      return Err(PledgeBoxError::invalid(format!("Unknown promise \"{}\"", token)));
    }
    result.push(token);
  }
  Ok(result.join(" "))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn known_promises_pass() {
    assert_eq!(check("stdio  rpath\twpath").unwrap(), "stdio rpath wpath");
    assert_eq!(check("").unwrap(), "");
  }

  #[test]
  fn unknown_promise_fails() {
    assert!(matches!(check("stdio bogus"), Err(PledgeBoxError::Invalid(_))));
  }
}
