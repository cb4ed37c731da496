//! Assemble the isolation command line and the environment of the child.
//!
//! Layout, in order:
//!
//! ```text
//! [nsenter --net=<netns> --no-fork --]
//! unshare --ipc --pid --mount-proc --fork --kill-child=SIGKILL --setuid=<uid> --setgid=<gid> --
//! <sandbox> [-p <promises>] [-v <path>]... -- <command> [args]...
//! ```

use std::collections::BTreeMap;
use std::env;
use std::ffi::CString;
use std::path::Path;
use std::process::{Command, Stdio};

use log::{debug, info};

use crate::context::{Environment, Options};
use crate::utils::{into_c_string, Identity};
use crate::{PledgeBoxError, SetupStage};

/// Variables that either mean nothing inside the sandbox or leak host state
const BLOCKED_ENV: [&str; 6] = [
  "LS_COLORS",
  "XAUTHORITY",
  "DISPLAY",
  "COLORTERM",
  "MAIL",
  "TMPDIR",
];

/// Full argument vector, `argv[0]` first
pub fn parameters(bin: &Path, env: &Environment, options: &Options, identity: &Identity) -> Vec<String> {
  let mut result = vec![];

  if let Some(net) = env.net() {
    result.extend([
      "nsenter".to_string(),
      format!("--net={}", net.to_string_lossy()),
      "--no-fork".to_string(),
      "--".to_string(),
    ]);
  }

  result.extend([
    "unshare".to_string(),
    "--ipc".to_string(),
    "--pid".to_string(),
    "--mount-proc".to_string(),
    "--fork".to_string(),
    "--kill-child=SIGKILL".to_string(),
    format!("--setuid={}", identity.uid),
    format!("--setgid={}", identity.gid),
    "--".to_string(),
  ]);

  result.push(bin.to_string_lossy().into_owned());
  if !options.promises().is_empty() {
    result.push("-p".to_string());
    result.push(options.promises().to_string());
  }
  for path in options.unveil() {
    result.push("-v".to_string());
    result.push(path.clone());
  }

  result.push("--".to_string());
  result.push(options.command().to_string());
  result.extend(options.arguments().iter().cloned());
  result
}

/// Child environment: caller variables with `USER`/`HOME` forced to the
/// resolved identity, block-listed keys dropped, and `TMPDIR` set once.
pub fn flatten(user: &str, home: &Path, vars: &BTreeMap<String, String>) -> Vec<String> {
  let mut result = Vec::with_capacity(vars.len() + 3);
  for (key, value) in vars {
    if key == "USER" || key == "HOME" || BLOCKED_ENV.contains(&key.as_str()) {
      continue;
    }
    result.push(format!("{}={}", key, value));
  }
  result.push(format!("USER={}", user));
  result.push(format!("HOME={}", home.to_string_lossy()));
  result.push(format!("TMPDIR={}", env::temp_dir().to_string_lossy()));
  result
}

pub(crate) fn to_c_strings(list: &[String]) -> Result<Vec<CString>, PledgeBoxError> {
  list.iter().map(into_c_string).collect()
}

/// Run the launcher once with `-h`, outside of any cgroup, so it materializes
/// its cached artifacts before the constrained launch.
pub fn prepare(bin: &Path) -> Result<(), PledgeBoxError> {
  debug!("Prepare sandbox launcher {}", bin.to_string_lossy());
  let status = Command::new(bin)
    .arg("-h")
    .env_clear()
    .env("PATH", env::var("PATH").unwrap_or_default())
    .env("TMPDIR", env::temp_dir())
    .stdin(Stdio::null())
    .stdout(Stdio::null())
    .stderr(Stdio::null())
    .status()
    .map_err(|err| {
      PledgeBoxError::setup(
        SetupStage::Prepare,
        format!("failed to run {}: {}", bin.to_string_lossy(), err),
      )
    })?;

  if status.success() {
    info!("Prepare sandbox launcher {} ok", bin.to_string_lossy());
    Ok(())
  } else {
    Err(PledgeBoxError::setup(
      SetupStage::Prepare,
      format!("{} -h exited with {}", bin.to_string_lossy(), status),
    ))
  }
}

#[cfg(test)]
mod tests {
  use std::path::PathBuf;

  use nix::unistd::{Gid, Uid};

  use super::*;

  fn identity() -> Identity {
    Identity {
      name: "alice".to_string(),
      uid: Uid::from_raw(1001),
      gid: Gid::from_raw(1002),
      home: PathBuf::from("/home/alice"),
    }
  }

  fn options() -> Options {
    Options::builder("/bin/echo")
      .args(["hello", "it's me"])
      .promises("stdio rpath")
      .unveil("r:/etc")
      .unveil("rw:/tmp")
      .build()
  }

  #[test]
  fn parameters_without_network() {
    let env = Environment::builder("alice", "/sys/fs/cgroup/a.scope").build();
    let argv = parameters(Path::new("/opt/bin/pledge"), &env, &options(), &identity());
    assert_eq!(
      argv,
      vec![
        "unshare",
        "--ipc",
        "--pid",
        "--mount-proc",
        "--fork",
        "--kill-child=SIGKILL",
        "--setuid=1001",
        "--setgid=1002",
        "--",
        "/opt/bin/pledge",
        "-p",
        "stdio rpath",
        "-v",
        "r:/etc",
        "-v",
        "rw:/tmp",
        "--",
        "/bin/echo",
        "hello",
        "it's me",
      ]
    );
  }

  #[test]
  fn parameters_with_network_namespace() {
    let env = Environment::builder("alice", "/sys/fs/cgroup/a.scope")
      .net("/var/run/netns/abc")
      .build();
    let argv = parameters(Path::new("/opt/bin/pledge"), &env, &options(), &identity());
    assert_eq!(&argv[..5], &["nsenter", "--net=/var/run/netns/abc", "--no-fork", "--", "unshare"]);
  }

  #[test]
  fn parameters_skip_empty_promises() {
    let env = Environment::builder("alice", "/sys/fs/cgroup/a.scope").build();
    let options = Options::builder("true").build();
    let argv = parameters(Path::new("/opt/bin/pledge"), &env, &options, &identity());
    assert_eq!(&argv[argv.len() - 3..], &["/opt/bin/pledge", "--", "true"]);
  }

  #[test]
  fn flatten_overrides_identity_and_drops_blocked() {
    let mut vars = BTreeMap::new();
    vars.insert("USER".to_string(), "root".to_string());
    vars.insert("HOME".to_string(), "/root".to_string());
    vars.insert("DISPLAY".to_string(), ":0".to_string());
    vars.insert("TMPDIR".to_string(), "/var/tmp/host".to_string());
    vars.insert("XAUTHORITY".to_string(), "/root/.Xauthority".to_string());
    vars.insert("PATH".to_string(), "/usr/bin".to_string());
    vars.insert("EMPTY".to_string(), "".to_string());

    let result = flatten("alice", Path::new("/home/alice"), &vars);
    assert!(result.contains(&"USER=alice".to_string()));
    assert!(result.contains(&"HOME=/home/alice".to_string()));
    assert!(result.contains(&"PATH=/usr/bin".to_string()));
    assert!(result.contains(&"EMPTY=".to_string()));
    assert!(!result.iter().any(|v| v == "USER=root" || v == "HOME=/root"));
    assert!(!result.iter().any(|v| v.starts_with("DISPLAY=") || v.starts_with("XAUTHORITY=")));
    assert!(!result.iter().any(|v| v == "TMPDIR=/var/tmp/host"));
    assert_eq!(result.iter().filter(|v| v.starts_with("TMPDIR=")).count(), 1);
  }

  #[test]
  fn flatten_sets_identity_when_absent() {
    let result = flatten("bob", Path::new("/tmp/pledge-bob"), &BTreeMap::new());
    assert_eq!(result.len(), 3);
    assert_eq!(result[0], "USER=bob");
    assert_eq!(result[1], "HOME=/tmp/pledge-bob");
    assert!(result[2].starts_with("TMPDIR="));
  }

  #[test]
  fn prepare_missing_launcher_fails_in_prepare_stage() {
    let err = prepare(Path::new("/nonexistent/pledge.com")).unwrap_err();
    assert_eq!(err.stage(), Some(SetupStage::Prepare));
  }
}
