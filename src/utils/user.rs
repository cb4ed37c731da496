use std::env;
use std::fs::{self, DirBuilder};
use std::io::ErrorKind;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use log::{debug, info};
use nix::unistd::{chown, Gid, Uid, User};

use crate::PledgeBoxError;

/// Resolved identity of the user a task runs as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
  pub name: String,
  pub uid: Uid,
  pub gid: Gid,
  pub home: PathBuf,
}

/// Look up uid, gid and home directory of the named user.
pub fn lookup(name: &str) -> Result<Identity, PledgeBoxError> {
  let user = User::from_name(name)
    .map_err(|errno| PledgeBoxError::not_found(format!("failed to find user {:?}: {}", name, errno)))?
    .ok_or_else(|| PledgeBoxError::not_found(format!("failed to find user {:?}", name)))?;

  debug!(
    "Resolve user {} (uid = {}, gid = {}, home = {})",
    name,
    user.uid,
    user.gid,
    user.dir.to_string_lossy()
  );

  Ok(Identity {
    name: user.name,
    uid: user.uid,
    gid: user.gid,
    home: user.dir,
  })
}

/// Return a usable home directory for `identity`, falling back to a
/// per-user directory under the host temp root when the real one is absent.
pub fn ensure_home(identity: &Identity) -> Result<PathBuf, PledgeBoxError> {
  ensure_home_in(&env::temp_dir(), identity)
}

/// Same as [`ensure_home`], with the fallback placed under `root`.
pub fn ensure_home_in(root: &Path, identity: &Identity) -> Result<PathBuf, PledgeBoxError> {
  match fs::metadata(&identity.home) {
    Ok(meta) if meta.is_dir() => return Ok(identity.home.clone()),
    Ok(_) => {
      return Err(PledgeBoxError::configuration(format!(
        "home directory path {} is not a directory",
        identity.home.to_string_lossy()
      )))
    }
    Err(err) if err.kind() == ErrorKind::NotFound => {}
    Err(err) => return Err(err.into()),
  }

  // e.g. service users will have a non-existent home directory
  let fallback = root.join(format!("pledge-{}", identity.name));
  match fs::metadata(&fallback) {
    Ok(meta) if meta.is_dir() => Ok(fallback),
    Ok(_) => Err(PledgeBoxError::configuration(format!(
      "fallback home {} exists but is not a directory",
      fallback.to_string_lossy()
    ))),
    Err(err) if err.kind() == ErrorKind::NotFound => {
      match DirBuilder::new().mode(0o755).create(&fallback) {
        Ok(_) => {}
        // lost a race against a concurrent launch for the same user
        Err(err) if err.kind() == ErrorKind::AlreadyExists && fallback.is_dir() => return Ok(fallback),
        Err(err) => return Err(err.into()),
      }
      chown(&fallback, Some(identity.uid), Some(identity.gid))?;
      info!(
        "Create home {} for user {}",
        fallback.to_string_lossy(),
        identity.name
      );
      Ok(fallback)
    }
    Err(err) => Err(err.into()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unknown_user_is_not_found() {
    let err = lookup("pledgebox-no-such-user-1f3a").unwrap_err();
    assert!(matches!(err, PledgeBoxError::NotFound(_)));
  }

  #[test]
  fn root_resolves() {
    let root = lookup("root").unwrap();
    assert_eq!(root.uid, Uid::from_raw(0));
    assert_eq!(root.gid, Gid::from_raw(0));
  }
}
