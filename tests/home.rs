use std::fs;
use std::path::PathBuf;

use nix::unistd::{Gid, Uid};
use tempfile::tempdir;

use pledgebox::{ensure_home_in, Identity, PledgeBoxError};

mod common;

fn homeless(name: &str) -> Identity {
  Identity {
    name: name.to_string(),
    uid: Uid::current(),
    gid: Gid::current(),
    home: PathBuf::from("/nonexistent/pledgebox/home"),
  }
}

#[test]
fn fallback_home_is_reused() {
  common::setup();

  let root = tempdir().unwrap();
  let identity = homeless("svc");
  let first = ensure_home_in(root.path(), &identity).unwrap();
  assert_eq!(first, root.path().join("pledge-svc"));
  assert!(first.is_dir());

  let second = ensure_home_in(root.path(), &identity).unwrap();
  assert_eq!(first, second);
}

#[test]
fn fallback_occupied_by_file_fails() {
  common::setup();

  let root = tempdir().unwrap();
  fs::write(root.path().join("pledge-svc"), "").unwrap();
  let err = ensure_home_in(root.path(), &homeless("svc")).unwrap_err();
  assert!(matches!(err, PledgeBoxError::Configuration(_)));
}

#[test]
fn existing_home_is_kept() {
  common::setup();

  let root = tempdir().unwrap();
  let home = tempdir().unwrap();
  let identity = Identity {
    home: home.path().to_path_buf(),
    ..homeless("svc")
  };
  assert_eq!(ensure_home_in(root.path(), &identity).unwrap(), home.path());
  assert!(!root.path().join("pledge-svc").exists());
}

#[test]
fn home_that_is_a_file_fails() {
  common::setup();

  let root = tempdir().unwrap();
  let file = tempfile::NamedTempFile::new().unwrap();
  let identity = Identity {
    home: file.path().to_path_buf(),
    ..homeless("svc")
  };
  assert!(matches!(
    ensure_home_in(root.path(), &identity),
    Err(PledgeBoxError::Configuration(_))
  ));
}
