#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::Once;

use flexi_logger::Logger;
use tempfile::{tempdir, TempDir};

static INIT: Once = Once::new();

pub fn setup() {
  INIT.call_once(|| {
    Logger::try_with_str("pledgebox=debug,info")
      .unwrap()
      .start()
      .unwrap();
  });
}

/// A scratch directory standing in for a cgroup, with the given control files
pub fn fake_cgroup(files: &[(&str, &str)]) -> TempDir {
  let dir = tempdir().unwrap();
  for (file, content) in files {
    fs::write(dir.path().join(file), content).unwrap();
  }
  dir
}

pub fn read(dir: &Path, file: &str) -> String {
  fs::read_to_string(dir.join(file)).unwrap()
}
