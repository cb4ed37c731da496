use std::collections::HashMap;

use log::debug;

use crate::cgroup::CgroupController;
use crate::resources::{HostSpecs, TrackCpu};

/// Point-in-time resource usage of a task cgroup
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Utilization {
  pub memory: u64,
  pub swap: u64,
  pub cache: u64,

  pub user: f64,
  pub system: f64,
  pub percent: f64,
  pub ticks: f64,
}

/// Parse `key value` lines of a cgroup accounting file, skipping anything else.
pub fn extract(content: &str) -> HashMap<String, u64> {
  content
    .lines()
    .filter_map(|line| {
      let mut fields = line.split_whitespace();
      match (fields.next(), fields.next(), fields.next()) {
        (Some(key), Some(value), None) => value.parse().ok().map(|value| (key.to_string(), value)),
        _ => None,
      }
    })
    .collect()
}

fn read_number(cgroup: &CgroupController, file: &str) -> u64 {
  match cgroup.read(file) {
    Ok(content) => content.parse().unwrap_or(0),
    Err(err) => {
      debug!("Read {} fails: {}", file, err);
      0
    }
  }
}

fn read_map(cgroup: &CgroupController, file: &str) -> HashMap<String, u64> {
  match cgroup.read(file) {
    Ok(content) => extract(&content),
    Err(err) => {
      debug!("Read {} fails: {}", file, err);
      HashMap::new()
    }
  }
}

/// Sample the cgroup accounting files. Unreadable files count as zero.
pub(crate) fn sample(
  cgroup: &CgroupController,
  tracker: &mut TrackCpu,
  specs: Option<HostSpecs>,
) -> Utilization {
  let memory = read_number(cgroup, "memory.current");
  let swap = read_number(cgroup, "memory.swap.current");
  let cache = read_map(cgroup, "memory.stat").get("file").copied().unwrap_or(0);

  // failed or partial reads never reach the tracker
  let cpu = read_map(cgroup, "cpu.stat");
  let (user, system, percent) = match (
    cpu.get("user_usec"),
    cpu.get("system_usec"),
    cpu.get("usage_usec"),
  ) {
    (Some(&user), Some(&system), Some(&total)) => tracker.percent(user, system, total),
    _ => {
      debug!("cpu.stat is unavailable, skip cpu sample");
      (0.0, 0.0, 0.0)
    }
  };

  let ticks = match specs {
    Some(specs) => 0.01 * percent * specs.per_core() as f64,
    None => 0.0,
  };

  Utilization {
    memory,
    swap,
    cache,
    user,
    system,
    percent,
    ticks,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn extract_cpu_stat() {
    let content = "usage_usec 20454080000\nuser_usec 16809820000\nsystem_usec 3644260000\n\
nr_periods 0\nnr_throttled 0\nthrottled_usec 0\n";
    let stats = extract(content);
    assert_eq!(stats["user_usec"], 16809820000);
    assert_eq!(stats["system_usec"], 3644260000);
    assert_eq!(stats["usage_usec"], 20454080000);
  }

  #[test]
  fn extract_memory_stat() {
    let content = "anon 1929216\nfile 12386787328\nkernel_stack 49152\nworkingset_refault_anon 0\n";
    assert_eq!(extract(content)["file"], 12386787328);
  }

  #[test]
  fn extract_skips_malformed_lines() {
    let stats = extract("ok 1\nthree fields here\nnan x\n\n");
    assert_eq!(stats.len(), 1);
    assert_eq!(stats["ok"], 1);
  }
}
