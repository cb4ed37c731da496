use std::fs;
use std::time::Instant;

use lazy_static::lazy_static;
use log::warn;

use crate::PledgeBoxError;

/// Fixed cgroup v2 bandwidth period, in microseconds
pub const PERIOD_USEC: u64 = 100_000;

/// Smallest quota the kernel accepts for `cpu.max`
const MIN_QUOTA_USEC: u64 = 1_000;

lazy_static! {
  static ref HOST_SPECS: Option<HostSpecs> = match HostSpecs::probe() {
    Ok(specs) => Some(specs),
    Err(err) => {
      warn!("Probe host cpu specs fails: {}", err);
      None
    }
  };
}

/// Rated clock speed and core count of the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostSpecs {
  pub mhz: u64,
  pub cores: u64,
}

impl HostSpecs {
  pub fn probe() -> Result<Self, PledgeBoxError> {
    let content = fs::read_to_string("/proc/cpuinfo")?;
    Ok(Self::parse(&content))
  }

  /// Cached result of the first probe
  pub fn host() -> Option<HostSpecs> {
    *HOST_SPECS
  }

  /// Highest `cpu MHz` entry and number of `processor` entries
  pub fn parse(cpuinfo: &str) -> Self {
    let mut mhz = 0;
    let mut cores = 0;
    for line in cpuinfo.lines() {
      let Some((key, value)) = line.split_once(':') else {
        continue;
      };
      match key.trim() {
        "processor" => cores += 1,
        "cpu MHz" => {
          let whole = value.trim().split('.').next().unwrap_or("");
          if let Ok(speed) = whole.parse::<u64>() {
            mhz = mhz.max(speed);
          }
        }
        _ => {}
      }
    }
    HostSpecs { mhz, cores }
  }

  /// Total clock-speed-weighted capacity
  pub fn ticks(&self) -> u64 {
    self.mhz * self.cores
  }

  pub fn per_core(&self) -> u64 {
    if self.cores == 0 {
      0
    } else {
      self.ticks() / self.cores
    }
  }
}

/// Convert a CPU share request (in MHz) into a `cpu.max` quota per
/// [`PERIOD_USEC`].
pub fn bandwidth(shares: u64, specs: &HostSpecs) -> Result<u64, PledgeBoxError> {
  let mhz = specs.per_core();
  if mhz == 0 {
    return Err(PledgeBoxError::invalid(
      "cannot compute cpu bandwidth without host clock speed",
    ));
  }
  let quota = shares.saturating_mul(PERIOD_USEC) / mhz;
  Ok(quota.max(MIN_QUOTA_USEC))
}

#[derive(Debug, Clone, Copy)]
struct Sample {
  at: Instant,
  user: u64,
  system: u64,
  total: u64,
}

/// Derive CPU percentages from consecutive cumulative `cpu.stat` counters.
#[derive(Debug, Default)]
pub struct TrackCpu {
  prev: Option<Sample>,
}

impl TrackCpu {
  pub fn new() -> Self {
    TrackCpu { prev: None }
  }

  /// Returns (user, system, total) percentages since the previous call.
  pub fn percent(&mut self, user_usec: u64, system_usec: u64, total_usec: u64) -> (f64, f64, f64) {
    self.percent_at(Instant::now(), user_usec, system_usec, total_usec)
  }

  pub(crate) fn percent_at(
    &mut self,
    now: Instant,
    user_usec: u64,
    system_usec: u64,
    total_usec: u64,
  ) -> (f64, f64, f64) {
    let current = Sample {
      at: now,
      user: user_usec,
      system: system_usec,
      total: total_usec,
    };
    let Some(prev) = self.prev.replace(current) else {
      return (0.0, 0.0, 0.0);
    };
    if prev.user == 0 && prev.system == 0 && prev.total == 0 {
      return (0.0, 0.0, 0.0);
    }
    let elapsed = now.saturating_duration_since(prev.at).as_micros() as u64;
    (
      percent(prev.user, user_usec, elapsed),
      percent(prev.system, system_usec, elapsed),
      percent(prev.total, total_usec, elapsed),
    )
  }
}

fn percent(before: u64, after: u64, elapsed: u64) -> f64 {
  if elapsed == 0 || after <= before {
    return 0.0;
  }
  let value = (after - before) as f64 / elapsed as f64 * 100.0;
  value.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;

  const CPUINFO: &str = "processor\t: 0\nvendor_id\t: GenuineIntel\ncpu MHz\t\t: 2400.000\n\n\
processor\t: 1\nvendor_id\t: GenuineIntel\ncpu MHz\t\t: 3100.512\n";

  #[test]
  fn parse_cpuinfo() {
    let specs = HostSpecs::parse(CPUINFO);
    assert_eq!(specs, HostSpecs { mhz: 3100, cores: 2 });
    assert_eq!(specs.ticks(), 6200);
    assert_eq!(specs.per_core(), 3100);
  }

  #[test]
  fn bandwidth_scales_with_clock() {
    let specs = HostSpecs { mhz: 2000, cores: 4 };
    assert_eq!(bandwidth(2000, &specs).unwrap(), 100_000);
    assert_eq!(bandwidth(500, &specs).unwrap(), 25_000);
    assert_eq!(bandwidth(1, &specs).unwrap(), MIN_QUOTA_USEC);
    assert!(bandwidth(1000, &HostSpecs { mhz: 0, cores: 4 }).is_err());
  }

  #[test]
  fn first_sample_is_zero() {
    let mut tracker = TrackCpu::new();
    assert_eq!(tracker.percent(500, 500, 1000), (0.0, 0.0, 0.0));
  }

  #[test]
  fn second_sample_is_proportional() {
    let mut tracker = TrackCpu::new();
    let start = Instant::now();
    tracker.percent_at(start, 1_000, 1_000, 2_000);
    let (user, system, total) =
      tracker.percent_at(start + Duration::from_secs(1), 251_000, 101_000, 352_000);
    assert!((user - 25.0).abs() < 1e-9);
    assert!((system - 10.0).abs() < 1e-9);
    assert!((total - 35.0).abs() < 1e-9);
  }

  #[test]
  fn zero_baseline_counts_as_first_sample() {
    let mut tracker = TrackCpu::new();
    let start = Instant::now();
    tracker.percent_at(start, 0, 0, 0);
    let result = tracker.percent_at(start + Duration::from_secs(1), 900_000, 0, 900_000);
    assert_eq!(result, (0.0, 0.0, 0.0));
    let (_, _, total) =
      tracker.percent_at(start + Duration::from_secs(2), 1_400_000, 0, 1_400_000);
    assert!((total - 50.0).abs() < 1e-9);
  }

  #[test]
  fn non_increasing_counters_are_zero() {
    let mut tracker = TrackCpu::new();
    let start = Instant::now();
    tracker.percent_at(start, 5_000, 5_000, 10_000);
    let result = tracker.percent_at(start + Duration::from_millis(500), 4_000, 5_000, 9_000);
    assert_eq!(result, (0.0, 0.0, 0.0));
  }

  #[test]
  fn same_instant_is_zero() {
    let mut tracker = TrackCpu::new();
    let start = Instant::now();
    tracker.percent_at(start, 0, 0, 0);
    assert_eq!(tracker.percent_at(start, 10, 10, 20), (0.0, 0.0, 0.0));
  }
}
