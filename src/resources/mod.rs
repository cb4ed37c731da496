//! Translate abstract resource requests into kernel units.

use std::fmt::{Display, Formatter};

pub use cpu::{bandwidth, HostSpecs, TrackCpu, PERIOD_USEC};
pub use signal::parse_signal;
pub use utilization::{extract, Utilization};

use crate::PledgeBoxError;

mod cpu;
mod signal;
pub(crate) mod utilization;

/// Scheduling importance, mapped onto a nice value.
///
/// highest -> -20
/// high    -> -10
/// normal  ->  -5
/// low     ->  10
/// lowest  ->  19
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Importance {
  label: String,
  nice: i32,
}

impl Importance {
  pub fn parse<S: AsRef<str>>(text: S) -> Result<Self, PledgeBoxError> {
    let label = text.as_ref().trim().to_lowercase();
    let nice = match label.as_str() {
      "highest" => -20,
      "high" => -10,
      "" | "normal" => -5,
      "low" => 10,
      "lowest" => 19,
      _ => {
        return Err(PledgeBoxError::invalid(format!(
          "importance of {:?} not recognized",
          label
        )))
      }
    };
    let label = if label.is_empty() {
      "normal".to_string()
    } else {
      label
    };
    Ok(Importance { label, nice })
  }

  pub fn label(&self) -> &str {
    &self.label
  }

  pub fn nice(&self) -> i32 {
    self.nice
  }
}

impl Default for Importance {
  fn default() -> Self {
    Importance {
      label: "normal".to_string(),
      nice: -5,
    }
  }
}

impl Display for Importance {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "({} {})", self.label, self.nice)
  }
}

/// Memory protection and ceiling in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryThresholds {
  pub low: Option<u64>,
  pub max: u64,
}

impl MemoryThresholds {
  /// A lone soft target becomes the hard ceiling; with both present the soft
  /// target is the `memory.low` protection and the larger value the ceiling.
  pub fn new(memory: u64, memory_max: u64) -> Option<Self> {
    match (memory, memory_max) {
      (0, 0) => None,
      (memory, 0) => Some(MemoryThresholds {
        low: None,
        max: memory,
      }),
      (0, memory_max) => Some(MemoryThresholds {
        low: None,
        max: memory_max,
      }),
      (memory, memory_max) => Some(MemoryThresholds {
        low: Some(memory),
        max: memory.max(memory_max),
      }),
    }
  }
}

/// Everything written into the task cgroup before launch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Constraints {
  pub bandwidth: u64,
  pub memory: Option<MemoryThresholds>,
  pub nice: Option<i32>,
}
