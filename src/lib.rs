pub use cgroup::CgroupController;
pub use command::{flatten, parameters, prepare};
pub use context::{Environment, EnvironmentBuilder, Options, OptionsBuilder, Sink};
pub use error::{PledgeBoxError, PledgeBoxExit, SetupStage};
pub use process::{Completion, ExitStatus};
pub use resources::{
  bandwidth, extract, parse_signal, Constraints, HostSpecs, Importance, MemoryThresholds, TrackCpu,
  Utilization,
};
pub use shutdown::Shutdown;
pub use supervisor::{Supervisor, TaskState, STOP_INTERVAL};
pub use utils::{default_format, ensure_home, ensure_home_in, lookup, parse_env, Identity};

mod cgroup;
mod command;
mod context;
mod error;
mod process;
pub mod promises;
mod resources;
mod shutdown;
mod spawn;
mod supervisor;
mod utils;
