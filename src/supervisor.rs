use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use nix::unistd::Pid;
use path_absolutize::Absolutize;

use crate::cgroup::CgroupController;
use crate::command::{flatten, parameters, prepare};
use crate::context::{Environment, Options};
use crate::process::{Completion, Process};
use crate::resources::utilization::sample;
use crate::resources::{parse_signal, HostSpecs, TrackCpu, Utilization};
use crate::shutdown::Shutdown;
use crate::spawn::{log_command, spawn};
use crate::utils::{ensure_home, lookup};
use crate::{PledgeBoxError, SetupStage};

/// Default interval between `pids.current` reads while stopping
pub const STOP_INTERVAL: Duration = Duration::from_millis(500);

/// Lifecycle of a supervised task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
  Unstarted,
  Running,
  Exited,
}

/// How the cgroup emptied out after the stop signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Vacate {
  Empty,
  TimedOut,
  Unreadable,
}

#[derive(Debug, Default)]
struct State {
  process: Option<Arc<Process>>,
  exit: Option<Completion>,
}

/// Supervises one sandboxed command: launch, wait, signal, stop, and stats.
///
/// All methods take `&self`; a handle is meant to be shared between a
/// controlling thread, a thread blocked in [`Supervisor::wait`] and a stats
/// sampler.
#[derive(Debug)]
pub struct Supervisor {
  bin: PathBuf,
  env: Environment,
  opts: Option<Options>,
  cgroup: CgroupController,
  interval: Duration,
  state: RwLock<State>,
  cpu: Mutex<TrackCpu>,
  reaper: Mutex<()>,
}

impl Supervisor {
  /// Prepare a supervisor for a fresh launch. `bin` is the sandbox launcher.
  pub fn new<P: AsRef<Path>>(bin: P, env: Environment, opts: Options) -> Self {
    Self::create(bin.as_ref(), env, Some(opts), State::default())
  }

  /// Re-attach to a task that is already running as `pid`, e.g. after the
  /// supervising process restarted. Nothing is launched.
  ///
  /// The exit status reported by [`Supervisor::wait`] is only exact while
  /// this process is still the parent of `pid`; otherwise the result is
  /// [`crate::ExitStatus::Vanished`] with no user time.
  pub fn recover<P: AsRef<Path>>(bin: P, pid: i32, env: Environment) -> Self {
    let pid = Pid::from_raw(pid);
    info!(
      "Recover process #{} in cgroup {}",
      pid,
      env.cgroup().to_string_lossy()
    );
    let state = State {
      process: Some(Arc::new(Process::orphan(pid, STOP_INTERVAL))),
      exit: None,
    };
    Self::create(bin.as_ref(), env, None, state)
  }

  fn create(bin: &Path, env: Environment, opts: Option<Options>, state: State) -> Self {
    let bin = match bin.absolutize() {
      Ok(path) => path.to_path_buf(),
      Err(err) => {
        warn!("Absolutize {} fails: {}", bin.to_string_lossy(), err);
        bin.to_path_buf()
      }
    };
    Supervisor {
      bin,
      cgroup: CgroupController::new(env.cgroup()),
      env,
      opts,
      interval: STOP_INTERVAL,
      state: RwLock::new(state),
      cpu: Mutex::new(TrackCpu::new()),
      reaper: Mutex::new(()),
    }
  }

  /// Set the interval between `pids.current` reads in [`Supervisor::stop`]
  pub fn with_stop_interval(mut self, interval: Duration) -> Self {
    self.interval = interval;
    self
  }

  pub fn bin(&self) -> &Path {
    &self.bin
  }

  pub fn environment(&self) -> &Environment {
    &self.env
  }

  pub fn options(&self) -> Option<&Options> {
    self.opts.as_ref()
  }

  pub fn cgroup(&self) -> &CgroupController {
    &self.cgroup
  }

  /// Launch the task inside its cgroup.
  pub fn start(&self, shutdown: &Shutdown) -> Result<(), PledgeBoxError> {
    let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
    if state.process.is_some() {
      return Err(PledgeBoxError::state("task is already started"));
    }
    let opts = self
      .opts
      .as_ref()
      .ok_or_else(|| PledgeBoxError::state("recovered task cannot be started again"))?;
    check_cancelled(shutdown)?;

    let identity = lookup(self.env.user())?;
    let home = ensure_home(&identity)?;

    prepare(&self.bin)?;

    if !CgroupController::is_unified() {
      return Err(PledgeBoxError::setup(
        SetupStage::Cgroup,
        "host does not mount the unified cgroup v2 hierarchy",
      ));
    }
    let cgroup_fd = self.cgroup.open()?;
    self.cgroup.constrain(&self.env.constraints(Some(opts)));

    let argv = parameters(&self.bin, &self.env, opts, &identity);
    let envp = flatten(&identity.name, &home, self.env.env());
    log_command(&argv, &envp);

    check_cancelled(shutdown)?;
    let pid = spawn(&argv, &envp, &self.env, &cgroup_fd)?;
    drop(cgroup_fd);

    info!(
      "Task {} started as #{} in {}",
      opts.command(),
      pid,
      self.cgroup.path().to_string_lossy()
    );
    state.process = Some(Arc::new(Process::child(pid)));
    Ok(())
  }

  /// Process id of the launched or recovered task, `None` before start
  pub fn pid(&self) -> Option<i32> {
    let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
    state.process.as_ref().map(|p| p.pid().as_raw())
  }

  pub fn state(&self) -> TaskState {
    let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
    match (&state.process, &state.exit) {
      (None, _) => TaskState::Unstarted,
      (Some(_), None) => TaskState::Running,
      (Some(_), Some(_)) => TaskState::Exited,
    }
  }

  pub fn is_running(&self) -> bool {
    self.state() == TaskState::Running
  }

  /// Block until the task exits. No lock is held while blocked, so signal,
  /// stop and stats stay usable meanwhile.
  pub fn wait(&self) -> Result<(), PledgeBoxError> {
    let process = {
      let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
      match (&state.process, &state.exit) {
        (None, _) => return Err(PledgeBoxError::state("task is not started")),
        (Some(_), Some(_)) => return Ok(()),
        (Some(process), None) => process.clone(),
      }
    };

    let _reaper = self.reaper.lock().unwrap_or_else(PoisonError::into_inner);
    if self.state.read().unwrap_or_else(PoisonError::into_inner).exit.is_some() {
      return Ok(());
    }

    let completion = process.wait()?;
    info!("Task #{} {}", process.pid(), completion.status);
    let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
    state.exit = Some(completion);
    Ok(())
  }

  /// Exit status and user CPU time, available once [`Supervisor::wait`] has
  /// returned `Ok`
  pub fn result(&self) -> Result<Completion, PledgeBoxError> {
    let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
    state
      .exit
      .ok_or_else(|| PledgeBoxError::state("task has not exited"))
  }

  fn running(&self) -> Result<Arc<Process>, PledgeBoxError> {
    let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
    match (&state.process, &state.exit) {
      (Some(process), None) => Ok(process.clone()),
      (None, _) => Err(PledgeBoxError::state("task is not started")),
      (Some(_), Some(_)) => Err(PledgeBoxError::state("task has already exited")),
    }
  }

  /// Deliver the named signal to the task's process group
  pub fn signal(&self, name: &str) -> Result<(), PledgeBoxError> {
    let signal = parse_signal(name)?;
    let process = self.running()?;
    process.signal(signal)
  }

  /// Signal the task, then give its cgroup `timeout` to empty out before
  /// killing everything in it and closing the output sinks. Returns the
  /// result of the initial signal.
  pub fn stop(&self, name: &str, timeout: Duration) -> Result<(), PledgeBoxError> {
    let signal = parse_signal(name)?;
    let process = self.running()?;

    info!("Stop task #{} with {} (timeout {:?})", process.pid(), signal, timeout);
    let result = process.signal(signal);
    if let Err(err) = &result {
      warn!("Send {} to #{} fails: {}", signal, process.pid(), err);
    }

    match self.block_pids(timeout) {
      Vacate::Empty => info!("Cgroup of task #{} is empty", process.pid()),
      vacate => {
        info!("Escalate stop of task #{} ({:?})", process.pid(), vacate);
        if let Err(err) = self.cgroup.kill() {
          warn!("Kill cgroup {} fails: {}", self.cgroup.path().to_string_lossy(), err);
        }
        self.env.close();
      }
    }

    result
  }

  fn block_pids(&self, timeout: Duration) -> Vacate {
    let deadline = Instant::now() + timeout;
    loop {
      match self.cgroup.pids_current() {
        Some(0) => return Vacate::Empty,
        None => return Vacate::Unreadable,
        Some(count) => debug!("{} processes still alive", count),
      }
      let now = Instant::now();
      if now >= deadline {
        return Vacate::TimedOut;
      }
      thread::sleep(self.interval.min(deadline - now));
    }
  }

  /// Current utilization from the cgroup accounting files
  pub fn stats(&self) -> Utilization {
    let mut cpu = self.cpu.lock().unwrap_or_else(PoisonError::into_inner);
    sample(&self.cgroup, &mut cpu, HostSpecs::host())
  }
}

fn check_cancelled(shutdown: &Shutdown) -> Result<(), PledgeBoxError> {
  if shutdown.is_cancelled() {
    Err(PledgeBoxError::setup(
      SetupStage::Cancelled,
      "supervisor is shutting down",
    ))
  } else {
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn env() -> Environment {
    Environment::builder("nobody", "/nonexistent/pledgebox.scope").build()
  }

  #[test]
  fn fresh_supervisor_is_unstarted() {
    let supervisor = Supervisor::new("pledge.com", env(), Options::builder("true").build());
    assert_eq!(supervisor.state(), TaskState::Unstarted);
    assert_eq!(supervisor.pid(), None);
    assert!(supervisor.bin().is_absolute());
    assert!(matches!(supervisor.wait(), Err(PledgeBoxError::State(_))));
    assert!(matches!(supervisor.result(), Err(PledgeBoxError::State(_))));
    assert!(matches!(supervisor.signal("sigterm"), Err(PledgeBoxError::State(_))));
    assert!(matches!(
      supervisor.stop("sigterm", Duration::from_millis(10)),
      Err(PledgeBoxError::State(_))
    ));
  }

  #[test]
  fn cancelled_start_fails() {
    let supervisor = Supervisor::new("/opt/bin/pledge.com", env(), Options::builder("true").build());
    let shutdown = Shutdown::new();
    shutdown.cancel();
    let err = supervisor.start(&shutdown).unwrap_err();
    assert_eq!(err.stage(), Some(SetupStage::Cancelled));
    assert_eq!(supervisor.state(), TaskState::Unstarted);
  }

  #[test]
  fn recovered_cannot_start() {
    let supervisor = Supervisor::recover("/opt/bin/pledge.com", std::process::id() as i32, env());
    assert!(supervisor.options().is_none());
    assert_eq!(supervisor.state(), TaskState::Running);
    assert!(matches!(
      supervisor.start(&Shutdown::new()),
      Err(PledgeBoxError::State(_))
    ));
  }

  #[test]
  fn unknown_signal_is_rejected_before_state() {
    let supervisor = Supervisor::new("/opt/bin/pledge.com", env(), Options::builder("true").build());
    assert!(matches!(
      supervisor.signal("sigbogus"),
      Err(PledgeBoxError::Invalid(_))
    ));
  }

  #[test]
  fn stats_of_missing_cgroup_are_zero() {
    let supervisor = Supervisor::new("/opt/bin/pledge.com", env(), Options::builder("true").build());
    let usage = supervisor.stats();
    assert_eq!(usage.memory, 0);
    assert_eq!(usage.swap, 0);
    assert_eq!(usage.cache, 0);
    assert_eq!(usage.percent, 0.0);
  }
}
