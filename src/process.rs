use std::fmt::{Display, Formatter};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::libc;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::{sysconf, Pid, SysconfVar};

use crate::PledgeBoxError;

/// How a supervised process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
  Exited(i32),
  Signaled(Signal),
  /// The process is gone but the kernel no longer reports its status to us.
  /// Only produced for recovered processes.
  Vanished,
}

impl ExitStatus {
  /// Numeric exit code, `128 + signo` for signals
  pub fn code(&self) -> Option<i32> {
    match self {
      ExitStatus::Exited(code) => Some(*code),
      ExitStatus::Signaled(signal) => Some(128 + *signal as i32),
      ExitStatus::Vanished => None,
    }
  }

  pub fn signal(&self) -> Option<Signal> {
    match self {
      ExitStatus::Signaled(signal) => Some(*signal),
      _ => None,
    }
  }

  pub fn success(&self) -> bool {
    matches!(self, ExitStatus::Exited(0))
  }
}

impl Display for ExitStatus {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      ExitStatus::Exited(code) => write!(f, "exited with status {}", code),
      ExitStatus::Signaled(signal) => write!(f, "signaled by {}", signal),
      ExitStatus::Vanished => f.write_str("vanished with unknown status"),
    }
  }
}

/// Exit status plus the user CPU time the process consumed, when the kernel
/// reported it to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
  pub status: ExitStatus,
  pub user_time: Option<Duration>,
}

impl Completion {
  fn vanished() -> Self {
    Completion {
      status: ExitStatus::Vanished,
      user_time: None,
    }
  }
}

/// Wait and signal capability over one supervised process.
///
/// `Child` is a process this supervisor cloned itself and can reap. `Orphan`
/// is a process re-attached by pid after a supervisor restart; its exit is
/// observed through a pidfd (or `/proc` polling) and its status is only exact
/// while this process still happens to be its parent.
#[derive(Debug)]
pub enum Process {
  Child(Pid),
  Orphan(Orphan),
}

#[derive(Debug)]
pub struct Orphan {
  pid: Pid,
  pidfd: Option<OwnedFd>,
  interval: Duration,
}

impl Process {
  pub fn child(pid: Pid) -> Self {
    Process::Child(pid)
  }

  pub fn orphan(pid: Pid, interval: Duration) -> Self {
    let pidfd = match pidfd_open(pid) {
      Ok(fd) => Some(fd),
      Err(Errno::ESRCH) => {
        info!("Recovered process #{} is already gone", pid);
        None
      }
      Err(errno) => {
        warn!("pidfd_open #{} fails ({}), fall back to polling /proc", pid, errno);
        None
      }
    };
    Process::Orphan(Orphan {
      pid,
      pidfd,
      interval,
    })
  }

  pub fn pid(&self) -> Pid {
    match self {
      Process::Child(pid) => *pid,
      Process::Orphan(orphan) => orphan.pid,
    }
  }

  /// Block until the process is gone. Interrupted calls are retried; any
  /// other OS error is returned to the caller.
  pub fn wait(&self) -> Result<Completion, PledgeBoxError> {
    match self {
      Process::Child(pid) => wait_child(*pid),
      Process::Orphan(orphan) => orphan.wait(),
    }
  }

  /// Deliver a signal to the whole process group
  pub fn signal(&self, signal: Signal) -> Result<(), PledgeBoxError> {
    let pid = self.pid();
    debug!("Send {} to process group #{}", signal, pid);
    killpg(pid, signal)?;
    Ok(())
  }
}

fn wait_child(pid: Pid) -> Result<Completion, PledgeBoxError> {
  loop {
    let mut status = 0;
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::wait4(pid.as_raw(), &mut status, 0, &mut usage) };
    if ret < 0 {
      match Errno::last() {
        Errno::EINTR => continue,
        errno => {
          return Err(PledgeBoxError::wait(format!(
            "wait4 #{} fails: {}",
            pid, errno
          )))
        }
      }
    }

    let user_time = Duration::from_secs(usage.ru_utime.tv_sec as u64)
      + Duration::from_micros(usage.ru_utime.tv_usec as u64);
    match WaitStatus::from_raw(pid, status)? {
      WaitStatus::Exited(_, code) => {
        info!("Child process #{} exited with status {} (user {:?})", pid, code, user_time);
        return Ok(Completion {
          status: ExitStatus::Exited(code),
          user_time: Some(user_time),
        });
      }
      WaitStatus::Signaled(_, signal, _) => {
        info!("Child process #{} is signaled by {} (user {:?})", pid, signal, user_time);
        return Ok(Completion {
          status: ExitStatus::Signaled(signal),
          user_time: Some(user_time),
        });
      }
      status => {
        debug!("Child process #{} reports {:?}", pid, status);
      }
    }
  }
}

impl Orphan {
  fn wait(&self) -> Result<Completion, PledgeBoxError> {
    match &self.pidfd {
      Some(pidfd) => {
        wait_readable(pidfd)?;
        Ok(reap_pidfd(pidfd).unwrap_or_else(|| {
          info!("Recovered process #{} exited, status not observable", self.pid);
          Completion::vanished()
        }))
      }
      None => {
        let proc = PathBuf::from(format!("/proc/{}", self.pid));
        while proc.exists() {
          thread::sleep(self.interval);
        }
        info!("Recovered process #{} is gone, status not observable", self.pid);
        Ok(Completion::vanished())
      }
    }
  }
}

fn pidfd_open(pid: Pid) -> Result<OwnedFd, Errno> {
  let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0) };
  if fd < 0 {
    return Err(Errno::last());
  }
  Ok(unsafe { OwnedFd::from_raw_fd(fd as i32) })
}

/// A pidfd polls readable once its process has terminated
fn wait_readable(pidfd: &OwnedFd) -> Result<(), PledgeBoxError> {
  loop {
    let mut fds = [PollFd::new(pidfd.as_raw_fd(), PollFlags::POLLIN)];
    match poll(&mut fds, -1) {
      Ok(_) => return Ok(()),
      Err(Errno::EINTR) => continue,
      Err(errno) => return Err(PledgeBoxError::wait(format!("poll pidfd fails: {}", errno))),
    }
  }
}

/// Exact status when this process is still the parent, `None` otherwise
fn reap_pidfd(pidfd: &OwnedFd) -> Option<Completion> {
  let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
  let ret = unsafe {
    libc::waitid(
      libc::P_PIDFD,
      pidfd.as_raw_fd() as libc::id_t,
      &mut info,
      libc::WEXITED,
    )
  };
  if ret < 0 {
    debug!("waitid on pidfd fails: {}", Errno::last());
    return None;
  }
  let (status, utime) = unsafe { (info.si_status(), info.si_utime()) };
  let status = match info.si_code {
    libc::CLD_EXITED => ExitStatus::Exited(status),
    libc::CLD_KILLED | libc::CLD_DUMPED => ExitStatus::Signaled(Signal::try_from(status).ok()?),
    _ => return None,
  };
  Some(Completion {
    status,
    user_time: ticks_to_duration(utime as i64),
  })
}

/// `si_utime` is reported in clock ticks
fn ticks_to_duration(ticks: i64) -> Option<Duration> {
  let hz = sysconf(SysconfVar::CLK_TCK).ok().flatten()?;
  if hz <= 0 || ticks < 0 {
    return None;
  }
  Some(Duration::from_micros(ticks as u64 * 1_000_000 / hz as u64))
}
