use std::ffi::CString;
use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::ptr;

use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::libc::{self, c_char};
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{chdir, dup2, setpgid, Pid};

use crate::cgroup::CgroupFd;
use crate::command::to_c_strings;
use crate::context::Environment;
use crate::utils::{ExecPipe, ExecWritePipe};
use crate::{PledgeBoxError, SetupStage};

const CLONE_INTO_CGROUP: u64 = 0x2_0000_0000;

/// Kernel `struct clone_args` (v2, with the cgroup field)
#[repr(C)]
#[derive(Debug, Default)]
struct CloneArgs {
  flags: u64,
  pidfd: u64,
  child_tid: u64,
  parent_tid: u64,
  exit_signal: u64,
  stack: u64,
  stack_size: u64,
  tls: u64,
  set_tid: u64,
  set_tid_size: u64,
  cgroup: u64,
}

enum Cloned {
  Parent(Pid),
  Child,
}

/// Everything the child needs, prepared before clone so the child itself
/// only issues syscalls.
struct ExecPlan {
  program: CString,
  _args: Vec<CString>,
  _envs: Vec<CString>,
  argv: Vec<*const c_char>,
  envp: Vec<*const c_char>,
  dir: CString,
  stdin: RawFd,
  stdout: RawFd,
  stderr: RawFd,
}

fn pointers(list: &[CString]) -> Vec<*const c_char> {
  list
    .iter()
    .map(|s| s.as_ptr())
    .chain(std::iter::once(ptr::null()))
    .collect()
}

fn clone_into_cgroup(cgroup: &CgroupFd) -> Result<Cloned, PledgeBoxError> {
  let mut args = CloneArgs {
    flags: CLONE_INTO_CGROUP,
    exit_signal: libc::SIGCHLD as u64,
    cgroup: cgroup.as_raw_fd() as u64,
    ..Default::default()
  };
  let ret = unsafe {
    libc::syscall(
      libc::SYS_clone3,
      &mut args as *mut CloneArgs,
      std::mem::size_of::<CloneArgs>(),
    )
  };
  match ret {
    -1 => Err(PledgeBoxError::setup(
      SetupStage::Spawn,
      format!("clone3 into cgroup fails: {}", Errno::last()),
    )),
    0 => Ok(Cloned::Child),
    pid => Ok(Cloned::Parent(Pid::from_raw(pid as i32))),
  }
}

/// Start `argv` inside the cgroup behind `cgroup`, in its own process group,
/// with the task sinks as stdout and stderr.
pub(crate) fn spawn(
  argv: &[String],
  envp: &[String],
  env: &Environment,
  cgroup: &CgroupFd,
) -> Result<Pid, PledgeBoxError> {
  let spawn_error = |err: PledgeBoxError| PledgeBoxError::setup(SetupStage::Spawn, err.to_string());

  let args = to_c_strings(argv).map_err(spawn_error)?;
  let envs = to_c_strings(envp).map_err(spawn_error)?;
  let program = args
    .first()
    .cloned()
    .ok_or_else(|| PledgeBoxError::setup(SetupStage::Spawn, "empty command line"))?;
  let dir = CString::new(env.dir().as_os_str().as_bytes())
    .map_err(|_| PledgeBoxError::setup(SetupStage::Spawn, "work directory contains a NUL byte"))?;

  let null = OpenOptions::new()
    .read(true)
    .write(true)
    .open("/dev/null")
    .map_err(|err| PledgeBoxError::setup(SetupStage::Spawn, format!("open /dev/null: {}", err)))?;

  let plan = ExecPlan {
    argv: pointers(&args),
    envp: pointers(&envs),
    program,
    _args: args,
    _envs: envs,
    dir,
    stdin: null.as_raw_fd(),
    stdout: env.out().raw_fd().unwrap_or(null.as_raw_fd()),
    stderr: env.err().raw_fd().unwrap_or(null.as_raw_fd()),
  };

  let pipe = ExecPipe::new().map_err(spawn_error)?;

  match clone_into_cgroup(cgroup)? {
    Cloned::Parent(child) => {
      info!("Start running child process (pid = {})", child);
      let pipe = match pipe.read() {
        Ok(pipe) => pipe,
        Err(err) => {
          abandon(child);
          return Err(spawn_error(err));
        }
      };
      match pipe.read() {
        Ok(None) => Ok(child),
        Ok(Some(message)) => {
          error!("Child process #{} fails before exec: {}", child, message);
          let _ = waitpid(child, None);
          Err(PledgeBoxError::setup(SetupStage::Exec, message))
        }
        Err(err) => {
          error!("Read exec status of #{} fails: {}", child, err);
          abandon(child);
          Err(PledgeBoxError::setup(SetupStage::Exec, err.to_string()))
        }
      }
    }
    Cloned::Child => {
      let pipe = pipe.write();
      exec_child(&pipe, &plan)
    }
  }
}

/// Kill and reap a child whose exec outcome is unknown. It may not have
/// reached `setpgid` yet, so the pid itself is killed as well.
fn abandon(child: Pid) {
  warn!("Kill child process #{} with unknown exec status", child);
  let _ = killpg(child, Signal::SIGKILL);
  let _ = kill(child, Signal::SIGKILL);
  let _ = waitpid(child, None);
}

/// Runs in the cloned child: no allocation, no logging, only syscalls.
fn exec_child(pipe: &ExecWritePipe, plan: &ExecPlan) -> ! {
  fn fail(pipe: &ExecWritePipe, what: &[u8], errno: Errno) -> ! {
    pipe.write(what);
    pipe.write(errno.desc().as_bytes());
    unsafe { libc::_exit(127) }
  }

  // 独立进程组，信号可以送达整个进程树
  if let Err(errno) = setpgid(Pid::from_raw(0), Pid::from_raw(0)) {
    fail(pipe, b"setpgid fails: ", errno);
  }
  for (fd, target) in [
    (plan.stdin, libc::STDIN_FILENO),
    (plan.stdout, libc::STDOUT_FILENO),
    (plan.stderr, libc::STDERR_FILENO),
  ] {
    if let Err(errno) = dup2(fd, target) {
      fail(pipe, b"redirect io fails: ", errno);
    }
  }
  if let Err(errno) = chdir(plan.dir.as_c_str()) {
    fail(pipe, b"chdir fails: ", errno);
  }

  unsafe { libc::execvpe(plan.program.as_ptr(), plan.argv.as_ptr(), plan.envp.as_ptr()) };
  fail(pipe, b"execvpe fails: ", Errno::last())
}

pub(crate) fn log_command(argv: &[String], envp: &[String]) {
  debug!("Start running program {}", argv.join(" "));
  debug!("With environment {}", envp.join(" "));
}

#[cfg(test)]
mod tests {
  use std::os::unix::process::CommandExt;
  use std::process::Command;

  use nix::errno::Errno;

  use super::*;

  #[test]
  fn abandon_kills_and_reaps_group() {
    let child = Command::new("sleep").arg("30").process_group(0).spawn().unwrap();
    let pid = Pid::from_raw(child.id() as i32);
    abandon(pid);
    assert_eq!(kill(pid, None), Err(Errno::ESRCH));
  }

  #[test]
  fn abandon_kills_child_outside_own_group() {
    let child = Command::new("sleep").arg("30").spawn().unwrap();
    let pid = Pid::from_raw(child.id() as i32);
    abandon(pid);
    assert_eq!(kill(pid, None), Err(Errno::ESRCH));
  }
}
