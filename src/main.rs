use std::env;
use std::fs::OpenOptions;
use std::os::fd::{FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use flexi_logger::{Duplicate, FileSpec, Logger};
use log::{error, info, warn};
use nix::libc::STDOUT_FILENO;
use nix::unistd::{dup, isatty, Uid, User};

use pledgebox::promises;
use pledgebox::{
  bandwidth, default_format, Completion, Environment, HostSpecs, Options, PledgeBoxError,
  PledgeBoxExit, Shutdown, Sink, Supervisor,
};

const MB: u64 = 1024 * 1024;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
  #[arg(short, long, help = "Run as this user (default: current user)")]
  user: Option<String>,

  #[arg(short, long, env = "PLEDGEBOX_CGROUP", help = "Cgroup v2 directory of the task")]
  cgroup: PathBuf,

  #[arg(long, help = "Network namespace to enter")]
  net: Option<PathBuf>,

  #[arg(short, long, default_value_t = 0, help = "Memory soft limit (MB)")]
  memory: u64,

  #[arg(long, default_value_t = 0, help = "Memory hard limit (MB)")]
  memory_max: u64,

  #[arg(long, default_value_t = 0, help = "CPU shares (MHz)")]
  cpu: u64,

  #[arg(
    long,
    env = "PLEDGE_PATH",
    default_value = "/opt/bin/pledge-1.8.com",
    help = "Sandbox launcher"
  )]
  sandbox: PathBuf,

  #[arg(long)]
  stdout: Option<PathBuf>,

  #[arg(long)]
  stderr: Option<PathBuf>,

  #[arg(short, long, help = "Pass environment variable (KEY=VALUE, or KEY to copy)")]
  env: Vec<String>,

  #[arg(short, long, default_value = "/", help = "Work directory")]
  dir: PathBuf,

  #[arg(long, default_value_t = false)]
  verbose: bool,

  #[arg(long, default_value_t = 0, help = "Log utilization every N ms")]
  stats_interval: u64,

  #[arg(short, long, default_value_t = 0, help = "Stop the task after N ms")]
  timeout: u64,

  #[arg(long, default_value = "SIGTERM")]
  kill_signal: String,

  #[arg(long, default_value_t = 5000, help = "Grace period (ms) before killing the cgroup")]
  kill_timeout: u64,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
  #[command(about = "Run a command inside the sandbox")]
  Run {
    #[arg(short, long, default_value = "", help = "Pledge promises")]
    promises: String,

    #[arg(short = 'v', long, help = "Unveil path ([rwxc]:path)")]
    unveil: Vec<String>,

    #[arg(short, long, default_value = "normal")]
    importance: String,

    #[arg(help = "Program")]
    program: String,

    #[arg(help = "Arguments")]
    arguments: Vec<String>,
  },

  #[command(about = "Re-attach to a running task and wait for it")]
  Recover {
    #[arg(help = "Process id")]
    pid: i32,
  },
}

fn open_sink(path: &Option<PathBuf>, fd: i32) -> Result<Sink, PledgeBoxError> {
  match path {
    Some(path) => {
      let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|err| {
          PledgeBoxError::configuration(format!(
            "Open {} fails: {}",
            path.to_string_lossy(),
            err
          ))
        })?;
      Ok(Sink::from(file))
    }
    None => {
      let fd = dup(fd)?;
      Ok(Sink::from(unsafe { OwnedFd::from_raw_fd(fd) }))
    }
  }
}

fn current_user() -> Result<String, PledgeBoxError> {
  match User::from_uid(Uid::current())? {
    Some(user) => Ok(user.name),
    None => Err(PledgeBoxError::not_found("Current user is not in the passwd database")),
  }
}

impl Cli {
  fn environment(&self) -> Result<Environment, PledgeBoxError> {
    let user = match &self.user {
      Some(user) => user.clone(),
      None => current_user()?,
    };

    let bandwidth = if self.cpu > 0 {
      let specs = HostSpecs::host()
        .ok_or_else(|| PledgeBoxError::configuration("Can not read /proc/cpuinfo"))?;
      bandwidth(self.cpu, &specs)?
    } else {
      0
    };

    let env = Environment::builder(user, self.cgroup.clone())
      .out(open_sink(&self.stdout, STDOUT_FILENO)?)
      .err(open_sink(&self.stderr, nix::libc::STDERR_FILENO)?)
      .host_path()
      .parse_env_list(self.env.clone())?
      .dir(self.dir.clone())
      .memory(self.memory * MB)
      .memory_max(self.memory_max * MB)
      .bandwidth(bandwidth)
      .set_net(self.net.clone())
      .build();
    Ok(env)
  }

  fn supervisor(self) -> Result<Supervisor, PledgeBoxError> {
    let env = self.environment()?;
    match self.command {
      Commands::Run {
        promises,
        unveil,
        importance,
        program,
        arguments,
      } => {
        let options = Options::builder(program)
          .args(arguments)
          .promises(promises::check(promises)?)
          .importance(importance)?;
        let options = unveil
          .into_iter()
          .fold(options, |options, path| options.unveil(path))
          .build();
        let supervisor = Supervisor::new(self.sandbox, env, options);
        supervisor.start(&Shutdown::new())?;
        Ok(supervisor)
      }
      Commands::Recover { pid } => Ok(Supervisor::recover(self.sandbox, pid, env)),
    }
  }
}

fn supervise(
  supervisor: &Supervisor,
  stats_interval: Duration,
  timeout: Duration,
  kill_signal: &str,
  kill_timeout: Duration,
) -> Result<Completion, PledgeBoxError> {
  let (stats_tx, stats_rx) = mpsc::channel::<()>();
  let (watch_tx, watch_rx) = mpsc::channel::<()>();

  thread::scope(|scope| {
    if !stats_interval.is_zero() {
      scope.spawn(move || loop {
        match stats_rx.recv_timeout(stats_interval) {
          Err(RecvTimeoutError::Timeout) => {
            let usage = supervisor.stats();
            info!(
              "Utilization: memory = {}, swap = {}, cache = {}, cpu = {:.2}% (user {:.2}%, system {:.2}%)",
              usage.memory, usage.swap, usage.cache, usage.percent, usage.user, usage.system
            );
          }
          _ => break,
        }
      });
    }

    if !timeout.is_zero() {
      scope.spawn(move || {
        if let Err(RecvTimeoutError::Timeout) = watch_rx.recv_timeout(timeout) {
          warn!("Task exceeds {:?}, stop it with {}", timeout, kill_signal);
          if let Err(err) = supervisor.stop(kill_signal, kill_timeout) {
            error!("Stop task fails: {}", err);
          }
        }
      });
    }

    let result = supervisor.wait();
    drop(stats_tx);
    drop(watch_tx);
    result
  })?;

  supervisor.result()
}

fn report(completion: &Completion, pid: Option<i32>) {
  let status = completion.status;
  let user_ms = completion.user_time.map(|t| t.as_millis());
  let is_tty = isatty(STDOUT_FILENO).unwrap_or(false);
  if is_tty {
    let user = match user_ms {
      Some(ms) => format!("{} ms", ms),
      None => "unknown".to_string(),
    };
    println!(
      "\x1b[1m\x1b[92mTask #{}\x1b[39m\x1b[22m  {} (user time {})",
      pid.unwrap_or(0),
      status,
      user
    );
  } else {
    let code = match status.code() {
      Some(code) => code.to_string(),
      None => "null".to_string(),
    };
    let signal = match status.signal() {
      Some(signal) => format!("\"{}\"", signal),
      None => "null".to_string(),
    };
    let user = match user_ms {
      Some(ms) => ms.to_string(),
      None => "null".to_string(),
    };
    println!(
      "{{\n  \"ok\": true,\n  \"pid\": {},\n  \"code\": {},\n  \"signal\": {},\n  \"user_time_ms\": {}\n}}",
      pid.unwrap_or(0),
      code,
      signal,
      user
    );
  }
}

fn bootstrap(cli: Cli) -> Result<i32, PledgeBoxError> {
  let level = if cli.verbose { "pledgebox=debug" } else { "pledgebox=info" };
  Logger::try_with_str(level)?
    .log_to_file(
      FileSpec::default()
        .directory(env::var("LOG_DIR").unwrap_or("./logs/".into()))
        .basename("pledgebox")
        .discriminant(format!("{}", chrono::offset::Local::now().format("%Y-%m-%d")))
        .suppress_timestamp(),
    )
    .append()
    .duplicate_to_stderr(if cli.verbose { Duplicate::Info } else { Duplicate::Warn })
    .format_for_files(default_format)
    .start()?;

  info!("Start running pledgebox");

  let stats_interval = Duration::from_millis(cli.stats_interval);
  let timeout = Duration::from_millis(cli.timeout);
  let kill_timeout = Duration::from_millis(cli.kill_timeout);
  let kill_signal = cli.kill_signal.clone();

  let supervisor = cli.supervisor()?;
  let completion = supervise(&supervisor, stats_interval, timeout, &kill_signal, kill_timeout)?;
  report(&completion, supervisor.pid());

  info!("Running pledgebox finished");

  Ok(completion.status.code().unwrap_or(0))
}

fn main() -> PledgeBoxExit {
  match bootstrap(Cli::parse()) {
    Ok(code) => PledgeBoxExit::Ok(code),
    Err(err) => PledgeBoxExit::Err(err),
  }
}
