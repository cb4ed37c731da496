use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;

use crate::context::{Environment, Options, Sink};
use crate::resources::Importance;
use crate::utils::parse_env;
use crate::PledgeBoxError;

/// Build Environment
pub struct EnvironmentBuilder {
  env: Environment,
}

/// Build Options
pub struct OptionsBuilder {
  options: Options,
}

impl EnvironmentBuilder {
  pub(crate) fn new(user: String, cgroup: PathBuf) -> Self {
    EnvironmentBuilder {
      env: Environment {
        user,
        out: Sink::null(),
        err: Sink::null(),
        env: BTreeMap::new(),
        dir: PathBuf::from("/"),
        cgroup,
        net: None,
        memory: 0,
        memory_max: 0,
        bandwidth: 0,
      },
    }
  }

  /// Finish building
  pub fn build(self) -> Environment {
    self.env
  }

  /// Set stdout sink
  pub fn out<S: Into<Sink>>(mut self, sink: S) -> Self {
    self.env.out = sink.into();
    self
  }

  /// Set stderr sink
  pub fn err<S: Into<Sink>>(mut self, sink: S) -> Self {
    self.env.err = sink.into();
    self
  }

  /// Pass env
  pub fn env<KS: Into<String>, VS: Into<String>>(mut self, key: KS, value: VS) -> Self {
    self.env.env.insert(key.into(), value.into());
    self
  }

  /// Pass a whole mapping of env
  pub fn envs<I, KS, VS>(mut self, vars: I) -> Self
  where
    I: IntoIterator<Item = (KS, VS)>,
    KS: Into<String>,
    VS: Into<String>,
  {
    for (key, value) in vars {
      self.env.env.insert(key.into(), value.into());
    }
    self
  }

  /// Pass the host `PATH`, the only variable a task inherits unless asked
  pub fn host_path(mut self) -> Self {
    let path = env::var("PATH").unwrap_or("".to_string());
    self.env.env.insert("PATH".to_string(), path);
    self
  }

  /// Parse env list in `KEY=VALUE` form
  pub fn parse_env_list(mut self, list: Vec<String>) -> Result<Self, PledgeBoxError> {
    for text in list {
      let (key, value) = parse_env(text)?;
      self.env.env.insert(key, value);
    }
    Ok(self)
  }

  /// Set work directory
  pub fn dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
    self.env.dir = path.into();
    self
  }

  /// Set network namespace path or not
  pub fn set_net(mut self, path: Option<PathBuf>) -> Self {
    self.env.net = path;
    self
  }

  /// Enter the network namespace at path
  pub fn net<P: Into<PathBuf>>(mut self, path: P) -> Self {
    self.env.net = Some(path.into());
    self
  }

  /// Set soft memory target (unit: bytes)
  pub fn memory(mut self, value: u64) -> Self {
    self.env.memory = value;
    self
  }

  /// Set hard memory ceiling (unit: bytes)
  pub fn memory_max(mut self, value: u64) -> Self {
    self.env.memory_max = value;
    self
  }

  /// Set cpu quota per 100ms period (unit: us)
  pub fn bandwidth(mut self, value: u64) -> Self {
    self.env.bandwidth = value;
    self
  }
}

impl OptionsBuilder {
  pub(crate) fn new(command: String) -> Self {
    OptionsBuilder {
      options: Options {
        command,
        arguments: vec![],
        promises: String::new(),
        unveil: vec![],
        importance: Importance::default(),
      },
    }
  }

  /// Finish building
  pub fn build(self) -> Options {
    self.options
  }

  /// Append one argument
  pub fn arg<AS: Into<String>>(mut self, argument: AS) -> Self {
    self.options.arguments.push(argument.into());
    self
  }

  /// Append arguments
  pub fn args<I, AS>(mut self, arguments: I) -> Self
  where
    I: IntoIterator<Item = AS>,
    AS: Into<String>,
  {
    self
      .options
      .arguments
      .extend(arguments.into_iter().map(|a| a.into()));
    self
  }

  /// Set the promise string passed to the sandbox launcher
  pub fn promises<PS: Into<String>>(mut self, promises: PS) -> Self {
    self.options.promises = promises.into();
    self
  }

  /// Unveil a path, e.g. `r:/etc`
  pub fn unveil<PS: Into<String>>(mut self, path: PS) -> Self {
    self.options.unveil.push(path.into());
    self
  }

  /// Parse importance label
  pub fn importance<LS: AsRef<str>>(mut self, label: LS) -> Result<Self, PledgeBoxError> {
    self.options.importance = Importance::parse(label)?;
    Ok(self)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn host_path_is_the_only_inherited_variable() {
    let env = Environment::builder("nobody", "/sys/fs/cgroup/test.scope")
      .host_path()
      .build();
    assert_eq!(env.env().len(), 1);
    assert_eq!(env.env()["PATH"], env::var("PATH").unwrap_or_default());
  }

  #[test]
  fn env_list_adds_on_top_of_path() {
    let env = Environment::builder("nobody", "/sys/fs/cgroup/test.scope")
      .host_path()
      .parse_env_list(vec!["LANG=C.UTF-8".to_string(), "PATH=/bin".to_string()])
      .unwrap()
      .build();
    assert_eq!(env.env().len(), 2);
    assert_eq!(env.env()["LANG"], "C.UTF-8");
    assert_eq!(env.env()["PATH"], "/bin");
  }
}
