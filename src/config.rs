//! Process-wide tracker configuration. Set once, before (or at) the first
//! allocation, read by everything else.

use std::{env, fs::File, io::BufReader, path::Path, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Most frames a record can hold, see [`Config::stack_depth`].
pub const MAX_STACK_DEPTH: usize = 16;
/// Upper bound for both [`Config::alignment`] and [`Config::tail_padding`].
pub const MAX_ALIGNMENT: usize = 4096;
pub const MAX_TAIL_PADDING: usize = 4096;

/// Where diagnostics go.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    #[default]
    Stderr,
    Stdout,
    /// Appended to, opened once when the tracker is configured.
    File(PathBuf),
    /// Forwarded to the `log` facade.
    Log,
}

/// What happens after a fatal diagnostic has been written.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FatalAction {
    /// `std::process::abort()`
    #[default]
    Abort,
    /// Raise `SIGSEGV` so the crash dump points at the faulting frame.
    Trap,
    /// Panic with the fault description. Only for explicit handles (and
    /// tests). A `#[global_allocator]` must never unwind.
    Panic,
}

/// Behaviour when the backing allocator returns null.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OomBehavior {
    /// Report the failure to the caller (`Error::OutOfMemory`, or null from
    /// `GlobalAlloc::alloc`).
    #[default]
    Standard,
    /// Write a diagnostic and invoke the fatal action.
    Fatal,
}

/// What to do when a block is freed from a different module than the one
/// that allocated it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleCheck {
    Off,
    #[default]
    Warn,
    Fatal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Write one line per allocation and deallocation to the sink.
    pub verbose: bool,
    /// Run the leak check when the last unit guard is released.
    pub auto_leak_check: bool,
    pub sink: SinkKind,
    /// Minimum alignment of every user pointer. Power of two.
    pub alignment: usize,
    /// Sentinel bytes appended after every payload.
    pub tail_padding: usize,
    pub fatal_action: FatalAction,
    pub on_oom: OomBehavior,
    pub module_check: ModuleCheck,
    /// Return addresses captured per allocation, `0` disables stack capture
    /// (and with it the module check).
    pub stack_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl Config {
    /// [`Config::default()`], usable in `const` and `static` context.
    pub const DEFAULT: Config = Config {
        verbose: false,
        auto_leak_check: true,
        sink: SinkKind::Stderr,
        alignment: 16,
        tail_padding: 0,
        fatal_action: FatalAction::Abort,
        on_oom: OomBehavior::Standard,
        module_check: ModuleCheck::Warn,
        stack_depth: 12,
    };

    /// Read a JSON config. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, overridden by any `MEMWATCH_*` variables that are set.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like [`Config::from_env()`], but with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(v) = lookup("MEMWATCH_VERBOSE") {
            config.verbose = parse_bool("MEMWATCH_VERBOSE", &v)?;
        }
        if let Some(v) = lookup("MEMWATCH_AUTO_LEAK_CHECK") {
            config.auto_leak_check = parse_bool("MEMWATCH_AUTO_LEAK_CHECK", &v)?;
        }
        if let Some(v) = lookup("MEMWATCH_SINK") {
            config.sink = match v.trim() {
                "stderr" => SinkKind::Stderr,
                "stdout" => SinkKind::Stdout,
                "log" => SinkKind::Log,
                path => SinkKind::File(PathBuf::from(path)),
            };
        }
        if let Some(v) = lookup("MEMWATCH_ALIGNMENT") {
            config.alignment = parse_usize("MEMWATCH_ALIGNMENT", &v)?;
        }
        if let Some(v) = lookup("MEMWATCH_TAIL_PADDING") {
            config.tail_padding = parse_usize("MEMWATCH_TAIL_PADDING", &v)?;
        }
        if let Some(v) = lookup("MEMWATCH_FATAL") {
            config.fatal_action = match v.trim() {
                "abort" => FatalAction::Abort,
                "trap" => FatalAction::Trap,
                "panic" => FatalAction::Panic,
                other => return Err(invalid("MEMWATCH_FATAL", other)),
            };
        }
        if let Some(v) = lookup("MEMWATCH_ON_OOM") {
            config.on_oom = match v.trim() {
                "standard" => OomBehavior::Standard,
                "fatal" => OomBehavior::Fatal,
                other => return Err(invalid("MEMWATCH_ON_OOM", other)),
            };
        }
        if let Some(v) = lookup("MEMWATCH_MODULE_CHECK") {
            config.module_check = match v.trim() {
                "off" => ModuleCheck::Off,
                "warn" => ModuleCheck::Warn,
                "fatal" => ModuleCheck::Fatal,
                other => return Err(invalid("MEMWATCH_MODULE_CHECK", other)),
            };
        }
        if let Some(v) = lookup("MEMWATCH_STACK_DEPTH") {
            config.stack_depth = parse_usize("MEMWATCH_STACK_DEPTH", &v)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.alignment.is_power_of_two() || self.alignment > MAX_ALIGNMENT {
            return Err(Error::InvalidConfig(format!(
                "alignment must be a power of two no larger than {MAX_ALIGNMENT}, got {}",
                self.alignment
            )));
        }
        if self.tail_padding > MAX_TAIL_PADDING {
            return Err(Error::InvalidConfig(format!(
                "tail padding must be at most {MAX_TAIL_PADDING} bytes, got {}",
                self.tail_padding
            )));
        }
        if self.stack_depth > MAX_STACK_DEPTH {
            return Err(Error::InvalidConfig(format!(
                "stack depth must be at most {MAX_STACK_DEPTH}, got {}",
                self.stack_depth
            )));
        }
        Ok(())
    }
}

fn invalid(key: &str, value: &str) -> Error {
    Error::InvalidConfig(format!("{key}: unrecognised value `{value}`"))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(invalid(key, other)),
    }
}

fn parse_usize(key: &str, value: &str) -> Result<usize> {
    value.trim().parse().map_err(|_| invalid(key, value))
}
