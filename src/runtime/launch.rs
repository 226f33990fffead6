//! Spawning runtime processes.
//!
//! The orchestrator only sees [`Launcher`] and [`RuntimeHandle`]; the
//! default [`CommandLauncher`] runs the configured command through
//! `tokio::process`.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use rustc_hash::FxHashMap;

use super::RuntimeError;
use crate::config::RuntimeConfig;
use crate::core::ProjectId;

/// What a single launch needs to know.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub project_id: ProjectId,
    pub root: PathBuf,
    pub port: u16,
}

/// A spawned runtime process.
pub trait RuntimeHandle: Send {
    fn pid(&self) -> Option<u32>;

    /// Exit code once the process has exited (`-1` when killed by a signal).
    fn try_wait(&mut self) -> io::Result<Option<i32>>;

    /// Ask the process to exit.
    fn terminate(&mut self) -> io::Result<()>;

    /// Force the process to exit.
    fn kill(&mut self) -> io::Result<()>;
}

pub trait Launcher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn RuntimeHandle>, RuntimeError>;
}

// ============================================================================
// Environment Variables
// ============================================================================

/// Build `$PREVIEW_*` variables for a launch.
pub fn runtime_vars(spec: &LaunchSpec) -> FxHashMap<String, String> {
    let mut vars = FxHashMap::default();
    vars.insert("PREVIEW_PORT".into(), spec.port.to_string());
    vars.insert("PREVIEW_ROOT".into(), spec.root.display().to_string());
    vars.insert("PREVIEW_PROJECT".into(), spec.project_id.to_string());
    vars
}

/// Replace `$PREVIEW_*` occurrences in command arguments.
pub fn resolve_args(args: &[String], vars: &FxHashMap<String, String>) -> Vec<String> {
    args.iter()
        .map(|arg| {
            let mut result = arg.clone();
            for (key, value) in vars {
                result = result.replace(&format!("${key}"), value);
            }
            result
        })
        .collect()
}

// ============================================================================
// Command Launcher
// ============================================================================

pub struct CommandLauncher {
    config: RuntimeConfig,
}

impl CommandLauncher {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }
}

impl Launcher for CommandLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn RuntimeHandle>, RuntimeError> {
        let vars = runtime_vars(spec);
        let resolved = resolve_args(&self.config.command, &vars);
        let spawn_err = |message: String| RuntimeError::Spawn {
            project: spec.project_id.clone(),
            message,
        };

        let (program, args) = resolved
            .split_first()
            .ok_or_else(|| spawn_err("empty runtime command".into()))?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .current_dir(&spec.root)
            .envs(&self.config.env)
            .envs(&vars)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if !self.config.inherit_output {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        // Own process group, so signals reach the dev server behind `npm run`.
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd
            .spawn()
            .map_err(|err| spawn_err(format!("`{program}`: {err}")))?;

        Ok(Box::new(ChildHandle { child }))
    }
}

struct ChildHandle {
    child: tokio::process::Child,
}

impl ChildHandle {
    #[cfg(unix)]
    fn signal_group(&self, signal: nix::sys::signal::Signal) -> io::Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        match killpg(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }
}

impl RuntimeHandle for ChildHandle {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| status.code().unwrap_or(-1)))
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        self.signal_group(nix::sys::signal::Signal::SIGTERM)
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    fn kill(&mut self) -> io::Result<()> {
        #[cfg(unix)]
        self.signal_group(nix::sys::signal::Signal::SIGKILL)?;
        self.child.start_kill()
    }
}
