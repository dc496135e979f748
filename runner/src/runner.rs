pub mod responder;
pub mod server;

use crate::{
    config::{CampaignConfig, CampaignFiles},
    hooks::{HookError, Hooks},
    params::SimParams,
};
use rand::Rng;
use std::{
    ffi::OsString,
    fs::{File, OpenOptions},
    path::PathBuf,
    process::{Command, ExitStatus, Stdio},
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// thread count variable handed to every worker
pub const THREADS_VARIABLE: &str = "OMP_NUM_THREADS";

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Failed to prepare the input of sim {sim}")]
    Hook {
        sim: usize,
        #[source]
        source: HookError,
    },
    #[error("Failed to open {path:?} for the worker")]
    Redirect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to spawn worker {program:?}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to wait for the worker")]
    Wait(#[source] std::io::Error),
    #[error("Server mode requires a responder")]
    MissingResponder,
    #[error("Failed to connect to the worker server at {address}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Lost the connection to the worker server")]
    Conversation(#[source] std::io::Error),
    #[error("Responder failed to answer the worker server")]
    Respond(#[source] HookError),
    #[error("Failed to start the server client")]
    ClientThread(#[source] std::io::Error),
    #[error("Server client panicked")]
    ClientPanicked,
    #[error("Failed to signal the worker server")]
    Signal(#[from] nix::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// seed, render and start from the rendered input
    Fresh,
    /// resume from the worker's own checkpoint
    Restart,
}

/// Result of one attempt at one simulation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    /// successful attempt that resumed from a checkpoint
    Resumed,
    /// the worker exited nonzero, `None` if it was killed by a signal or never ran
    Failed { code: Option<i32> },
}

impl AttemptOutcome {
    pub fn from_status(status: ExitStatus, mode: RunMode) -> Self {
        match (status.success(), mode) {
            (true, RunMode::Fresh) => Self::Success,
            (true, RunMode::Restart) => Self::Resumed,
            (false, _) => Self::Failed {
                code: status.code(),
            },
        }
    }

    pub fn succeeded(mode: RunMode) -> Self {
        match mode {
            RunMode::Fresh => Self::Success,
            RunMode::Restart => Self::Resumed,
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

/// Fully resolved external worker call, equal inputs yield equal invocations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInvocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub stdin: Option<PathBuf>,
    pub log: PathBuf,
    pub append_log: bool,
    pub env: Vec<(String, String)>,
}

impl WorkerInvocation {
    /// build the command, opening the redirections
    pub fn command(&self) -> Result<Command, RunnerError> {
        let redirect = |path: &PathBuf| {
            let path = path.clone();
            move |source: std::io::Error| RunnerError::Redirect { path, source }
        };

        let log = OpenOptions::new()
            .create(true)
            .write(true)
            .append(self.append_log)
            .truncate(!self.append_log)
            .open(&self.log)
            .map_err(redirect(&self.log))?;
        let errors = log.try_clone().map_err(redirect(&self.log))?;

        let stdin = match self.stdin {
            Some(ref path) => Stdio::from(File::open(path).map_err(redirect(path))?),
            None => Stdio::null(),
        };

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(key, value)| (key, value)))
            .stdin(stdin)
            .stdout(log)
            .stderr(errors);

        Ok(command)
    }

    pub fn spawn_error(&self) -> impl FnOnce(std::io::Error) -> RunnerError {
        let program = self.program.clone();
        move |source| RunnerError::Spawn { program, source }
    }
}

/// Runs exactly one attempt of one simulation
pub struct SimulationRunner<'a> {
    config: &'a CampaignConfig,
    hooks: &'a Hooks,
    files: CampaignFiles,
}

impl<'a> SimulationRunner<'a> {
    pub fn new(config: &'a CampaignConfig, hooks: &'a Hooks) -> Self {
        Self {
            config,
            hooks,
            files: config.files(),
        }
    }

    fn env(&self) -> Vec<(String, String)> {
        vec![(
            THREADS_VARIABLE.to_string(),
            self.config.procs_per_sim.to_string(),
        )]
    }

    /// worker reading the rendered input, overwriting the log
    pub fn fresh_invocation(&self, sim: usize) -> WorkerInvocation {
        WorkerInvocation {
            program: self.config.worker.exec.clone(),
            args: self.config.worker.args.iter().map(OsString::from).collect(),
            stdin: Some(self.files.input(sim)),
            log: self.files.log(sim),
            append_log: false,
            env: self.env(),
        }
    }

    /// worker resuming from its checkpoint, appending to the log
    pub fn restart_invocation(&self, sim: usize) -> WorkerInvocation {
        WorkerInvocation {
            program: self.config.worker.restart_exec.clone(),
            args: vec![self.files.checkpoint(sim).into_os_string()],
            stdin: None,
            log: self.files.log(sim),
            append_log: true,
            env: self.env(),
        }
    }

    /// seed, specialize and render the input of a fresh simulation
    pub fn prepare<R: Rng>(
        &self,
        node: usize,
        sim: usize,
        rng: &mut R,
    ) -> Result<SimParams, RunnerError> {
        let params = SimParams::derive(self.config, node, sim).resolve_seed(rng);
        let params = self.hooks.specialize.specialize(params);
        let input = self.files.input(sim);

        self.hooks
            .render
            .render(&params, &input)
            .map_err(|source| RunnerError::Hook { sim, source })?;

        debug!(sim, input = ?input, seed = ?params.seed(), "Rendered worker input");

        Ok(params)
    }

    /// run one attempt, blocking until the worker is gone
    #[instrument(skip(self), level = "info")]
    pub fn run(
        &self,
        node: usize,
        sim: usize,
        mode: RunMode,
    ) -> Result<AttemptOutcome, RunnerError> {
        let invocation = match mode {
            RunMode::Fresh => {
                self.prepare(node, sim, &mut rand::thread_rng())?;
                self.fresh_invocation(sim)
            }
            RunMode::Restart => self.restart_invocation(sim),
        };

        let outcome = match self.config.server {
            Some(ref server) => {
                let responder = self
                    .hooks
                    .responder
                    .as_deref()
                    .ok_or(RunnerError::MissingResponder)?;

                server::run(&invocation, sim, server, responder, mode)?
            }
            None => {
                let status = invocation
                    .command()?
                    .status()
                    .map_err(invocation.spawn_error())?;

                AttemptOutcome::from_status(status, mode)
            }
        };

        match outcome {
            AttemptOutcome::Failed { code } => warn!(sim, ?code, "Worker failed"),
            _ => info!(sim, ?outcome, "Worker finished"),
        }

        Ok(outcome)
    }
}
