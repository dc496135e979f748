use crate::{executors::slurm::QueueConfig, ledger::Matching, params};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::File,
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read campaign config")]
    ReadConfig(#[source] Error),
    #[error("Failed to parse campaign config")]
    ParseConfig(#[from] serde_yaml::Error),
    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[source] Error),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CampaignConfig {
    // prefix shared by every file the campaign writes
    pub prefix: String,
    // directory holding inputs, logs, checkpoints, ledger and snapshots
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    pub num_nodes: usize,
    pub procs_per_node: usize,
    #[serde(default = "default_procs_per_sim")]
    pub procs_per_sim: usize,
    pub num_sims: usize,
    // wall clock minutes requested per queued job
    #[serde(default = "default_minutes")]
    pub minutes: u64,
    #[serde(default)]
    pub max_restarts: u32,
    // -1 draws a fresh seed for every simulation
    #[serde(default = "default_seed")]
    pub seed: i64,
    pub worker: WorkerConfig,
    #[serde(default)]
    pub template: Option<PathBuf>,
    // per simulation values, indexed by sim
    #[serde(default)]
    pub sweep: BTreeMap<String, Vec<serde_yaml::Value>>,
    #[serde(default)]
    pub params: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub server: Option<ServerConfig>,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub post_process: Option<Vec<String>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    // reads the rendered input on stdin
    pub exec: PathBuf,
    // resumes from a checkpoint file given as its only argument
    pub restart_exec: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct LedgerConfig {
    #[serde(default)]
    pub matching: Matching,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    // base port, every simulation listens on port + sim
    pub port: u16,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    // request that ends the conversation
    #[serde(default = "default_terminate")]
    pub terminate: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    // time the server gets to exit after SIGTERM before it is killed
    #[serde(default = "default_grace")]
    pub grace_ms: u64,
    #[serde(default)]
    pub responder: Vec<String>,
    #[serde(default = "default_responder_timeout")]
    pub responder_timeout_ms: u64,
}

/// Paths of every artefact a campaign reads or writes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CampaignFiles {
    directory: PathBuf,
    prefix: String,
}

impl CampaignFiles {
    pub fn new(directory: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            prefix: prefix.into(),
        }
    }

    fn named(&self, name: String) -> PathBuf {
        self.directory.join(name)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn input(&self, sim: usize) -> PathBuf {
        self.named(format!("{}{sim}_run.txt", self.prefix))
    }

    pub fn log(&self, sim: usize) -> PathBuf {
        self.named(format!("{}{sim}_run.log", self.prefix))
    }

    pub fn checkpoint(&self, sim: usize) -> PathBuf {
        self.named(format!("{}{sim}_checkpoint.fst", self.prefix))
    }

    pub fn ledger(&self) -> PathBuf {
        self.named(format!("{}_sim_ids.txt", self.prefix))
    }

    pub fn local_params(&self) -> PathBuf {
        self.named(format!("{}_params.json", self.prefix))
    }

    pub fn queued_params(&self, queue_id: u64) -> PathBuf {
        self.named(format!("{}_params{queue_id}.json", self.prefix))
    }

    pub fn queue_ids(&self) -> PathBuf {
        self.named(format!("{}_queue_ids.txt", self.prefix))
    }

    pub fn queue_script(&self, node: usize) -> PathBuf {
        self.named(format!("{}_slurm{node}.txt", self.prefix))
    }
}

impl CampaignConfig {
    /// read and parse a campaign description from a yaml file
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let file = File::open(path).map_err(ConfigErrors::ReadConfig)?;

        Ok(serde_yaml::from_reader(file)?)
    }

    pub fn files(&self) -> CampaignFiles {
        CampaignFiles::new(&self.directory, &self.prefix)
    }

    /// number of simulations one node runs side by side
    pub fn sims_per_node(&self) -> usize {
        self.procs_per_node / self.procs_per_sim.max(1)
    }

    /// check the campaign for inconsistencies, returns true if any error was found
    pub fn preflight_checks(&self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.prefix.is_empty() {
            error!("prefix cannot be empty, it names every campaign file");
            contains_error = true;
        }

        if self.num_nodes == 0 {
            error!("num_nodes must be at least 1");
            contains_error = true;
        }

        if self.procs_per_sim == 0 {
            error!("procs_per_sim must be at least 1");
            contains_error = true;
        } else if self.procs_per_node % self.procs_per_sim != 0 || self.sims_per_node() == 0 {
            error!(
                "procs_per_node ({}) must be a positive multiple of procs_per_sim ({})",
                self.procs_per_node, self.procs_per_sim
            );
            contains_error = true;
        }

        if self.num_sims != self.num_nodes * self.sims_per_node() {
            error!(
                "num_sims ({}) must equal num_nodes ({}) * sims per node ({})",
                self.num_sims,
                self.num_nodes,
                self.sims_per_node()
            );
            contains_error = true;
        }

        if self.seed < -1 {
            error!("seed must be -1 (random) or a natural number, got {}", self.seed);
            contains_error = true;
        }

        for (name, exec) in [
            ("worker.exec", &self.worker.exec),
            ("worker.restart_exec", &self.worker.restart_exec),
        ] {
            match check_executable(exec) {
                Ok(true) => {}
                Ok(false) => {
                    error!("{name} ({}) is not executable", exec.to_string_lossy());
                    contains_error = true;
                }
                Err(e) => {
                    error!(
                        "Failed to determine if {name} ({}) is an executable: {e}",
                        exec.to_string_lossy()
                    );
                    contains_error = true;
                }
            }
        }

        if let Some(ref template) = self.template {
            if !template.is_file() {
                error!("template {} is not a file", template.to_string_lossy());
                contains_error = true;
            }
        }

        for (key, values) in self.sweep.iter() {
            if values.len() != self.num_sims {
                error!(
                    "sweep.{key} has {} values but the campaign has {} simulations",
                    values.len(),
                    self.num_sims
                );
                contains_error = true;
            }

            if self.params.contains_key(key) {
                warn!("sweep.{key} shadows params.{key}");
            }
        }

        if let Some(ref server) = self.server {
            if server.responder.is_empty() {
                error!("server.responder must name a command answering server requests");
                contains_error = true;
            }

            if server.buffer_size == 0 {
                error!("server.buffer_size cannot be 0");
                contains_error = true;
            }

            if usize::from(server.port) + self.num_sims > usize::from(u16::MAX) {
                error!(
                    "server.port {} leaves no room for {} simulation ports",
                    server.port, self.num_sims
                );
                contains_error = true;
            }
        }

        if let Some(ref command) = self.post_process {
            if command.is_empty() {
                error!("post_process must not be an empty command");
                contains_error = true;
            }
        }

        if self.minutes == 0 {
            warn!("minutes is 0, queued jobs will be killed right away");
        }

        if let Err(e) = params::check_representable(self) {
            error!("{e}");
            contains_error = true;
        }

        contains_error
    }
}

fn default_directory() -> PathBuf {
    PathBuf::from(".")
}

fn default_procs_per_sim() -> usize {
    1
}

fn default_minutes() -> u64 {
    60
}

fn default_seed() -> i64 {
    -1
}

fn default_host() -> String {
    String::from("localhost")
}

fn default_buffer_size() -> usize {
    1000
}

fn default_terminate() -> String {
    String::from("terminate")
}

fn default_connect_timeout() -> u64 {
    30_000
}

fn default_grace() -> u64 {
    2_000
}

fn default_responder_timeout() -> u64 {
    2_000
}
