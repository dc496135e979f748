/*
 * Queue submission for slurm:
 * 1. Render one batch script per node, each a restart array of max_restarts + 1 tasks
 *    that run one at a time
 * 2. Submit held, so the job cannot start before its parameters exist
 * 3. Persist the parameter snapshot under the returned job id, record (job id, node)
 * 4. Release the job
 *
 * Inside the script a zero exit cancels the remaining array tasks, a nonzero exit lets the
 * next task restart the node from its checkpoints.
 */

use crate::{
    config::CampaignConfig,
    params::{self, JobKey, ParamStore, ParamStoreError, Snapshot},
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    process::Command,
};
use thiserror::Error;
use tracing::{debug, info, instrument};

/// hours between two syncs of the scratch copy if none are configured
pub const DEFAULT_HOURS_PER_SYNC: f64 = 5.0;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to write {path:?}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to run queue command {command}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Queue command {command} failed: {stderr}")]
    Command { command: String, stderr: String },
    #[error("Failed to find a job id in the submit output '{0}'")]
    JobId(String),
    #[error("Queue command is empty")]
    EmptyCommand,
    #[error("Failed to persist the parameters of the job")]
    Params(#[from] ParamStoreError),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    // prints the job id of the submitted script, the script path is appended
    #[serde(default = "default_submit")]
    pub submit: Vec<String>,
    // releases a held job, the job id is appended, empty if jobs are not held
    #[serde(default = "default_release")]
    pub release: Vec<String>,
    // cancels the remaining restart tasks once a node is done
    #[serde(default = "default_cancel")]
    pub cancel: String,
    // extra scheduler flags, e.g. "-p queue"
    #[serde(default)]
    pub flags: Option<String>,
    // node local scratch, staging is disabled if unset
    #[serde(default)]
    pub scratch: Option<PathBuf>,
    #[serde(default)]
    pub scratch_hours_per_sync: Option<f64>,
    // command running this orchestrator inside the job
    #[serde(default)]
    pub entry_point: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            submit: default_submit(),
            release: default_release(),
            cancel: default_cancel(),
            flags: None,
            scratch: None,
            scratch_hours_per_sync: None,
            entry_point: None,
        }
    }
}

fn default_submit() -> Vec<String> {
    vec!["sbatch".into(), "--hold".into()]
}

fn default_release() -> Vec<String> {
    vec!["scontrol".into(), "release".into()]
}

fn default_cancel() -> String {
    String::from("scancel")
}

/// A submitted node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueJob {
    pub queue_id: u64,
    pub node: usize,
    pub script: PathBuf,
}

fn scratch_preamble(config: &CampaignConfig, scratch: &Path) -> String {
    let hours = config
        .queue
        .scratch_hours_per_sync
        .unwrap_or(DEFAULT_HOURS_PER_SYNC);
    let seconds = (hours * 3600.0).round().max(1.0) as u64;
    let prefix = &config.prefix;

    format!(
        r#"original_dir=$PWD; echo $original_dir
scratch={scratch}/$LOGNAME/${{SLURM_ARRAY_JOB_ID}}_${{SLURM_ARRAY_TASK_ID}}/; mkdir -p $scratch; cd $scratch; echo "scratch:$scratch"
rsync -au $original_dir/* .
echo "while [ 1 -le 2 ]; do sleep {seconds}; rsync -au * $original_dir/; done" > {prefix}_sync.sh
chmod a+x {prefix}_sync.sh
./{prefix}_sync.sh &
sync_pid=$!
ls
"#,
        scratch = scratch.display(),
    )
}

const SCRATCH_POSTAMBLE: &str = "kill $sync_pid\nrsync -au . $original_dir/\n";

/// render the batch script running `node`'s share of the campaign
pub fn generate(config: &CampaignConfig, node: usize, entry_point: &str) -> String {
    let prefix = &config.prefix;

    let mut script = format!(
        r#"#!/bin/bash
#SBATCH -n {procs}
#SBATCH -N 1
#SBATCH -t {minutes}:00
#SBATCH --array=0-{max_restarts}%1
#SBATCH -o {prefix}_slurm_%A_%a.txt
#SBATCH -e {prefix}_slurm_%A_%a.txt
"#,
        procs = config.procs_per_node,
        minutes = config.minutes,
        max_restarts = config.max_restarts,
    );
    if let Some(ref flags) = config.queue.flags {
        script.push_str(&format!("#SBATCH {flags}\n"));
    }
    script.push_str(concat!(
        r#"echo "Running ID ${SLURM_ARRAY_JOB_ID}_${SLURM_ARRAY_TASK_ID} on $(hostname) at $(date) in $PWD""#,
        "\ncd $PWD\n"
    ));

    if let Some(ref scratch) = config.queue.scratch {
        script.push_str(&scratch_preamble(config, scratch));
    }

    script.push_str(&format!(
        "export OMP_NUM_THREADS={threads}\n\
         {entry_point} --run_type 0 --node {node} --queue_id $SLURM_ARRAY_JOB_ID --queue_task $SLURM_ARRAY_TASK_ID\n\
         status=$?\n",
        threads = config.procs_per_sim,
    ));

    if config.queue.scratch.is_some() {
        script.push_str(SCRATCH_POSTAMBLE);
    }

    script.push_str(&format!(
        r#"if [ $status -eq 0 ]; then
  echo "Job is done"
  {cancel} $SLURM_ARRAY_JOB_ID
else
  echo "Job is terminating, to be restarted again"
fi
echo "Time is $(date)"
exit $status
"#,
        cancel = config.queue.cancel
    ));

    script
}

/// take the job id from the last line of the submit output
///
/// Accepts both `sbatch --parsable` output (`id` or `id;cluster`) and the default
/// `Submitted batch job <id>`.
pub fn parse_job_id(output: &str) -> Result<u64, QueueError> {
    output
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| {
            let line = line.split(';').next().unwrap_or(line);
            line.split_whitespace().last()
        })
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| QueueError::JobId(output.trim().to_string()))
}

fn run_queue_command(command: &[String], last: &str) -> Result<String, QueueError> {
    let (program, args) = command.split_first().ok_or(QueueError::EmptyCommand)?;
    let shown = format!("{} {last}", command.join(" "));

    debug!(command = %shown, "Running queue command");

    let output = Command::new(program)
        .args(args)
        .arg(last)
        .output()
        .map_err(|source| QueueError::Spawn {
            command: shown.clone(),
            source,
        })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(QueueError::Command {
            command: shown,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Submits one batch job per node of a campaign
pub struct SlurmExecutor<'a> {
    config: &'a CampaignConfig,
    store: ParamStore,
    entry_point: String,
}

impl<'a> SlurmExecutor<'a> {
    pub fn load(config: &'a CampaignConfig, entry_point: impl Into<String>) -> Self {
        Self {
            config,
            store: ParamStore::new(config.files()),
            entry_point: config
                .queue
                .entry_point
                .clone()
                .unwrap_or_else(|| entry_point.into()),
        }
    }

    /// submit every node, the queue id record is started afresh
    #[instrument(skip(self), level = "info")]
    pub fn submit_all(&self) -> Result<Vec<QueueJob>, QueueError> {
        // refuse before the first submission rather than leaving held jobs behind
        params::check_representable(self.config)?;

        let record = self.config.files().queue_ids();
        fs::write(&record, "").map_err(|source| QueueError::Write {
            path: record.clone(),
            source,
        })?;

        let jobs = (0..self.config.num_nodes)
            .map(|node| self.submit_node(node))
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            jobs = jobs.iter().map(|job| job.queue_id).join(","),
            "Submitted campaign"
        );

        Ok(jobs)
    }

    pub fn submit_node(&self, node: usize) -> Result<QueueJob, QueueError> {
        let files = self.config.files();
        let script = files.queue_script(node);
        let write_error = |path: &PathBuf| {
            let path = path.clone();
            move |source: std::io::Error| QueueError::Write { path, source }
        };

        fs::write(&script, generate(self.config, node, &self.entry_point))
            .map_err(write_error(&script))?;

        let output = run_queue_command(&self.config.queue.submit, &script.to_string_lossy())?;
        let queue_id = parse_job_id(&output)?;

        self.store.persist(
            &Snapshot {
                node: Some(node),
                campaign: self.config.clone(),
            },
            JobKey::Queued(queue_id),
        )?;

        let record = files.queue_ids();
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&record)
            .and_then(|mut file| file.write_all(format!("{queue_id} {node}\n").as_bytes()))
            .map_err(write_error(&record))?;

        if !self.config.queue.release.is_empty() {
            run_queue_command(&self.config.queue.release, &queue_id.to_string())?;
        }

        info!(queue_id, node, "Queued node");

        Ok(QueueJob {
            queue_id,
            node,
            script,
        })
    }
}
