use crate::{
    config::CampaignConfig,
    executors::{
        local::{LocalExecutor, NodeReport},
        slurm::{QueueError, QueueJob, SlurmExecutor},
        ExecutorError,
    },
    hooks::{HookError, Hooks},
    ledger::{Ledger, LedgerError},
    params::{JobKey, ParamStore, ParamStoreError, Snapshot},
    partition::node_range,
    runner::RunMode,
};
use clap::ValueEnum;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Node {node} does not exist in a campaign of {num_nodes} nodes")]
    NodeOutOfRange { node: usize, num_nodes: usize },
    #[error("Parameter store failed")]
    Params(#[from] ParamStoreError),
    #[error("Completion ledger failed")]
    Ledger(#[from] LedgerError),
    #[error("Local execution failed")]
    Executor(#[from] ExecutorError),
    #[error("Queue submission failed")]
    Queue(#[from] QueueError),
    #[error("Post-processing failed")]
    PostProcess(#[from] HookError),
    #[error("Failed to rebuild the hooks of the persisted campaign")]
    Hooks(#[source] HookError),
}

/// Builds the hooks of a campaign, used again when a queued job reloads its snapshot
pub type HookFactory = Box<dyn Fn(&CampaignConfig) -> Result<Hooks, HookError> + Sync>;

/// What a single invocation of the orchestrator should do
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunType {
    /// run one node's simulations on this machine
    #[value(name = "0")]
    Run,
    /// submit one batch job per node
    #[value(name = "1")]
    Submit,
    /// only run the post-processing
    #[value(name = "2")]
    PostProcess,
}

/// Fixed for the lifetime of a process by the scheduler's attempt number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Fresh,
    Restarted { attempt: u32 },
}

impl AttemptState {
    pub fn from_queue_task(queue_task: u32) -> Self {
        match queue_task {
            0 => Self::Fresh,
            attempt => Self::Restarted { attempt },
        }
    }

    pub fn mode(&self) -> RunMode {
        match self {
            Self::Fresh => RunMode::Fresh,
            Self::Restarted { .. } => RunMode::Restart,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invocation {
    pub run_type: RunType,
    pub node: usize,
    /// scheduler job id, `None` when invoked directly
    pub queue_id: Option<u64>,
    pub queue_task: u32,
}

/// Result of a dispatched invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Node(NodeReport),
    Submitted(Vec<QueueJob>),
    PostProcessed,
}

impl Completion {
    /// process exit code: 1 if any assigned simulation failed
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Node(report) if !report.all_succeeded() => 1,
            _ => 0,
        }
    }
}

/// Configuration a node runs with
struct NodeSetup {
    config: CampaignConfig,
    node: usize,
    // the configuration came from a persisted snapshot
    reloaded: bool,
}

pub struct Controller {
    config: CampaignConfig,
    hooks: Hooks,
    factory: Option<HookFactory>,
    entry_point: String,
}

impl Controller {
    /// controller with fixed hooks, queued jobs keep them after reloading their snapshot
    pub fn new(config: CampaignConfig, hooks: Hooks, entry_point: impl Into<String>) -> Self {
        Self {
            config,
            hooks,
            factory: None,
            entry_point: entry_point.into(),
        }
    }

    /// controller whose hooks follow the campaign, queued jobs rebuild them from their snapshot
    pub fn with_factory(
        config: CampaignConfig,
        factory: HookFactory,
        entry_point: impl Into<String>,
    ) -> Result<Self, HookError> {
        let hooks = factory(&config)?;

        Ok(Self {
            config,
            hooks,
            factory: Some(factory),
            entry_point: entry_point.into(),
        })
    }

    pub fn dispatch(&self, invocation: Invocation) -> Result<Completion, ControllerError> {
        match invocation.run_type {
            RunType::Run => self.run_node(invocation).map(Completion::Node),
            RunType::Submit => self.submit().map(Completion::Submitted),
            RunType::PostProcess => {
                self.hooks.post_process.post_process(&self.config)?;
                Ok(Completion::PostProcessed)
            }
        }
    }

    /// clear the ledger and queue every node
    pub fn submit(&self) -> Result<Vec<QueueJob>, ControllerError> {
        let ledger = Ledger::new(self.config.files().ledger(), self.config.ledger.matching);
        ledger.reset()?;

        Ok(SlurmExecutor::load(&self.config, self.entry_point.as_str()).submit_all()?)
    }

    /// resolve the configuration the node runs with, preparing a fresh local campaign
    fn node_config(&self, invocation: Invocation) -> Result<NodeSetup, ControllerError> {
        let state = AttemptState::from_queue_task(invocation.queue_task);
        let store = ParamStore::new(self.config.files());

        match (invocation.queue_id, state) {
            (Some(queue_id), AttemptState::Fresh) => {
                let snapshot = store.reload(JobKey::Queued(queue_id))?;
                let node = match snapshot.node {
                    Some(node) if node != invocation.node => {
                        warn!(
                            queue_id,
                            persisted = node,
                            requested = invocation.node,
                            "Node differs from the persisted job, using the persisted node"
                        );
                        node
                    }
                    Some(node) => node,
                    None => invocation.node,
                };
                info!(queue_id, node, "Reloaded queued parameters");

                Ok(NodeSetup {
                    config: snapshot.campaign,
                    node,
                    reloaded: true,
                })
            }
            // restarts resume from checkpoints and never rebuild their parameters
            (_, AttemptState::Restarted { .. }) => {
                Ok(NodeSetup {
                    config: self.config.clone(),
                    node: invocation.node,
                    reloaded: false,
                })
            }
            (None, AttemptState::Fresh) => {
                Ledger::new(self.config.files().ledger(), self.config.ledger.matching).reset()?;
                store.persist(
                    &Snapshot {
                        node: Some(invocation.node),
                        campaign: self.config.clone(),
                    },
                    JobKey::Local,
                )?;

                Ok(NodeSetup {
                    config: self.config.clone(),
                    node: invocation.node,
                    reloaded: false,
                })
            }
        }
    }

    /// run every simulation assigned to one node
    pub fn run_node(&self, invocation: Invocation) -> Result<NodeReport, ControllerError> {
        let state = AttemptState::from_queue_task(invocation.queue_task);
        let NodeSetup {
            config,
            node,
            reloaded,
        } = self.node_config(invocation)?;

        // hooks built from the live config file must not leak into a reloaded campaign
        let rebuilt = match self.factory {
            Some(ref factory) if reloaded => Some(factory(&config).map_err(ControllerError::Hooks)?),
            _ => None,
        };
        let hooks = rebuilt.as_ref().unwrap_or(&self.hooks);

        let sims = node_range(config.num_sims, config.num_nodes, node).ok_or(
            ControllerError::NodeOutOfRange {
                node,
                num_nodes: config.num_nodes,
            },
        )?;

        info!(node, ?state, sims = ?sims, "Running node");

        let ledger = Ledger::new(config.files().ledger(), config.ledger.matching);
        let report = LocalExecutor::load(&config, hooks, &ledger).execute(
            node,
            sims,
            state.mode(),
        )?;

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_counter_selects_state() {
        assert_eq!(AttemptState::from_queue_task(0), AttemptState::Fresh);
        assert_eq!(
            AttemptState::from_queue_task(3),
            AttemptState::Restarted { attempt: 3 }
        );
        assert_eq!(AttemptState::Fresh.mode(), RunMode::Fresh);
        assert_eq!(
            AttemptState::Restarted { attempt: 1 }.mode(),
            RunMode::Restart
        );
    }

    #[test]
    fn run_type_parses_numbers() {
        assert_eq!(RunType::from_str("0", false).unwrap(), RunType::Run);
        assert_eq!(RunType::from_str("1", false).unwrap(), RunType::Submit);
        assert_eq!(RunType::from_str("2", false).unwrap(), RunType::PostProcess);
        assert!(RunType::from_str("3", false).is_err());
    }

    #[test]
    fn failed_sims_exit_nonzero() {
        let mut report = NodeReport::default();
        report
            .outcomes
            .insert(0, crate::runner::AttemptOutcome::Success);
        assert_eq!(Completion::Node(report.clone()).exit_code(), 0);

        report
            .outcomes
            .insert(1, crate::runner::AttemptOutcome::Failed { code: Some(1) });
        assert_eq!(Completion::Node(report).exit_code(), 1);
        assert_eq!(Completion::PostProcessed.exit_code(), 0);
    }
}
