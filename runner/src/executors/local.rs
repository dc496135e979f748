use super::ExecutorError;
use crate::{
    config::CampaignConfig,
    hooks::Hooks,
    ledger::Ledger,
    runner::{AttemptOutcome, RunMode, SimulationRunner},
};
use itertools::Itertools;
use rayon::ThreadPoolBuilder;
use std::{collections::BTreeMap, ops::Range, sync::mpsc, thread};
use tracing::{debug, error, info, instrument, warn};

/// What one node invocation achieved
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeReport {
    pub outcomes: BTreeMap<usize, AttemptOutcome>,
    /// this node ran the campaign's post-processing
    pub post_processed: bool,
}

impl NodeReport {
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.values().all(AttemptOutcome::is_success)
    }

    pub fn failed(&self) -> Vec<usize> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| !outcome.is_success())
            .map(|(sim, _)| *sim)
            .collect_vec()
    }
}

/// Executor that runs every simulation of a node on a local thread pool
///
/// Each pool thread supervises one worker process at a time. Results flow back over a
/// channel to the calling thread, which is the only writer of the ledger and decides
/// whether this node triggers post-processing.
pub struct LocalExecutor<'a> {
    config: &'a CampaignConfig,
    hooks: &'a Hooks,
    ledger: &'a Ledger,
    threads: usize,
}

impl<'a> LocalExecutor<'a> {
    /// create a new LocalExecutor instance sized to the simulations of one node
    pub fn load(config: &'a CampaignConfig, hooks: &'a Hooks, ledger: &'a Ledger) -> Self {
        Self {
            config,
            hooks,
            ledger,
            threads: config.sims_per_node().max(1),
        }
    }

    /// run all simulations of `sims`, waiting for every one of them even if some fail
    #[instrument(skip(self), level = "info")]
    pub fn execute(
        &self,
        node: usize,
        sims: Range<usize>,
        mode: RunMode,
    ) -> Result<NodeReport, ExecutorError> {
        debug!("Starting simulation pool with {} threads", self.threads);

        let pool = ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .thread_name(move |index| format!("node{node}-sim{index}"))
            .build()?;

        let runner = SimulationRunner::new(self.config, self.hooks);
        let total = sims.len();
        let (sender, receiver) = mpsc::channel::<(usize, AttemptOutcome)>();

        let mut report = NodeReport::default();
        let mut first_error = None;

        thread::scope(|scope| {
            let runner = &runner;
            let dispatcher = scope.spawn(move || {
                pool.scope(|tasks| {
                    for sim in sims {
                        let sender = sender.clone();

                        tasks.spawn(move |_| {
                            let outcome = match runner.run(node, sim, mode) {
                                Ok(outcome) => outcome,
                                Err(error) => {
                                    error!(sim, error = ?error, "Simulation could not be run");
                                    AttemptOutcome::Failed { code: None }
                                }
                            };

                            // the supervisor drains until every sender is gone
                            if sender.send((sim, outcome)).is_err() {
                                warn!(sim, "Supervisor stopped listening");
                            }
                        });
                    }
                });
            });

            for (sim, outcome) in receiver {
                report.outcomes.insert(sim, outcome);
                info!("Done with {}/{total}", report.outcomes.len());

                if !outcome.is_success() {
                    continue;
                }

                // keep draining after an error so no worker is orphaned
                if let Err(error) = self.settle(sim, &mut report) {
                    error!(sim, error = ?error, "Failed to settle finished simulation");
                    first_error.get_or_insert(error);
                }
            }

            if dispatcher.join().is_err() {
                first_error.get_or_insert(ExecutorError::Panicked);
            }
        });

        match first_error {
            Some(error) => Err(error),
            None => {
                info!(failed = ?report.failed(), "Done with processing");
                Ok(report)
            }
        }
    }

    /// record a finished simulation and post-process if it completed the campaign
    fn settle(&self, sim: usize, report: &mut NodeReport) -> Result<(), ExecutorError> {
        self.ledger.record(sim)?;

        if self.ledger.is_campaign_complete(self.config.num_sims)?
            && self.ledger.trigger_post_process_once()?
        {
            info!(sim, "Campaign complete, running post-processing");
            self.hooks
                .post_process
                .post_process(self.config)
                .map_err(ExecutorError::PostProcess)?;
            report.post_processed = true;
        }

        Ok(())
    }
}
