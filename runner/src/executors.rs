pub mod local;
pub mod slurm;

use crate::{hooks::HookError, ledger::LedgerError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to build the simulation pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Completion ledger failed")]
    Ledger(#[from] LedgerError),
    #[error("Post-processing failed")]
    PostProcess(#[source] HookError),
    #[error("Simulation pool panicked")]
    Panicked,
}
