use itertools::Itertools;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// suffix of the marker claimed by the single post-processing owner
pub const CLAIM_SUFFIX: &str = ".claimed";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Failed to access ledger file {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How a ledger line is matched against a simulation index
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Matching {
    /// a line records an index only if it parses to exactly that index
    #[default]
    Exact,
    /// a line records every index whose decimal form it contains, so "10" also counts as "1"
    Containment,
}

/// Append-only record of finished simulations, shared by every node of a campaign
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    claim: PathBuf,
    matching: Matching,
    // serializes appends of this process, other processes rely on O_APPEND
    writer: Mutex<()>,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>, matching: Matching) -> Self {
        let path = path.into();
        let mut claim = path.clone().into_os_string();
        claim.push(CLAIM_SUFFIX);

        Self {
            path,
            claim: PathBuf::from(claim),
            matching,
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn claim_path(&self) -> &Path {
        &self.claim
    }

    fn io_error(&self, path: &Path) -> impl FnOnce(std::io::Error) -> LedgerError {
        let path = path.to_path_buf();
        move |source| LedgerError::Io { path, source }
    }

    /// start a new campaign: empty ledger, no post-processing owner
    pub fn reset(&self) -> Result<(), LedgerError> {
        let _guard = self.writer.lock();

        fs::write(&self.path, "").map_err(self.io_error(&self.path))?;
        match fs::remove_file(&self.claim) {
            Ok(()) => debug!(claim = ?self.claim, "Released stale post-processing claim"),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => return Err(self.io_error(&self.claim)(error)),
        }

        info!(ledger = ?self.path, "Cleared completion ledger");

        Ok(())
    }

    /// append a finished simulation, recording the same index twice is harmless
    pub fn record(&self, sim: usize) -> Result<(), LedgerError> {
        let _guard = self.writer.lock();

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(self.io_error(&self.path))?;
        // a single write keeps concurrent appends from interleaving
        file.write_all(format!("{sim}\n").as_bytes())
            .map_err(self.io_error(&self.path))?;

        debug!(sim, ledger = ?self.path, "Recorded finished simulation");

        Ok(())
    }

    pub fn is_campaign_complete(&self, num_sims: usize) -> Result<bool, LedgerError> {
        is_campaign_complete(&self.path, num_sims, self.matching)
    }

    pub fn missing(&self, num_sims: usize) -> Result<Vec<usize>, LedgerError> {
        missing(&self.path, num_sims, self.matching)
    }

    /// Claim the single post-processing run of the campaign.
    ///
    /// The claim is an exclusive create of the marker next to the ledger, so among any
    /// number of concurrent callers, across processes, exactly one receives `true`. The
    /// owner then removes the ledger, which tells queued jobs that the campaign is over.
    pub fn trigger_post_process_once(&self) -> Result<bool, LedgerError> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.claim)
        {
            Ok(_) => {}
            Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                debug!(claim = ?self.claim, "Post-processing already claimed");
                return Ok(false);
            }
            Err(error) => return Err(self.io_error(&self.claim)(error)),
        }

        let _guard = self.writer.lock();
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(error) if error.kind() == ErrorKind::NotFound => {
                warn!(ledger = ?self.path, "Ledger vanished before the post-processing owner removed it");
            }
            Err(error) => return Err(self.io_error(&self.path)(error)),
        }

        info!(ledger = ?self.path, "Claimed post-processing");

        Ok(true)
    }
}

/// read the ledger lines, a missing ledger reads as empty
fn read_lines(path: &Path) -> Result<Vec<String>, LedgerError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content.lines().map(str::to_owned).collect_vec()),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(source) => Err(LedgerError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// indices of `[0, num_sims)` not yet recorded in the ledger at `path`
pub fn missing(path: &Path, num_sims: usize, matching: Matching) -> Result<Vec<usize>, LedgerError> {
    let lines = read_lines(path)?;

    Ok(match matching {
        Matching::Exact => {
            let recorded: BTreeSet<usize> = lines
                .iter()
                .filter_map(|line| line.trim().parse().ok())
                .collect();

            (0..num_sims).filter(|sim| !recorded.contains(sim)).collect_vec()
        }
        Matching::Containment => (0..num_sims)
            .filter(|sim| {
                let needle = sim.to_string();
                !lines.iter().any(|line| line.contains(&needle))
            })
            .collect_vec(),
    })
}

/// true iff every index in `[0, num_sims)` is recorded, a missing ledger is never complete
pub fn is_campaign_complete(
    path: &Path,
    num_sims: usize,
    matching: Matching,
) -> Result<bool, LedgerError> {
    if !path.is_file() {
        return Ok(false);
    }

    Ok(missing(path, num_sims, matching)?.is_empty())
}
