use crate::config::{CampaignConfig, CampaignFiles};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{BufReader, Write},
    path::PathBuf,
};
use thiserror::Error;
use tracing::{debug, error};

/// seed value requesting a random seed per simulation
pub const SEED_SENTINEL: i64 = -1;
/// exclusive upper bound for drawn seeds
pub const SEED_BOUND: i64 = 1_000_000_000;

pub type Params = BTreeMap<String, Value>;

#[derive(Error, Debug)]
pub enum ParamStoreError {
    #[error("{path} cannot be serialized: {reason}")]
    Serialization { path: String, reason: String },
    #[error("Failed to encode parameter snapshot")]
    Encode(#[from] serde_json::Error),
    #[error("Failed to access parameter snapshot {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Everything a queued or resumed node needs to rebuild its configuration
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Snapshot {
    pub node: Option<usize>,
    pub campaign: CampaignConfig,
}

/// Key of a persisted snapshot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobKey {
    /// direct invocation without a queue
    Local,
    /// job id handed out by the batch scheduler
    Queued(u64),
}

#[derive(Clone, Debug)]
pub struct ParamStore {
    files: CampaignFiles,
}

impl ParamStore {
    pub fn new(files: CampaignFiles) -> Self {
        Self { files }
    }

    pub fn path(&self, key: JobKey) -> PathBuf {
        match key {
            JobKey::Local => self.files.local_params(),
            JobKey::Queued(queue_id) => self.files.queued_params(queue_id),
        }
    }

    /// write a snapshot, failing before anything touches disk if a value is not representable
    pub fn persist(&self, snapshot: &Snapshot, key: JobKey) -> Result<PathBuf, ParamStoreError> {
        check_representable(&snapshot.campaign)?;

        let path = self.path(key);
        let encoded = serde_json::to_string_pretty(snapshot)?;
        let io_error = |source| ParamStoreError::Io {
            path: path.clone(),
            source,
        };

        // write to a sibling and rename so a reader never sees a partial snapshot
        let staging = path.with_extension("json.tmp");
        let mut file = File::create(&staging).map_err(io_error)?;
        file.write_all(encoded.as_bytes()).map_err(io_error)?;
        file.sync_all().map_err(io_error)?;
        fs::rename(&staging, &path).map_err(io_error)?;

        debug!(path = ?path, "Persisted parameter snapshot");

        Ok(path)
    }

    pub fn reload(&self, key: JobKey) -> Result<Snapshot, ParamStoreError> {
        let path = self.path(key);
        let file = File::open(&path).map_err(|source| ParamStoreError::Io {
            path: path.clone(),
            source,
        })?;

        match serde_json::from_reader(BufReader::new(file)) {
            Ok(snapshot) => Ok(snapshot),
            Err(error) => {
                error!(error = ?error, path = ?path, "Failed to decode parameter snapshot");

                Err(error.into())
            }
        }
    }
}

/// ensure every free-form value of the campaign survives a json round trip unchanged
pub fn check_representable(config: &CampaignConfig) -> Result<(), ParamStoreError> {
    for (key, value) in config.params.iter() {
        check_value(&format!("params.{key}"), value)?;
    }

    for (key, values) in config.sweep.iter() {
        for (sim, value) in values.iter().enumerate() {
            check_value(&format!("sweep.{key}[{sim}]"), value)?;
        }
    }

    Ok(())
}

fn check_value(path: &str, value: &Value) -> Result<(), ParamStoreError> {
    let fail = |reason: &str| -> Result<(), ParamStoreError> {
        Err(ParamStoreError::Serialization {
            path: path.to_string(),
            reason: reason.to_string(),
        })
    };

    match value {
        Value::Null | Value::Bool(_) | Value::String(_) => Ok(()),
        Value::Number(number) => match number.as_f64() {
            Some(float) if !float.is_finite() => fail("non-finite numbers have no json form"),
            _ => Ok(()),
        },
        Value::Sequence(values) => values
            .iter()
            .enumerate()
            .try_for_each(|(index, value)| check_value(&format!("{path}[{index}]"), value)),
        Value::Mapping(mapping) => mapping.iter().try_for_each(|(key, value)| match key {
            Value::String(key) => check_value(&format!("{path}.{key}"), value),
            _ => fail("mapping keys must be strings"),
        }),
        Value::Tagged(_) => fail("tagged values have no json form"),
    }
}

/// Parameters of a single simulation, derived from the immutable campaign configuration
#[derive(Clone, Debug, PartialEq)]
pub struct SimParams {
    pub node: usize,
    pub sim: usize,
    values: Params,
}

impl SimParams {
    /// merge campaign scalars, free-form params and sim/node into a fresh value
    pub fn derive(config: &CampaignConfig, node: usize, sim: usize) -> Self {
        let mut values = config.params.clone();

        values.insert("prefix".into(), Value::from(config.prefix.as_str()));
        values.insert("num_nodes".into(), Value::from(config.num_nodes as u64));
        values.insert("num_sims".into(), Value::from(config.num_sims as u64));
        values.insert("procs_per_node".into(), Value::from(config.procs_per_node as u64));
        values.insert("procs_per_sim".into(), Value::from(config.procs_per_sim as u64));
        values.insert("minutes".into(), Value::from(config.minutes));
        values.insert("seed".into(), Value::from(config.seed));
        values.insert("node".into(), Value::from(node as u64));
        values.insert("sim".into(), Value::from(sim as u64));

        Self { node, sim, values }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn values(&self) -> &Params {
        &self.values
    }

    /// return a copy with one value replaced
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn seed(&self) -> Option<i64> {
        self.values.get("seed").and_then(Value::as_i64)
    }

    /// replace the seed sentinel with a drawn seed, any other seed is kept
    pub fn resolve_seed<R: Rng>(self, rng: &mut R) -> Self {
        match self.seed() {
            Some(SEED_SENTINEL) => {
                let seed = rng.gen_range(0..SEED_BOUND);
                self.with("seed", Value::from(seed))
            }
            _ => self,
        }
    }
}
