//! Seams for the caller supplied parts of a campaign.
//!
//! A campaign needs three collaborators it knows nothing about: a specializer that derives
//! the parameters of one simulation, a renderer that turns them into the worker's input and
//! a post-processing step that runs once after every simulation finished. Server mode adds a
//! responder that answers the worker's requests. Closures implement every trait, the
//! structs below are the defaults the `simcamp` binary builds from a campaign file.

use crate::{
    config::CampaignConfig,
    params::SimParams,
    runner::responder::CommandResponder,
};
use serde_yaml::Value;
use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum HookError {
    #[error("Template references unknown parameter '{0}'")]
    UnknownKey(String),
    #[error("Template has an unbalanced brace at byte {0}")]
    UnbalancedBrace(usize),
    #[error("Failed to access {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to spawn hook command {0}")]
    Spawn(String, #[source] std::io::Error),
    #[error("Hook command {command} failed with {status}")]
    Command { command: String, status: String },
    #[error("Hook command timed out")]
    Timeout,
    #[error("Lost the output of a hook command")]
    OutputLost,
}

/// Derive the parameters of one simulation, must not depend on anything but its input
pub trait Specialize: Sync {
    fn specialize(&self, params: SimParams) -> SimParams;
}

/// Write the worker input for one simulation to `path`
pub trait RenderInput: Sync {
    fn render(&self, params: &SimParams, path: &Path) -> Result<(), HookError>;
}

/// Analysis run once after the whole campaign completed
pub trait PostProcess: Sync {
    fn post_process(&self, config: &CampaignConfig) -> Result<(), HookError>;
}

/// Answer a single request of a worker running in server mode
pub trait Responder: Sync {
    fn respond(&self, sim: usize, request: &str) -> Result<String, HookError>;
}

impl<F> Specialize for F
where
    F: Fn(SimParams) -> SimParams + Sync,
{
    fn specialize(&self, params: SimParams) -> SimParams {
        self(params)
    }
}

impl<F> RenderInput for F
where
    F: Fn(&SimParams, &Path) -> Result<(), HookError> + Sync,
{
    fn render(&self, params: &SimParams, path: &Path) -> Result<(), HookError> {
        self(params, path)
    }
}

impl<F> PostProcess for F
where
    F: Fn(&CampaignConfig) -> Result<(), HookError> + Sync,
{
    fn post_process(&self, config: &CampaignConfig) -> Result<(), HookError> {
        self(config)
    }
}

impl<F> Responder for F
where
    F: Fn(usize, &str) -> Result<String, HookError> + Sync,
{
    fn respond(&self, sim: usize, request: &str) -> Result<String, HookError> {
        self(sim, request)
    }
}

/// All collaborators of a campaign
pub struct Hooks {
    pub specialize: Box<dyn Specialize>,
    pub render: Box<dyn RenderInput>,
    pub post_process: Box<dyn PostProcess>,
    pub responder: Option<Box<dyn Responder>>,
}

impl Hooks {
    /// build the default hooks described by a campaign file
    pub fn from_config(config: &CampaignConfig) -> Result<Self, HookError> {
        let specialize: Box<dyn Specialize> = if config.sweep.is_empty() {
            Box::new(Unchanged)
        } else {
            Box::new(Sweep::new(config))
        };

        let render: Box<dyn RenderInput> = match config.template {
            Some(ref path) => Box::new(TemplateRenderer::load(path)?),
            None => Box::new(KeyValueRenderer),
        };

        let post_process: Box<dyn PostProcess> = match config.post_process {
            Some(ref command) => Box::new(CommandPostProcess::new(command.clone())),
            None => Box::new(NoPostProcess),
        };

        let responder = config.server.as_ref().and_then(|server| {
            CommandResponder::new(
                &server.responder,
                Duration::from_millis(server.responder_timeout_ms),
            )
            .map(|responder| Box::new(responder) as Box<dyn Responder>)
        });

        Ok(Self {
            specialize,
            render,
            post_process,
            responder,
        })
    }
}

/// Keep the derived parameters as they are
pub struct Unchanged;

impl Specialize for Unchanged {
    fn specialize(&self, params: SimParams) -> SimParams {
        params
    }
}

/// Pick the value of every swept key at the index of the simulation
pub struct Sweep {
    values: Vec<(String, Vec<Value>)>,
}

impl Sweep {
    pub fn new(config: &CampaignConfig) -> Self {
        Self {
            values: config
                .sweep
                .iter()
                .map(|(key, values)| (key.clone(), values.clone()))
                .collect(),
        }
    }
}

impl Specialize for Sweep {
    fn specialize(&self, params: SimParams) -> SimParams {
        let sim = params.sim;

        self.values
            .iter()
            .fold(params, |params, (key, values)| match values.get(sim) {
                Some(value) => params.with(key.clone(), value.clone()),
                None => params,
            })
    }
}

/// format a value the way it appears in rendered text
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::String(text) => text.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Render a template where `{key}` is replaced by the parameter `key`, `{{` and `}}` escape braces
#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    template: String,
}

impl TemplateRenderer {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, HookError> {
        fs::read_to_string(path)
            .map(Self::new)
            .map_err(|source| HookError::Io {
                path: path.to_path_buf(),
                source,
            })
    }

    pub fn fill(&self, params: &SimParams) -> Result<String, HookError> {
        let mut output = String::with_capacity(self.template.len());
        let mut chars = self.template.char_indices().peekable();

        while let Some((position, c)) = chars.next() {
            match c {
                '{' if matches!(chars.peek(), Some((_, '{'))) => {
                    chars.next();
                    output.push('{');
                }
                '}' if matches!(chars.peek(), Some((_, '}'))) => {
                    chars.next();
                    output.push('}');
                }
                '{' => {
                    let mut key = String::new();
                    loop {
                        match chars.next() {
                            Some((_, '}')) => break,
                            Some((_, c)) => key.push(c),
                            None => return Err(HookError::UnbalancedBrace(position)),
                        }
                    }

                    match params.get(&key) {
                        Some(value) => output.push_str(&display_value(value)),
                        None => return Err(HookError::UnknownKey(key)),
                    }
                }
                '}' => return Err(HookError::UnbalancedBrace(position)),
                c => output.push(c),
            }
        }

        Ok(output)
    }
}

impl RenderInput for TemplateRenderer {
    fn render(&self, params: &SimParams, path: &Path) -> Result<(), HookError> {
        let text = self.fill(params)?;

        fs::write(path, text).map_err(|source| HookError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Write one `key value` line per parameter
pub struct KeyValueRenderer;

impl RenderInput for KeyValueRenderer {
    fn render(&self, params: &SimParams, path: &Path) -> Result<(), HookError> {
        let text: String = params
            .values()
            .iter()
            .map(|(key, value)| format!("{key} {}\n", display_value(value)))
            .collect();

        fs::write(path, text).map_err(|source| HookError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Run a command in the campaign directory once the campaign is complete
#[derive(Debug, Clone)]
pub struct CommandPostProcess {
    command: Vec<String>,
}

impl CommandPostProcess {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl PostProcess for CommandPostProcess {
    fn post_process(&self, config: &CampaignConfig) -> Result<(), HookError> {
        let Some((program, args)) = self.command.split_first() else {
            return Ok(());
        };

        info!(command = ?self.command, "Running post-processing");

        let status = Command::new(program)
            .args(args)
            .current_dir(&config.directory)
            .env("SIMCAMP_PREFIX", &config.prefix)
            .env("SIMCAMP_NUM_SIMS", config.num_sims.to_string())
            .status()
            .map_err(|error| HookError::Spawn(program.clone(), error))?;

        if status.success() {
            debug!("Post-processing finished");
            Ok(())
        } else {
            Err(HookError::Command {
                command: self.command.join(" "),
                status: status.to_string(),
            })
        }
    }
}

/// Post-processing for campaigns that have none
pub struct NoPostProcess;

impl PostProcess for NoPostProcess {
    fn post_process(&self, config: &CampaignConfig) -> Result<(), HookError> {
        info!(prefix = config.prefix, "Campaign complete, no post-processing configured");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SimParams {
        let config: CampaignConfig = serde_yaml::from_str(
            "prefix: lj\nnum_nodes: 1\nprocs_per_node: 2\nnum_sims: 2\n\
             worker:\n  exec: /bin/true\n  restart_exec: /bin/true\n\
             seed: 99\nparams:\n  beta: 1.5\n  fstprt: lj.fstprt\n\
             sweep:\n  density: [0.1, 0.2]\n",
        )
        .unwrap();

        Sweep::new(&config).specialize(SimParams::derive(&config, 0, 1))
    }

    #[test]
    fn sweep_picks_the_value_of_the_sim() {
        assert_eq!(params().get("density"), Some(&Value::from(0.2)));
    }

    #[test]
    fn template_fills_keys_and_escapes() {
        let renderer = TemplateRenderer::new(
            "RandomMT19937 seed {seed}\nThermoParams beta {beta}\nLog output_file {prefix}{sim}.csv\n{{literal}}\n",
        );

        assert_eq!(
            renderer.fill(&params()).unwrap(),
            "RandomMT19937 seed 99\nThermoParams beta 1.5\nLog output_file lj1.csv\n{literal}\n"
        );
    }

    #[test]
    fn template_reports_unknown_keys() {
        let renderer = TemplateRenderer::new("Potential {missing}");

        assert!(matches!(
            renderer.fill(&params()),
            Err(HookError::UnknownKey(key)) if key == "missing"
        ));
    }

    #[test]
    fn template_reports_unbalanced_braces() {
        assert!(matches!(
            TemplateRenderer::new("seed {seed").fill(&params()),
            Err(HookError::UnbalancedBrace(5))
        ));
        assert!(matches!(
            TemplateRenderer::new("seed }").fill(&params()),
            Err(HookError::UnbalancedBrace(5))
        ));
    }

    #[test]
    fn key_value_renderer_writes_every_param() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.txt");

        KeyValueRenderer.render(&params(), &path).unwrap();
        let text = fs::read_to_string(&path).unwrap();

        assert!(text.contains("beta 1.5\n"));
        assert!(text.contains("sim 1\n"));
        assert!(text.contains("density 0.2\n"));
    }

    #[test]
    fn closures_are_hooks() {
        let specialize = |params: SimParams| params.with("beta", Value::from(3.0));
        let hook: &dyn Specialize = &specialize;

        assert_eq!(hook.specialize(params()).get("beta"), Some(&Value::from(3.0)));
    }
}
