use clap::Parser;
use simcamp_runner::{
    config::CampaignConfig,
    controller::{Controller, Invocation, RunType},
    hooks::Hooks,
};
use std::{
    env,
    path::{Path, PathBuf},
    process::exit,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Launch, supervise and restart a campaign of checkpointable simulations
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// campaign description
    #[arg(short, long, default_value = "campaign.yaml")]
    config: PathBuf,
    /// 0: run locally, 1: submit to queue, 2: post-process
    #[arg(short = 'r', long = "run_type", value_enum, default_value = "0")]
    run_type: RunType,
    /// node index
    #[arg(long, default_value_t = 0)]
    node: usize,
    /// if != -1, read the parameters persisted for this job
    #[arg(long = "queue_id", default_value_t = -1, allow_negative_numbers = true)]
    queue_id: i64,
    /// if > 0, restart from checkpoint
    #[arg(long = "queue_task", default_value_t = 0)]
    queue_task: u32,
}

/// command a queued job uses to call back into this binary
fn entry_point(config: &Path) -> String {
    let exe = env::current_exe()
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_else(|_| String::from("simcamp"));
    let config = config
        .canonicalize()
        .unwrap_or_else(|_| config.to_path_buf());

    format!("{exe} --config {}", config.to_string_lossy())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match CampaignConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = ?e, "Failed to load {}: {e}", args.config.to_string_lossy());
            exit(1)
        }
    };

    if config.preflight_checks() {
        error!("Campaign {} failed the preflight checks", config.prefix);
        exit(1)
    }

    let invocation = Invocation {
        run_type: args.run_type,
        node: args.node,
        queue_id: u64::try_from(args.queue_id).ok(),
        queue_task: args.queue_task,
    };
    info!(?invocation, "Starting campaign {}", config.prefix);

    let callback = entry_point(&args.config);
    let controller = match Controller::with_factory(config, Box::new(Hooks::from_config), callback) {
        Ok(controller) => controller,
        Err(e) => {
            error!(error = ?e, "Failed to set up campaign hooks: {e}");
            exit(1)
        }
    };

    match controller.dispatch(invocation) {
        Ok(completion) => exit(completion.exit_code()),
        Err(e) => {
            error!(error = ?e, "Campaign invocation failed: {e}");
            exit(1)
        }
    }
}
