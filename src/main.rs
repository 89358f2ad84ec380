use anyhow::{Context, Result};
use cua_driver::orchestrator::{AllowAllPolicy, DiskSnapshotStore, TerminalConsent};
use cua_driver::{
    logging, Agent, BrowserConfig, ChromiumComputer, Computer, Config, CuaClient, Dimensions,
    DryRunComputer, Orchestrator, RunOutcome, RunStatus, Scaler,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

const DEFAULT_INSTRUCTIONS: &str = "Take a screenshot and describe what is on the screen.";

async fn run_with<C: Computer>(cfg: &Config, computer: C, instructions: &str) -> Result<RunOutcome> {
    let client = CuaClient::new(cfg.endpoint()?);
    let computer = Scaler::new(computer, cfg.scale_size());
    let mut agent = Agent::new(client, cfg.model.clone(), computer)
        .with_parallel_tool_calls(cfg.parallel_tool_calls)
        .with_retry_policy(cfg.retry_policy());

    let store = Arc::new(DiskSnapshotStore::new(std::env::temp_dir().join("cua-driver-runs")));
    let outcome = if cfg.autoplay {
        let orchestrator = Orchestrator::new(cfg.orchestrator(), AllowAllPolicy).with_snapshot_store(store);
        watch_ctrl_c(orchestrator.stop_handle());
        orchestrator.run(&mut agent, instructions).await
    } else {
        let orchestrator = Orchestrator::new(cfg.orchestrator(), TerminalConsent).with_snapshot_store(store);
        watch_ctrl_c(orchestrator.stop_handle());
        orchestrator.run(&mut agent, instructions).await
    };
    Ok(outcome)
}

fn watch_ctrl_c(stop: Arc<std::sync::atomic::AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current step");
            stop.store(true, Ordering::Relaxed);
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::load().context("failed to load configuration")?;
    logging::init(&cfg.log_level);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let instructions = if args.is_empty() {
        std::env::var("CUA_INSTRUCTIONS").unwrap_or_else(|_| DEFAULT_INSTRUCTIONS.to_string())
    } else {
        args.join(" ")
    };
    info!(model = %cfg.model, dry_run = cfg.dry_run, "starting: {instructions}");

    let outcome = if cfg.dry_run {
        let computer = DryRunComputer::new(Dimensions::new(1920, 1080));
        run_with(&cfg, computer, &instructions).await?
    } else {
        let computer = ChromiumComputer::launch(BrowserConfig {
            headless: cfg.headless,
            ..Default::default()
        })
        .await?;
        if let Some(url) = &cfg.start_url {
            computer.open_url(url).await?;
        }
        run_with(&cfg, computer, &instructions).await?
    };

    println!("{}", outcome.summary);
    if let Some(err) = &outcome.error {
        eprintln!("error: {err}");
    }
    if outcome.status == RunStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}
