use anyhow::Result;
use cua_driver::orchestrator::AllowAllPolicy;
use cua_driver::{
    logging, Agent, BrowserConfig, ChromiumComputer, Config, CuaClient, Orchestrator,
    OrchestratorConfig, Scaler, ToolHandler,
};
use serde_json::json;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("info");
    let cfg = Config::load()?;

    let computer = ChromiumComputer::launch(BrowserConfig {
        headless: false,
        ..Default::default()
    })
    .await?;
    computer.open_url("https://www.bing.com").await?;

    let mut agent = Agent::new(
        CuaClient::new(cfg.endpoint()?),
        cfg.model.clone(),
        Scaler::new(computer, cfg.scale_size()),
    )
    .with_retry_policy(cfg.retry_policy());

    agent.register_tool(
        "current_time",
        json!({
            "description": "Returns the current UNIX time in seconds.",
            "type": "object",
            "properties": {}
        }),
        ToolHandler::sync(|_| {
            let secs = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            Ok(json!({ "unix_seconds": secs }))
        }),
    );
    agent.register_tool(
        "pause",
        json!({
            "description": "Waits for the given number of milliseconds.",
            "type": "object",
            "properties": { "ms": { "type": "integer" } },
            "required": ["ms"]
        }),
        ToolHandler::from_async(|args| async move {
            let ms = args.get("ms").and_then(|v| v.as_u64()).unwrap_or(500);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!({ "slept_ms": ms }))
        }),
    );

    let orchestrator = Orchestrator::new(
        OrchestratorConfig {
            max_actions: 20,
            autoplay: true,
            action_delay: Duration::from_millis(500),
            ..Default::default()
        },
        AllowAllPolicy,
    );
    let outcome = orchestrator
        .run(
            &mut agent,
            "Search for the weather in Seattle and tell me the forecast for tomorrow.",
        )
        .await;

    println!("{}", outcome.summary);
    for step in &outcome.steps {
        for message in &step.messages {
            println!("step {}: {message}", step.step);
        }
    }
    Ok(())
}
