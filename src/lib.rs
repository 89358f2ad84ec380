pub mod agent;
pub mod browser;
pub mod computer;
pub mod config;
pub mod cua;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod retry;
pub mod scaler;

pub use agent::{Agent, ToolHandler};
pub use browser::{BrowserConfig, ChromiumComputer};
pub use computer::{Action, Computer, Dimensions, DryRunComputer, MouseButton, Point};
pub use config::Config;
pub use cua::{CuaClient, Endpoint, ResponsesApi, SafetyCheck, Turn};
pub use error::{AgentError, ModelError, Result};
pub use orchestrator::{AbortReason, Orchestrator, OrchestratorConfig, RunOutcome, RunStatus};
pub use retry::RetryPolicy;
pub use scaler::Scaler;
