use async_trait::async_trait;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs as async_fs;
use tracing::{error, info, warn};

use crate::agent::Agent;
use crate::computer::{Action, Computer};
use crate::cua::{ResponsesApi, SafetyCheck};
use crate::error::{AgentError, Result};

// ========================= Outcome Types =========================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    LimitReached,
    ConsentDenied,
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Aborted(AbortReason),
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Approval {
    pub granted: bool,
    pub reason: Option<String>,
}

impl Approval {
    pub fn granted() -> Self {
        Self { granted: true, reason: None }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            granted: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StepLog {
    pub step: usize,
    pub reasoning: String,
    pub actions: Vec<Action>,
    pub messages: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub actions_taken: usize,
    pub summary: String,
    pub error: Option<String>,
    pub steps: Vec<StepLog>,
    /// PNG as the model last saw it; absent when the capture itself failed.
    pub final_screenshot: Option<Vec<u8>>,
}

// ========================= Pluggable Subsystems =========================

/// Human-in-the-loop or policy decision on whether pending work may run.
#[async_trait]
pub trait ConsentGate: Send + Sync {
    async fn approve_actions(&self, actions: &[Action]) -> Result<Approval>;
    async fn acknowledge_safety_checks(&self, checks: &[SafetyCheck]) -> Result<Approval>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, run_id: &str, label: &str, png: &[u8]) -> Result<()>;
}

#[derive(Clone, Copy, Debug)]
pub struct AllowAllPolicy;

#[async_trait]
impl ConsentGate for AllowAllPolicy {
    async fn approve_actions(&self, _actions: &[Action]) -> Result<Approval> {
        Ok(Approval::granted())
    }

    async fn acknowledge_safety_checks(&self, checks: &[SafetyCheck]) -> Result<Approval> {
        info!(checks = ?checks, "safety checks acknowledged by policy");
        Ok(Approval::granted())
    }
}

/// Asks on the terminal; an empty answer or `y` allows.
#[derive(Clone, Copy, Debug)]
pub struct TerminalConsent;

impl TerminalConsent {
    async fn ask(prompt: String) -> Result<bool> {
        let answer = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
            let mut stdout = std::io::stdout();
            write!(stdout, "{prompt} [Y/n] ")?;
            stdout.flush()?;
            let mut line = String::new();
            std::io::stdin().read_line(&mut line)?;
            Ok(line)
        })
        .await
        .map_err(|e| AgentError::Io(std::io::Error::other(e)))??;
        let answer = answer.trim().to_ascii_lowercase();
        Ok(answer.is_empty() || answer == "y" || answer == "yes")
    }
}

#[async_trait]
impl ConsentGate for TerminalConsent {
    async fn approve_actions(&self, actions: &[Action]) -> Result<Approval> {
        let kinds: Vec<&str> = actions.iter().map(Action::kind).collect();
        if Self::ask(format!("Run computer action(s) {kinds:?}?")).await? {
            Ok(Approval::granted())
        } else {
            Ok(Approval::denied("operator declined the action"))
        }
    }

    async fn acknowledge_safety_checks(&self, checks: &[SafetyCheck]) -> Result<Approval> {
        for check in checks {
            println!(
                "Safety check {}: {}",
                check.code.as_deref().unwrap_or(&check.id),
                check.message.as_deref().unwrap_or("")
            );
        }
        if Self::ask("Acknowledge and continue?".to_string()).await? {
            Ok(Approval::granted())
        } else {
            Ok(Approval::denied("operator did not acknowledge safety checks"))
        }
    }
}

pub struct DiskSnapshotStore {
    base_dir: PathBuf,
}

impl DiskSnapshotStore {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self { base_dir: base.as_ref().to_path_buf() }
    }
}

#[async_trait]
impl SnapshotStore for DiskSnapshotStore {
    async fn save(&self, run_id: &str, label: &str, png: &[u8]) -> Result<()> {
        let dir = self.base_dir.join(run_id);
        async_fs::create_dir_all(&dir).await?;
        async_fs::write(dir.join(format!("{label}.png")), png).await?;
        Ok(())
    }
}

// ========================= Orchestrator =========================

/// Computer actions plus function tool calls; what `max_actions` bounds.
fn work_done<C: Computer, M: ResponsesApi>(agent: &Agent<C, M>) -> usize {
    agent.executed_actions() + agent.executed_tool_calls()
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Budget for executed computer actions and function calls together.
    pub max_actions: usize,
    pub autoplay: bool,
    pub require_consent: bool,
    pub safety_checks_enabled: bool,
    /// Pause before each action after the first.
    pub action_delay: Duration,
    pub temperature: Option<f32>,
    /// How many failed actions per run are handed back to the model.
    pub max_recoveries: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_actions: 50,
            autoplay: false,
            require_consent: true,
            safety_checks_enabled: true,
            action_delay: Duration::from_secs(2),
            temperature: None,
            max_recoveries: 1,
        }
    }
}

pub struct Orchestrator<G: ConsentGate> {
    cfg: OrchestratorConfig,
    gate: G,
    stop: Arc<AtomicBool>,
    snapshot_store: Option<Arc<dyn SnapshotStore>>,
}

impl<G: ConsentGate> Orchestrator<G> {
    pub fn new(cfg: OrchestratorConfig, gate: G) -> Self {
        Self {
            cfg,
            gate,
            stop: Arc::new(AtomicBool::new(false)),
            snapshot_store: None,
        }
    }

    pub fn with_snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshot_store = Some(store);
        self
    }

    /// Setting the flag stops the run before its next iteration.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub async fn run<C, M>(&self, agent: &mut Agent<C, M>, instructions: &str) -> RunOutcome
    where
        C: Computer,
        M: ResponsesApi,
    {
        let run_id = nanoid!();
        let baseline = agent.executed_actions();
        let mut steps = Vec::new();
        info!(run_id = %run_id, max_actions = self.cfg.max_actions, "task started");

        let (status, error) = match self.drive(agent, instructions, baseline, &mut steps).await {
            Ok(status) => (status, None),
            Err(err) => {
                error!(run_id = %run_id, error = %err, "task failed");
                (RunStatus::Failed, Some(err.to_string()))
            }
        };
        let actions_taken = agent.executed_actions() - baseline;

        let final_screenshot = match agent.computer().screenshot().await {
            Ok(png) => Some(png),
            Err(err) => {
                warn!(error = %err, "failed to capture final screenshot");
                None
            }
        };
        if let (Some(store), Some(png)) = (&self.snapshot_store, &final_screenshot) {
            if let Err(err) = store.save(&run_id, "final", png).await {
                warn!(error = %err, "failed to store final screenshot");
            }
        }
        if let Err(err) = agent.computer().cleanup().await {
            warn!(error = %err, "computer cleanup failed");
        }

        let summary = match &status {
            RunStatus::Completed => format!("Task completed with {actions_taken} actions"),
            RunStatus::Aborted(AbortReason::LimitReached) => format!(
                "Stopped at the action limit ({}) after {actions_taken} actions",
                self.cfg.max_actions
            ),
            RunStatus::Aborted(AbortReason::ConsentDenied) => {
                format!("Stopped after {actions_taken} actions: consent denied")
            }
            RunStatus::Aborted(AbortReason::Cancelled) => {
                format!("Cancelled after {actions_taken} actions")
            }
            RunStatus::Failed => format!("Failed after {actions_taken} actions"),
        };
        info!(run_id = %run_id, status = ?status, actions_taken, "{summary}");

        RunOutcome {
            run_id,
            status,
            actions_taken,
            summary,
            error,
            steps,
            final_screenshot,
        }
    }

    async fn drive<C, M>(
        &self,
        agent: &mut Agent<C, M>,
        instructions: &str,
        baseline: usize,
        steps: &mut Vec<StepLog>,
    ) -> Result<RunStatus>
    where
        C: Computer,
        M: ResponsesApi,
    {
        agent.start();
        let baseline_work = work_done(agent);
        let mut user_input = Some(instructions);
        let mut recoveries = 0;
        let mut step = 0usize;

        loop {
            step += 1;
            if self.stop.load(Ordering::Relaxed) {
                info!(step, "stop requested");
                return Ok(RunStatus::Aborted(AbortReason::Cancelled));
            }

            // Function calls spend the budget too, so a model that only
            // calls tools still comes to a stop.
            let due_actions = agent.actions_due();
            let due = due_actions + agent.tool_calls_due();
            if due > 0 {
                let spent = work_done(agent) - baseline_work;
                if spent + due > self.cfg.max_actions {
                    warn!(max_actions = self.cfg.max_actions, "reached maximum actions limit");
                    return Ok(RunStatus::Aborted(AbortReason::LimitReached));
                }
            }
            if due_actions > 0 {
                if let Some(reason) = self.gate(agent).await? {
                    info!(reason = %reason, "pending actions not approved");
                    return Ok(RunStatus::Aborted(AbortReason::ConsentDenied));
                }
                let taken = agent.executed_actions() - baseline;
                if taken > 0 && !self.cfg.action_delay.is_zero() {
                    tokio::time::sleep(self.cfg.action_delay).await;
                }
            }

            match agent.continue_task(user_input.take(), self.cfg.temperature).await {
                Ok(()) => {}
                Err(AgentError::Computer(msg)) if recoveries < self.cfg.max_recoveries => {
                    recoveries += 1;
                    warn!(step, error = %msg, "action failed, asking the model for another way");
                    let note = format!(
                        "The previous action could not be performed ({msg}). \
                         Look at the current screenshot and choose a different action."
                    );
                    agent.report_failure(&note, self.cfg.temperature).await?;
                }
                Err(err) => return Err(err),
            }

            let log = StepLog {
                step,
                reasoning: agent.reasoning_summary(),
                actions: agent.actions(),
                messages: agent.messages(),
            };
            if !log.reasoning.is_empty() {
                info!(step, "reasoning: {}", log.reasoning);
            }
            for action in &log.actions {
                info!(step, action = ?action, "proposed action");
            }
            for message in &log.messages {
                info!(step, "agent: {message}");
            }
            steps.push(log);

            if !agent.has_pending_calls() {
                if agent.requires_user_input() {
                    info!(step, "model is waiting for input, nothing left to run");
                } else {
                    info!(step, "task appears to be complete");
                }
                return Ok(RunStatus::Completed);
            }
        }
    }

    /// `None` when the pending work may run, otherwise why it may not.
    async fn gate<C, M>(&self, agent: &Agent<C, M>) -> Result<Option<String>>
    where
        C: Computer,
        M: ResponsesApi,
    {
        let checks = agent.pending_safety_checks();
        if self.cfg.autoplay {
            if !checks.is_empty() {
                warn!(checks = ?checks, "safety checks acknowledged by autoplay");
            }
            return Ok(None);
        }

        if self.cfg.require_consent && agent.requires_consent() {
            let approval = self.gate.approve_actions(&agent.actions()).await?;
            if !approval.granted {
                return Ok(Some(approval.reason.unwrap_or_else(|| "actions denied".into())));
            }
        }
        if !checks.is_empty() {
            if self.cfg.safety_checks_enabled {
                let approval = self.gate.acknowledge_safety_checks(&checks).await?;
                if !approval.granted {
                    return Ok(Some(
                        approval.reason.unwrap_or_else(|| "safety checks denied".into()),
                    ));
                }
            } else {
                warn!(checks = ?checks, "safety checks acknowledged without review");
            }
        }
        Ok(None)
    }
}
