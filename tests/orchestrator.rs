mod common;

use async_trait::async_trait;
use common::*;
use cua_driver::cua::{InputItem, SafetyCheck, Turn};
use cua_driver::orchestrator::{AllowAllPolicy, Approval, ConsentGate, SnapshotStore};
use cua_driver::{
    AbortReason, Action, Agent, ModelError, Orchestrator, OrchestratorConfig, RunStatus,
    ToolHandler,
};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn autoplay(max_actions: usize) -> OrchestratorConfig {
    OrchestratorConfig {
        max_actions,
        autoplay: true,
        action_delay: Duration::ZERO,
        ..Default::default()
    }
}

fn clicking_model(turns: usize) -> ScriptedModel {
    ScriptedModel::turns(
        (0..turns)
            .map(|i| turn(&format!("resp_{i}"), vec![computer_call(&format!("c{i}"), click(i as i64, 1))]))
            .collect(),
    )
}

fn agent(model: &ScriptedModel, computer: &RecordingComputer) -> Agent<RecordingComputer, ScriptedModel> {
    Agent::new(model.clone(), "computer-use-preview", computer.clone())
}

struct Gate {
    actions: bool,
    safety: bool,
}

impl Gate {
    fn new(actions: bool, safety: bool) -> Self {
        Self { actions, safety }
    }
}

#[async_trait]
impl ConsentGate for Gate {
    async fn approve_actions(&self, _actions: &[Action]) -> cua_driver::Result<Approval> {
        Ok(if self.actions { Approval::granted() } else { Approval::denied("no") })
    }

    async fn acknowledge_safety_checks(&self, _checks: &[SafetyCheck]) -> cua_driver::Result<Approval> {
        Ok(if self.safety { Approval::granted() } else { Approval::denied("unsafe") })
    }
}

#[derive(Default)]
struct MemoryStore {
    saved: Mutex<Vec<(String, String, usize)>>,
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn save(&self, run_id: &str, label: &str, png: &[u8]) -> cua_driver::Result<()> {
        self.saved
            .lock()
            .unwrap()
            .push((run_id.to_string(), label.to_string(), png.len()));
        Ok(())
    }
}

#[tokio::test]
async fn stops_exactly_at_the_action_limit() {
    let model = clicking_model(10);
    let computer = RecordingComputer::new(800, 600);
    let mut agent = agent(&model, &computer);

    let outcome = Orchestrator::new(autoplay(3), AllowAllPolicy)
        .run(&mut agent, "keep clicking")
        .await;

    assert_eq!(outcome.status, RunStatus::Aborted(AbortReason::LimitReached));
    assert_eq!(outcome.actions_taken, 3);
    assert_eq!(
        computer.actions().iter().filter(|a| a.starts_with("click")).count(),
        3
    );
    assert!(outcome.summary.contains("limit"));
}

#[tokio::test]
async fn tool_calls_count_against_the_limit() {
    let model = ScriptedModel::turns(
        (0..40)
            .map(|i| turn(&format!("resp_{i}"), vec![function_call(&format!("f{i}"), "ping", "{}")]))
            .collect(),
    );
    let computer = RecordingComputer::new(800, 600);
    let mut agent = agent(&model, &computer);
    agent.register_tool("ping", json!({"type": "object"}), ToolHandler::sync(|_| Ok(json!("pong"))));

    let outcome = Orchestrator::new(autoplay(3), AllowAllPolicy)
        .run(&mut agent, "ping forever")
        .await;

    assert_eq!(outcome.status, RunStatus::Aborted(AbortReason::LimitReached));
    assert_eq!(agent.executed_tool_calls(), 3);
    assert_eq!(model.requests().len(), 4);
}

#[tokio::test]
async fn queued_calls_of_one_turn_run_one_per_step() {
    let model = ScriptedModel::turns(vec![turn(
        "resp_1",
        vec![
            computer_call("c1", click(1, 1)),
            computer_call("c2", click(2, 2)),
            computer_call("c3", click(3, 3)),
        ],
    )]);
    let computer = RecordingComputer::new(800, 600);
    let mut agent = agent(&model, &computer);

    let outcome = Orchestrator::new(autoplay(10), AllowAllPolicy)
        .run(&mut agent, "click three times")
        .await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.actions_taken, 3);
    assert_eq!(model.requests().len(), 2);
    assert_eq!(
        &computer.actions()[..3],
        &["click 1,1 left", "click 2,2 left", "click 3,3 left"]
    );
}

#[tokio::test]
async fn completes_when_the_model_stops_calling() {
    let model = ScriptedModel::turns(vec![
        turn("resp_1", vec![reasoning("Opening the menu."), computer_call("c1", click(4, 4))]),
        turn("resp_2", vec![message("The menu is open.")]),
    ]);
    let computer = RecordingComputer::new(800, 600);
    let mut agent = agent(&model, &computer);
    let store = Arc::new(MemoryStore::default());

    let outcome = Orchestrator::new(autoplay(10), AllowAllPolicy)
        .with_snapshot_store(store.clone())
        .run(&mut agent, "open the menu")
        .await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.actions_taken, 1);
    assert!(outcome.error.is_none());
    assert_eq!(outcome.steps.len(), 2);
    assert_eq!(outcome.steps[0].reasoning, "Opening the menu.");
    assert_eq!(outcome.steps[1].messages, vec!["The menu is open.".to_string()]);
    assert!(outcome.final_screenshot.is_some());
    assert_eq!(computer.calls().last().map(String::as_str), Some("cleanup"));

    let saved = store.saved.lock().unwrap().clone();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].0, outcome.run_id);
    assert_eq!(saved[0].1, "final");
}

#[tokio::test]
async fn declined_consent_aborts_before_acting() {
    let model = clicking_model(2);
    let computer = RecordingComputer::new(800, 600);
    let mut agent = agent(&model, &computer);
    let cfg = OrchestratorConfig {
        autoplay: false,
        action_delay: Duration::ZERO,
        ..Default::default()
    };

    let outcome = Orchestrator::new(cfg, Gate::new(false, true))
        .run(&mut agent, "click")
        .await;

    assert_eq!(outcome.status, RunStatus::Aborted(AbortReason::ConsentDenied));
    assert_eq!(outcome.actions_taken, 0);
    assert!(computer.actions().iter().all(|a| a == "cleanup"));
}

#[tokio::test]
async fn unacknowledged_safety_check_aborts() {
    let model = ScriptedModel::turns(vec![turn(
        "resp_1",
        vec![guarded_call("c1", click(1, 1), "malicious_instructions")],
    )]);
    let computer = RecordingComputer::new(800, 600);
    let mut agent = agent(&model, &computer);
    let gate = Gate::new(true, false);
    let cfg = OrchestratorConfig {
        action_delay: Duration::ZERO,
        ..Default::default()
    };
    let orchestrator = Orchestrator::new(cfg, gate);

    let outcome = orchestrator.run(&mut agent, "click").await;

    assert_eq!(outcome.status, RunStatus::Aborted(AbortReason::ConsentDenied));
    assert_eq!(outcome.actions_taken, 0);
}

#[tokio::test]
async fn safety_review_can_be_switched_off() {
    let model = ScriptedModel::turns(vec![turn(
        "resp_1",
        vec![guarded_call("c1", click(1, 1), "malicious_instructions")],
    )]);
    let computer = RecordingComputer::new(800, 600);
    let mut agent = agent(&model, &computer);
    let cfg = OrchestratorConfig {
        safety_checks_enabled: false,
        require_consent: false,
        action_delay: Duration::ZERO,
        ..Default::default()
    };

    let outcome = Orchestrator::new(cfg, Gate::new(false, false))
        .run(&mut agent, "click")
        .await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.actions_taken, 1);
}

#[tokio::test]
async fn remote_failure_still_captures_final_screen() {
    let model = ScriptedModel::new(vec![Err(ModelError::Other {
        status: Some(401),
        message: "invalid api key".into(),
    })]);
    let computer = RecordingComputer::new(800, 600);
    let mut agent = agent(&model, &computer);

    let outcome = Orchestrator::new(autoplay(5), AllowAllPolicy)
        .run(&mut agent, "anything")
        .await;

    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(outcome.error.unwrap().contains("invalid api key"));
    assert!(outcome.final_screenshot.is_some());
}

#[tokio::test]
async fn stop_flag_cancels_the_run() {
    let model = clicking_model(5);
    let computer = RecordingComputer::new(800, 600);
    let mut agent = agent(&model, &computer);
    let orchestrator = Orchestrator::new(autoplay(5), AllowAllPolicy);
    orchestrator.stop_handle().store(true, Ordering::Relaxed);

    let outcome = orchestrator.run(&mut agent, "click").await;

    assert_eq!(outcome.status, RunStatus::Aborted(AbortReason::Cancelled));
    assert!(model.requests().is_empty());
}

#[tokio::test]
async fn failed_action_is_reported_back_once() {
    let model = ScriptedModel::turns(vec![
        turn("resp_1", vec![computer_call("c1", click(9, 9))]),
        turn("resp_2", vec![message("I could not click it.")]),
    ]);
    let computer = RecordingComputer::new(800, 600);
    computer.fail_clicks(true);
    let mut agent = agent(&model, &computer);

    let outcome = Orchestrator::new(autoplay(5), AllowAllPolicy)
        .run(&mut agent, "click the thing")
        .await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.actions_taken, 0);
    let req = model.last_request();
    assert!(matches!(&req.input[0], InputItem::ComputerCallOutput { call_id, .. } if call_id == "c1"));
    assert!(matches!(
        &req.input[1],
        InputItem::Message { role, content } if role == "user" && content.contains("element at 9,9 is gone")
    ));
}

#[tokio::test]
async fn failed_action_without_recoveries_fails_the_run() {
    let model = clicking_model(3);
    let computer = RecordingComputer::new(800, 600);
    computer.fail_clicks(true);
    let mut agent = agent(&model, &computer);
    let cfg = OrchestratorConfig {
        max_recoveries: 0,
        ..autoplay(5)
    };

    let outcome = Orchestrator::new(cfg, AllowAllPolicy).run(&mut agent, "click").await;

    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(outcome.error.unwrap().contains("computer error"));
}

#[tokio::test(start_paused = true)]
async fn pauses_between_actions() {
    let model = clicking_model(3);
    let computer = RecordingComputer::new(800, 600);
    let mut agent = agent(&model, &computer);
    let cfg = OrchestratorConfig {
        action_delay: Duration::from_secs(2),
        ..autoplay(10)
    };

    let started = tokio::time::Instant::now();
    let outcome = Orchestrator::new(cfg, AllowAllPolicy).run(&mut agent, "click").await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.actions_taken, 3);
    assert!(started.elapsed() >= Duration::from_secs(4));
}

#[test]
fn turn_builders_default_to_completed() {
    let t: Turn = turn("r", vec![]);
    assert_eq!(t.status, cua_driver::cua::ResponseStatus::Completed);
}
