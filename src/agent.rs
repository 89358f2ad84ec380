use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::future::Future;
use tracing::{debug, info, warn};

use crate::computer::{self, Action, Computer};
use crate::cua::{
    ComputerScreenshot, InputItem, OutputItem, ReasoningOptions, ResponseRequest, ResponseStatus,
    ResponsesApi, SafetyCheck, ToolDescriptor, Turn,
};
use crate::error::{AgentError, Result};
use crate::retry::RetryPolicy;

// ========================= Named Tools =========================

type SyncHandler = Box<dyn Fn(Value) -> Result<Value> + Send + Sync>;
type AsyncHandler = Box<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Implementation behind a named function tool. Receives the call's decoded
/// JSON arguments; the returned value is serialized back to the model.
pub enum ToolHandler {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

impl ToolHandler {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        ToolHandler::Sync(Box::new(f))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        ToolHandler::Async(Box::new(move |args| Box::pin(f(args))))
    }

    async fn call(&self, args: Value) -> Result<Value> {
        match self {
            ToolHandler::Sync(f) => f(args),
            ToolHandler::Async(f) => f(args).await,
        }
    }
}

struct RegisteredTool {
    name: String,
    descriptor: ToolDescriptor,
    handler: ToolHandler,
}

// ========================= Agent =========================

/// Conducts the conversation with the remote model one turn at a time.
///
/// Holds at most one [`Turn`]. Under the default configuration each
/// [`Agent::continue_task`] executes a single pending computer call; the
/// turn's remaining calls stay pending, and the model is only asked for the
/// next turn once every call of the current one has an answer.
pub struct Agent<C: Computer, M: ResponsesApi> {
    client: M,
    model: String,
    computer: C,
    tools: Vec<RegisteredTool>,
    parallel_tool_calls: bool,
    retry: RetryPolicy,
    turn: Option<Turn>,
    /// Call ids of the current turn that already have an output.
    answered: HashSet<String>,
    /// Outputs waiting to be sent with the next request.
    outbox: Vec<InputItem>,
    executed_actions: usize,
    executed_tool_calls: usize,
}

impl<C: Computer, M: ResponsesApi> Agent<C, M> {
    pub fn new(client: M, model: impl Into<String>, computer: C) -> Self {
        Self {
            client,
            model: model.into(),
            computer,
            tools: Vec::new(),
            parallel_tool_calls: false,
            retry: RetryPolicy::default(),
            turn: None,
            answered: HashSet::new(),
            outbox: Vec::new(),
            executed_actions: 0,
            executed_tool_calls: 0,
        }
    }

    /// Runs every pending computer call of a turn instead of only the first.
    pub fn with_parallel_tool_calls(mut self, enabled: bool) -> Self {
        self.parallel_tool_calls = enabled;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn computer(&self) -> &C {
        &self.computer
    }

    pub fn turn(&self) -> Option<&Turn> {
        self.turn.as_ref()
    }

    pub fn parallel_tool_calls(&self) -> bool {
        self.parallel_tool_calls
    }

    /// Computer actions executed over the agent's lifetime.
    pub fn executed_actions(&self) -> usize {
        self.executed_actions
    }

    /// Function tool invocations over the agent's lifetime.
    pub fn executed_tool_calls(&self) -> usize {
        self.executed_tool_calls
    }

    /// Forgets the current turn; the next call starts a new conversation.
    pub fn start(&mut self) {
        self.clear_turn();
    }

    fn clear_turn(&mut self) {
        self.turn = None;
        self.answered.clear();
        self.outbox.clear();
    }

    /// Adds a named function tool. A second registration under the same name
    /// replaces the first in place.
    pub fn register_tool(&mut self, name: impl Into<String>, schema: Value, handler: ToolHandler) {
        let name = name.into();
        let descriptor = ToolDescriptor::Function {
            name: name.clone(),
            description: schema
                .get("description")
                .and_then(|d| d.as_str())
                .map(str::to_string),
            parameters: schema,
        };
        let entry = RegisteredTool {
            name: name.clone(),
            descriptor,
            handler,
        };
        match self.tools.iter_mut().find(|t| t.name == name) {
            Some(slot) => {
                warn!(tool = %name, "tool already registered, replacing it");
                *slot = entry;
            }
            None => self.tools.push(entry),
        }
    }

    pub fn tool_descriptors(&self) -> Vec<ToolDescriptor> {
        let dims = self.computer.dimensions();
        let mut tools = vec![ToolDescriptor::Computer {
            display_width: dims.width,
            display_height: dims.height,
            environment: self.computer.environment().to_string(),
        }];
        tools.extend(self.tools.iter().map(|t| t.descriptor.clone()));
        tools
    }

    // ---------------- read-only projections of the current turn ----------------

    fn output(&self) -> &[OutputItem] {
        self.turn.as_ref().map(|t| t.output.as_slice()).unwrap_or_default()
    }

    fn is_pending(&self, item: &OutputItem) -> bool {
        match item {
            OutputItem::ComputerCall { call_id, .. } | OutputItem::FunctionCall { call_id, .. } => {
                !self.answered.contains(call_id)
            }
            _ => false,
        }
    }

    fn pending_computer_calls(&self) -> impl Iterator<Item = (&Action, &[SafetyCheck])> {
        self.output()
            .iter()
            .filter(|item| self.is_pending(item))
            .filter_map(|item| match item {
                OutputItem::ComputerCall {
                    action,
                    pending_safety_checks,
                    ..
                } => Some((action, pending_safety_checks.as_slice())),
                _ => None,
            })
    }

    pub fn requires_user_input(&self) -> bool {
        match self.output().last() {
            None => true,
            Some(OutputItem::Message { role, .. }) => role == "assistant",
            Some(_) => false,
        }
    }

    pub fn requires_consent(&self) -> bool {
        self.pending_computer_calls().next().is_some()
    }

    /// True while the current turn still has computer or function calls to answer.
    pub fn has_pending_calls(&self) -> bool {
        self.output().iter().any(|item| self.is_pending(item))
    }

    pub fn pending_safety_checks(&self) -> Vec<SafetyCheck> {
        self.pending_computer_calls()
            .flat_map(|(_, checks)| checks.iter().cloned())
            .collect()
    }

    pub fn reasoning_summary(&self) -> String {
        self.output()
            .iter()
            .filter_map(|item| match item {
                OutputItem::Reasoning { summary } => Some(summary.concat()),
                _ => None,
            })
            .collect()
    }

    pub fn messages(&self) -> Vec<String> {
        self.output()
            .iter()
            .filter_map(|item| match item {
                OutputItem::Message { text, .. } => Some(text.iter().cloned()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Actions of the computer calls that have not been answered yet.
    pub fn actions(&self) -> Vec<Action> {
        self.pending_computer_calls()
            .map(|(action, _)| action.clone())
            .collect()
    }

    /// How many of the pending actions the next `continue_task` will run.
    pub fn actions_due(&self) -> usize {
        let pending = self.actions().len();
        if self.parallel_tool_calls {
            pending
        } else {
            pending.min(1)
        }
    }

    /// Function calls the next `continue_task` will invoke.
    pub fn tool_calls_due(&self) -> usize {
        self.output()
            .iter()
            .filter(|item| matches!(item, OutputItem::FunctionCall { .. }) && self.is_pending(item))
            .count()
    }

    // ---------------- protocol ----------------

    /// Runs the due calls of the current turn and queues `user_message`. Once
    /// no call of the turn is left pending, everything queued is sent and the
    /// model's next turn replaces the current one.
    pub async fn continue_task(
        &mut self,
        user_message: Option<&str>,
        temperature: Option<f32>,
    ) -> Result<()> {
        self.advance(user_message, temperature, None).await
    }

    /// Tells the model that its last action could not be carried out. Pending
    /// calls are answered with a fresh screenshot without running them, and
    /// `note` goes along as a user message so the model can pick a different
    /// action.
    pub async fn report_failure(&mut self, note: &str, temperature: Option<f32>) -> Result<()> {
        self.advance(Some(note), temperature, Some(note)).await
    }

    fn check_turn(&self, turn: &Turn) -> Result<()> {
        for item in &turn.output {
            match item {
                OutputItem::Unknown(kind) => {
                    return Err(AgentError::UnimplementedProtocolItem(kind.clone()))
                }
                OutputItem::FunctionCall { name, .. } if !self.tools.iter().any(|t| &t.name == name) => {
                    return Err(AgentError::UnsupportedTool(name.clone()))
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn call_tool(&self, name: &str, arguments: &str) -> Result<Value> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| AgentError::UnsupportedTool(name.to_string()))?;
        let args: Value = if arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(arguments)?
        };
        debug!(tool = %name, "invoking tool");
        tool.handler.call(args).await
    }

    async fn screenshot_b64(&self) -> Result<String> {
        let png = self.computer.screenshot().await?;
        Ok(B64.encode(png))
    }

    async fn advance(
        &mut self,
        user_message: Option<&str>,
        temperature: Option<f32>,
        failure: Option<&str>,
    ) -> Result<()> {
        let mut previous_response_id = None;

        if let Some(turn) = self.turn.take() {
            let answered = self.answer_calls(&turn, failure).await;
            previous_response_id = Some(turn.id.0.clone());
            self.turn = Some(turn);
            answered?;
        }

        if let Some(message) = user_message.filter(|m| !m.is_empty()) {
            self.outbox.push(InputItem::user(message));
        }
        if self.has_pending_calls() {
            debug!(
                remaining = self.actions().len(),
                "computer calls left for the next continue"
            );
            return Ok(());
        }

        let request = ResponseRequest {
            model: self.model.clone(),
            input: std::mem::take(&mut self.outbox),
            previous_response_id,
            tools: self.tool_descriptors(),
            reasoning: ReasoningOptions {
                generate_summary: "concise".into(),
            },
            temperature,
            truncation: "auto".into(),
            parallel_tool_calls: self.parallel_tool_calls,
        };

        // The answered turn is spent whether or not the next one arrives.
        self.clear_turn();
        let client = &self.client;
        let turn = self
            .retry
            .run("responses.create", || client.create(&request))
            .await?;
        if turn.status != ResponseStatus::Completed {
            return Err(AgentError::CompletionStatus(turn.status));
        }
        debug!(response_id = %turn.id.0, items = turn.output.len(), "turn received");
        self.turn = Some(turn);
        Ok(())
    }

    /// Runs and answers the calls of `turn` that are due. With `failure` set,
    /// every unanswered call is answered without running anything.
    async fn answer_calls(&mut self, turn: &Turn, failure: Option<&str>) -> Result<()> {
        self.check_turn(turn)?;
        let mut ran_action = false;

        for item in &turn.output {
            if !self.is_pending(item) {
                continue;
            }
            match item {
                OutputItem::ComputerCall {
                    call_id,
                    action,
                    pending_safety_checks,
                } => {
                    if failure.is_none() {
                        if ran_action && !self.parallel_tool_calls {
                            continue;
                        }
                        ran_action = true;
                        if !matches!(action, Action::Screenshot) {
                            info!(call_id = %call_id, action = ?action, "executing action");
                            computer::execute(&self.computer, action).await?;
                            self.executed_actions += 1;
                        }
                    }
                    let image = self.screenshot_b64().await?;
                    self.outbox.push(InputItem::ComputerCallOutput {
                        call_id: call_id.clone(),
                        output: ComputerScreenshot::png_base64(&image),
                        acknowledged_safety_checks: pending_safety_checks.clone(),
                    });
                    self.answered.insert(call_id.clone());
                }
                OutputItem::FunctionCall {
                    call_id,
                    name,
                    arguments,
                } => {
                    let result = match failure {
                        Some(note) => json!({ "error": note }),
                        None => {
                            let value = self.call_tool(name, arguments).await?;
                            self.executed_tool_calls += 1;
                            value
                        }
                    };
                    self.outbox.push(InputItem::FunctionCallOutput {
                        call_id: call_id.clone(),
                        output: serde_json::to_string(&result)?,
                    });
                    self.answered.insert(call_id.clone());
                }
                OutputItem::Reasoning { .. } | OutputItem::Message { .. } => {}
                OutputItem::Unknown(kind) => {
                    return Err(AgentError::UnimplementedProtocolItem(kind.clone()))
                }
            }
        }
        Ok(())
    }
}
