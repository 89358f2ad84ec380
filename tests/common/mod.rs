#![allow(dead_code)]

use async_trait::async_trait;
use cua_driver::computer::{Computer, Dimensions, MouseButton, Point};
use cua_driver::cua::{
    OutputItem, ResponseId, ResponseRequest, ResponseStatus, ResponsesApi, SafetyCheck, Turn,
};
use cua_driver::{Action, AgentError, ModelError};
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

// ---------------- computer ----------------

/// In-memory screen that records every call it receives.
#[derive(Clone)]
pub struct RecordingComputer {
    size: Dimensions,
    log: Arc<Mutex<Vec<String>>>,
    fail_clicks: Arc<AtomicBool>,
}

impl RecordingComputer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            size: Dimensions::new(width, height),
            log: Arc::new(Mutex::new(Vec::new())),
            fail_clicks: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Calls other than screenshots.
    pub fn actions(&self) -> Vec<String> {
        self.calls().into_iter().filter(|c| c != "screenshot").collect()
    }

    pub fn screenshots(&self) -> usize {
        self.calls().iter().filter(|c| *c == "screenshot").count()
    }

    pub fn fail_clicks(&self, fail: bool) {
        self.fail_clicks.store(fail, Ordering::SeqCst);
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl Computer for RecordingComputer {
    fn environment(&self) -> &str {
        "browser"
    }

    fn dimensions(&self) -> Dimensions {
        self.size
    }

    async fn screenshot(&self) -> cua_driver::Result<Vec<u8>> {
        self.record("screenshot".into());
        Ok(png(self.size.width, self.size.height, [255, 255, 255]))
    }

    async fn click(&self, x: i64, y: i64, button: MouseButton) -> cua_driver::Result<()> {
        if self.fail_clicks.load(Ordering::SeqCst) {
            return Err(AgentError::Computer(format!("element at {x},{y} is gone")));
        }
        self.record(format!("click {x},{y} {}", button.as_str()));
        Ok(())
    }

    async fn double_click(&self, x: i64, y: i64) -> cua_driver::Result<()> {
        self.record(format!("double_click {x},{y}"));
        Ok(())
    }

    async fn move_pointer(&self, x: i64, y: i64) -> cua_driver::Result<()> {
        self.record(format!("move {x},{y}"));
        Ok(())
    }

    async fn scroll(&self, x: i64, y: i64, sx: i64, sy: i64) -> cua_driver::Result<()> {
        self.record(format!("scroll {x},{y} by {sx},{sy}"));
        Ok(())
    }

    async fn type_text(&self, text: &str) -> cua_driver::Result<()> {
        self.record(format!("type {text}"));
        Ok(())
    }

    async fn keypress(&self, keys: &[String]) -> cua_driver::Result<()> {
        self.record(format!("keypress {}", keys.join("+")));
        Ok(())
    }

    async fn drag(&self, path: &[Point]) -> cua_driver::Result<()> {
        let points: Vec<String> = path.iter().map(|p| format!("{},{}", p.x, p.y)).collect();
        self.record(format!("drag {}", points.join(" ")));
        Ok(())
    }

    async fn wait(&self, ms: u64) -> cua_driver::Result<()> {
        self.record(format!("wait {ms}"));
        Ok(())
    }

    async fn cleanup(&self) -> cua_driver::Result<()> {
        self.record("cleanup".into());
        Ok(())
    }
}

pub fn png(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb(rgb));
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

// ---------------- model ----------------

/// Replays canned turns and records every request it was sent. Once the
/// script runs out it answers with a plain assistant message.
#[derive(Clone, Default)]
pub struct ScriptedModel {
    script: Arc<Mutex<VecDeque<Result<Turn, ModelError>>>>,
    requests: Arc<Mutex<Vec<ResponseRequest>>>,
}

impl ScriptedModel {
    pub fn new(script: Vec<Result<Turn, ModelError>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            requests: Arc::default(),
        }
    }

    pub fn turns(turns: Vec<Turn>) -> Self {
        Self::new(turns.into_iter().map(Ok).collect())
    }

    pub fn requests(&self) -> Vec<ResponseRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> ResponseRequest {
        self.requests().pop().expect("no request was sent")
    }
}

#[async_trait]
impl ResponsesApi for ScriptedModel {
    async fn create(&self, request: &ResponseRequest) -> Result<Turn, ModelError> {
        self.requests.lock().unwrap().push(request.clone());
        let n = self.requests.lock().unwrap().len();
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(turn(&format!("resp_end_{n}"), vec![message("All done.")])))
    }
}

// ---------------- turn builders ----------------

pub fn turn(id: &str, output: Vec<OutputItem>) -> Turn {
    Turn {
        id: ResponseId(id.to_string()),
        status: ResponseStatus::Completed,
        output,
    }
}

pub fn computer_call(call_id: &str, action: Action) -> OutputItem {
    OutputItem::ComputerCall {
        call_id: call_id.to_string(),
        action,
        pending_safety_checks: Vec::new(),
    }
}

pub fn guarded_call(call_id: &str, action: Action, check: &str) -> OutputItem {
    OutputItem::ComputerCall {
        call_id: call_id.to_string(),
        action,
        pending_safety_checks: vec![SafetyCheck {
            id: format!("sc_{call_id}"),
            code: Some(check.to_string()),
            message: Some("Check the page before continuing.".into()),
        }],
    }
}

pub fn function_call(call_id: &str, name: &str, arguments: &str) -> OutputItem {
    OutputItem::FunctionCall {
        call_id: call_id.to_string(),
        name: name.to_string(),
        arguments: arguments.to_string(),
    }
}

pub fn message(text: &str) -> OutputItem {
    OutputItem::Message {
        role: "assistant".into(),
        text: vec![text.to_string()],
    }
}

pub fn reasoning(text: &str) -> OutputItem {
    OutputItem::Reasoning {
        summary: vec![text.to_string()],
    }
}

pub fn click(x: i64, y: i64) -> Action {
    Action::Click {
        x,
        y,
        button: MouseButton::Left,
    }
}
