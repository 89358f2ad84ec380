use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{AgentError, Result};

// ========================= Core Types =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i64,
    pub y: i64,
}

impl Point {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn longest_edge(&self) -> u32 {
        self.width.max(self.height)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    /// The model calls the middle button "wheel".
    #[serde(alias = "middle")]
    Wheel,
    Back,
    Forward,
}

impl MouseButton {
    pub fn as_str(&self) -> &'static str {
        match self {
            MouseButton::Left => "left",
            MouseButton::Right => "right",
            MouseButton::Wheel => "wheel",
            MouseButton::Back => "back",
            MouseButton::Forward => "forward",
        }
    }
}

fn default_wait_ms() -> u64 {
    1000
}

/// One proposed interaction, extracted from a pending computer call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Click {
        x: i64,
        y: i64,
        #[serde(default)]
        button: MouseButton,
    },
    DoubleClick { x: i64, y: i64 },
    Move { x: i64, y: i64 },
    Scroll {
        x: i64,
        y: i64,
        #[serde(default)]
        scroll_x: i64,
        #[serde(default)]
        scroll_y: i64,
    },
    Type { text: String },
    Keypress { keys: Vec<String> },
    Drag { path: Vec<Point> },
    Wait {
        #[serde(default = "default_wait_ms")]
        ms: u64,
    },
    Screenshot,
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Click { .. } => "click",
            Action::DoubleClick { .. } => "double_click",
            Action::Move { .. } => "move",
            Action::Scroll { .. } => "scroll",
            Action::Type { .. } => "type",
            Action::Keypress { .. } => "keypress",
            Action::Drag { .. } => "drag",
            Action::Wait { .. } => "wait",
            Action::Screenshot => "screenshot",
        }
    }
}

// ========================= Capability =========================

/// A real or virtual display that can be looked at and poked.
///
/// Coordinates are in the computer's own pixel space as reported by
/// [`Computer::dimensions`]. Every method may be called any number of times.
#[async_trait]
pub trait Computer: Send + Sync {
    /// Platform identifier handed to the model, e.g. `"browser"` or `"windows"`.
    fn environment(&self) -> &str;
    fn dimensions(&self) -> Dimensions;

    /// PNG-encoded capture of the current display.
    async fn screenshot(&self) -> Result<Vec<u8>>;
    async fn click(&self, x: i64, y: i64, button: MouseButton) -> Result<()>;
    async fn double_click(&self, x: i64, y: i64) -> Result<()>;
    async fn move_pointer(&self, x: i64, y: i64) -> Result<()>;
    async fn scroll(&self, x: i64, y: i64, scroll_x: i64, scroll_y: i64) -> Result<()>;
    async fn type_text(&self, text: &str) -> Result<()>;
    async fn keypress(&self, keys: &[String]) -> Result<()>;
    async fn drag(&self, path: &[Point]) -> Result<()>;

    async fn wait(&self, ms: u64) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

/// Runs `action` against `computer`. `Screenshot` is a no-op here since the
/// caller captures a screenshot after every action anyway.
pub async fn execute<C: Computer + ?Sized>(computer: &C, action: &Action) -> Result<()> {
    match action {
        Action::Click { x, y, button } => computer.click(*x, *y, *button).await,
        Action::DoubleClick { x, y } => computer.double_click(*x, *y).await,
        Action::Move { x, y } => computer.move_pointer(*x, *y).await,
        Action::Scroll {
            x,
            y,
            scroll_x,
            scroll_y,
        } => computer.scroll(*x, *y, *scroll_x, *scroll_y).await,
        Action::Type { text } => computer.type_text(text).await,
        Action::Keypress { keys } => computer.keypress(keys).await,
        Action::Drag { path } => computer.drag(path).await,
        Action::Wait { ms } => computer.wait(*ms).await,
        Action::Screenshot => Ok(()),
    }
}

pub(crate) fn encode_png(image: &image::DynamicImage) -> Result<Vec<u8>> {
    let mut png = Vec::new();
    image.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)?;
    Ok(png)
}

/// Maps the host OS onto the environment names the model understands.
pub fn host_environment() -> &'static str {
    match std::env::consts::OS {
        "windows" => "windows",
        "macos" => "mac",
        _ => "linux",
    }
}

// ========================= Dry Run =========================

/// Logs every action instead of performing it and shows a black screen.
#[derive(Clone, Debug)]
pub struct DryRunComputer {
    environment: String,
    size: Dimensions,
}

impl DryRunComputer {
    pub fn new(size: Dimensions) -> Self {
        Self {
            environment: host_environment().to_string(),
            size,
        }
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }
}

#[async_trait]
impl Computer for DryRunComputer {
    fn environment(&self) -> &str {
        &self.environment
    }

    fn dimensions(&self) -> Dimensions {
        self.size
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        let blank = image::RgbImage::new(self.size.width, self.size.height);
        debug!(width = self.size.width, height = self.size.height, "dry-run screenshot");
        encode_png(&image::DynamicImage::ImageRgb8(blank))
    }

    async fn click(&self, x: i64, y: i64, button: MouseButton) -> Result<()> {
        if x < 0 || y < 0 || x >= self.size.width as i64 || y >= self.size.height as i64 {
            return Err(AgentError::Computer(format!(
                "click ({x}, {y}) outside {}x{}",
                self.size.width, self.size.height
            )));
        }
        info!(x, y, button = button.as_str(), "dry-run click");
        Ok(())
    }

    async fn double_click(&self, x: i64, y: i64) -> Result<()> {
        info!(x, y, "dry-run double click");
        Ok(())
    }

    async fn move_pointer(&self, x: i64, y: i64) -> Result<()> {
        info!(x, y, "dry-run move");
        Ok(())
    }

    async fn scroll(&self, x: i64, y: i64, scroll_x: i64, scroll_y: i64) -> Result<()> {
        info!(x, y, scroll_x, scroll_y, "dry-run scroll");
        Ok(())
    }

    async fn type_text(&self, text: &str) -> Result<()> {
        info!(chars = text.chars().count(), "dry-run type");
        Ok(())
    }

    async fn keypress(&self, keys: &[String]) -> Result<()> {
        info!(keys = ?keys, "dry-run keypress");
        Ok(())
    }

    async fn drag(&self, path: &[Point]) -> Result<()> {
        info!(points = path.len(), "dry-run drag");
        Ok(())
    }

    async fn wait(&self, ms: u64) -> Result<()> {
        info!(ms, "dry-run wait");
        Ok(())
    }
}
