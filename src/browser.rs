use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType, InsertTextParams, MouseButton as CdpButton,
};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::layout::Point as CdpPoint;
use chromiumoxide::page::{Page, ScreenshotParamsBuilder};
use futures::StreamExt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;
use tracing::debug;

use crate::computer::{Computer, Dimensions, MouseButton, Point};
use crate::error::AgentError;

#[derive(Clone, Debug)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
    pub viewport: Dimensions,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            user_agent: None,
            viewport: Dimensions::new(1280, 800),
        }
    }
}

pub struct Browser {
    page: Page,
    viewport: Dimensions,
    _browser: OxideBrowser,
}

fn cdp_button(button: MouseButton) -> CdpButton {
    match button {
        MouseButton::Left => CdpButton::Left,
        MouseButton::Right => CdpButton::Right,
        MouseButton::Wheel => CdpButton::Middle,
        MouseButton::Back => CdpButton::Back,
        MouseButton::Forward => CdpButton::Forward,
    }
}

/// Maps the model's lowercase key names onto DOM `KeyboardEvent.key` values.
fn dom_key(key: &str) -> String {
    match key.to_ascii_lowercase().as_str() {
        "arrowdown" | "down" => "ArrowDown".into(),
        "arrowup" | "up" => "ArrowUp".into(),
        "arrowleft" | "left" => "ArrowLeft".into(),
        "arrowright" | "right" => "ArrowRight".into(),
        "enter" | "return" => "Enter".into(),
        "esc" | "escape" => "Escape".into(),
        "tab" => "Tab".into(),
        "space" => " ".into(),
        "backspace" => "Backspace".into(),
        "delete" | "del" => "Delete".into(),
        "ctrl" | "control" => "Control".into(),
        "alt" | "option" => "Alt".into(),
        "shift" => "Shift".into(),
        "cmd" | "meta" | "super" | "win" => "Meta".into(),
        "home" => "Home".into(),
        "end" => "End".into(),
        "pageup" => "PageUp".into(),
        "pagedown" => "PageDown".into(),
        _ => key.to_string(),
    }
}

impl Browser {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // Fresh profile per run: Chromium refuses a profile another instance still holds.
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("cua-driver-profile-{}-{}", std::process::id(), ts));
        let _ = std::fs::create_dir_all(&profile_dir);
        builder = builder
            .user_data_dir(profile_dir)
            .window_size(cfg.viewport.width, cfg.viewport.height)
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder.build().map_err(|e| anyhow!(e))?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg).await?;
        tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });

        let page = browser.new_page("about:blank").await?;
        if let Some(ua) = cfg.user_agent {
            page.set_user_agent(ua).await?;
        }
        let this = Self {
            page,
            viewport: cfg.viewport,
            _browser: browser,
        };
        this.pin_viewport().await?;
        Ok(this)
    }

    /// Locks the viewport so screenshots always have the advertised size.
    async fn pin_viewport(&self) -> Result<()> {
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(self.viewport.width as i64)
            .height(self.viewport.height as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.execute(metrics).await?;
        Ok(())
    }

    pub async fn goto(&self, url: &str) -> Result<()> {
        self.page.goto(url).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    async fn mouse(
        &self,
        kind: DispatchMouseEventType,
        at: Point,
        button: CdpButton,
        clicks: i64,
    ) -> Result<()> {
        let event = DispatchMouseEventParams::builder()
            .r#type(kind)
            .x(at.x as f64)
            .y(at.y as f64)
            .button(button)
            .click_count(clicks)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.execute(event).await?;
        Ok(())
    }

    pub async fn move_mouse(&self, at: Point) -> Result<()> {
        self.page
            .move_mouse(CdpPoint { x: at.x as f64, y: at.y as f64 })
            .await?;
        Ok(())
    }

    pub async fn click(&self, at: Point, button: MouseButton, clicks: i64) -> Result<()> {
        self.move_mouse(at).await?;
        let button = cdp_button(button);
        self.mouse(DispatchMouseEventType::MousePressed, at, button.clone(), clicks)
            .await?;
        self.mouse(DispatchMouseEventType::MouseReleased, at, button, clicks).await
    }

    async fn eval(&self, script: String) -> Result<()> {
        let eval = EvaluateParams::builder()
            .expression(script)
            .build()
            .map_err(|e| anyhow!(e))?;
        self.page.execute(eval).await?;
        Ok(())
    }

    pub async fn scroll(&self, at: Point, dx: i64, dy: i64) -> Result<()> {
        self.move_mouse(at).await?;
        self.eval(format!(
            "(document.elementFromPoint({}, {}) || document.scrollingElement || document.body).scrollBy({dx}, {dy});",
            at.x, at.y
        ))
        .await
    }

    pub async fn type_text(&self, text: &str) -> Result<()> {
        self.page
            .execute(InsertTextParams { text: text.to_string() })
            .await?;
        Ok(())
    }

    /// Presses `keys` in order and releases them in reverse.
    pub async fn keypress(&self, keys: &[String]) -> Result<()> {
        let keys: Vec<String> = keys.iter().map(|k| dom_key(k)).collect();
        let keys_js = serde_json::to_string(&keys)?;
        self.eval(format!(
            r#"
            (function() {{
              const el = document.activeElement || document.body;
              const keys = {keys_js};
              const mods = {{
                ctrlKey: keys.includes("Control"), altKey: keys.includes("Alt"),
                shiftKey: keys.includes("Shift"), metaKey: keys.includes("Meta"), bubbles: true
              }};
              for (const k of keys) el.dispatchEvent(new KeyboardEvent("keydown", {{...mods, key: k, code: k}}));
              for (const k of [...keys].reverse()) el.dispatchEvent(new KeyboardEvent("keyup", {{...mods, key: k, code: k}}));
            }})()
            "#
        ))
        .await
    }

    pub async fn drag_path(&self, points: &[Point]) -> Result<()> {
        let Some((&start, rest)) = points.split_first() else {
            return Ok(());
        };
        self.move_mouse(start).await?;
        self.mouse(DispatchMouseEventType::MousePressed, start, CdpButton::Left, 1)
            .await?;
        let mut last = start;
        for &p in rest {
            self.move_mouse(p).await?;
            last = p;
        }
        self.mouse(DispatchMouseEventType::MouseReleased, last, CdpButton::Left, 1)
            .await
    }

    pub async fn screenshot_png(&self) -> Result<Vec<u8>> {
        let take = || async {
            self.page
                .screenshot(ScreenshotParamsBuilder::default().full_page(false).build())
                .await
        };
        match take().await {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("0 width") || msg.contains("0 height") {
                    self.pin_viewport().await?;
                    sleep(Duration::from_millis(50)).await;
                    return Ok(take().await?);
                }
                Err(anyhow!(e))
            }
        }
    }
}

// ========================= Computer Adapter =========================

/// A Chromium tab as a [`Computer`]; the viewport is the screen.
pub struct ChromiumComputer {
    browser: Browser,
}

fn computer_err(e: anyhow::Error) -> AgentError {
    AgentError::Computer(e.to_string())
}

impl ChromiumComputer {
    pub async fn launch(cfg: BrowserConfig) -> crate::error::Result<Self> {
        let browser = Browser::launch(cfg).await.map_err(computer_err)?;
        Ok(Self { browser })
    }

    pub async fn open_url(&self, url: &str) -> crate::error::Result<()> {
        debug!(url, "navigating");
        self.browser.goto(url).await.map_err(computer_err)
    }
}

#[async_trait]
impl Computer for ChromiumComputer {
    fn environment(&self) -> &str {
        "browser"
    }

    fn dimensions(&self) -> Dimensions {
        self.browser.viewport
    }

    async fn screenshot(&self) -> crate::error::Result<Vec<u8>> {
        self.browser.screenshot_png().await.map_err(computer_err)
    }

    async fn click(&self, x: i64, y: i64, button: MouseButton) -> crate::error::Result<()> {
        self.browser
            .click(Point::new(x, y), button, 1)
            .await
            .map_err(computer_err)
    }

    async fn double_click(&self, x: i64, y: i64) -> crate::error::Result<()> {
        self.browser
            .click(Point::new(x, y), MouseButton::Left, 2)
            .await
            .map_err(computer_err)
    }

    async fn move_pointer(&self, x: i64, y: i64) -> crate::error::Result<()> {
        self.browser
            .move_mouse(Point::new(x, y))
            .await
            .map_err(computer_err)
    }

    async fn scroll(&self, x: i64, y: i64, scroll_x: i64, scroll_y: i64) -> crate::error::Result<()> {
        self.browser
            .scroll(Point::new(x, y), scroll_x, scroll_y)
            .await
            .map_err(computer_err)
    }

    async fn type_text(&self, text: &str) -> crate::error::Result<()> {
        self.browser.type_text(text).await.map_err(computer_err)
    }

    async fn keypress(&self, keys: &[String]) -> crate::error::Result<()> {
        self.browser.keypress(keys).await.map_err(computer_err)
    }

    async fn drag(&self, path: &[Point]) -> crate::error::Result<()> {
        self.browser.drag_path(path).await.map_err(computer_err)
    }
}
