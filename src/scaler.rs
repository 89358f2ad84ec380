//! Logical/physical coordinate translation.
//!
//! The model sees a resized screenshot whose longest edge is bounded; actions
//! it proposes in that space are mapped back to true screen pixels using the
//! ratio recorded when the screenshot was taken.

use async_trait::async_trait;
use std::sync::Mutex;
use tracing::debug;

use crate::computer::{encode_png, Computer, Dimensions, MouseButton, Point};
use crate::error::{AgentError, Result};

/// Longest edge the model is shown when no logical size is configured.
pub const MAX_EDGE: u32 = 2048;

/// Uniform ratio between one physical screenshot and the logical canvas it
/// was drawn onto.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScaleTransform {
    pub physical: Dimensions,
    pub logical: Dimensions,
    pub ratio: f64,
}

impl ScaleTransform {
    pub fn new(physical: Dimensions, logical: Dimensions) -> Self {
        let ratio = f64::min(
            logical.width as f64 / physical.width as f64,
            logical.height as f64 / physical.height as f64,
        );
        Self {
            physical,
            logical,
            ratio,
        }
    }

    pub fn to_physical(&self, p: Point) -> Point {
        Point::new(
            (p.x as f64 / self.ratio).round() as i64,
            (p.y as f64 / self.ratio).round() as i64,
        )
    }

    pub fn to_logical(&self, p: Point) -> Point {
        Point::new(
            (p.x as f64 * self.ratio).round() as i64,
            (p.y as f64 * self.ratio).round() as i64,
        )
    }

    /// Size of the resized screenshot before padding, never below 1x1.
    pub fn scaled_size(&self) -> Dimensions {
        Dimensions::new(
            ((self.physical.width as f64 * self.ratio) as u32).max(1),
            ((self.physical.height as f64 * self.ratio) as u32).max(1),
        )
    }
}

/// Scales `physical` so its longest edge equals `max_edge`, keeping the
/// aspect ratio and rounding down; neither edge drops below 1.
pub fn fit_longest_edge(physical: Dimensions, max_edge: u32) -> Dimensions {
    let longest = physical.longest_edge() as u64;
    if longest == 0 {
        return physical;
    }
    let max_edge = max_edge as u64;
    Dimensions::new(
        ((physical.width as u64 * max_edge / longest) as u32).max(1),
        ((physical.height as u64 * max_edge / longest) as u32).max(1),
    )
}

/// Wraps a [`Computer`] and presents a bounded logical coordinate space.
pub struct Scaler<C: Computer> {
    computer: C,
    size: Option<Dimensions>,
    transform: Mutex<Option<ScaleTransform>>,
}

impl<C: Computer> Scaler<C> {
    /// `size` is the logical canvas; `None` derives it from the computer's
    /// physical size capped at [`MAX_EDGE`].
    pub fn new(computer: C, size: Option<Dimensions>) -> Self {
        Self {
            computer,
            size,
            transform: Mutex::new(None),
        }
    }

    pub fn inner(&self) -> &C {
        &self.computer
    }

    /// Transform recorded by the most recent screenshot.
    pub fn transform(&self) -> Option<ScaleTransform> {
        *self.transform.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn to_screen(&self, x: i64, y: i64) -> Result<Point> {
        let transform = self.transform().ok_or(AgentError::ScaleNotInitialized)?;
        Ok(transform.to_physical(Point::new(x, y)))
    }
}

#[async_trait]
impl<C: Computer> Computer for Scaler<C> {
    fn environment(&self) -> &str {
        self.computer.environment()
    }

    fn dimensions(&self) -> Dimensions {
        match self.size {
            Some(size) => size,
            None => fit_longest_edge(self.computer.dimensions(), MAX_EDGE),
        }
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        let png = self.computer.screenshot().await?;
        let image = image::load_from_memory(&png)?;
        if image.width() == 0 || image.height() == 0 {
            return Err(AgentError::Computer("screenshot has no pixels".into()));
        }

        let physical = Dimensions::new(image.width(), image.height());
        let logical = self.dimensions();
        let transform = ScaleTransform::new(physical, logical);
        let scaled = transform.scaled_size();

        let resized = image.resize_exact(
            scaled.width,
            scaled.height,
            image::imageops::FilterType::Lanczos3,
        );
        // Pasted at the origin; the rest of the canvas stays black. Pointer
        // translation assumes exactly this placement.
        let mut canvas = image::RgbImage::new(logical.width, logical.height);
        image::imageops::overlay(&mut canvas, &resized.to_rgb8(), 0, 0);

        *self.transform.lock().unwrap_or_else(|e| e.into_inner()) = Some(transform);
        debug!(
            from = ?(physical.width, physical.height),
            to = ?(logical.width, logical.height),
            ratio = transform.ratio,
            "screenshot scaled"
        );
        encode_png(&image::DynamicImage::ImageRgb8(canvas))
    }

    async fn click(&self, x: i64, y: i64, button: MouseButton) -> Result<()> {
        let p = self.to_screen(x, y)?;
        self.computer.click(p.x, p.y, button).await
    }

    async fn double_click(&self, x: i64, y: i64) -> Result<()> {
        let p = self.to_screen(x, y)?;
        self.computer.double_click(p.x, p.y).await
    }

    async fn move_pointer(&self, x: i64, y: i64) -> Result<()> {
        let p = self.to_screen(x, y)?;
        self.computer.move_pointer(p.x, p.y).await
    }

    async fn scroll(&self, x: i64, y: i64, scroll_x: i64, scroll_y: i64) -> Result<()> {
        let p = self.to_screen(x, y)?;
        self.computer.scroll(p.x, p.y, scroll_x, scroll_y).await
    }

    async fn type_text(&self, text: &str) -> Result<()> {
        self.computer.type_text(text).await
    }

    async fn keypress(&self, keys: &[String]) -> Result<()> {
        self.computer.keypress(keys).await
    }

    async fn drag(&self, path: &[Point]) -> Result<()> {
        let path = path
            .iter()
            .map(|p| self.to_screen(p.x, p.y))
            .collect::<Result<Vec<_>>>()?;
        self.computer.drag(&path).await
    }

    async fn wait(&self, ms: u64) -> Result<()> {
        self.computer.wait(ms).await
    }

    async fn cleanup(&self) -> Result<()> {
        self.computer.cleanup().await
    }
}
