//! Shared chromiumoxide page primitives used by both backends.
//!
//! Everything that speaks CDP lives here: input dispatch at pixel
//! coordinates, viewport-clipped screenshots, navigation settling, and the
//! mapping from chromiumoxide's error surface to [`ComputerError`].

use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams,
    DispatchMouseEventType, InsertTextParams, MouseButton as CdpMouseButton,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::error::CdpError;
use chromiumoxide::layout::Point as CdpPoint;
use chromiumoxide::page::{Page, ScreenshotParams};
use std::time::Duration;
use tokio::time::{sleep, timeout};

use crate::action::{MouseButton, Point, Viewport};
use crate::computer::{ComputerError, Screenshot};

/// Pause after navigations so late layout and script-driven renders settle
/// before the next capture.
const SETTLE_DELAY: Duration = Duration::from_millis(400);

/// A page plus the session state both backends track against it: the fixed
/// viewport and the last known pointer position.
pub struct DrivenPage {
    page: Page,
    viewport: Viewport,
    cursor: Point,
}

impl DrivenPage {
    pub async fn new(page: Page, viewport: Viewport) -> Result<Self, ComputerError> {
        let driven = Self {
            page,
            viewport,
            cursor: Point::new(0, 0),
        };
        driven.apply_viewport_metrics().await?;
        Ok(driven)
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn cursor(&self) -> Point {
        self.cursor
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    /// Pin the rendered viewport to the requested size exactly. The window
    /// may be larger; the page itself must not be.
    pub async fn apply_viewport_metrics(&self) -> Result<(), ComputerError> {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(self.viewport.width as i64)
            .height(self.viewport.height as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(ComputerError::Launch)?;
        self.page
            .execute(params)
            .await
            .map_err(|e| classify(&e, Failure::Dispatch))?;
        Ok(())
    }

    pub async fn navigate(&self, url: &str, nav_timeout: Duration) -> Result<(), ComputerError> {
        let go = async {
            self.page.goto(url).await?;
            self.page.wait_for_navigation().await?;
            Ok::<_, CdpError>(())
        };
        match timeout(nav_timeout, go).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(classify(&e, Failure::Navigation)),
            Err(_) => {
                return Err(ComputerError::NavigationTimeout(format!(
                    "{url} did not load within {nav_timeout:?}"
                )))
            }
        }
        sleep(SETTLE_DELAY).await;
        Ok(())
    }

    pub async fn url(&self) -> Result<String, ComputerError> {
        let url = self
            .page
            .url()
            .await
            .map_err(|e| classify(&e, Failure::Dispatch))?;
        Ok(url.unwrap_or_default())
    }

    /// Viewport-clipped PNG. Bounded; elapses as `CaptureTimeout`.
    pub async fn capture(&self, capture_timeout: Duration) -> Result<Screenshot, ComputerError> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .build();
        let bytes = match timeout(capture_timeout, self.page.screenshot(params)).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => return Err(classify(&e, Failure::Capture)),
            Err(_) => {
                return Err(ComputerError::CaptureTimeout(format!(
                    "no frame within {capture_timeout:?}"
                )))
            }
        };
        Ok(Screenshot {
            png: bytes,
            width: self.viewport.width,
            height: self.viewport.height,
        })
    }

    pub async fn click(&mut self, x: i32, y: i32, button: MouseButton) -> Result<(), ComputerError> {
        self.press_release(x, y, button, 1).await
    }

    pub async fn double_click(&mut self, x: i32, y: i32) -> Result<(), ComputerError> {
        self.press_release(x, y, MouseButton::Left, 2).await
    }

    async fn press_release(
        &mut self,
        x: i32,
        y: i32,
        button: MouseButton,
        click_count: i64,
    ) -> Result<(), ComputerError> {
        let cmd = DispatchMouseEventParams::builder()
            .x(x as f64)
            .y(y as f64)
            .button(cdp_button(button))
            .click_count(click_count);
        self.page
            .move_mouse(CdpPoint {
                x: x as f64,
                y: y as f64,
            })
            .await
            .map_err(|e| classify(&e, Failure::Dispatch))?;
        self.cursor = Point::new(x, y);
        let pressed = cmd
            .clone()
            .r#type(DispatchMouseEventType::MousePressed)
            .build()
            .map_err(ComputerError::OutOfBounds)?;
        self.page
            .execute(pressed)
            .await
            .map_err(|e| classify(&e, Failure::Dispatch))?;
        let released = cmd
            .r#type(DispatchMouseEventType::MouseReleased)
            .build()
            .map_err(ComputerError::OutOfBounds)?;
        self.page
            .execute(released)
            .await
            .map_err(|e| classify(&e, Failure::Dispatch))?;
        Ok(())
    }

    /// Pointer-down at `path[0]`, moves through intermediate points,
    /// pointer-up at the last. A mid-path failure still attempts the release
    /// so the gesture never stays half-performed.
    pub async fn drag(&mut self, path: &[Point]) -> Result<(), ComputerError> {
        let first = match path.first() {
            Some(p) => *p,
            None => return Ok(()),
        };
        let down = DispatchMouseEventParams::builder()
            .x(first.x as f64)
            .y(first.y as f64)
            .button(CdpMouseButton::Left);
        self.page
            .move_mouse(CdpPoint {
                x: first.x as f64,
                y: first.y as f64,
            })
            .await
            .map_err(|e| classify(&e, Failure::Dispatch))?;
        let pressed = down
            .clone()
            .r#type(DispatchMouseEventType::MousePressed)
            .build()
            .map_err(ComputerError::OutOfBounds)?;
        self.page
            .execute(pressed)
            .await
            .map_err(|e| classify(&e, Failure::Dispatch))?;
        self.cursor = first;

        let mut move_err = None;
        for p in &path[1..] {
            match self
                .page
                .move_mouse(CdpPoint {
                    x: p.x as f64,
                    y: p.y as f64,
                })
                .await
            {
                Ok(_) => self.cursor = *p,
                Err(e) => {
                    move_err = Some(classify(&e, Failure::Dispatch));
                    break;
                }
            }
        }

        let up_at = self.cursor;
        let released = DispatchMouseEventParams::builder()
            .x(up_at.x as f64)
            .y(up_at.y as f64)
            .button(CdpMouseButton::Left)
            .r#type(DispatchMouseEventType::MouseReleased)
            .build()
            .map_err(ComputerError::OutOfBounds)?;
        let release = self
            .page
            .execute(released)
            .await
            .map_err(|e| classify(&e, Failure::Dispatch));
        match move_err {
            Some(err) => Err(err),
            None => release.map(|_| ()),
        }
    }

    /// Wheel event at (x, y) with pixel deltas; positive `dy` scrolls the
    /// content down.
    pub async fn wheel(&mut self, x: i32, y: i32, dx: i32, dy: i32) -> Result<(), ComputerError> {
        let params = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseWheel)
            .x(x as f64)
            .y(y as f64)
            .delta_x(dx as f64)
            .delta_y(dy as f64)
            .build()
            .map_err(ComputerError::OutOfBounds)?;
        self.page
            .execute(params)
            .await
            .map_err(|e| classify(&e, Failure::Dispatch))?;
        self.cursor = Point::new(x, y);
        Ok(())
    }

    /// Feed text to the focused element via CDP `Input.insertText`.
    pub async fn insert_text(&self, text: &str) -> Result<(), ComputerError> {
        self.page
            .execute(InsertTextParams {
                text: text.to_string(),
            })
            .await
            .map_err(|e| classify(&e, Failure::Dispatch))?;
        Ok(())
    }

    /// Hold the keys down in order, then release in reverse, so multi-key
    /// sequences behave as chords ("Control" + "a").
    pub async fn key_sequence(&self, keys: &[String]) -> Result<(), ComputerError> {
        for key in keys {
            self.key_event(key, DispatchKeyEventType::KeyDown).await?;
        }
        for key in keys.iter().rev() {
            self.key_event(key, DispatchKeyEventType::KeyUp).await?;
        }
        Ok(())
    }

    async fn key_event(
        &self,
        key: &str,
        event: DispatchKeyEventType,
    ) -> Result<(), ComputerError> {
        let mut builder = DispatchKeyEventParams::builder()
            .r#type(event.clone())
            .key(key.to_string());
        if let Some(code) = virtual_key_code(key) {
            builder = builder.windows_virtual_key_code(code).code(key.to_string());
        } else if key.chars().count() == 1 && matches!(event, DispatchKeyEventType::KeyDown) {
            builder = builder.text(key.to_string());
        }
        let params = builder.build().map_err(ComputerError::OutOfBounds)?;
        self.page
            .execute(params)
            .await
            .map_err(|e| classify(&e, Failure::Dispatch))?;
        Ok(())
    }

    /// Keep the session on one tab: popups and `target="_blank"` links would
    /// otherwise escape the driven page.
    pub async fn enforce_single_tab(&self) -> Result<(), ComputerError> {
        let js = r#"
            (function() {
              window.open = function(url) { if (url) location.href = url; return window; };
              document.addEventListener('click', function(ev) {
                const a = ev.target && ev.target.closest ? ev.target.closest('a[target]') : null;
                if (a) a.removeAttribute('target');
              }, true);
            })()
        "#;
        self.page
            .evaluate(js)
            .await
            .map_err(|e| classify(&e, Failure::Dispatch))?;
        Ok(())
    }

    pub async fn evaluate(&self, js: &str) -> Result<(), ComputerError> {
        self.page
            .evaluate(js)
            .await
            .map_err(|e| classify(&e, Failure::Dispatch))?;
        Ok(())
    }

}

fn cdp_button(button: MouseButton) -> CdpMouseButton {
    match button {
        MouseButton::Left => CdpMouseButton::Left,
        MouseButton::Middle => CdpMouseButton::Middle,
        MouseButton::Right => CdpMouseButton::Right,
    }
}

fn virtual_key_code(key: &str) -> Option<i64> {
    let code = match key {
        "Enter" => 13,
        "Tab" => 9,
        "Escape" => 27,
        "Backspace" => 8,
        "Delete" => 46,
        "Home" => 36,
        "End" => 35,
        "PageUp" => 33,
        "PageDown" => 34,
        "ArrowLeft" => 37,
        "ArrowUp" => 38,
        "ArrowRight" => 39,
        "ArrowDown" => 40,
        "Shift" => 16,
        "Control" => 17,
        "Alt" => 18,
        "Meta" => 91,
        _ => return None,
    };
    Some(code)
}

/// What the failing call was doing, so timeouts land in the right bucket.
#[derive(Clone, Copy, Debug)]
pub enum Failure {
    Navigation,
    Capture,
    Dispatch,
}

/// Map a chromiumoxide error onto the computer taxonomy. A dead websocket or
/// killed process shows up here as a channel error on the next call, which is
/// exactly when the contract says `BackendDisconnected` surfaces.
pub fn classify(err: &CdpError, during: Failure) -> ComputerError {
    if matches!(err, CdpError::Timeout) {
        return match during {
            Failure::Navigation => ComputerError::NavigationTimeout("cdp deadline".into()),
            Failure::Capture => ComputerError::CaptureTimeout("cdp deadline".into()),
            Failure::Dispatch => ComputerError::ElementNotInteractable("cdp deadline".into()),
        };
    }
    let msg = err.to_string();
    let lowered = msg.to_ascii_lowercase();
    if lowered.contains("channel")
        || lowered.contains("websocket")
        || lowered.contains("connection")
        || lowered.contains("browser closed")
        || lowered.contains("oneshot")
    {
        return ComputerError::BackendDisconnected(msg);
    }
    if lowered.contains("node") || lowered.contains("not clickable") || lowered.contains("detached")
    {
        return ComputerError::ElementNotInteractable(msg);
    }
    match during {
        Failure::Navigation => ComputerError::NavigationTimeout(msg),
        Failure::Capture => ComputerError::CaptureTimeout(msg),
        Failure::Dispatch => ComputerError::ElementNotInteractable(msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_codes_cover_navigation_keys() {
        assert_eq!(virtual_key_code("Enter"), Some(13));
        assert_eq!(virtual_key_code("ArrowDown"), Some(40));
        assert_eq!(virtual_key_code("a"), None);
    }

    #[test]
    fn cdp_timeout_classifies_by_phase() {
        assert!(matches!(
            classify(&CdpError::Timeout, Failure::Capture),
            ComputerError::CaptureTimeout(_)
        ));
        assert!(matches!(
            classify(&CdpError::Timeout, Failure::Navigation),
            ComputerError::NavigationTimeout(_)
        ));
    }
}
