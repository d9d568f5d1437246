//! Local driver backend: a Chromium process on this machine.

use async_trait::async_trait;
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use futures::StreamExt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::action::{Action, Viewport};
use crate::cdp::DrivenPage;
use crate::computer::{Computer, ComputerError, Screenshot};

/// DOM id of the injected cursor dot. `pointer-events: none` keeps it out of
/// the page's own hit testing.
const CURSOR_OVERLAY_ID: &str = "__wp_cursor";

const MAX_WAIT_ACTION: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct LocalOptions {
    pub viewport: Viewport,
    pub initial_url: String,
    pub highlight_mouse: bool,
    pub headless: bool,
    pub launch_timeout: Duration,
    pub navigation_timeout: Duration,
    pub capture_timeout: Duration,
}

impl Default for LocalOptions {
    fn default() -> Self {
        Self {
            viewport: Viewport::new(1440, 900),
            initial_url: "about:blank".to_string(),
            highlight_mouse: false,
            headless: true,
            launch_timeout: Duration::from_secs(30),
            navigation_timeout: Duration::from_secs(30),
            capture_timeout: Duration::from_secs(10),
        }
    }
}

pub struct LocalComputer {
    driven: DrivenPage,
    browser: Option<OxideBrowser>,
    handler_task: Option<JoinHandle<()>>,
    options: LocalOptions,
}

impl LocalComputer {
    /// Launch a browser process, pin the viewport, inject the overlay when
    /// requested, and load the initial URL. Fails with a launch error after a
    /// bounded wait; never hangs on a wedged browser binary.
    pub async fn open(options: LocalOptions) -> Result<Self, ComputerError> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder()
            .window_size(options.viewport.width, options.viewport.height);
        if !options.headless {
            builder = builder.with_head();
        }
        // Unique user data dir per run: restarting Chromium rapidly against a
        // shared profile trips its ProcessSingleton lock.
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("webpilot-profile-{}-{}", std::process::id(), ts));
        let _ = std::fs::create_dir_all(&profile_dir);
        builder = builder
            .user_data_dir(profile_dir.clone())
            .arg(format!("--user-data-dir={}", profile_dir.display()))
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let config = builder.build().map_err(ComputerError::Launch)?;

        let (browser, mut handler) = timeout(options.launch_timeout, OxideBrowser::launch(config))
            .await
            .map_err(|_| {
                ComputerError::Launch(format!(
                    "browser did not start within {:?}",
                    options.launch_timeout
                ))
            })?
            .map_err(|e| ComputerError::Launch(e.to_string()))?;
        let handler_task = tokio::spawn(async move { while handler.next().await.is_some() {} });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| ComputerError::Launch(e.to_string()))?;
        let driven = DrivenPage::new(page, options.viewport).await?;

        if options.highlight_mouse {
            let inject = AddScriptToEvaluateOnNewDocumentParams::builder()
                .source(overlay_script())
                .build()
                .map_err(ComputerError::Launch)?;
            driven
                .page()
                .execute(inject)
                .await
                .map_err(|e| ComputerError::Launch(e.to_string()))?;
        }

        driven
            .navigate(&options.initial_url, options.navigation_timeout)
            .await
            .map_err(|e| ComputerError::Launch(e.to_string()))?;
        let _ = driven.enforce_single_tab().await;
        if options.highlight_mouse {
            let _ = driven.evaluate(&move_cursor_js(0, 0)).await;
        }
        info!(url = %options.initial_url, viewport = %options.viewport, "local browser session ready");

        Ok(Self {
            driven,
            browser: Some(browser),
            handler_task: Some(handler_task),
            options,
        })
    }

    fn check_alive(&self) -> Result<(), ComputerError> {
        if self.browser.is_none() {
            return Err(ComputerError::BackendDisconnected(
                "session is closed".into(),
            ));
        }
        Ok(())
    }

    async fn refresh_overlay(&self) {
        if !self.options.highlight_mouse {
            return;
        }
        let cursor = self.driven.cursor();
        let _ = self.driven.evaluate(&move_cursor_js(cursor.x, cursor.y)).await;
    }
}

#[async_trait]
impl Computer for LocalComputer {
    fn viewport(&self) -> Viewport {
        self.options.viewport
    }

    fn highlights_cursor(&self) -> bool {
        self.options.highlight_mouse
    }

    async fn screenshot(&mut self) -> Result<Screenshot, ComputerError> {
        self.check_alive()?;
        self.driven.capture(self.options.capture_timeout).await
    }

    async fn dispatch(&mut self, action: &Action) -> Result<(), ComputerError> {
        self.check_alive()?;
        action.validate(self.options.viewport)?;
        match action {
            Action::Click { x, y, button } => self.driven.click(*x, *y, *button).await?,
            Action::DoubleClick { x, y } => self.driven.double_click(*x, *y).await?,
            Action::Drag { path } => self.driven.drag(path).await?,
            Action::Scroll { x, y, dx, dy } => self.driven.wheel(*x, *y, *dx, *dy).await?,
            Action::TypeText { text } => self.driven.insert_text(text).await?,
            Action::KeyPress { keys } => self.driven.key_sequence(keys).await?,
            Action::Wait { duration } => sleep((*duration).min(MAX_WAIT_ACTION)).await,
            Action::Navigate { url } => {
                self.driven
                    .navigate(url, self.options.navigation_timeout)
                    .await?;
                let _ = self.driven.enforce_single_tab().await;
            }
            Action::Screenshot => {}
            Action::Finish { .. } => {
                return Err(ComputerError::OutOfBounds(
                    "terminal action is not dispatchable".into(),
                ))
            }
        }
        self.refresh_overlay().await;
        Ok(())
    }

    async fn current_url(&mut self) -> Result<String, ComputerError> {
        self.check_alive()?;
        self.driven.url().await
    }

    async fn close(&mut self) -> Result<(), ComputerError> {
        let Some(mut browser) = self.browser.take() else {
            return Ok(());
        };
        if let Err(e) = browser.close().await {
            warn!(error = %e, "browser close reported an error");
        }
        let _ = browser.wait().await;
        if let Some(task) = self.handler_task.take() {
            task.abort();
        }
        info!("local browser session released");
        Ok(())
    }
}

fn overlay_script() -> String {
    format!(
        r#"(() => {{
  const ensure = () => {{
    if (document.getElementById('{id}')) return;
    const dot = document.createElement('div');
    dot.id = '{id}';
    dot.style.cssText = 'position:fixed;left:0;top:0;width:14px;height:14px;' +
      'border-radius:50%;background:rgba(255,64,64,0.65);' +
      'border:2px solid rgba(255,255,255,0.9);z-index:2147483647;' +
      'pointer-events:none;transform:translate(-50%,-50%);' +
      'transition:left 60ms linear,top 60ms linear;';
    (document.documentElement || document.body).appendChild(dot);
  }};
  window.__wpMoveCursor = (x, y) => {{
    ensure();
    const dot = document.getElementById('{id}');
    dot.style.left = x + 'px';
    dot.style.top = y + 'px';
  }};
  if (document.readyState === 'loading') {{
    document.addEventListener('DOMContentLoaded', ensure);
  }} else {{
    ensure();
  }}
}})()"#,
        id = CURSOR_OVERLAY_ID
    )
}

fn move_cursor_js(x: i32, y: i32) -> String {
    format!("window.__wpMoveCursor && window.__wpMoveCursor({x}, {y})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_never_intercepts_clicks() {
        let script = overlay_script();
        assert!(script.contains("pointer-events:none"));
        assert!(script.contains(CURSOR_OVERLAY_ID));
    }

    #[test]
    fn default_options_match_session_defaults() {
        let options = LocalOptions::default();
        assert_eq!(options.viewport, Viewport::new(1440, 900));
        assert!(options.headless);
        assert!(!options.highlight_mouse);
    }
}
