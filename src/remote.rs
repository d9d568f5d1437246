//! Remote session backend: a browser hosted by a remote automation service,
//! provisioned over REST and driven over its CDP websocket.
//!
//! Cursor highlighting is accepted but is a no-op here; the hosted service
//! owns the rendered surface and offers no overlay hook. The asymmetry is
//! part of the backend contract, surfaced via `highlights_cursor`.

use async_trait::async_trait;
use chromiumoxide::browser::Browser as OxideBrowser;
use futures::future::BoxFuture;
use futures::StreamExt;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::json;
use std::env;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::action::{Action, Viewport};
use crate::cdp::DrivenPage;
use crate::computer::{Computer, ComputerError, Screenshot};

const DEFAULT_API_URL: &str = "https://api.browserbase.com/v1";

/// Transient channel errors get this many attempts before the session is
/// declared disconnected.
const CHANNEL_ATTEMPTS: u32 = 2;
const CHANNEL_BACKOFF: Duration = Duration::from_millis(250);

const MAX_WAIT_ACTION: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct RemoteOptions {
    pub viewport: Viewport,
    pub initial_url: String,
    /// Accepted for CLI symmetry with the local backend; never honored.
    pub highlight_mouse: bool,
    pub api_url: String,
    pub api_key: String,
    pub project_id: Option<String>,
    pub launch_timeout: Duration,
    pub navigation_timeout: Duration,
    pub capture_timeout: Duration,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            viewport: Viewport::new(1440, 900),
            initial_url: "about:blank".to_string(),
            highlight_mouse: false,
            api_url: env::var("BROWSERBASE_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.into()),
            api_key: env::var("BROWSERBASE_API_KEY").unwrap_or_default(),
            project_id: env::var("BROWSERBASE_PROJECT_ID").ok(),
            launch_timeout: Duration::from_secs(60),
            navigation_timeout: Duration::from_secs(30),
            capture_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    id: String,
    #[serde(alias = "connect_url")]
    connect_url: Option<String>,
}

/// Thin REST client for session provisioning and release.
#[derive(Debug)]
struct SessionApi {
    http: HttpClient,
    base_url: String,
    api_key: String,
    project_id: Option<String>,
}

impl SessionApi {
    fn new(options: &RemoteOptions) -> Result<Self, ComputerError> {
        if options.api_key.is_empty() {
            return Err(ComputerError::Launch(
                "remote session api key is not configured".into(),
            ));
        }
        let http = HttpClient::builder()
            .build()
            .map_err(|e| ComputerError::Launch(e.to_string()))?;
        Ok(Self {
            http,
            base_url: options.api_url.clone(),
            api_key: options.api_key.clone(),
            project_id: options.project_id.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }

    async fn create_session(&self) -> Result<(String, String), ComputerError> {
        let mut body = json!({});
        if let Some(project) = &self.project_id {
            body["projectId"] = json!(project);
        }
        let response = self
            .http
            .post(self.endpoint("sessions"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ComputerError::Launch(format!("session create failed: {e}")))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ComputerError::Launch(e.to_string()))?;
        if !status.is_success() {
            return Err(ComputerError::Launch(format!(
                "session create returned {status}: {text}"
            )));
        }
        let session: SessionResponse = serde_json::from_str(&text)
            .map_err(|e| ComputerError::Launch(format!("bad session response: {e}")))?;
        let connect_url = session.connect_url.ok_or_else(|| {
            ComputerError::Launch(format!("session {} has no connect url", session.id))
        })?;
        Ok((session.id, connect_url))
    }

    /// Ask the service to stop billing the session. Errors are reported, not
    /// propagated: local teardown already happened and must not be undone.
    async fn release_session(&self, session_id: &str) {
        let mut body = json!({ "status": "REQUEST_RELEASE" });
        if let Some(project) = &self.project_id {
            body["projectId"] = json!(project);
        }
        let result = self
            .http
            .post(self.endpoint(&format!("sessions/{session_id}")))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                info!(session = %session_id, "remote session released");
            }
            Ok(response) => {
                warn!(session = %session_id, status = %response.status(), "remote release rejected");
            }
            Err(e) => {
                warn!(session = %session_id, error = %e, "remote release failed");
            }
        }
    }
}

pub struct RemoteComputer {
    driven: DrivenPage,
    browser: Option<OxideBrowser>,
    handler_task: Option<JoinHandle<()>>,
    api: SessionApi,
    session_id: Option<String>,
    options: RemoteOptions,
}

impl RemoteComputer {
    /// Provision a hosted session, attach over its websocket, pin the
    /// viewport, and load the initial URL. The remote session is released if
    /// any later step of acquisition fails; a half-acquired session must not
    /// keep billing.
    pub async fn open(options: RemoteOptions) -> Result<Self, ComputerError> {
        if options.highlight_mouse {
            warn!("cursor highlighting is not supported by the remote backend; ignoring");
        }
        let api = SessionApi::new(&options)?;
        let (session_id, connect_url) = api.create_session().await?;
        info!(session = %session_id, "remote session provisioned");

        match Self::attach(&options, &connect_url).await {
            Ok((driven, browser, handler_task)) => Ok(Self {
                driven,
                browser: Some(browser),
                handler_task: Some(handler_task),
                api,
                session_id: Some(session_id),
                options,
            }),
            Err(e) => {
                api.release_session(&session_id).await;
                Err(e)
            }
        }
    }

    async fn attach(
        options: &RemoteOptions,
        connect_url: &str,
    ) -> Result<(DrivenPage, OxideBrowser, JoinHandle<()>), ComputerError> {
        let (browser, mut handler) =
            timeout(options.launch_timeout, OxideBrowser::connect(connect_url))
                .await
                .map_err(|_| {
                    ComputerError::Launch(format!(
                        "websocket attach did not complete within {:?}",
                        options.launch_timeout
                    ))
                })?
                .map_err(|e| ComputerError::Launch(e.to_string()))?;
        let handler_task = tokio::spawn(async move { while handler.next().await.is_some() {} });

        let pages = browser
            .pages()
            .await
            .map_err(|e| ComputerError::Launch(e.to_string()))?;
        let page = match pages.into_iter().next() {
            Some(page) => page,
            None => browser
                .new_page("about:blank")
                .await
                .map_err(|e| ComputerError::Launch(e.to_string()))?,
        };
        let driven = DrivenPage::new(page, options.viewport).await?;
        driven
            .navigate(&options.initial_url, options.navigation_timeout)
            .await
            .map_err(|e| ComputerError::Launch(e.to_string()))?;
        let _ = driven.enforce_single_tab().await;
        Ok((driven, browser, handler_task))
    }

    fn check_alive(&self) -> Result<(), ComputerError> {
        if self.browser.is_none() {
            return Err(ComputerError::BackendDisconnected(
                "session is closed".into(),
            ));
        }
        Ok(())
    }

    /// Run one page operation, absorbing transient channel drops with a
    /// bounded retry before declaring the backend disconnected.
    async fn with_retry<T>(
        &mut self,
        label: &str,
        op: impl for<'a> Fn(&'a mut DrivenPage) -> BoxFuture<'a, Result<T, ComputerError>>,
    ) -> Result<T, ComputerError> {
        let mut attempt = 1;
        loop {
            match op(&mut self.driven).await {
                Err(ComputerError::BackendDisconnected(msg)) if attempt < CHANNEL_ATTEMPTS => {
                    warn!(%label, attempt, error = %msg, "transient channel error, retrying");
                    attempt += 1;
                    sleep(CHANNEL_BACKOFF).await;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl Computer for RemoteComputer {
    fn viewport(&self) -> Viewport {
        self.options.viewport
    }

    fn highlights_cursor(&self) -> bool {
        false
    }

    async fn screenshot(&mut self) -> Result<Screenshot, ComputerError> {
        self.check_alive()?;
        let capture_timeout = self.options.capture_timeout;
        self.with_retry("screenshot", move |driven| {
            Box::pin(driven.capture(capture_timeout))
        })
        .await
    }

    async fn dispatch(&mut self, action: &Action) -> Result<(), ComputerError> {
        self.check_alive()?;
        action.validate(self.options.viewport)?;
        let navigation_timeout = self.options.navigation_timeout;
        match action {
            Action::Click { x, y, button } => {
                let (x, y, button) = (*x, *y, *button);
                self.with_retry("click", move |driven| Box::pin(driven.click(x, y, button)))
                    .await?
            }
            Action::DoubleClick { x, y } => {
                let (x, y) = (*x, *y);
                self.with_retry("double_click", move |driven| {
                    Box::pin(driven.double_click(x, y))
                })
                .await?
            }
            Action::Drag { path } => {
                let path = path.clone();
                self.with_retry("drag", move |driven| {
                    let path = path.clone();
                    Box::pin(async move { driven.drag(&path).await })
                })
                .await?
            }
            Action::Scroll { x, y, dx, dy } => {
                let (x, y, dx, dy) = (*x, *y, *dx, *dy);
                self.with_retry("scroll", move |driven| Box::pin(driven.wheel(x, y, dx, dy)))
                    .await?
            }
            Action::TypeText { text } => {
                let text = text.clone();
                self.with_retry("type_text", move |driven| {
                    let text = text.clone();
                    Box::pin(async move { driven.insert_text(&text).await })
                })
                .await?
            }
            Action::KeyPress { keys } => {
                let keys = keys.clone();
                self.with_retry("key_press", move |driven| {
                    let keys = keys.clone();
                    Box::pin(async move { driven.key_sequence(&keys).await })
                })
                .await?
            }
            Action::Wait { duration } => sleep((*duration).min(MAX_WAIT_ACTION)).await,
            Action::Navigate { url } => {
                let url = url.clone();
                self.with_retry("navigate", move |driven| {
                    let url = url.clone();
                    Box::pin(async move { driven.navigate(&url, navigation_timeout).await })
                })
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
        Ok(())
    }

    async fn current_url(&mut self) -> Result<String, ComputerError> {
        self.check_alive()?;
        self.with_retry("current_url", |driven| Box::pin(driven.url()))
            .await
    }

    /// Releases the hosted session exactly once, even when the websocket is
    /// already gone or close is called repeatedly.
    async fn close(&mut self) -> Result<(), ComputerError> {
        if let Some(mut browser) = self.browser.take() {
            if let Err(e) = browser.close().await {
                warn!(error = %e, "remote browser close reported an error");
            }
            let _ = browser.wait().await;
        }
        if let Some(task) = self.handler_task.take() {
            task.abort();
        }
        if let Some(session_id) = self.session_id.take() {
            self.api.release_session(&session_id).await;
        }
        Ok(())
    }
}
