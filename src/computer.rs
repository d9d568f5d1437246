use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::action::{Action, InvalidAction, Viewport};

/// Captured viewport image. `width`/`height` always equal the session
/// viewport; backends clip to it rather than the full page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Screenshot {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Screenshot {
    pub fn to_base64(&self) -> String {
        B64.encode(&self.png)
    }
}

/// Typed failure surface of a computer. Every backend normalizes its native
/// errors into this taxonomy; nothing else crosses the trait boundary.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum ComputerError {
    #[error("failed to acquire browser session: {0}")]
    Launch(String),
    #[error("screenshot capture timed out: {0}")]
    CaptureTimeout(String),
    #[error("navigation timed out: {0}")]
    NavigationTimeout(String),
    #[error("element not interactable: {0}")]
    ElementNotInteractable(String),
    #[error("action rejected: {0}")]
    OutOfBounds(String),
    #[error("backend disconnected: {0}")]
    BackendDisconnected(String),
}

impl From<InvalidAction> for ComputerError {
    fn from(err: InvalidAction) -> Self {
        ComputerError::OutOfBounds(err.to_string())
    }
}

impl ComputerError {
    /// Fatal errors end the run; the loop moves to a failed outcome.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ComputerError::Launch(_) | ComputerError::BackendDisconnected(_)
        )
    }

    /// Transient errors are retried with the same pending action, bounded,
    /// without re-querying the model.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ComputerError::CaptureTimeout(_)
                | ComputerError::NavigationTimeout(_)
                | ComputerError::ElementNotInteractable(_)
        )
    }
}

/// One controllable browser instance, local or remote. The agent loop is the
/// sole owner for the session's lifetime: no concurrent callers, no reentrant
/// dispatch, and `close` must be called on every exit path.
///
/// Both backends present this exact contract; backend-native coordinate
/// systems, timing units, and error types never leak through it.
#[async_trait]
pub trait Computer: Send {
    /// The fixed session viewport.
    fn viewport(&self) -> Viewport;

    /// Whether this backend renders a cursor-highlight overlay. The remote
    /// backend accepts the option but cannot honor it; callers that care can
    /// observe the asymmetry here instead of probing backend types.
    fn highlights_cursor(&self) -> bool;

    /// Capture the rendered viewport, reflecting state no older than the most
    /// recently dispatched action's completion. Bounded; fails with
    /// `CaptureTimeout` rather than blocking.
    async fn screenshot(&mut self) -> Result<Screenshot, ComputerError>;

    /// Perform one action. Atomic from the caller's perspective: a failed
    /// pointer gesture never leaves the pointer held down. `Finish` must not
    /// be dispatched; `Screenshot` is accepted as a no-op.
    async fn dispatch(&mut self, action: &Action) -> Result<(), ComputerError>;

    async fn current_url(&mut self) -> Result<String, ComputerError>;

    /// Idempotent; releases all underlying resources. Safe to call multiple
    /// times and after a failure.
    async fn close(&mut self) -> Result<(), ComputerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_and_transient_classification() {
        assert!(ComputerError::Launch("no chrome".into()).is_fatal());
        assert!(ComputerError::BackendDisconnected("ws closed".into()).is_fatal());
        assert!(!ComputerError::CaptureTimeout("10s".into()).is_fatal());

        assert!(ComputerError::CaptureTimeout("10s".into()).is_transient());
        assert!(ComputerError::NavigationTimeout("30s".into()).is_transient());
        assert!(ComputerError::ElementNotInteractable("covered".into()).is_transient());
        assert!(!ComputerError::BackendDisconnected("gone".into()).is_transient());
        assert!(!ComputerError::OutOfBounds("(-1, 0)".into()).is_transient());
    }

    #[test]
    fn invalid_action_converts_to_out_of_bounds() {
        let err: ComputerError = InvalidAction::EmptyDragPath.into();
        assert!(matches!(err, ComputerError::OutOfBounds(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn screenshot_base64() {
        let shot = Screenshot {
            png: vec![0x89, 0x50, 0x4e, 0x47],
            width: 4,
            height: 1,
        };
        assert_eq!(shot.to_base64(), "iVBORw==");
    }
}
