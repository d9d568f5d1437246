use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Fixed pixel dimensions of the controlled browsing surface. Set once at
/// session construction and immutable for the session's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// True when (x, y) lies inside `[0, width) x [0, height)`.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && (x as u32) < self.width && (y as u32) < self.height
    }
}

impl fmt::Display for Viewport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    #[default]
    Left,
    Middle,
    Right,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// One discrete GUI instruction issued to a computer. `Screenshot` is
/// perception-only; `Finish` is terminal and never dispatched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Click {
        x: i32,
        y: i32,
        #[serde(default)]
        button: MouseButton,
    },
    DoubleClick {
        x: i32,
        y: i32,
    },
    Drag {
        path: Vec<Point>,
    },
    Scroll {
        x: i32,
        y: i32,
        dx: i32,
        dy: i32,
    },
    TypeText {
        text: String,
    },
    KeyPress {
        keys: Vec<String>,
    },
    Wait {
        duration: Duration,
    },
    Navigate {
        url: String,
    },
    Screenshot,
    Finish {
        reasoning: String,
    },
}

/// Reason an action was rejected before reaching a computer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidAction {
    #[error("coordinate ({x}, {y}) outside viewport {viewport}")]
    OutOfBounds { x: i32, y: i32, viewport: Viewport },
    #[error("drag path is empty")]
    EmptyDragPath,
    #[error("key press carries no keys")]
    EmptyKeySequence,
    #[error("navigation url is empty")]
    EmptyUrl,
}

impl Action {
    /// Gate every action against the session viewport before dispatch.
    /// Violations never reach a backend.
    pub fn validate(&self, viewport: Viewport) -> Result<(), InvalidAction> {
        let check = |x: i32, y: i32| {
            if viewport.contains(x, y) {
                Ok(())
            } else {
                Err(InvalidAction::OutOfBounds { x, y, viewport })
            }
        };
        match self {
            Action::Click { x, y, .. } => check(*x, *y),
            Action::DoubleClick { x, y } => check(*x, *y),
            Action::Drag { path } => {
                if path.is_empty() {
                    return Err(InvalidAction::EmptyDragPath);
                }
                for p in path {
                    check(p.x, p.y)?;
                }
                Ok(())
            }
            Action::Scroll { x, y, .. } => check(*x, *y),
            Action::KeyPress { keys } => {
                if keys.is_empty() {
                    Err(InvalidAction::EmptyKeySequence)
                } else {
                    Ok(())
                }
            }
            Action::Navigate { url } => {
                if url.trim().is_empty() {
                    Err(InvalidAction::EmptyUrl)
                } else {
                    Ok(())
                }
            }
            Action::TypeText { .. } | Action::Wait { .. } | Action::Screenshot => Ok(()),
            Action::Finish { .. } => Ok(()),
        }
    }

    /// Short tag for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Click { .. } => "click",
            Action::DoubleClick { .. } => "double_click",
            Action::Drag { .. } => "drag",
            Action::Scroll { .. } => "scroll",
            Action::TypeText { .. } => "type_text",
            Action::KeyPress { .. } => "key_press",
            Action::Wait { .. } => "wait",
            Action::Navigate { .. } => "navigate",
            Action::Screenshot => "screenshot",
            Action::Finish { .. } => "finish",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Action::Finish { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VP: Viewport = Viewport {
        width: 1440,
        height: 900,
    };

    #[test]
    fn click_inside_bounds_passes() {
        let action = Action::Click {
            x: 0,
            y: 0,
            button: MouseButton::Left,
        };
        assert!(action.validate(VP).is_ok());

        let action = Action::Click {
            x: 1439,
            y: 899,
            button: MouseButton::Left,
        };
        assert!(action.validate(VP).is_ok());
    }

    #[test]
    fn click_boundary_fuzz_rejected() {
        for (x, y) in [(-1, 0), (0, -1), (1440, 0), (0, 900), (9999, 9999)] {
            let action = Action::Click {
                x,
                y,
                button: MouseButton::Left,
            };
            assert_eq!(
                action.validate(VP),
                Err(InvalidAction::OutOfBounds { x, y, viewport: VP }),
                "({x}, {y}) must be rejected"
            );
        }
    }

    #[test]
    fn drag_checks_every_path_point() {
        let ok = Action::Drag {
            path: vec![Point::new(10, 10), Point::new(700, 450), Point::new(1439, 899)],
        };
        assert!(ok.validate(VP).is_ok());

        let bad = Action::Drag {
            path: vec![Point::new(10, 10), Point::new(1440, 450)],
        };
        assert!(matches!(
            bad.validate(VP),
            Err(InvalidAction::OutOfBounds { x: 1440, .. })
        ));

        let empty = Action::Drag { path: vec![] };
        assert_eq!(empty.validate(VP), Err(InvalidAction::EmptyDragPath));
    }

    #[test]
    fn scroll_origin_is_bounds_checked() {
        let ok = Action::Scroll {
            x: 720,
            y: 450,
            dx: 0,
            dy: -300,
        };
        assert!(ok.validate(VP).is_ok());

        let bad = Action::Scroll {
            x: -1,
            y: 0,
            dx: 0,
            dy: 100,
        };
        assert!(bad.validate(VP).is_err());
    }

    #[test]
    fn shape_validation() {
        assert_eq!(
            Action::KeyPress { keys: vec![] }.validate(VP),
            Err(InvalidAction::EmptyKeySequence)
        );
        assert_eq!(
            Action::Navigate { url: "  ".into() }.validate(VP),
            Err(InvalidAction::EmptyUrl)
        );
        assert!(Action::TypeText { text: String::new() }.validate(VP).is_ok());
        assert!(Action::Screenshot.validate(VP).is_ok());
        assert!(Action::Wait {
            duration: Duration::from_secs(1)
        }
        .validate(VP)
        .is_ok());
    }

    #[test]
    fn action_serde_round_trip_is_tagged() {
        let action = Action::Click {
            x: 5,
            y: 7,
            button: MouseButton::Right,
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "click");
        assert_eq!(json["button"], "right");
    }
}
