//! Decision capability: the external vision model that picks the next action.
//!
//! The loop only sees [`Decision`] values coming back from a `Decider`; the
//! HTTP client below talks to a hosted computer-use model, rebuilds the
//! conversation from the loop's history on every call, and decodes the
//! model's function calls into the action vocabulary. Model coordinates are
//! normalized to a 0-999 grid and denormalized against the real viewport
//! here; the loop still bounds-checks whatever comes out.

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::env;
use std::time::Duration;
use thiserror::Error;

use crate::action::{Action, MouseButton, Point, Viewport};
use crate::agent::{Decider, DecisionRequest, StepOutcome, StepRecord};

/// Exactly one of these comes back per decision step. `Finish` is the only
/// way a run terminates successfully; completion is never inferred from the
/// shape of free text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Decision {
    Act(Action),
    Finish { reasoning: String },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecisionError {
    #[error("decider is not configured: {0}")]
    Configuration(String),
    #[error("decision transport failed: {0}")]
    Transport(String),
    #[error("decision output was malformed: {0}")]
    Malformed(String),
    #[error("decision output was empty")]
    Empty,
}

#[derive(Clone, Debug)]
pub struct DeciderConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
}

impl Default for DeciderConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("GEMINI_BASE_URL")
                .unwrap_or_else(|_| "https://generativelanguage.googleapis.com/v1beta".into()),
            api_key: env::var("GEMINI_API_KEY")
                .or_else(|_| env::var("GOOGLE_API_KEY"))
                .unwrap_or_default(),
            model: env::var("GEMINI_COMPUTER_USE_MODEL")
                .unwrap_or_else(|_| "gemini-2.5-computer-use-preview-10-2025".into()),
        }
    }
}

#[derive(Clone)]
pub struct HttpDecider {
    http: HttpClient,
    config: DeciderConfig,
}

impl HttpDecider {
    pub fn new(config: DeciderConfig) -> Result<Self, DecisionError> {
        if config.api_key.is_empty() {
            return Err(DecisionError::Configuration("api key is missing".into()));
        }
        Ok(Self {
            http: HttpClient::new(),
            config,
        })
    }

    fn request_body(request: &DecisionRequest<'_>) -> Value {
        let viewport = request.viewport;
        let preamble = format!(
            "{task}\n\nYou are driving a web browser through function calls. \
             The viewport is {w}x{h} pixels; every coordinate argument is \
             normalized to a 0-999 grid over that viewport. Issue exactly one \
             function call per turn. When the task is complete, reply with \
             plain text containing your final answer instead of a function \
             call.",
            task = request.task,
            w = viewport.width,
            h = viewport.height,
        );
        let mut contents = vec![json!({
            "role": "user",
            "parts": [{ "text": preamble }]
        })];

        for record in request.history {
            match &record.decision {
                Some(Decision::Act(action)) => {
                    let (name, args) = encode_action(action, viewport);
                    contents.push(json!({
                        "role": "model",
                        "parts": [{ "functionCall": { "name": name, "args": args } }]
                    }));
                    contents.push(json!({
                        "role": "user",
                        "parts": [{ "functionResponse": {
                            "name": name,
                            "response": { "outcome": outcome_text(record) }
                        }}]
                    }));
                }
                Some(Decision::Finish { .. }) => {}
                None => {
                    let reason = match &record.outcome {
                        StepOutcome::DecisionFailed { reason } => reason.clone(),
                        other => format!("{other:?}"),
                    };
                    contents.push(json!({
                        "role": "user",
                        "parts": [{ "text": format!(
                            "Your previous reply could not be interpreted: {reason}. \
                             Reply with exactly one function call."
                        )}]
                    }));
                }
            }
        }

        contents.push(json!({
            "role": "user",
            "parts": [
                { "text": format!("current_url={}", request.observation.url) },
                { "inlineData": {
                    "mimeType": "image/png",
                    "data": request.observation.image_base64
                }}
            ]
        }));

        json!({
            "contents": contents,
            "tools": [{ "functionDeclarations": function_declarations() }]
        })
    }

    fn parse_response(value: &Value, viewport: Viewport) -> Result<Decision, DecisionError> {
        let parts = value
            .pointer("/candidates/0/content/parts")
            .and_then(|p| p.as_array())
            .ok_or(DecisionError::Empty)?;

        let mut text_parts: Vec<&str> = Vec::new();
        for part in parts {
            if let Some(call) = part.get("functionCall") {
                let name = call
                    .get("name")
                    .and_then(|n| n.as_str())
                    .ok_or_else(|| DecisionError::Malformed("function call has no name".into()))?;
                let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
                return decode_function(name, &args, viewport).map(Decision::Act);
            }
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                text_parts.push(text);
            }
        }

        if text_parts.is_empty() {
            return Err(DecisionError::Empty);
        }
        Ok(Decision::Finish {
            reasoning: text_parts.join("\n").trim().to_string(),
        })
    }
}

#[async_trait]
impl Decider for HttpDecider {
    async fn decide(&self, request: DecisionRequest<'_>) -> Result<Decision, DecisionError> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.config.api_base.trim_end_matches('/'),
            self.config.model
        );
        let body = Self::request_body(&request);
        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| DecisionError::Transport(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| DecisionError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(DecisionError::Transport(format!(
                "decision endpoint returned {status}: {text}"
            )));
        }
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| DecisionError::Malformed(format!("response is not json: {e}")))?;
        Self::parse_response(&value, request.viewport)
    }
}

/// 0-999 grid value -> viewport pixel. Out-of-grid input maps out of the
/// viewport and is rejected downstream rather than clamped into it.
fn denormalize(value: i64, extent: u32) -> i32 {
    ((value * extent as i64) / 1000) as i32
}

fn normalize(value: i32, extent: u32) -> i64 {
    if extent == 0 {
        return 0;
    }
    ((value as i64 * 1000) / extent as i64).clamp(0, 999)
}

fn require_i64(args: &Value, field: &str, function: &str) -> Result<i64, DecisionError> {
    args.get(field).and_then(|v| v.as_i64()).ok_or_else(|| {
        DecisionError::Malformed(format!("{function} is missing integer field `{field}`"))
    })
}

fn decode_function(name: &str, args: &Value, viewport: Viewport) -> Result<Action, DecisionError> {
    let action = match name {
        "click_at" => {
            let button = match args.get("button").and_then(|b| b.as_str()) {
                Some("right") => MouseButton::Right,
                Some("middle") => MouseButton::Middle,
                _ => MouseButton::Left,
            };
            Action::Click {
                x: denormalize(require_i64(args, "x", name)?, viewport.width),
                y: denormalize(require_i64(args, "y", name)?, viewport.height),
                button,
            }
        }
        "double_click_at" => Action::DoubleClick {
            x: denormalize(require_i64(args, "x", name)?, viewport.width),
            y: denormalize(require_i64(args, "y", name)?, viewport.height),
        },
        "drag" => {
            let raw = args
                .get("path")
                .and_then(|p| p.as_array())
                .ok_or_else(|| {
                    DecisionError::Malformed("drag is missing array field `path`".into())
                })?;
            let mut path = Vec::with_capacity(raw.len());
            for point in raw {
                let x = point.get("x").and_then(|v| v.as_i64());
                let y = point.get("y").and_then(|v| v.as_i64());
                match (x, y) {
                    (Some(x), Some(y)) => path.push(Point::new(
                        denormalize(x, viewport.width),
                        denormalize(y, viewport.height),
                    )),
                    _ => {
                        return Err(DecisionError::Malformed(
                            "drag path point is missing x or y".into(),
                        ))
                    }
                }
            }
            Action::Drag { path }
        }
        "scroll_at" => Action::Scroll {
            x: denormalize(require_i64(args, "x", name)?, viewport.width),
            y: denormalize(require_i64(args, "y", name)?, viewport.height),
            dx: args.get("dx").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
            dy: args.get("dy").and_then(|v| v.as_i64()).unwrap_or(0) as i32,
        },
        "type_text" => Action::TypeText {
            text: args
                .get("text")
                .and_then(|t| t.as_str())
                .ok_or_else(|| {
                    DecisionError::Malformed("type_text is missing field `text`".into())
                })?
                .to_string(),
        },
        "key_combination" => {
            let keys = args
                .get("keys")
                .and_then(|k| k.as_array())
                .map(|keys| {
                    keys.iter()
                        .filter_map(|k| k.as_str().map(str::to_string))
                        .collect::<Vec<_>>()
                })
                .ok_or_else(|| {
                    DecisionError::Malformed("key_combination is missing field `keys`".into())
                })?;
            Action::KeyPress { keys }
        }
        "wait" => {
            let seconds = args
                .get("seconds")
                .and_then(|s| s.as_f64())
                .unwrap_or(1.0)
                .clamp(0.0, 30.0);
            Action::Wait {
                duration: Duration::from_secs_f64(seconds),
            }
        }
        "navigate" => Action::Navigate {
            url: args
                .get("url")
                .and_then(|u| u.as_str())
                .ok_or_else(|| DecisionError::Malformed("navigate is missing field `url`".into()))?
                .to_string(),
        },
        "take_screenshot" => Action::Screenshot,
        other => {
            return Err(DecisionError::Malformed(format!(
                "unsupported function `{other}`"
            )))
        }
    };
    Ok(action)
}

/// Inverse of `decode_function`, used to replay history turns back to the
/// model in its own coordinate space.
fn encode_action(action: &Action, viewport: Viewport) -> (&'static str, Value) {
    match action {
        Action::Click { x, y, button } => (
            "click_at",
            json!({
                "x": normalize(*x, viewport.width),
                "y": normalize(*y, viewport.height),
                "button": match button {
                    MouseButton::Left => "left",
                    MouseButton::Middle => "middle",
                    MouseButton::Right => "right",
                },
            }),
        ),
        Action::DoubleClick { x, y } => (
            "double_click_at",
            json!({
                "x": normalize(*x, viewport.width),
                "y": normalize(*y, viewport.height),
            }),
        ),
        Action::Drag { path } => (
            "drag",
            json!({
                "path": path.iter().map(|p| json!({
                    "x": normalize(p.x, viewport.width),
                    "y": normalize(p.y, viewport.height),
                })).collect::<Vec<_>>(),
            }),
        ),
        Action::Scroll { x, y, dx, dy } => (
            "scroll_at",
            json!({
                "x": normalize(*x, viewport.width),
                "y": normalize(*y, viewport.height),
                "dx": dx,
                "dy": dy,
            }),
        ),
        Action::TypeText { text } => ("type_text", json!({ "text": text })),
        Action::KeyPress { keys } => ("key_combination", json!({ "keys": keys })),
        Action::Wait { duration } => ("wait", json!({ "seconds": duration.as_secs_f64() })),
        Action::Navigate { url } => ("navigate", json!({ "url": url })),
        Action::Screenshot => ("take_screenshot", json!({})),
        Action::Finish { reasoning } => ("finish", json!({ "reasoning": reasoning })),
    }
}

fn outcome_text(record: &StepRecord) -> String {
    match &record.outcome {
        StepOutcome::Completed => "ok".to_string(),
        StepOutcome::ActionFailed { error } => format!("error: {error}"),
        StepOutcome::Rejected { reason } => format!("rejected: {reason}"),
        StepOutcome::DecisionFailed { reason } => format!("undecided: {reason}"),
    }
}

fn function_declarations() -> Value {
    json!([
        {
            "name": "click_at",
            "description": "Click at a normalized (0-999) viewport coordinate.",
            "parameters": {
                "type": "object",
                "properties": {
                    "x": { "type": "integer" },
                    "y": { "type": "integer" },
                    "button": { "type": "string", "enum": ["left", "middle", "right"] }
                },
                "required": ["x", "y"]
            }
        },
        {
            "name": "double_click_at",
            "description": "Double-click at a normalized viewport coordinate.",
            "parameters": {
                "type": "object",
                "properties": {
                    "x": { "type": "integer" },
                    "y": { "type": "integer" }
                },
                "required": ["x", "y"]
            }
        },
        {
            "name": "drag",
            "description": "Press at the first path point, move through the rest, release at the last.",
            "parameters": {
                "type": "object",
                "properties": {
                    "path": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "x": { "type": "integer" },
                                "y": { "type": "integer" }
                            },
                            "required": ["x", "y"]
                        }
                    }
                },
                "required": ["path"]
            }
        },
        {
            "name": "scroll_at",
            "description": "Scroll at a normalized coordinate by dx/dy pixels; positive dy scrolls down.",
            "parameters": {
                "type": "object",
                "properties": {
                    "x": { "type": "integer" },
                    "y": { "type": "integer" },
                    "dx": { "type": "integer" },
                    "dy": { "type": "integer" }
                },
                "required": ["x", "y"]
            }
        },
        {
            "name": "type_text",
            "description": "Type text into the focused element.",
            "parameters": {
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            }
        },
        {
            "name": "key_combination",
            "description": "Press keys as a chord, e.g. [\"Control\", \"a\"].",
            "parameters": {
                "type": "object",
                "properties": {
                    "keys": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["keys"]
            }
        },
        {
            "name": "wait",
            "description": "Pause before the next observation.",
            "parameters": {
                "type": "object",
                "properties": { "seconds": { "type": "number" } }
            }
        },
        {
            "name": "navigate",
            "description": "Load a URL in the controlled tab.",
            "parameters": {
                "type": "object",
                "properties": { "url": { "type": "string" } },
                "required": ["url"]
            }
        },
        {
            "name": "take_screenshot",
            "description": "Capture the viewport without changing page state.",
            "parameters": { "type": "object", "properties": {} }
        }
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Observation;

    const VP: Viewport = Viewport {
        width: 1440,
        height: 900,
    };

    #[test]
    fn denormalize_keeps_grid_inside_viewport() {
        assert_eq!(denormalize(0, 1440), 0);
        assert_eq!(denormalize(999, 1440), 1438);
        assert_eq!(denormalize(999, 900), 899);
        assert_eq!(denormalize(500, 1440), 720);
        // Out-of-grid values stay out of bounds for the loop to reject.
        assert_eq!(denormalize(9999, 1440), 14398);
        assert_eq!(denormalize(-1, 1440), -1);
    }

    #[test]
    fn normalize_round_trips_within_grid() {
        for px in [0, 1, 719, 1439] {
            let grid = normalize(px, 1440);
            assert!((0..=999).contains(&grid));
            let back = denormalize(grid, 1440);
            assert!((back - px).abs() <= 2, "px {px} round-tripped to {back}");
        }
    }

    #[test]
    fn decode_click_denormalizes() {
        let action =
            decode_function("click_at", &json!({ "x": 500, "y": 500, "button": "right" }), VP)
                .unwrap();
        assert_eq!(
            action,
            Action::Click {
                x: 720,
                y: 450,
                button: MouseButton::Right,
            }
        );
    }

    #[test]
    fn decode_rejects_unknown_and_partial_calls() {
        assert!(matches!(
            decode_function("open_coffee_machine", &json!({}), VP),
            Err(DecisionError::Malformed(_))
        ));
        assert!(matches!(
            decode_function("click_at", &json!({ "x": 3 }), VP),
            Err(DecisionError::Malformed(_))
        ));
        assert!(matches!(
            decode_function("type_text", &json!({}), VP),
            Err(DecisionError::Malformed(_))
        ));
    }

    #[test]
    fn parse_function_call_wins_over_text() {
        let value = json!({
            "candidates": [{ "content": { "parts": [
                { "text": "I will click the button." },
                { "functionCall": { "name": "click_at", "args": { "x": 10, "y": 10 } } }
            ]}}]
        });
        let decision = HttpDecider::parse_response(&value, VP).unwrap();
        assert!(matches!(decision, Decision::Act(Action::Click { .. })));
    }

    #[test]
    fn parse_plain_text_is_terminal() {
        let value = json!({
            "candidates": [{ "content": { "parts": [
                { "text": "Result: PASS" }
            ]}}]
        });
        let decision = HttpDecider::parse_response(&value, VP).unwrap();
        assert_eq!(
            decision,
            Decision::Finish {
                reasoning: "Result: PASS".into()
            }
        );
    }

    #[test]
    fn parse_empty_response_is_empty_error() {
        assert_eq!(
            HttpDecider::parse_response(&json!({ "candidates": [] }), VP),
            Err(DecisionError::Empty)
        );
        let no_parts = json!({ "candidates": [{ "content": { "parts": [] } }] });
        assert_eq!(
            HttpDecider::parse_response(&no_parts, VP),
            Err(DecisionError::Empty)
        );
    }

    #[test]
    fn request_body_replays_history_in_model_coordinates() {
        let record = StepRecord {
            index: 0,
            observation: Observation {
                url: "https://example.test/".into(),
                image_base64: "aGk=".into(),
                width: VP.width,
                height: VP.height,
            },
            decision: Some(Decision::Act(Action::Click {
                x: 720,
                y: 450,
                button: MouseButton::Left,
            })),
            outcome: StepOutcome::Completed,
        };
        let observation = record.observation.clone();
        let history = vec![record];
        let body = HttpDecider::request_body(&DecisionRequest {
            task: "check the page",
            history: &history,
            observation: &observation,
            viewport: VP,
            step: 1,
        });
        let contents = body["contents"].as_array().unwrap();
        // preamble + model call + function response + current observation
        assert_eq!(contents.len(), 4);
        assert_eq!(contents[1]["parts"][0]["functionCall"]["name"], "click_at");
        assert_eq!(contents[1]["parts"][0]["functionCall"]["args"]["x"], 500);
        assert_eq!(
            contents[2]["parts"][0]["functionResponse"]["response"]["outcome"],
            "ok"
        );
        assert_eq!(
            contents[3]["parts"][1]["inlineData"]["mimeType"],
            "image/png"
        );
    }
}
