//! The agent loop: observe -> decide -> act until the model finishes, a
//! budget runs out, or the backend dies.
//!
//! The loop is single-flight by construction: one action in flight at a time,
//! and the next decision never starts before the prior outcome is recorded.
//! History is an append-only log; every absorbed failure lands in it so the
//! model sees what went wrong on its next turn.

use async_trait::async_trait;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::action::Viewport;
use crate::computer::{Computer, ComputerError, Screenshot};
use crate::decision::{Decision, DecisionError};

#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Hard cap on dispatched actions.
    pub max_steps: u32,
    /// Consecutive rejected actions tolerated before the run fails. Separate
    /// budget from `max_steps`: rejections never consume a dispatch.
    pub max_consecutive_invalid: u32,
    /// Attempts per observation capture and per pending action on transient
    /// failures. Retries re-attempt dispatch only; the model is not re-queried.
    pub max_transient_attempts: u32,
    pub decision_timeout: Duration,
    pub retry_backoff: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 50,
            max_consecutive_invalid: 3,
            max_transient_attempts: 3,
            decision_timeout: Duration::from_secs(90),
            retry_backoff: Duration::from_millis(200),
        }
    }
}

/// What the loop saw at the start of a step: the rendered viewport and where
/// the browser was.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub url: String,
    pub image_base64: String,
    pub width: u32,
    pub height: u32,
}

impl Observation {
    pub fn new(url: String, screenshot: &Screenshot) -> Self {
        Self {
            url,
            image_base64: screenshot.to_base64(),
            width: screenshot.width,
            height: screenshot.height,
        }
    }
}

/// How one history entry ended.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StepOutcome {
    /// Action dispatched successfully; consumed one step.
    Completed,
    /// Recoverable dispatch failure, absorbed; the same action was retried.
    ActionFailed { error: ComputerError },
    /// Action rejected before dispatch; consumed invalid-action budget only.
    Rejected { reason: String },
    /// The decision step produced nothing usable; absorbed once.
    DecisionFailed { reason: String },
}

/// One entry of the append-only history log. Entries are pushed, never
/// mutated; the index is their position at insertion time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: u32,
    pub observation: Observation,
    pub decision: Option<Decision>,
    pub outcome: StepOutcome,
}

/// Everything a decider gets to see for one decision.
pub struct DecisionRequest<'a> {
    pub task: &'a str,
    pub history: &'a [StepRecord],
    pub observation: &'a Observation,
    pub viewport: Viewport,
    pub step: u32,
}

/// The external decision capability. Implementations are never trusted: the
/// loop validates every returned action before acting on it.
#[async_trait]
pub trait Decider: Send + Sync {
    async fn decide(&self, request: DecisionRequest<'_>) -> Result<Decision, DecisionError>;
}

#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum FailureReason {
    #[error("step limit of {0} reached")]
    StepLimit(u32),
    #[error("{0} consecutive invalid actions")]
    InvalidActionBudget(u32),
    #[error("decision capability failed repeatedly: {0}")]
    Decision(String),
    #[error(transparent)]
    Backend(ComputerError),
    #[error("stopped by operator")]
    Stopped,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RunOutcome {
    /// The model produced a terminal answer.
    Finished { reasoning: String },
    /// The loop gave up. Deliberately carries no narrative: the run never got
    /// to reason about its own failure, so none is fabricated.
    Failed { reason: FailureReason },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub outcome: RunOutcome,
    pub steps_taken: u32,
    pub absorbed_failures: u32,
    pub history: Vec<StepRecord>,
    pub total_time_ms: u64,
}

impl RunReport {
    pub fn final_reasoning(&self) -> Option<&str> {
        match &self.outcome {
            RunOutcome::Finished { reasoning } => Some(reasoning),
            RunOutcome::Failed { .. } => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.outcome, RunOutcome::Finished { .. })
    }

    /// Write the final reasoning to `path`, creating parent directories as
    /// needed. A run that did not finish leaves the file untouched and
    /// returns `false`.
    pub async fn write_final_reasoning(&self, path: &Path) -> std::io::Result<bool> {
        let Some(reasoning) = self.final_reasoning() else {
            return Ok(false);
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, reasoning).await?;
        Ok(true)
    }
}

/// Cooperative stop signal. Honored only at the step boundary, between the
/// end of one action and the next observation; an in-flight browser action is
/// never interrupted mid-gesture.
#[derive(Clone, Debug, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

pub struct AgentLoop<D> {
    decider: D,
    config: AgentConfig,
    stop: StopHandle,
}

impl<D: Decider> AgentLoop<D> {
    pub fn new(decider: D, config: AgentConfig) -> Self {
        Self {
            decider,
            config,
            stop: StopHandle::default(),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Run against an owned computer and release it on every exit path. This
    /// is the only supported entry point for real sessions; a leaked browser
    /// process or billed remote session is a bug, not an inconvenience.
    pub async fn run_session(&self, task: &str, mut computer: Box<dyn Computer>) -> RunReport {
        let report = self.run(task, computer.as_mut()).await;
        if let Err(e) = computer.close().await {
            warn!(error = %e, "computer release failed after run");
        }
        report
    }

    /// Drive the loop to a terminal outcome. Never panics on model or backend
    /// misbehavior; everything recoverable is absorbed into history and
    /// everything fatal becomes a failed outcome.
    pub async fn run(&self, task: &str, computer: &mut dyn Computer) -> RunReport {
        let run_id = nanoid!();
        let start = Instant::now();
        let viewport = computer.viewport();
        let mut history: Vec<StepRecord> = Vec::new();
        let mut steps_taken: u32 = 0;
        let mut absorbed_failures: u32 = 0;
        let mut consecutive_invalid: u32 = 0;
        info!(run = %run_id, %viewport, "agent run started");

        let outcome = 'run: loop {
            // Step boundary: the only place external stops and budget checks
            // are honored.
            if self.stop.is_stopped() {
                info!(run = %run_id, "stop requested; ending run");
                break RunOutcome::Failed {
                    reason: FailureReason::Stopped,
                };
            }
            if steps_taken >= self.config.max_steps {
                break RunOutcome::Failed {
                    reason: FailureReason::StepLimit(self.config.max_steps),
                };
            }

            let observation = match self.observe(computer).await {
                Ok(observation) => observation,
                Err(error) => {
                    warn!(run = %run_id, %error, "observation failed; ending run");
                    break RunOutcome::Failed {
                        reason: FailureReason::Backend(error),
                    };
                }
            };

            // Invalid actions and absorbed decision failures loop back here
            // with the same observation; no dispatch is consumed.
            let mut decision_failures: u32 = 0;
            'decide: loop {
                let request = DecisionRequest {
                    task,
                    history: &history,
                    observation: &observation,
                    viewport,
                    step: steps_taken,
                };
                let decided = match timeout(
                    self.config.decision_timeout,
                    self.decider.decide(request),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(DecisionError::Transport(format!(
                        "no decision within {:?}",
                        self.config.decision_timeout
                    ))),
                };

                let decision = match decided {
                    Ok(decision) => {
                        decision_failures = 0;
                        decision
                    }
                    Err(error) => {
                        decision_failures += 1;
                        absorbed_failures += 1;
                        warn!(run = %run_id, %error, attempt = decision_failures, "decision failed");
                        history.push(StepRecord {
                            index: history.len() as u32,
                            observation: observation.clone(),
                            decision: None,
                            outcome: StepOutcome::DecisionFailed {
                                reason: error.to_string(),
                            },
                        });
                        if decision_failures >= 2 {
                            break 'run RunOutcome::Failed {
                                reason: FailureReason::Decision(error.to_string()),
                            };
                        }
                        // One retry against the same observation.
                        continue 'decide;
                    }
                };

                match decision {
                    Decision::Finish { reasoning } => {
                        info!(run = %run_id, steps = steps_taken, "model finished the task");
                        break 'run RunOutcome::Finished { reasoning };
                    }
                    Decision::Act(action) => {
                        if let Err(invalid) = action.validate(viewport) {
                            consecutive_invalid += 1;
                            absorbed_failures += 1;
                            warn!(
                                run = %run_id,
                                action = action.kind(),
                                %invalid,
                                streak = consecutive_invalid,
                                "action rejected before dispatch"
                            );
                            history.push(StepRecord {
                                index: history.len() as u32,
                                observation: observation.clone(),
                                decision: Some(Decision::Act(action)),
                                outcome: StepOutcome::Rejected {
                                    reason: invalid.to_string(),
                                },
                            });
                            if consecutive_invalid >= self.config.max_consecutive_invalid {
                                break 'run RunOutcome::Failed {
                                    reason: FailureReason::InvalidActionBudget(
                                        consecutive_invalid,
                                    ),
                                };
                            }
                            continue 'decide;
                        }
                        consecutive_invalid = 0;

                        let mut attempt: u32 = 1;
                        loop {
                            match computer.dispatch(&action).await {
                                Ok(()) => {
                                    steps_taken += 1;
                                    info!(
                                        run = %run_id,
                                        step = steps_taken,
                                        action = action.kind(),
                                        "action dispatched"
                                    );
                                    history.push(StepRecord {
                                        index: history.len() as u32,
                                        observation: observation.clone(),
                                        decision: Some(Decision::Act(action)),
                                        outcome: StepOutcome::Completed,
                                    });
                                    break;
                                }
                                Err(error)
                                    if error.is_transient()
                                        && attempt < self.config.max_transient_attempts =>
                                {
                                    absorbed_failures += 1;
                                    warn!(
                                        run = %run_id,
                                        action = action.kind(),
                                        attempt,
                                        %error,
                                        "dispatch failed; retrying same action"
                                    );
                                    history.push(StepRecord {
                                        index: history.len() as u32,
                                        observation: observation.clone(),
                                        decision: Some(Decision::Act(action.clone())),
                                        outcome: StepOutcome::ActionFailed { error },
                                    });
                                    attempt += 1;
                                    sleep(self.config.retry_backoff).await;
                                }
                                Err(error) => {
                                    warn!(run = %run_id, %error, "dispatch failed; ending run");
                                    break 'run RunOutcome::Failed {
                                        reason: FailureReason::Backend(error),
                                    };
                                }
                            }
                        }
                        break 'decide;
                    }
                }
            }
        };

        let report = RunReport {
            run_id,
            outcome,
            steps_taken,
            absorbed_failures,
            history,
            total_time_ms: start.elapsed().as_millis() as u64,
        };
        match &report.outcome {
            RunOutcome::Finished { .. } => {
                info!(run = %report.run_id, steps = report.steps_taken, "run finished")
            }
            RunOutcome::Failed { reason } => {
                warn!(run = %report.run_id, steps = report.steps_taken, %reason, "run failed")
            }
        }
        report
    }

    /// Capture URL + screenshot, retrying transient capture failures within
    /// the same bounded budget used for dispatch.
    async fn observe(&self, computer: &mut dyn Computer) -> Result<Observation, ComputerError> {
        let mut attempt: u32 = 1;
        loop {
            let captured = async {
                let url = computer.current_url().await?;
                let screenshot = computer.screenshot().await?;
                Ok::<_, ComputerError>(Observation::new(url, &screenshot))
            }
            .await;
            match captured {
                Ok(observation) => return Ok(observation),
                Err(error)
                    if error.is_transient() && attempt < self.config.max_transient_attempts =>
                {
                    warn!(attempt, %error, "observation capture failed; retrying");
                    attempt += 1;
                    sleep(self.config.retry_backoff).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, MouseButton};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const VP: Viewport = Viewport {
        width: 1440,
        height: 900,
    };

    fn fast_config() -> AgentConfig {
        AgentConfig {
            max_steps: 10,
            retry_backoff: Duration::from_millis(1),
            ..AgentConfig::default()
        }
    }

    fn shot() -> Screenshot {
        Screenshot {
            png: vec![1, 2, 3],
            width: VP.width,
            height: VP.height,
        }
    }

    fn click(x: i32, y: i32) -> Action {
        Action::Click {
            x,
            y,
            button: MouseButton::Left,
        }
    }

    /// Scriptable computer: failures are queued per call site, dispatches are
    /// recorded.
    #[derive(Default)]
    struct MockComputer {
        screenshot_failures: VecDeque<ComputerError>,
        dispatch_failures: VecDeque<ComputerError>,
        dispatched: Vec<Action>,
        screenshots_taken: u32,
    }

    #[async_trait]
    impl Computer for MockComputer {
        fn viewport(&self) -> Viewport {
            VP
        }

        fn highlights_cursor(&self) -> bool {
            false
        }

        async fn screenshot(&mut self) -> Result<Screenshot, ComputerError> {
            if let Some(error) = self.screenshot_failures.pop_front() {
                return Err(error);
            }
            self.screenshots_taken += 1;
            Ok(shot())
        }

        async fn dispatch(&mut self, action: &Action) -> Result<(), ComputerError> {
            if let Some(error) = self.dispatch_failures.pop_front() {
                return Err(error);
            }
            self.dispatched.push(action.clone());
            Ok(())
        }

        async fn current_url(&mut self) -> Result<String, ComputerError> {
            Ok("https://fixture.test/".into())
        }

        async fn close(&mut self) -> Result<(), ComputerError> {
            Ok(())
        }
    }

    /// Decider that replays a scripted sequence of results, then repeats the
    /// fallback forever.
    struct ScriptedDecider {
        script: Mutex<VecDeque<Result<Decision, DecisionError>>>,
        fallback: Result<Decision, DecisionError>,
    }

    impl ScriptedDecider {
        fn new(
            script: Vec<Result<Decision, DecisionError>>,
            fallback: Result<Decision, DecisionError>,
        ) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback,
            }
        }

        fn always(result: Result<Decision, DecisionError>) -> Self {
            Self::new(vec![], result)
        }
    }

    #[async_trait]
    impl Decider for ScriptedDecider {
        async fn decide(&self, _request: DecisionRequest<'_>) -> Result<Decision, DecisionError> {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone())
        }
    }

    fn finish(text: &str) -> Result<Decision, DecisionError> {
        Ok(Decision::Finish {
            reasoning: text.into(),
        })
    }

    #[tokio::test]
    async fn immediate_finish_terminates_with_reasoning() {
        let agent = AgentLoop::new(ScriptedDecider::always(finish("Result: PASS")), fast_config());
        let mut computer = MockComputer::default();
        let report = agent.run("qa the page", &mut computer).await;

        assert_eq!(
            report.outcome,
            RunOutcome::Finished {
                reasoning: "Result: PASS".into()
            }
        );
        assert_eq!(report.final_reasoning(), Some("Result: PASS"));
        assert_eq!(report.steps_taken, 0);
        assert!(computer.dispatched.is_empty());

        // The output artifact carries exactly the reasoning string.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("result.txt");
        assert!(report.write_final_reasoning(&path).await.unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "Result: PASS");
    }

    #[tokio::test]
    async fn out_of_bounds_actions_exhaust_invalid_budget() {
        let agent = AgentLoop::new(
            ScriptedDecider::always(Ok(Decision::Act(click(9999, 9999)))),
            fast_config(),
        );
        let mut computer = MockComputer::default();
        let report = agent.run("qa the page", &mut computer).await;

        assert_eq!(
            report.outcome,
            RunOutcome::Failed {
                reason: FailureReason::InvalidActionBudget(3)
            }
        );
        assert!(report.final_reasoning().is_none());
        // Rejected before dispatch: the computer never saw a single action.
        assert!(computer.dispatched.is_empty());
        assert_eq!(report.steps_taken, 0);
        assert_eq!(report.absorbed_failures, 3);
        assert_eq!(report.history.len(), 3);
        assert!(report
            .history
            .iter()
            .all(|r| matches!(r.outcome, StepOutcome::Rejected { .. })));

        // A failed run writes nothing.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result.txt");
        assert!(!report.write_final_reasoning(&path).await.unwrap());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn capture_timeout_is_retried_within_budget() {
        let agent = AgentLoop::new(
            ScriptedDecider::new(
                vec![
                    Ok(Decision::Act(click(10, 10))),
                    Ok(Decision::Act(click(20, 20))),
                ],
                finish("Result: PASS"),
            ),
            fast_config(),
        );
        let mut computer = MockComputer::default();
        // One observation fails twice, then succeeds; the retry path is the
        // same no matter which observation in the run it is.
        computer
            .screenshot_failures
            .push_back(ComputerError::CaptureTimeout("t".into()));
        computer
            .screenshot_failures
            .push_back(ComputerError::CaptureTimeout("t".into()));
        let report = agent.run("qa the page", &mut computer).await;

        assert!(report.is_finished());
        assert_eq!(report.steps_taken, 2);
        // Capture retries are absorbed silently; only decide/act failures
        // create history records.
        assert_eq!(report.history.len() as u32, report.steps_taken);
        assert_eq!(report.absorbed_failures, 0);
        // One capture per observation once the retries succeed.
        assert_eq!(computer.screenshots_taken, 3);
    }

    #[tokio::test]
    async fn capture_timeout_exhaustion_fails_the_run() {
        let agent = AgentLoop::new(ScriptedDecider::always(finish("unused")), fast_config());
        let mut computer = MockComputer::default();
        for _ in 0..3 {
            computer
                .screenshot_failures
                .push_back(ComputerError::CaptureTimeout("t".into()));
        }
        let report = agent.run("qa the page", &mut computer).await;
        assert_eq!(
            report.outcome,
            RunOutcome::Failed {
                reason: FailureReason::Backend(ComputerError::CaptureTimeout("t".into()))
            }
        );
    }

    #[tokio::test]
    async fn step_limit_bounds_a_decider_that_never_finishes() {
        let agent = AgentLoop::new(
            ScriptedDecider::always(Ok(Decision::Act(click(5, 5)))),
            fast_config(),
        );
        let mut computer = MockComputer::default();
        let report = agent.run("qa the page", &mut computer).await;

        assert_eq!(
            report.outcome,
            RunOutcome::Failed {
                reason: FailureReason::StepLimit(10)
            }
        );
        assert_eq!(report.steps_taken, 10);
        assert_eq!(computer.dispatched.len(), 10);
        // History accounting: every record is a step or an absorbed failure.
        assert_eq!(
            report.history.len() as u32,
            report.steps_taken + report.absorbed_failures
        );
    }

    #[tokio::test]
    async fn history_counts_steps_plus_absorbed_failures() {
        let agent = AgentLoop::new(
            ScriptedDecider::new(
                vec![
                    Ok(Decision::Act(click(-1, 0))),
                    Ok(Decision::Act(click(10, 10))),
                    Err(DecisionError::Empty),
                    Ok(Decision::Act(click(20, 20))),
                ],
                finish("done"),
            ),
            fast_config(),
        );
        let mut computer = MockComputer::default();
        let report = agent.run("qa the page", &mut computer).await;

        assert!(report.is_finished());
        assert_eq!(report.steps_taken, 2);
        assert_eq!(report.absorbed_failures, 2);
        assert_eq!(
            report.history.len() as u32,
            report.steps_taken + report.absorbed_failures
        );
    }

    #[tokio::test]
    async fn decision_failure_is_retried_once_then_fatal() {
        let recovers = AgentLoop::new(
            ScriptedDecider::new(vec![Err(DecisionError::Empty)], finish("ok after retry")),
            fast_config(),
        );
        let mut computer = MockComputer::default();
        let report = recovers.run("qa the page", &mut computer).await;
        assert!(report.is_finished());
        assert_eq!(report.absorbed_failures, 1);

        let fails = AgentLoop::new(
            ScriptedDecider::always(Err(DecisionError::Malformed("gibberish".into()))),
            fast_config(),
        );
        let mut computer = MockComputer::default();
        let report = fails.run("qa the page", &mut computer).await;
        assert!(matches!(
            report.outcome,
            RunOutcome::Failed {
                reason: FailureReason::Decision(_)
            }
        ));
        assert_eq!(report.history.len(), 2);
    }

    #[tokio::test]
    async fn transient_dispatch_failure_retries_same_action_without_redeciding() {
        let agent = AgentLoop::new(
            ScriptedDecider::new(vec![Ok(Decision::Act(click(30, 30)))], finish("done")),
            fast_config(),
        );
        let mut computer = MockComputer::default();
        computer
            .dispatch_failures
            .push_back(ComputerError::ElementNotInteractable("covered".into()));
        computer
            .dispatch_failures
            .push_back(ComputerError::ElementNotInteractable("covered".into()));
        let report = agent.run("qa the page", &mut computer).await;

        assert!(report.is_finished());
        assert_eq!(report.steps_taken, 1);
        assert_eq!(report.absorbed_failures, 2);
        assert_eq!(computer.dispatched, vec![click(30, 30)]);
        let failed_records = report
            .history
            .iter()
            .filter(|r| matches!(r.outcome, StepOutcome::ActionFailed { .. }))
            .count();
        assert_eq!(failed_records, 2);
    }

    #[tokio::test]
    async fn transient_dispatch_exhaustion_escalates() {
        let agent = AgentLoop::new(
            ScriptedDecider::always(Ok(Decision::Act(click(30, 30)))),
            fast_config(),
        );
        let mut computer = MockComputer::default();
        for _ in 0..3 {
            computer
                .dispatch_failures
                .push_back(ComputerError::NavigationTimeout("slow".into()));
        }
        let report = agent.run("qa the page", &mut computer).await;
        assert_eq!(
            report.outcome,
            RunOutcome::Failed {
                reason: FailureReason::Backend(ComputerError::NavigationTimeout("slow".into()))
            }
        );
    }

    #[tokio::test]
    async fn backend_disconnect_fails_immediately_without_retry() {
        let agent = AgentLoop::new(
            ScriptedDecider::always(Ok(Decision::Act(click(30, 30)))),
            fast_config(),
        );
        let mut computer = MockComputer::default();
        computer
            .dispatch_failures
            .push_back(ComputerError::BackendDisconnected("chrome died".into()));
        let report = agent.run("qa the page", &mut computer).await;
        assert!(matches!(
            report.outcome,
            RunOutcome::Failed {
                reason: FailureReason::Backend(ComputerError::BackendDisconnected(_))
            }
        ));
        assert_eq!(report.steps_taken, 0);
    }

    #[tokio::test]
    async fn valid_action_resets_invalid_streak() {
        let agent = AgentLoop::new(
            ScriptedDecider::new(
                vec![
                    Ok(Decision::Act(click(9999, 0))),
                    Ok(Decision::Act(click(9999, 0))),
                    Ok(Decision::Act(click(1, 1))),
                    Ok(Decision::Act(click(9999, 0))),
                    Ok(Decision::Act(click(9999, 0))),
                    Ok(Decision::Act(click(2, 2))),
                ],
                finish("done"),
            ),
            fast_config(),
        );
        let mut computer = MockComputer::default();
        let report = agent.run("qa the page", &mut computer).await;

        // Four rejections total, but never three in a row.
        assert!(report.is_finished());
        assert_eq!(report.steps_taken, 2);
        assert_eq!(report.absorbed_failures, 4);
    }

    #[tokio::test]
    async fn stop_handle_is_honored_at_the_step_boundary() {
        let agent = AgentLoop::new(
            ScriptedDecider::always(Ok(Decision::Act(click(5, 5)))),
            fast_config(),
        );
        agent.stop_handle().stop();
        let mut computer = MockComputer::default();
        let report = agent.run("qa the page", &mut computer).await;
        assert_eq!(
            report.outcome,
            RunOutcome::Failed {
                reason: FailureReason::Stopped
            }
        );
        assert!(computer.dispatched.is_empty());
    }

    #[tokio::test]
    async fn run_session_releases_the_computer_on_every_outcome() {
        // Finished run releases once.
        let releases = Arc::new(Mutex::new(0));
        let agent = AgentLoop::new(ScriptedDecider::always(finish("done")), fast_config());
        let computer = Box::new(CountingComputer::new(MockComputer::default(), releases.clone()));
        let report = agent.run_session("qa the page", computer).await;
        assert!(report.is_finished());
        assert_eq!(*releases.lock().unwrap(), 1);

        // Fatally failed run still releases exactly once.
        let releases = Arc::new(Mutex::new(0));
        let agent = AgentLoop::new(
            ScriptedDecider::always(Ok(Decision::Act(click(5, 5)))),
            fast_config(),
        );
        let mut inner = MockComputer::default();
        inner
            .dispatch_failures
            .push_back(ComputerError::BackendDisconnected("gone".into()));
        let computer = Box::new(CountingComputer::new(inner, releases.clone()));
        let report = agent.run_session("qa the page", computer).await;
        assert!(!report.is_finished());
        assert_eq!(*releases.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_releases_once() {
        let releases = Arc::new(Mutex::new(0));
        let mut computer = CountingComputer::new(MockComputer::default(), releases.clone());
        computer.close().await.unwrap();
        computer.close().await.unwrap();
        computer.close().await.unwrap();
        assert_eq!(*releases.lock().unwrap(), 1);
    }

    /// Release-counting wrapper with the same take-once close semantics the
    /// real backends implement.
    struct CountingComputer {
        inner: MockComputer,
        releases: Arc<Mutex<u32>>,
        closed: bool,
    }

    impl CountingComputer {
        fn new(inner: MockComputer, releases: Arc<Mutex<u32>>) -> Self {
            Self {
                inner,
                releases,
                closed: false,
            }
        }
    }

    #[async_trait]
    impl Computer for CountingComputer {
        fn viewport(&self) -> Viewport {
            self.inner.viewport()
        }
        fn highlights_cursor(&self) -> bool {
            false
        }
        async fn screenshot(&mut self) -> Result<Screenshot, ComputerError> {
            self.inner.screenshot().await
        }
        async fn dispatch(&mut self, action: &Action) -> Result<(), ComputerError> {
            self.inner.dispatch(action).await
        }
        async fn current_url(&mut self) -> Result<String, ComputerError> {
            self.inner.current_url().await
        }
        async fn close(&mut self) -> Result<(), ComputerError> {
            if !self.closed {
                self.closed = true;
                *self.releases.lock().unwrap() += 1;
            }
            Ok(())
        }
    }
}
