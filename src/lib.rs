pub mod action;
pub mod agent;
pub mod cdp;
pub mod computer;
pub mod decision;
pub mod local;
pub mod remote;

pub use action::{Action, MouseButton, Point, Viewport};
pub use agent::{AgentConfig, AgentLoop, Decider, RunOutcome, RunReport, StopHandle};
pub use computer::{Computer, ComputerError, Screenshot};
pub use decision::{Decision, DeciderConfig, DecisionError, HttpDecider};
pub use local::{LocalComputer, LocalOptions};
pub use remote::{RemoteComputer, RemoteOptions};
