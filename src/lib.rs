//! Decision core of a goal-driven web agent: turns a page's interactive
//! elements and an objective into validated, executable browser actions.

pub mod analyzer;
pub mod brain;
pub mod change;
pub mod chrome;
pub mod config;
pub mod dom;
pub mod error;
pub mod hands;
pub mod knowledge;
pub mod llm;
pub mod pilot;
pub mod prompt;
pub mod session;
pub mod types;
pub mod validator;

pub use brain::{DecisionContext, DecisionEngine};
pub use config::AgentConfig;
pub use hands::{ActionExecutor, BrowserPage};
pub use pilot::{Navigator, Operator, Pilot, RunResult, TurnEvent};
pub use types::{ActionHistory, ActionKind, ActionProposal, DecisionBundle, ElementDescriptor, TurnOutcome};
pub use validator::Planner;
