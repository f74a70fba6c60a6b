//! # Agent
//!
//! Entry points that sit above the execution graph:
//!
//! - [`AgentService`] runs conversational turns, saves bundles and queues builds
//! - [`Planner`] drafts a development plan before the first generation

mod planner;
mod service;

pub use planner::{
    render_plan, CloneIntent, PlanDraft, PlanRequest, Planner, CONTINUE_PROMPT, DEFAULT_TITLE,
};
pub use service::{
    AgentService, Collaborators, TurnError, TurnOutcome, TurnRequest, TurnStream,
};
