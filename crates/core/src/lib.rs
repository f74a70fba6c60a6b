//! # Kiln Core
//!
//! Conversational app generation: a user's message is routed through a small
//! execution graph of model calls, the generated code is streamed back to the
//! client and the resulting plan is persisted for the next turn.
//!
//! ## Architecture
//!
//! - `models/` - Logical model catalogue and provider mapping
//! - `gateway/` - Model invocation with retries, fallback and token streaming
//! - `images/` - Fetching and encoding reference images
//! - `extract/` - JSON extraction and repair of model output, `PlanRecord`
//! - `graph/` - Router, tool and generation nodes plus capabilities
//! - `relay/` - Graph events to wire frames
//! - `queue/` - Deduplicating build queue
//! - `state/` - SQLite database and persistence collaborators
//! - `agent/` - Turn service and planner
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kiln_core::agent::TurnRequest;
//!
//! let frames = service.start_turn(TurnRequest {
//!     prompt: "Build a todo app".into(),
//!     project_key: "brave-fox".into(),
//!     owner: "dev@example.com".into(),
//!     ..Default::default()
//! });
//! ```

pub mod agent;
pub mod config;
pub mod extract;
pub mod gateway;
pub mod graph;
pub mod images;
pub mod models;
pub mod queue;
pub mod relay;
pub mod state;
