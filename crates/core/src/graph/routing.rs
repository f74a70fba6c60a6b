//! # Graph Routing
//!
//! The node graph is fixed:
//!
//! ```text
//! Router --frontend--> Generate --> Terminal
//! Router --tools-----> Tool --> Router        (at most one tool hop)
//! Router --other-----> Terminal
//! ```
//!
//! Routing is fail-closed: an absent or unrecognized `NextNode` ends the turn.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::extract::try_extract_json;

/// Tool hops allowed per turn.
pub const MAX_TOOL_HOPS: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphNode {
    Router,
    Tool,
    Generate,
    Terminal,
}

/// What the router asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingDecision {
    Generate,
    Tool,
    Terminal,
}

fn next_node_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""NextNode"\s*:\s*"([^"]+)""#).expect("valid NextNode regex"))
}

/// `NextNode` value from router output: parsed JSON first, pattern match second.
pub fn next_node(text: &str) -> Option<String> {
    if let Some((value, _)) = try_extract_json(text) {
        let found = match &value {
            Value::Object(obj) => obj.get("NextNode").and_then(Value::as_str).map(str::to_string),
            // Router output that was itself JSON-encoded as a string
            Value::String(inner) => return next_node(inner),
            _ => None,
        };
        if found.is_some() {
            return found;
        }
    }
    next_node_re()
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

impl RoutingDecision {
    pub fn from_next_node(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("frontend") => RoutingDecision::Generate,
            Some("tools") => RoutingDecision::Tool,
            _ => RoutingDecision::Terminal,
        }
    }

    /// Decide from the router's `NextNode` alone. Tool calls without
    /// `"tools"` do not route anywhere.
    pub fn from_router_output(text: &str) -> Self {
        let value = next_node(text);
        let decision = Self::from_next_node(value.as_deref());
        tracing::info!(next_node = ?value, ?decision, "Router decision");
        decision
    }
}

/// Walks the static transition table for one turn.
#[derive(Debug, Clone)]
pub struct Route {
    pub node: GraphNode,
    pub tool_hops: u32,
}

impl Default for Route {
    fn default() -> Self {
        Self {
            node: GraphNode::Router,
            tool_hops: 0,
        }
    }
}

impl Route {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move to the next node. `decision` only matters when leaving the router.
    pub fn advance(&mut self, decision: Option<RoutingDecision>) -> GraphNode {
        self.node = match (self.node, decision) {
            (GraphNode::Router, Some(RoutingDecision::Generate)) => GraphNode::Generate,
            (GraphNode::Router, Some(RoutingDecision::Tool)) if self.tool_hops < MAX_TOOL_HOPS => {
                self.tool_hops += 1;
                GraphNode::Tool
            }
            (GraphNode::Router, _) => GraphNode::Terminal,
            (GraphNode::Tool, _) => GraphNode::Router,
            (GraphNode::Generate, _) => GraphNode::Terminal,
            (GraphNode::Terminal, _) => GraphNode::Terminal,
        };
        self.node
    }

    pub fn is_complete(&self) -> bool {
        self.node == GraphNode::Terminal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontend_routes_to_generation() {
        let outputs = [
            r#"{"NextNode":"frontend","user_message":"build it"}"#,
            r#"```json
{"NextNode": "frontend"}
```"#,
            r#""{\"NextNode\":\"frontend\"}""#,
            r#"Routing now: "NextNode" : "frontend", done"#,
        ];
        for output in outputs {
            assert_eq!(
                RoutingDecision::from_router_output(output),
                RoutingDecision::Generate,
                "{output}"
            );
        }
    }

    #[test]
    fn anything_else_is_terminal() {
        for output in [
            r#"{"NextNode":"backend"}"#,
            r#"{"NextNode":"Frontend"}"#,
            r#"{"next":"frontend"}"#,
            "I encountered an error processing your request.",
            "",
        ] {
            assert_eq!(
                RoutingDecision::from_router_output(output),
                RoutingDecision::Terminal,
                "{output}"
            );
        }
    }

    #[test]
    fn tools_only_by_name() {
        assert_eq!(
            RoutingDecision::from_router_output(r#"{"NextNode":"tools"}"#),
            RoutingDecision::Tool
        );
        assert_eq!(RoutingDecision::from_router_output(""), RoutingDecision::Terminal);
        assert_eq!(
            RoutingDecision::from_router_output("Let me look that up."),
            RoutingDecision::Terminal
        );
    }

    #[test]
    fn transition_table() {
        let mut route = Route::new();
        assert_eq!(route.advance(Some(RoutingDecision::Generate)), GraphNode::Generate);
        assert_eq!(route.advance(None), GraphNode::Terminal);
        assert!(route.is_complete());
        assert_eq!(route.advance(Some(RoutingDecision::Generate)), GraphNode::Terminal);
    }

    #[test]
    fn only_one_tool_hop() {
        let mut route = Route::new();
        assert_eq!(route.advance(Some(RoutingDecision::Tool)), GraphNode::Tool);
        assert_eq!(route.advance(None), GraphNode::Router);
        assert_eq!(route.advance(Some(RoutingDecision::Tool)), GraphNode::Terminal);
        assert_eq!(route.tool_hops, 1);
    }

    #[test]
    fn router_without_decision_ends() {
        let mut route = Route::new();
        assert_eq!(route.advance(None), GraphNode::Terminal);
    }
}
