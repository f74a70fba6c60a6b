//! Prompt templates bundled at compile time.
//!
//! Templates use `{{name}}` placeholders filled by [`render`].

/// Router node - picks the next node
pub const COORDINATOR: &str = include_str!("prompts/coordinator.md");

/// Generation node - builds a new app
pub const GENERATOR: &str = include_str!("prompts/generator.md");

/// Generation node - modifies an existing app
pub const GENERATOR_FIX: &str = include_str!("prompts/generator_fix.md");

/// Planner - frontend development plan
pub const PLANNER: &str = include_str!("prompts/planner.md");

/// Planner - clone intent detection
pub const CLONE_ANALYSIS: &str = include_str!("prompts/clone_analysis.md");

/// Planner - short project title
pub const TITLE: &str = include_str!("prompts/title.md");

/// Replace every `{{key}}` with its value. Unknown placeholders are left as-is.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{{{key}}}}}", key = key), value)
    })
}

/// Architect persona and replication block key for a model family.
pub fn planner_persona(family: &str) -> (&'static str, &'static str) {
    match family {
        "claude" => ("an expert frontend architect", "replicationSpecs"),
        "gemini" => (
            "a senior frontend technical lead who works from visual references",
            "visualAnalysis",
        ),
        "grok" => ("a pragmatic frontend development strategist", "cloneStrategy"),
        "kimi" => ("a detail-oriented UI engineer", "visualReplication"),
        _ => ("a senior frontend engineer", "replicationDetails"),
    }
}

/// All bundled templates with their slugs
pub fn all_defaults() -> Vec<(&'static str, &'static str)> {
    vec![
        ("coordinator", COORDINATOR),
        ("generator", GENERATOR),
        ("generator_fix", GENERATOR_FIX),
        ("planner", PLANNER),
        ("clone_analysis", CLONE_ANALYSIS),
        ("title", TITLE),
    ]
}
