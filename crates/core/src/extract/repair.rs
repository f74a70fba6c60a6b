//! Ordered syntactic fixups for almost-JSON model output.
//!
//! Repairs run in list order and are cumulative: step N sees the output of
//! steps 1..N-1. The caller re-parses after every step.

use std::sync::OnceLock;

use regex::Regex;

pub struct Repair {
    pub name: &'static str,
    pattern: &'static str,
    replacement: &'static str,
}

pub const REPAIRS: &[Repair] = &[
    Repair {
        name: "trailing_commas",
        pattern: r",(\s*[}\]])",
        replacement: "$1",
    },
    Repair {
        name: "unquoted_keys",
        pattern: r"([{,]\s*)(\w+):",
        replacement: r#"$1"$2":"#,
    },
    Repair {
        name: "single_quoted_values",
        pattern: r":\s*'([^']*)'",
        replacement: r#": "$1""#,
    },
];

fn compiled() -> &'static [(&'static Repair, Regex)] {
    static COMPILED: OnceLock<Vec<(&'static Repair, Regex)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        REPAIRS
            .iter()
            .map(|repair| (repair, Regex::new(repair.pattern).expect("valid repair regex")))
            .collect()
    })
}

/// Text after each repair step, paired with the step's name.
pub fn repair_steps(text: &str) -> Vec<(&'static str, String)> {
    let mut current = text.to_string();
    compiled()
        .iter()
        .map(|(repair, re)| {
            current = re.replace_all(&current, repair.replacement).into_owned();
            (repair.name, current.clone())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, input: &str) -> String {
        repair_steps(input)
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, text)| text)
            .unwrap()
    }

    #[test]
    fn every_pattern_compiles() {
        assert_eq!(compiled().len(), REPAIRS.len());
    }

    #[test]
    fn order_is_fixed() {
        let names: Vec<_> = REPAIRS.iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["trailing_commas", "unquoted_keys", "single_quoted_values"]);
    }

    #[test]
    fn trailing_commas_before_closers() {
        assert_eq!(step("trailing_commas", r#"{"a":[1,2,],}"#), r#"{"a":[1,2]}"#);
        assert_eq!(step("trailing_commas", "{\"a\":1,\n  }"), "{\"a\":1\n  }");
    }

    #[test]
    fn trailing_commas_leave_inner_commas() {
        assert_eq!(step("trailing_commas", r#"{"a":1,"b":2}"#), r#"{"a":1,"b":2}"#);
    }

    #[test]
    fn unquoted_keys_get_quotes() {
        assert_eq!(step("unquoted_keys", "{a: 1, b_2: 2}"), r#"{"a": 1, "b_2": 2}"#);
    }

    #[test]
    fn quoted_keys_are_untouched() {
        assert_eq!(step("unquoted_keys", r#"{"a": 1}"#), r#"{"a": 1}"#);
    }

    #[test]
    fn single_quoted_values_become_double_quoted() {
        assert_eq!(
            step("single_quoted_values", r#"{"a": 'x y'}"#),
            r#"{"a": "x y"}"#
        );
    }

    #[test]
    fn steps_are_cumulative() {
        let steps = repair_steps("{a: 'v',}");
        assert_eq!(steps[0].1, "{a: 'v'}");
        assert_eq!(steps[1].1, r#"{"a": 'v'}"#);
        assert_eq!(steps[2].1, r#"{"a": "v"}"#);
    }
}
