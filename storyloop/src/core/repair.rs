//! Bounded structural repairs for plan documents the agent left malformed.
//!
//! Each repair is a pure text transform that returns `None` when it has nothing
//! to change. The scanners track JSON string literals so delimiters and commas
//! inside strings are never touched.

/// A single repair applied to a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repair {
    TrimTrailingGarbage,
    StripTrailingCommas,
}

impl Repair {
    /// Repairs in the order they are attempted.
    pub const ALL: [Repair; 2] = [Repair::TrimTrailingGarbage, Repair::StripTrailingCommas];

    pub fn apply(self, input: &str) -> Option<String> {
        match self {
            Repair::TrimTrailingGarbage => trim_trailing_garbage(input),
            Repair::StripTrailingCommas => strip_trailing_commas(input),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Repair::TrimTrailingGarbage => "trim-trailing-garbage",
            Repair::StripTrailingCommas => "strip-trailing-commas",
        }
    }
}

/// Cut everything after the delimiter that closes the first top-level value.
///
/// Returns `None` if the document has no balanced top-level object/array or if
/// nothing but whitespace follows it.
pub fn trim_trailing_garbage(input: &str) -> Option<String> {
    let start = input.find(['{', '['])?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in input[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    let end = start + offset + ch.len_utf8();
                    if input[end..].trim().is_empty() {
                        return None;
                    }
                    let mut trimmed = input[..end].to_string();
                    trimmed.push('\n');
                    return Some(trimmed);
                }
            }
            _ => {}
        }
    }
    None
}

/// Remove commas that directly precede `}` or `]` (ignoring whitespace).
pub fn strip_trailing_commas(input: &str) -> Option<String> {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut changed = false;

    for (idx, &ch) in chars.iter().enumerate() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            out.push(ch);
            continue;
        }
        if ch == '"' {
            in_string = true;
        } else if ch == ',' {
            let next = chars[idx + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                changed = true;
                continue;
            }
        }
        out.push(ch);
    }

    changed.then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_text_after_closing_brace() {
        let repaired = trim_trailing_garbage("{\"a\": 1}\nDone! I updated the plan.")
            .expect("repaired");
        assert_eq!(repaired, "{\"a\": 1}\n");
    }

    #[test]
    fn trim_ignores_braces_inside_strings() {
        let input = r#"{"a": "}{ not a brace"} trailing"#;
        let repaired = trim_trailing_garbage(input).expect("repaired");
        assert_eq!(repaired, "{\"a\": \"}{ not a brace\"}\n");
    }

    #[test]
    fn trim_handles_escaped_quotes() {
        let input = r#"{"a": "say \"}\""}}"#;
        let repaired = trim_trailing_garbage(input).expect("repaired");
        assert_eq!(repaired, "{\"a\": \"say \\\"}\\\"\"}\n");
    }

    #[test]
    fn trim_returns_none_for_clean_or_unbalanced_input() {
        assert_eq!(trim_trailing_garbage("{\"a\": 1}\n  "), None);
        assert_eq!(trim_trailing_garbage("{\"a\": [1, 2}"), None);
        assert_eq!(trim_trailing_garbage("no json here"), None);
    }

    #[test]
    fn strips_commas_before_closers() {
        let input = "{\"a\": [1, 2,\n], \"b\": {\"c\": 3,  }, }";
        let repaired = strip_trailing_commas(input).expect("repaired");
        assert_eq!(repaired, "{\"a\": [1, 2\n], \"b\": {\"c\": 3  } }");
    }

    #[test]
    fn strip_leaves_commas_inside_strings() {
        let input = r#"{"a": "x,]", "b": 1}"#;
        assert_eq!(strip_trailing_commas(input), None);
    }

    #[test]
    fn repairs_run_in_declared_order() {
        assert_eq!(
            Repair::ALL,
            [Repair::TrimTrailingGarbage, Repair::StripTrailingCommas]
        );
        assert_eq!(Repair::StripTrailingCommas.as_str(), "strip-trailing-commas");
    }
}
