use crate::model::{AssertionResult, ExpectedOutcome, ScreenState, MAX_REGEX_PATTERN_LEN};
use serde_json::{json, Value};

/// Evaluate an expected outcome against the screen observed after a step.
#[must_use]
pub fn evaluate(state: &ScreenState, expected: &ExpectedOutcome) -> AssertionResult {
    let (passed, message, details) = match expected {
        ExpectedOutcome::ScreenIs { screen } => {
            let passed = state.screen == *screen;
            let message = if passed {
                None
            } else {
                Some(format!("screen was '{}', expected '{screen}'", state.screen))
            };
            (passed, message, None)
        }
        ExpectedOutcome::ElementVisible { selector } => {
            let passed = selector.resolve(&state.elements).is_some();
            let message = if passed {
                None
            } else {
                Some(format!("no element matched on screen '{}'", state.screen))
            };
            (passed, message, Some(json!({ "selector": selector })))
        }
        ExpectedOutcome::ElementAbsent { selector } => {
            let passed = selector.resolve(&state.elements).is_none();
            let message = if passed {
                None
            } else {
                Some(format!(
                    "element unexpectedly present on screen '{}'",
                    state.screen
                ))
            };
            (passed, message, Some(json!({ "selector": selector })))
        }
        ExpectedOutcome::TextVisible { text } => {
            let passed = state.text_content().contains(text.as_str());
            let message = if passed {
                None
            } else {
                Some(format!("screen did not contain '{text}'"))
            };
            (passed, message, None)
        }
        ExpectedOutcome::TextMatches { pattern } => {
            if pattern.len() > MAX_REGEX_PATTERN_LEN {
                (
                    false,
                    Some("regex pattern too long".to_string()),
                    Some(json!({ "max_len": MAX_REGEX_PATTERN_LEN, "len": pattern.len() })),
                )
            } else {
                match regex::Regex::new(pattern) {
                    Ok(re) => {
                        let passed = re.is_match(&state.text_content());
                        let message = if passed {
                            None
                        } else {
                            Some(format!("screen did not match '{pattern}'"))
                        };
                        (passed, message, None)
                    }
                    Err(err) => (
                        false,
                        Some("invalid regex".to_string()),
                        Some(Value::String(err.to_string())),
                    ),
                }
            }
        }
    };
    AssertionResult {
        assertion_type: expected.label().to_string(),
        passed,
        message,
        details,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ElementKind, Selector, UiElement};

    fn state() -> ScreenState {
        ScreenState {
            screen: "login".to_string(),
            elements: vec![
                UiElement {
                    id: Some("user".to_string()),
                    text: Some("Username".to_string()),
                    kind: ElementKind::Input,
                    clickable: true,
                    editable: true,
                    enabled: true,
                },
                UiElement {
                    id: None,
                    text: Some("Welcome back, 3 new messages".to_string()),
                    kind: ElementKind::Label,
                    clickable: false,
                    editable: false,
                    enabled: true,
                },
            ],
        }
    }

    #[test]
    fn screen_is_reports_actual_screen() {
        let result = evaluate(
            &state(),
            &ExpectedOutcome::ScreenIs {
                screen: "home".to_string(),
            },
        );
        assert!(!result.passed);
        assert_eq!(result.assertion_type, "screen_is");
        assert_eq!(
            result.message.as_deref(),
            Some("screen was 'login', expected 'home'")
        );
    }

    #[test]
    fn element_visible_and_absent_are_complementary() {
        let selector = Selector::id("user");
        assert!(evaluate(&state(), &ExpectedOutcome::ElementVisible { selector: selector.clone() }).passed);
        assert!(!evaluate(&state(), &ExpectedOutcome::ElementAbsent { selector }).passed);
    }

    #[test]
    fn text_matches_uses_regex() {
        let result = evaluate(
            &state(),
            &ExpectedOutcome::TextMatches {
                pattern: r"\d+ new messages".to_string(),
            },
        );
        assert!(result.passed);
    }

    #[test]
    fn invalid_regex_fails_with_details() {
        let result = evaluate(
            &state(),
            &ExpectedOutcome::TextMatches {
                pattern: "(".to_string(),
            },
        );
        assert!(!result.passed);
        assert_eq!(result.message.as_deref(), Some("invalid regex"));
        assert!(result.details.is_some());
    }

    #[test]
    fn oversized_pattern_is_rejected() {
        let result = evaluate(
            &state(),
            &ExpectedOutcome::TextMatches {
                pattern: "a".repeat(MAX_REGEX_PATTERN_LEN + 1),
            },
        );
        assert!(!result.passed);
    }
}
