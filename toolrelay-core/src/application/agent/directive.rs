use serde_json::Value;

/// How a tool-free assistant reply ends the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyDirective {
    Final { response: String },
    Clarify { question: String },
}

impl ReplyDirective {
    /// Classifies a non-empty reply. A reply opening with `marker`, or a JSON
    /// `{"action":"clarify","question":...}` object, asks for clarification.
    pub fn parse(content: &str, marker: &str) -> Self {
        let trimmed = content.trim();

        if !marker.is_empty() {
            if let Some(rest) = trimmed.strip_prefix(marker) {
                let question = rest
                    .trim_start_matches(|c: char| c == ':' || c == '-' || c.is_whitespace())
                    .trim();
                return ReplyDirective::Clarify {
                    question: if question.is_empty() {
                        trimmed.to_string()
                    } else {
                        question.to_string()
                    },
                };
            }
        }

        if let Some(Value::Object(map)) = extract_json(trimmed) {
            match map.get("action").and_then(Value::as_str) {
                Some("clarify") => {
                    if let Some(question) = map.get("question").and_then(Value::as_str) {
                        return ReplyDirective::Clarify {
                            question: question.trim().to_string(),
                        };
                    }
                }
                Some("final") => {
                    if let Some(response) = map.get("response").and_then(Value::as_str) {
                        return ReplyDirective::Final {
                            response: response.trim().to_string(),
                        };
                    }
                }
                _ => {}
            }
        }

        ReplyDirective::Final {
            response: trimmed.to_string(),
        }
    }
}

fn extract_json(content: &str) -> Option<Value> {
    let trimmed = content.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    if trimmed.starts_with("```") {
        let stripped = trimmed.trim_start_matches("```json");
        let stripped = stripped.trim_start_matches("```JSON");
        let stripped = stripped.trim_start_matches("```");
        if let Some(end) = stripped.rfind("```") {
            let slice = &stripped[..end];
            if let Ok(value) = serde_json::from_str::<Value>(slice.trim()) {
                return Some(value);
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            let candidate = &trimmed[start..=end];
            if let Ok(value) = serde_json::from_str::<Value>(candidate) {
                return Some(value);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKER: &str = "NEEDS_CLARIFICATION";

    #[test]
    fn marker_prefix_requests_clarification() {
        let directive = ReplyDirective::parse(
            "NEEDS_CLARIFICATION: which repository should I scan?",
            MARKER,
        );
        assert_eq!(
            directive,
            ReplyDirective::Clarify {
                question: "which repository should I scan?".into()
            }
        );
    }

    #[test]
    fn fenced_json_clarify_is_recognized() {
        let reply = "```json\n{\"action\":\"clarify\",\"question\":\"Which date?\"}\n```";
        assert_eq!(
            ReplyDirective::parse(reply, MARKER),
            ReplyDirective::Clarify {
                question: "Which date?".into()
            }
        );
    }

    #[test]
    fn plain_text_and_unrelated_json_are_final() {
        assert_eq!(
            ReplyDirective::parse("  The sum is 5. ", MARKER),
            ReplyDirective::Final {
                response: "The sum is 5.".into()
            }
        );
        let reply = r#"Result: {"sum": 5}"#;
        assert_eq!(
            ReplyDirective::parse(reply, MARKER),
            ReplyDirective::Final {
                response: reply.into()
            }
        );
    }

    #[test]
    fn final_action_unwraps_response() {
        assert_eq!(
            ReplyDirective::parse(r#"{"action":"final","response":"done"}"#, MARKER),
            ReplyDirective::Final {
                response: "done".into()
            }
        );
    }

    #[test]
    fn marker_must_lead_the_reply() {
        let reply = "I do not need anything. NEEDS_CLARIFICATION is not required.";
        assert!(matches!(
            ReplyDirective::parse(reply, MARKER),
            ReplyDirective::Final { .. }
        ));
    }
}
