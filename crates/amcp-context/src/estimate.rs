use amcp_types::Message;

/// Per-message role framing overhead, in tokens.
const MESSAGE_OVERHEAD: u64 = 4;
/// Flat overhead per tool call before counting its arguments.
const TOOL_CALL_OVERHEAD: u64 = 50;
/// Rough characters-per-token ratio for code-heavy text.
const CHARS_PER_TOKEN: u64 = 4;

pub fn estimate_text(text: &str) -> u64 {
    text.chars().count() as u64 / CHARS_PER_TOKEN
}

/// Overhead-aware token estimate for a message history. Intentionally a
/// heuristic: the compactor only needs a stable, monotone measure to compare
/// against ratio thresholds.
pub fn estimate_tokens(messages: &[Message]) -> u64 {
    messages.iter().map(estimate_message).sum()
}

pub fn estimate_message(message: &Message) -> u64 {
    let mut total = MESSAGE_OVERHEAD + estimate_text(&message.content);
    for call in &message.tool_calls {
        total += TOOL_CALL_OVERHEAD;
        total += estimate_text(&call.name);
        total += estimate_text(&call.arguments.to_string());
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use amcp_types::ToolCall;

    #[test]
    fn text_roughly_four_chars_per_token() {
        assert_eq!(estimate_text("abcdefgh"), 2);
        assert_eq!(estimate_text(""), 0);
    }

    #[test]
    fn messages_carry_role_overhead() {
        let history = vec![Message::user(""), Message::assistant("")];
        assert_eq!(estimate_tokens(&history), 2 * 4);
    }

    #[test]
    fn tool_calls_are_counted() {
        let plain = Message::assistant("run it");
        let with_call = Message::assistant_with_tools(
            "run it",
            vec![ToolCall {
                id: "call_1".into(),
                name: "bash".into(),
                arguments: serde_json::json!({"command": "ls -la"}),
            }],
        );
        assert!(estimate_message(&with_call) > estimate_message(&plain) + TOOL_CALL_OVERHEAD - 1);
    }

    #[test]
    fn estimate_is_monotone_in_history_length() {
        let mut history = Vec::new();
        let mut last = 0;
        for i in 0..10 {
            history.push(Message::user(format!("message number {i}")));
            let estimate = estimate_tokens(&history);
            assert!(estimate > last);
            last = estimate;
        }
    }
}
