use crate::domain::LogEntry;
use serde_json::{Map, Value};
use std::collections::HashMap;

#[derive(Clone, Debug, PartialEq)]
pub struct LastAssistant {
    pub text: String,
    pub timestamp: String,
    pub seq: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LastToolUse {
    pub id: String,
    pub tool: String,
    pub args: Map<String, Value>,
    pub timestamp: String,
    pub seq: u64,
}

/// Folds a session's event stream into the two preview entries shown on a
/// session card. Assistant messages and tool invocations share one sequence
/// counter so they can be ordered even when their timestamps tie.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PreviewBuilder {
    seq: u64,
    pub last_assistant: Option<LastAssistant>,
    pub last_tool_use: Option<LastToolUse>,
    pub tool_results: HashMap<String, bool>,
}

impl PreviewBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current sequence number, i.e. the one the next event will receive.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn record_assistant(&mut self, text: impl Into<String>, timestamp: impl Into<String>) {
        let text = text.into();
        if text.is_empty() {
            return;
        }
        self.last_assistant = Some(LastAssistant {
            text,
            timestamp: timestamp.into(),
            seq: self.next_seq(),
        });
    }

    pub fn record_tool_use(
        &mut self,
        id: impl Into<String>,
        tool: impl Into<String>,
        args: Map<String, Value>,
        timestamp: impl Into<String>,
    ) {
        self.last_tool_use = Some(LastToolUse {
            id: id.into(),
            tool: tool.into(),
            args,
            timestamp: timestamp.into(),
            seq: self.next_seq(),
        });
    }

    pub fn record_tool_result(&mut self, id: impl Into<String>, success: bool) {
        self.tool_results.insert(id.into(), success);
    }

    pub fn last_entries(&self) -> Vec<LogEntry> {
        build_last_entries(
            self.last_assistant.as_ref(),
            self.last_tool_use.as_ref(),
            &self.tool_results,
        )
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }
}

/// The last assistant message, followed by the last tool invocation when it
/// happened after that message. A tool with no recorded result counts as
/// successful.
pub fn build_last_entries(
    last_assistant: Option<&LastAssistant>,
    last_tool_use: Option<&LastToolUse>,
    tool_results: &HashMap<String, bool>,
) -> Vec<LogEntry> {
    let mut entries = Vec::new();

    if let Some(assistant) = last_assistant {
        entries.push(LogEntry::Assistant {
            text: assistant.text.clone(),
            timestamp: assistant.timestamp.clone(),
        });
    }

    if let Some(tool_use) = last_tool_use {
        let after_assistant = last_assistant.is_none_or(|assistant| tool_use.seq > assistant.seq);
        if after_assistant {
            entries.push(LogEntry::ToolUse {
                tool: tool_use.tool.clone(),
                args: tool_use.args.clone(),
                success: tool_results.get(&tool_use.id).copied().unwrap_or(true),
                timestamp: tool_use.timestamp.clone(),
            });
        }
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    const TS: &str = "2026-01-01T00:00:00.000Z";

    #[test]
    fn empty_builder_has_no_entries() {
        assert!(PreviewBuilder::new().last_entries().is_empty());
    }

    #[test]
    fn tool_use_after_assistant_is_appended() {
        let mut builder = PreviewBuilder::new();
        builder.record_assistant("working on it", TS);
        builder.record_tool_use("t1", "Bash", Map::new(), TS);
        builder.record_tool_result("t1", false);

        let entries = builder.last_entries();
        assert_eq!(entries.len(), 2);
        assert!(matches!(
            &entries[1],
            LogEntry::ToolUse { tool, success: false, .. } if tool == "Bash"
        ));
    }

    #[test]
    fn tool_use_before_assistant_is_dropped_even_with_equal_timestamps() {
        let mut builder = PreviewBuilder::new();
        builder.record_tool_use("t1", "Read", Map::new(), TS);
        builder.record_assistant("done", TS);

        let entries = builder.last_entries();
        assert_eq!(
            entries,
            vec![LogEntry::Assistant {
                text: "done".to_string(),
                timestamp: TS.to_string(),
            }]
        );
    }

    #[test]
    fn unanswered_tool_counts_as_success() {
        let mut builder = PreviewBuilder::new();
        builder.record_tool_use("t9", "Edit", Map::new(), TS);

        let entries = builder.last_entries();
        assert!(matches!(&entries[0], LogEntry::ToolUse { success: true, .. }));
    }

    #[test]
    fn empty_assistant_text_is_ignored() {
        let mut builder = PreviewBuilder::new();
        builder.record_assistant("", TS);
        assert!(builder.last_assistant.is_none());
        assert_eq!(builder.seq(), 0);
    }
}
