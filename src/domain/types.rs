use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
pub enum AgentBrand {
    #[serde(rename = "cc")]
    Claude,
    #[serde(rename = "oc")]
    OpenCode,
    #[serde(rename = "gc")]
    Copilot,
}

impl AgentBrand {
    pub fn code(self) -> &'static str {
        match self {
            Self::Claude => "cc",
            Self::OpenCode => "oc",
            Self::Copilot => "gc",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Claude => "Claude Code",
            Self::OpenCode => "Opencode",
            Self::Copilot => "GitHub Copilot",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Waiting,
    Inactive,
    External,
}

impl SessionStatus {
    /// Running, waiting and externally driven sessions count as active.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Inactive)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Standard,
    Plan,
    Yolo,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEntry {
    User {
        text: String,
        timestamp: String,
    },
    Assistant {
        text: String,
        timestamp: String,
    },
    ToolUse {
        tool: String,
        args: Map<String, Value>,
        success: bool,
        timestamp: String,
    },
}

/// Session summary as produced by a single backend, before branding.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSessionSummary {
    pub id: String,
    pub workspace: String,
    pub title: String,
    pub status: SessionStatus,
    pub mode: Option<SessionMode>,
    /// Unix milliseconds of the most recent activity.
    pub timestamp: i64,
    pub last_entries: Vec<LogEntry>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AgentRepoSummary {
    pub path: String,
    pub branch: String,
    pub sessions: Vec<AgentSessionSummary>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct RepoError {
    pub brand: AgentBrand,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RepoSessionSummary {
    #[serde(flatten)]
    pub session: AgentSessionSummary,
    pub brand: AgentBrand,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RepoSummary {
    pub path: String,
    pub branch: String,
    pub sessions: Vec<RepoSessionSummary>,
    pub errors: Vec<RepoError>,
}

/// Full transcript of one session, before branding.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionDetail {
    pub id: String,
    pub title: String,
    pub log: Vec<LogEntry>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AgentDetail {
    pub brand: AgentBrand,
    #[serde(flatten)]
    pub detail: SessionDetail,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_branded_session_flat() {
        let session = RepoSessionSummary {
            session: AgentSessionSummary {
                id: "s1".to_string(),
                workspace: "/r".to_string(),
                title: "t".to_string(),
                status: SessionStatus::External,
                mode: Some(SessionMode::Yolo),
                timestamp: 5,
                last_entries: vec![LogEntry::Assistant {
                    text: "hi".to_string(),
                    timestamp: "2026-01-01T00:00:00Z".to_string(),
                }],
            },
            brand: AgentBrand::OpenCode,
        };

        let value = serde_json::to_value(&session).expect("json");
        assert_eq!(value["brand"], "oc");
        assert_eq!(value["status"], "external");
        assert_eq!(value["mode"], "yolo");
        assert_eq!(value["lastEntries"][0]["type"], "assistant");
    }

    #[test]
    fn brands_have_codes_and_labels() {
        assert_eq!(AgentBrand::Claude.code(), "cc");
        assert_eq!(AgentBrand::Claude.label(), "Claude Code");
        assert_eq!(AgentBrand::OpenCode.label(), "Opencode");
        assert_eq!(AgentBrand::Copilot.label(), "GitHub Copilot");
    }

    #[test]
    fn only_inactive_is_not_active() {
        assert!(SessionStatus::Running.is_active());
        assert!(SessionStatus::Waiting.is_active());
        assert!(SessionStatus::External.is_active());
        assert!(!SessionStatus::Inactive.is_active());
    }
}
