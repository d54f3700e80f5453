use crate::domain::{
    AgentSessionSummary, LogEntry, PreviewBuilder, SessionDetail, SessionMode, SessionStatus,
    unix_ms_to_rfc3339,
};
use crate::infra::opencode::ServerStartError;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum OpenCodeError {
    #[error(transparent)]
    Server(#[from] ServerStartError),

    #[error("opencode request {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("failed to decode opencode response from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("opencode request task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct OcTime {
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub updated: i64,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct OcSession {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub directory: String,
    #[serde(default)]
    pub time: OcTime,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OcSessionStatus {
    Idle,
    Busy,
    Retry,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct OcVcs {
    #[serde(default)]
    pub branch: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct OcMessage {
    pub info: OcMessageInfo,
    #[serde(default)]
    pub parts: Vec<OcPart>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct OcMessageInfo {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub time: OcTime,
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OcPart {
    Text {
        #[serde(default)]
        text: String,
    },
    Tool {
        #[serde(default)]
        tool: String,
        #[serde(default)]
        state: OcToolState,
    },
    #[serde(other)]
    Other,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct OcToolState {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub input: Map<String, Value>,
    #[serde(default)]
    pub time: Option<OcToolTime>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct OcToolTime {
    pub start: i64,
}

impl OcToolState {
    fn is_completed(&self) -> bool {
        self.status == "completed"
    }

    /// Start time, for tools that have started.
    fn started_at(&self) -> Option<i64> {
        match self.status.as_str() {
            "running" | "completed" | "error" => self.time.as_ref().map(|time| time.start),
            _ => None,
        }
    }
}

/// HTTP client for one directory of a running opencode server. Every request
/// carries the directory so the server scopes it to that project.
pub struct OpenCodeClient {
    agent: ureq::Agent,
    base_url: String,
    directory: String,
}

impl OpenCodeClient {
    pub fn new(base_url: &str, directory: &str) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(REQUEST_TIMEOUT))
            .build();
        Self {
            agent: config.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            directory: directory.to_string(),
        }
    }

    pub fn directory(&self) -> &str {
        &self.directory
    }

    pub async fn list_sessions(&self) -> Result<Vec<OcSession>, OpenCodeError> {
        Ok(self.get_json("/session".to_string()).await?.unwrap_or_default())
    }

    pub async fn session_statuses(&self) -> Result<HashMap<String, OcSessionStatus>, OpenCodeError> {
        Ok(self
            .get_json("/session/status".to_string())
            .await?
            .unwrap_or_default())
    }

    pub async fn vcs(&self) -> Result<OcVcs, OpenCodeError> {
        Ok(self.get_json("/vcs".to_string()).await?.unwrap_or_default())
    }

    pub async fn session(&self, id: &str) -> Result<Option<OcSession>, OpenCodeError> {
        self.get_json(format!("/session/{id}")).await
    }

    pub async fn messages(&self, id: &str) -> Result<Vec<OcMessage>, OpenCodeError> {
        Ok(self
            .get_json(format!("/session/{id}/message"))
            .await?
            .unwrap_or_default())
    }

    /// `None` for a 404 or a JSON `null` body.
    async fn get_json<T>(&self, path: String) -> Result<Option<T>, OpenCodeError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let agent = self.agent.clone();
        let url = format!("{}{path}", self.base_url);
        let directory = self.directory.clone();

        tokio::task::spawn_blocking(move || -> Result<Option<T>, OpenCodeError> {
            let response = match agent.get(&url).query("directory", &directory).call() {
                Ok(response) => response,
                Err(ureq::Error::StatusCode(404)) => return Ok(None),
                Err(err) => {
                    return Err(OpenCodeError::Request {
                        url,
                        message: err.to_string(),
                    });
                }
            };
            // Long sessions produce message lists well past ureq's default body cap.
            let body = response
                .into_body()
                .into_with_config()
                .limit(u64::MAX)
                .read_to_vec();
            let decoded = body
                .map_err(|err| err.to_string())
                .and_then(|bytes| {
                    serde_json::from_slice::<Option<T>>(&bytes).map_err(|err| err.to_string())
                });
            decoded.map_err(|message| OpenCodeError::Decode { url, message })
        })
        .await?
    }
}

pub fn map_opencode_status(status: Option<&OcSessionStatus>) -> SessionStatus {
    match status {
        Some(OcSessionStatus::Busy) => SessionStatus::Running,
        Some(OcSessionStatus::Retry) => SessionStatus::Waiting,
        _ => SessionStatus::Inactive,
    }
}

pub fn map_opencode_mode(mode: Option<&str>) -> Option<SessionMode> {
    match mode? {
        "" => None,
        "plan" => Some(SessionMode::Plan),
        _ => Some(SessionMode::Standard),
    }
}

fn ms_to_timestamp(ms: i64) -> String {
    unix_ms_to_rfc3339(ms).unwrap_or_default()
}

fn joined_text(parts: &[OcPart]) -> String {
    parts
        .iter()
        .filter_map(|part| match part {
            OcPart::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Card summary for a session. Only assistant messages feed the preview;
/// the last assistant mode seen wins.
pub fn summarize_session(
    session: &OcSession,
    messages: &[OcMessage],
    status: Option<&OcSessionStatus>,
    workspace: &str,
) -> AgentSessionSummary {
    let mut mode = None;
    let mut preview = PreviewBuilder::new();

    for message in messages.iter().filter(|message| message.info.role == "assistant") {
        let timestamp = ms_to_timestamp(message.info.time.created);
        mode = map_opencode_mode(message.info.mode.as_deref()).or(mode);

        preview.record_assistant(joined_text(&message.parts), timestamp.clone());

        for part in &message.parts {
            let OcPart::Tool { tool, state } = part else {
                continue;
            };
            let tool_timestamp = state
                .started_at()
                .map(ms_to_timestamp)
                .unwrap_or_else(|| timestamp.clone());
            let tool_id = format!("{}-{tool}-{}", session.id, preview.seq());
            preview.record_tool_result(tool_id.clone(), state.is_completed());
            preview.record_tool_use(tool_id, tool.clone(), state.input.clone(), tool_timestamp);
        }
    }

    AgentSessionSummary {
        id: session.id.clone(),
        workspace: workspace.to_string(),
        title: if session.title.is_empty() {
            session.id.clone()
        } else {
            session.title.clone()
        },
        status: map_opencode_status(status),
        mode,
        timestamp: session.time.updated,
        last_entries: preview.last_entries(),
    }
}

/// Full transcript: user and assistant text plus every tool part.
pub fn session_detail(session: &OcSession, messages: &[OcMessage]) -> SessionDetail {
    let mut log = Vec::new();

    for message in messages {
        let timestamp = ms_to_timestamp(message.info.time.created);
        let text = joined_text(&message.parts);

        match message.info.role.as_str() {
            "user" => {
                if !text.is_empty() {
                    log.push(LogEntry::User { text, timestamp });
                }
            }
            "assistant" => {
                if !text.is_empty() {
                    log.push(LogEntry::Assistant {
                        text,
                        timestamp: timestamp.clone(),
                    });
                }
                for part in &message.parts {
                    let OcPart::Tool { tool, state } = part else {
                        continue;
                    };
                    log.push(LogEntry::ToolUse {
                        tool: tool.clone(),
                        args: state.input.clone(),
                        success: state.is_completed(),
                        timestamp: state
                            .started_at()
                            .map(ms_to_timestamp)
                            .unwrap_or_else(|| timestamp.clone()),
                    });
                }
            }
            _ => {}
        }
    }

    SessionDetail {
        id: session.id.clone(),
        title: if session.title.is_empty() {
            session.id.clone()
        } else {
            session.title.clone()
        },
        log,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session() -> OcSession {
        serde_json::from_value(json!({
            "id": "ses_1",
            "title": "Port the parser",
            "directory": "/work/app",
            "time": { "created": 1_000, "updated": 9_000 }
        }))
        .expect("session")
    }

    fn messages() -> Vec<OcMessage> {
        serde_json::from_value(json!([
            {
                "info": { "role": "user", "time": { "created": 1_000 } },
                "parts": [{ "type": "text", "text": "port it" }]
            },
            {
                "info": { "role": "assistant", "time": { "created": 2_000 }, "mode": "plan" },
                "parts": [
                    { "type": "step-start" },
                    { "type": "text", "text": "Plan ready" },
                    {
                        "type": "tool",
                        "tool": "bash",
                        "callID": "c1",
                        "state": {
                            "status": "error",
                            "input": { "command": "cargo fmt" },
                            "time": { "start": 3_000, "end": 3_500 }
                        }
                    }
                ]
            },
            {
                "info": { "role": "assistant", "time": { "created": 4_000 }, "mode": "build" },
                "parts": [{
                    "type": "tool",
                    "tool": "edit",
                    "state": { "status": "pending", "input": {} }
                }]
            }
        ]))
        .expect("messages")
    }

    #[test]
    fn decodes_statuses_and_maps_them() {
        let statuses: HashMap<String, OcSessionStatus> = serde_json::from_value(json!({
            "a": { "type": "busy" },
            "b": { "type": "retry", "attempt": 2, "message": "rate limited" },
            "c": { "type": "idle" },
            "d": { "type": "paused" }
        }))
        .expect("statuses");

        assert_eq!(map_opencode_status(statuses.get("a")), SessionStatus::Running);
        assert_eq!(map_opencode_status(statuses.get("b")), SessionStatus::Waiting);
        assert_eq!(map_opencode_status(statuses.get("c")), SessionStatus::Inactive);
        assert_eq!(map_opencode_status(statuses.get("d")), SessionStatus::Inactive);
        assert_eq!(map_opencode_status(None), SessionStatus::Inactive);
    }

    #[test]
    fn summary_uses_last_mode_and_trailing_tool() {
        let summary = summarize_session(&session(), &messages(), None, "/work/app");

        assert_eq!(summary.title, "Port the parser");
        assert_eq!(summary.mode, Some(SessionMode::Standard));
        assert_eq!(summary.timestamp, 9_000);
        assert_eq!(summary.last_entries.len(), 2);
        assert!(matches!(
            &summary.last_entries[0],
            LogEntry::Assistant { text, .. } if text == "Plan ready"
        ));
        // A pending tool has not completed yet.
        assert!(matches!(
            &summary.last_entries[1],
            LogEntry::ToolUse { tool, success: false, .. } if tool == "edit"
        ));
    }

    #[test]
    fn detail_lists_text_and_tools_in_order() {
        let detail = session_detail(&session(), &messages());

        assert_eq!(detail.log.len(), 4);
        assert!(matches!(&detail.log[0], LogEntry::User { text, .. } if text == "port it"));
        match &detail.log[2] {
            LogEntry::ToolUse {
                tool,
                args,
                success,
                timestamp,
            } => {
                assert_eq!(tool, "bash");
                assert_eq!(args["command"], "cargo fmt");
                assert!(!success);
                assert_eq!(timestamp, &ms_to_timestamp(3_000));
            }
            other => panic!("expected tool use, got {other:?}"),
        }
    }

    /// Serves one canned JSON response on a local port.
    fn serve_once(body: Vec<u8>) -> String {
        use std::io::{BufRead, BufReader, Write};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            while reader.read_line(&mut line).is_ok_and(|read| read > 0) {
                if line == "\r\n" {
                    break;
                }
                line.clear();
            }
            let mut stream = reader.into_inner();
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(head.as_bytes());
            let _ = stream.write_all(&body);
            let _ = stream.flush();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn reads_message_lists_larger_than_ten_mebibytes() {
        let text = "x".repeat(4 * 1024 * 1024);
        let messages: Vec<Value> = (0..3)
            .map(|i| {
                json!({
                    "info": { "role": "assistant", "time": { "created": i } },
                    "parts": [{ "type": "text", "text": text }]
                })
            })
            .collect();
        let body = serde_json::to_vec(&messages).expect("encode");
        assert!(body.len() > 10 * 1024 * 1024);

        let client = OpenCodeClient::new(&serve_once(body), "/work/app");
        let fetched = client.messages("ses_big").await.expect("large body");

        assert_eq!(fetched.len(), 3);
    }

    #[test]
    fn untitled_session_falls_back_to_id() {
        let mut untitled = session();
        untitled.title.clear();
        assert_eq!(session_detail(&untitled, &[]).title, "ses_1");
    }
}
