use crate::domain::{
    PreviewBuilder, SessionRecord, UserRecord, assistant_text, input_as_args, is_meta_message,
    parse_record, tool_results, tool_uses, user_text,
};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::ops::ControlFlow;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to open session log: {0}")]
    Open(io::Error),

    #[error("failed to read session log: {0}")]
    Read(io::Error),
}

/// Streams a session log line by line and hands every user or assistant
/// record to `visitor`. Lines that are not such records are skipped. The
/// file is closed as soon as the visitor breaks or the scan returns.
pub fn scan_session<F>(path: &Path, mut visitor: F) -> Result<(), ScanError>
where
    F: FnMut(SessionRecord) -> ControlFlow<()>,
{
    let file = File::open(path).map_err(ScanError::Open)?;
    let mut reader = BufReader::new(file);
    let mut buf: Vec<u8> = Vec::new();

    loop {
        buf.clear();
        let bytes = reader.read_until(b'\n', &mut buf).map_err(ScanError::Read)?;
        if bytes == 0 {
            return Ok(());
        }

        let Ok(line) = std::str::from_utf8(&buf) else {
            continue;
        };
        let line = line.trim_end_matches(['\n', '\r']);
        if line.trim().is_empty() {
            continue;
        }

        let Some(record) = parse_record(line) else {
            continue;
        };
        if visitor(record).is_break() {
            return Ok(());
        }
    }
}

pub fn read_first_user_record(path: &Path) -> Result<Option<UserRecord>, ScanError> {
    let mut first = None;
    scan_session(path, |record| match record {
        SessionRecord::User(user) => {
            first = Some(user);
            ControlFlow::Break(())
        }
        SessionRecord::Assistant(_) => ControlFlow::Continue(()),
    })?;
    Ok(first)
}

/// Everything needed to list a session, gathered in one pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionOverview {
    pub session_id: String,
    pub cwd: String,
    pub git_branch: String,
    pub permission_mode: Option<String>,
    pub has_content: bool,
    /// Largest raw timestamp string seen; records share one ISO-8601 format.
    pub last_timestamp: String,
    pub first_user_text: Option<String>,
    pub preview: PreviewBuilder,
}

/// Returns `None` when the log has no user record to identify the session.
pub fn read_session_overview(path: &Path) -> Result<Option<SessionOverview>, ScanError> {
    let mut overview = SessionOverview::default();
    let mut identified = false;

    scan_session(path, |record| {
        if record.timestamp() > overview.last_timestamp.as_str() {
            overview.last_timestamp = record.timestamp().to_string();
        }

        match record {
            SessionRecord::User(user) => {
                if !identified {
                    identified = true;
                    overview.session_id = user.session_id.clone();
                    overview.cwd = user.cwd.clone();
                    overview.git_branch = user.git_branch.clone();
                }
                if user.permission_mode.is_some() {
                    overview.permission_mode = user.permission_mode.clone();
                }
                if user.is_sidechain {
                    return ControlFlow::Continue(());
                }
                if overview.first_user_text.is_none() {
                    let text = user_text(&user);
                    if !text.is_empty() && !is_meta_message(&user) {
                        overview.has_content = true;
                        overview.first_user_text = Some(text);
                    }
                }
                for (tool_use_id, success) in tool_results(&user) {
                    overview.preview.record_tool_result(tool_use_id, success);
                }
            }
            SessionRecord::Assistant(assistant) => {
                if assistant.is_sidechain {
                    return ControlFlow::Continue(());
                }
                overview.has_content = true;
                overview
                    .preview
                    .record_assistant(assistant_text(&assistant), assistant.timestamp.clone());
                for tool_use in tool_uses(&assistant) {
                    overview.preview.record_tool_use(
                        tool_use.id,
                        tool_use.name,
                        input_as_args(tool_use.input),
                        assistant.timestamp.clone(),
                    );
                }
            }
        }
        ControlFlow::Continue(())
    })?;

    if !identified || overview.session_id.is_empty() {
        return Ok(None);
    }
    Ok(Some(overview))
}

/// Every non-sidechain record, in file order.
pub fn read_all_records(path: &Path) -> Result<Vec<SessionRecord>, ScanError> {
    let mut records = Vec::new();
    scan_session(path, |record| {
        if !record.is_sidechain() {
            records.push(record);
        }
        ControlFlow::Continue(())
    })?;
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use std::fs;
    use tempfile::tempdir;

    fn user(session_id: &str, timestamp: &str, content: Value) -> Value {
        json!({
            "type": "user",
            "uuid": format!("u-{timestamp}"),
            "parentUuid": null,
            "timestamp": timestamp,
            "sessionId": session_id,
            "cwd": "/work/app",
            "gitBranch": "feature",
            "isSidechain": false,
            "message": { "role": "user", "content": content }
        })
    }

    fn assistant(timestamp: &str, content: Value) -> Value {
        json!({
            "type": "assistant",
            "uuid": format!("a-{timestamp}"),
            "timestamp": timestamp,
            "isSidechain": false,
            "message": { "role": "assistant", "model": "m", "content": content, "stop_reason": null }
        })
    }

    fn write_log(dir: &Path, name: &str, lines: &[String]) -> std::path::PathBuf {
        let path = dir.join(name);
        fs::write(&path, lines.join("\n")).expect("write log");
        path
    }

    #[test]
    fn visits_well_formed_records_in_order_and_skips_garbage() {
        let dir = tempdir().expect("tempdir");
        let lines = vec![
            user("s", "2026-01-01T00:00:00Z", json!("one")).to_string(),
            "{broken".to_string(),
            assistant("2026-01-01T00:00:01Z", json!([{ "type": "text", "text": "two" }])).to_string(),
            json!({ "type": "summary", "summary": "x" }).to_string(),
            String::new(),
            user("s", "2026-01-01T00:00:02Z", json!("three")).to_string(),
        ];
        let path = write_log(dir.path(), "s.jsonl", &lines);

        let mut visited = Vec::new();
        scan_session(&path, |record| {
            visited.push(record.timestamp().to_string());
            ControlFlow::Continue(())
        })
        .expect("scan");

        assert_eq!(
            visited,
            vec![
                "2026-01-01T00:00:00Z",
                "2026-01-01T00:00:01Z",
                "2026-01-01T00:00:02Z",
            ]
        );
    }

    #[test]
    fn stops_after_visitor_breaks() {
        let dir = tempdir().expect("tempdir");
        let lines: Vec<String> = (0..50)
            .map(|i| user("s", &format!("2026-01-01T00:00:{:02}Z", i % 60), json!("x")).to_string())
            .collect();
        let path = write_log(dir.path(), "s.jsonl", &lines);

        let mut count = 0;
        scan_session(&path, |_| {
            count += 1;
            if count == 3 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .expect("scan");
        assert_eq!(count, 3);
    }

    #[test]
    fn missing_file_is_an_open_error() {
        let dir = tempdir().expect("tempdir");
        let err = scan_session(&dir.path().join("nope.jsonl"), |_| ControlFlow::Continue(()))
            .expect_err("missing file");
        assert!(matches!(err, ScanError::Open(_)));
    }

    #[test]
    fn first_user_record_skips_leading_assistant() {
        let dir = tempdir().expect("tempdir");
        let lines = vec![
            assistant("2026-01-01T00:00:00Z", json!([])).to_string(),
            user("sess-9", "2026-01-01T00:00:01Z", json!("hi")).to_string(),
        ];
        let path = write_log(dir.path(), "s.jsonl", &lines);

        let record = read_first_user_record(&path).expect("scan").expect("user");
        assert_eq!(record.session_id, "sess-9");
        assert_eq!(record.cwd, "/work/app");
    }

    #[test]
    fn overview_collects_identity_preview_and_title() {
        let dir = tempdir().expect("tempdir");
        let mut plan = user("sess-1", "2026-01-01T00:00:03Z", json!("continue"));
        plan["permissionMode"] = json!("plan");
        let lines = vec![
            user("sess-1", "2026-01-01T00:00:00Z", json!("<command-name>/init</command-name>"))
                .to_string(),
            user("sess-1", "2026-01-01T00:00:01Z", json!("Refactor the parser\nplease"))
                .to_string(),
            assistant(
                "2026-01-01T00:00:02Z",
                json!([
                    { "type": "text", "text": "Looking" },
                    { "type": "tool_use", "id": "t1", "name": "Read", "input": { "path": "a.rs" } }
                ]),
            )
            .to_string(),
            plan.to_string(),
            user(
                "sess-1",
                "2026-01-01T00:00:04Z",
                json!([{ "type": "tool_result", "tool_use_id": "t1", "is_error": true }]),
            )
            .to_string(),
        ];
        let path = write_log(dir.path(), "sess-1.jsonl", &lines);

        let overview = read_session_overview(&path).expect("scan").expect("overview");
        assert_eq!(overview.session_id, "sess-1");
        assert_eq!(overview.git_branch, "feature");
        assert_eq!(overview.permission_mode.as_deref(), Some("plan"));
        assert!(overview.has_content);
        assert_eq!(overview.last_timestamp, "2026-01-01T00:00:04Z");
        assert_eq!(
            overview.first_user_text.as_deref(),
            Some("Refactor the parser\nplease")
        );

        let entries = overview.preview.last_entries();
        assert_eq!(entries.len(), 2);
        assert!(matches!(
            &entries[1],
            crate::domain::LogEntry::ToolUse { tool, success: false, .. } if tool == "Read"
        ));
    }

    #[test]
    fn meta_only_session_has_no_content() {
        let dir = tempdir().expect("tempdir");
        let lines = vec![
            user("sess-2", "2026-01-01T00:00:00Z", json!("<command-name>/clear</command-name>"))
                .to_string(),
            user("sess-2", "2026-01-01T00:00:01Z", json!("<local-command-stdout></local-command-stdout>"))
                .to_string(),
        ];
        let path = write_log(dir.path(), "sess-2.jsonl", &lines);

        let overview = read_session_overview(&path).expect("scan").expect("overview");
        assert!(!overview.has_content);
        assert_eq!(overview.first_user_text, None);
    }

    #[test]
    fn overview_without_user_record_is_none() {
        let dir = tempdir().expect("tempdir");
        let lines = vec![assistant("2026-01-01T00:00:00Z", json!([])).to_string()];
        let path = write_log(dir.path(), "x.jsonl", &lines);
        assert_eq!(read_session_overview(&path).expect("scan"), None);
    }

    #[test]
    fn all_records_drop_sidechains() {
        let dir = tempdir().expect("tempdir");
        let mut side = assistant("2026-01-01T00:00:01Z", json!([{ "type": "text", "text": "sub" }]));
        side["isSidechain"] = json!(true);
        let lines = vec![
            user("s", "2026-01-01T00:00:00Z", json!("go")).to_string(),
            side.to_string(),
            assistant("2026-01-01T00:00:02Z", json!([{ "type": "text", "text": "main" }])).to_string(),
        ];
        let path = write_log(dir.path(), "s.jsonl", &lines);

        let records = read_all_records(&path).expect("scan");
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].timestamp(), "2026-01-01T00:00:02Z");
    }
}
