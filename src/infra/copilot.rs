use crate::domain::{
    AgentRepoSummary, AgentSessionSummary, LogEntry, PreviewBuilder, SessionDetail, SessionMode,
    SessionStatus, derive_title_from_user_text, input_as_args, mark_external_sessions, path_key,
    workspaces_with_agent,
};
use crate::infra::ProcessTable;
use async_trait::async_trait;
use futures_util::future::try_join_all;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

const COPILOT_PROCESS_NAME: &str = "copilot";

#[derive(Debug, Error)]
pub enum CopilotError {
    #[error("copilot session not found: {0}")]
    SessionNotFound(String),

    #[error("copilot sdk error: {0}")]
    Sdk(String),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CopilotSessionContext {
    pub cwd: String,
    pub git_root: Option<String>,
    pub branch: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CopilotSessionMetadata {
    pub session_id: String,
    pub summary: Option<String>,
    /// Unix milliseconds.
    pub modified_time: i64,
    pub context: Option<CopilotSessionContext>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CopilotEventKind {
    ModeChanged {
        new_mode: Option<String>,
    },
    UserMessage {
        content: String,
    },
    AssistantMessage {
        content: String,
    },
    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
        arguments: Value,
    },
    ToolExecutionComplete {
        tool_call_id: String,
        success: bool,
    },
    Other,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CopilotEvent {
    pub timestamp: String,
    pub kind: CopilotEventKind,
}

/// The Copilot SDK client as this crate uses it. The SDK manages its own
/// CLI process; `start` and `stop` bracket its lifetime.
#[async_trait]
pub trait CopilotSdk: Send + Sync {
    async fn start(&self) -> Result<(), CopilotError>;
    async fn stop(&self) -> Result<(), CopilotError>;
    async fn list_sessions(&self) -> Result<Vec<CopilotSessionMetadata>, CopilotError>;
    /// Event history of a session, without resuming it.
    async fn session_events(&self, session_id: &str) -> Result<Vec<CopilotEvent>, CopilotError>;
}

pub struct CopilotBackend {
    sdk: Arc<dyn CopilotSdk>,
    started: tokio::sync::Mutex<bool>,
    processes: Arc<ProcessTable>,
}

impl CopilotBackend {
    pub fn new(sdk: Arc<dyn CopilotSdk>, processes: Arc<ProcessTable>) -> Self {
        Self {
            sdk,
            started: tokio::sync::Mutex::new(false),
            processes,
        }
    }

    async fn ensure_started(&self) -> Result<(), CopilotError> {
        let mut started = self.started.lock().await;
        if !*started {
            self.sdk.start().await?;
            tracing::debug!("copilot client started");
            *started = true;
        }
        Ok(())
    }

    pub async fn load_repos(
        &self,
        repo_paths: &[String],
        max_sessions: usize,
    ) -> Result<Vec<AgentRepoSummary>, CopilotError> {
        self.ensure_started().await?;
        let all_sessions = self.sdk.list_sessions().await?;

        let mut repos = try_join_all(
            repo_paths
                .iter()
                .map(|repo_path| self.load_repo(&all_sessions, repo_path, max_sessions)),
        )
        .await?;

        let processes = self.processes.agent_processes().await;
        let active = workspaces_with_agent(&processes, COPILOT_PROCESS_NAME, None);
        mark_external_sessions(&mut repos, &active);

        Ok(repos)
    }

    async fn load_repo(
        &self,
        all_sessions: &[CopilotSessionMetadata],
        repo_path: &str,
        max_sessions: usize,
    ) -> Result<AgentRepoSummary, CopilotError> {
        let key = path_key(repo_path);
        let mut recent: Vec<&CopilotSessionMetadata> = all_sessions
            .iter()
            .filter(|metadata| {
                metadata.context.as_ref().is_some_and(|context| {
                    path_key(&context.cwd) == key
                        || context.git_root.as_deref().map(path_key).as_ref() == Some(&key)
                })
            })
            .collect();
        recent.sort_by(|a, b| b.modified_time.cmp(&a.modified_time));
        recent.truncate(max_sessions);

        let sessions = try_join_all(recent.iter().map(|metadata| async move {
            let events = self.sdk.session_events(&metadata.session_id).await?;
            Ok::<_, CopilotError>(summarize_events(metadata, &events, repo_path))
        }))
        .await?;

        let branch = recent
            .first()
            .and_then(|metadata| metadata.context.as_ref())
            .and_then(|context| context.branch.clone())
            .filter(|branch| !branch.is_empty())
            .unwrap_or_else(|| "HEAD".to_string());

        Ok(AgentRepoSummary {
            path: repo_path.to_string(),
            branch,
            sessions,
        })
    }

    pub async fn load_session(&self, id: &str) -> Result<Option<SessionDetail>, CopilotError> {
        self.ensure_started().await?;
        let events = match self.sdk.session_events(id).await {
            Ok(events) => events,
            Err(CopilotError::SessionNotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        Ok(Some(SessionDetail {
            id: id.to_string(),
            title: first_user_line(&events).unwrap_or_else(|| id.to_string()),
            log: events_to_log(&events),
        }))
    }

    /// Stops the SDK client if it was started.
    pub async fn shutdown(&self) {
        let mut started = self.started.lock().await;
        if !*started {
            return;
        }
        if let Err(err) = self.sdk.stop().await {
            tracing::warn!(error = %err, "failed to stop copilot client");
        }
        *started = false;
    }
}

pub fn map_copilot_mode(mode: Option<&str>) -> Option<SessionMode> {
    match mode? {
        "interactive" => Some(SessionMode::Standard),
        "plan" => Some(SessionMode::Plan),
        "autopilot" => Some(SessionMode::Yolo),
        _ => None,
    }
}

fn first_user_line(events: &[CopilotEvent]) -> Option<String> {
    events.iter().find_map(|event| match &event.kind {
        CopilotEventKind::UserMessage { content } if !content.is_empty() => {
            derive_title_from_user_text(content)
        }
        _ => None,
    })
}

pub fn summarize_events(
    metadata: &CopilotSessionMetadata,
    events: &[CopilotEvent],
    workspace: &str,
) -> AgentSessionSummary {
    let mut mode = None;
    let mut preview = PreviewBuilder::new();
    let mut call_ids: HashMap<&str, String> = HashMap::new();

    for event in events {
        match &event.kind {
            CopilotEventKind::ModeChanged { new_mode } => {
                mode = map_copilot_mode(new_mode.as_deref()).or(mode);
            }
            CopilotEventKind::AssistantMessage { content } => {
                preview.record_assistant(content.clone(), event.timestamp.clone());
            }
            CopilotEventKind::ToolExecutionStart {
                tool_call_id,
                tool_name,
                arguments,
            } => {
                let tool_id = format!("{}-{tool_name}-{}", metadata.session_id, preview.seq());
                call_ids.insert(tool_call_id, tool_id.clone());
                preview.record_tool_use(
                    tool_id,
                    tool_name.clone(),
                    input_as_args(arguments),
                    event.timestamp.clone(),
                );
            }
            CopilotEventKind::ToolExecutionComplete {
                tool_call_id,
                success,
            } => {
                if let Some(tool_id) = call_ids.get(tool_call_id.as_str()) {
                    preview.record_tool_result(tool_id.clone(), *success);
                }
            }
            CopilotEventKind::UserMessage { .. } | CopilotEventKind::Other => {}
        }
    }

    let title = metadata
        .summary
        .clone()
        .filter(|summary| !summary.is_empty())
        .or_else(|| first_user_line(events))
        .unwrap_or_else(|| metadata.session_id.clone());

    AgentSessionSummary {
        id: metadata.session_id.clone(),
        workspace: workspace.to_string(),
        title,
        status: SessionStatus::Inactive,
        mode,
        timestamp: metadata.modified_time,
        last_entries: preview.last_entries(),
    }
}

struct PendingTool {
    tool: String,
    args: Map<String, Value>,
    timestamp: String,
}

/// Transcript with each tool start paired to its completion by call id.
/// Starts that never completed are appended at the end as successful.
pub fn events_to_log(events: &[CopilotEvent]) -> Vec<LogEntry> {
    let mut log = Vec::new();
    let mut pending: Vec<(String, PendingTool)> = Vec::new();

    for event in events {
        match &event.kind {
            CopilotEventKind::UserMessage { content } if !content.is_empty() => {
                log.push(LogEntry::User {
                    text: content.clone(),
                    timestamp: event.timestamp.clone(),
                });
            }
            CopilotEventKind::AssistantMessage { content } if !content.is_empty() => {
                log.push(LogEntry::Assistant {
                    text: content.clone(),
                    timestamp: event.timestamp.clone(),
                });
            }
            CopilotEventKind::ToolExecutionStart {
                tool_call_id,
                tool_name,
                arguments,
            } => {
                pending.retain(|(id, _)| id != tool_call_id);
                pending.push((
                    tool_call_id.clone(),
                    PendingTool {
                        tool: tool_name.clone(),
                        args: input_as_args(arguments),
                        timestamp: event.timestamp.clone(),
                    },
                ));
            }
            CopilotEventKind::ToolExecutionComplete {
                tool_call_id,
                success,
            } => {
                let started = pending
                    .iter()
                    .position(|(id, _)| id == tool_call_id)
                    .map(|index| pending.remove(index).1);
                log.push(match started {
                    Some(tool) => LogEntry::ToolUse {
                        tool: tool.tool,
                        args: tool.args,
                        success: *success,
                        timestamp: tool.timestamp,
                    },
                    None => LogEntry::ToolUse {
                        tool: "unknown".to_string(),
                        args: Map::new(),
                        success: *success,
                        timestamp: event.timestamp.clone(),
                    },
                });
            }
            _ => {}
        }
    }

    log.extend(pending.into_iter().map(|(_, tool)| LogEntry::ToolUse {
        tool: tool.tool,
        args: tool.args,
        success: true,
        timestamp: tool.timestamp,
    }));
    log
}
