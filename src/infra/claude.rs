use crate::domain::{
    AgentRepoSummary, AgentSessionSummary, LogEntry, SessionDetail, SessionMode, SessionRecord,
    SessionStatus, assistant_text, claude_project_dir_name, derive_title_from_user_text,
    input_as_args, is_meta_message, mark_external_sessions, parse_rfc3339_to_unix_ms, path_key,
    tool_results, tool_uses, user_text, workspaces_with_agent,
};
use crate::infra::{
    ProcessTable, ScanError, SessionOverview, read_all_records, read_first_user_record,
    read_session_overview,
};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use walkdir::WalkDir;

const CLAUDE_PROCESS_NAME: &str = "claude";

#[derive(Debug, Error)]
pub enum ClaudeError {
    #[error("failed to read Claude projects dir {path}: {source}")]
    ReadProjectsDir { path: PathBuf, source: io::Error },

    #[error("failed to read session log {path}: {source}")]
    ReadSession { path: PathBuf, source: ScanError },

    #[error("Claude scan task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Sessions from the Claude Code log directory (`~/.claude/projects`). Each
/// project directory holds one `.jsonl` log per session.
pub struct ClaudeBackend {
    projects_dir: PathBuf,
    processes: Arc<ProcessTable>,
    session_files: Arc<Mutex<HashMap<String, PathBuf>>>,
}

impl ClaudeBackend {
    pub fn new(projects_dir: PathBuf, processes: Arc<ProcessTable>) -> Self {
        Self {
            projects_dir,
            processes,
            session_files: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn projects_dir(&self) -> &Path {
        &self.projects_dir
    }

    pub async fn load_repos(
        &self,
        repo_paths: &[String],
        max_sessions: usize,
    ) -> Result<Vec<AgentRepoSummary>, ClaudeError> {
        let projects_dir = self.projects_dir.clone();
        let repo_paths = repo_paths.to_vec();
        let session_files = Arc::clone(&self.session_files);

        let mut repos = tokio::task::spawn_blocking(move || -> Result<_, ClaudeError> {
            let index = index_project_dirs(&projects_dir)?;
            let mut repos = Vec::with_capacity(repo_paths.len());
            for repo_path in repo_paths {
                let project_dir = find_project_dir(&projects_dir, &index, &repo_path);
                let (repo, files) = match project_dir {
                    Some(dir) => load_project(&dir, &repo_path, max_sessions)?,
                    None => (empty_repo(&repo_path), Vec::new()),
                };
                remember_session_files(&session_files, files);
                repos.push(repo);
            }
            Ok(repos)
        })
        .await??;

        let processes = self.processes.agent_processes().await;
        let active = workspaces_with_agent(&processes, CLAUDE_PROCESS_NAME, None);
        mark_external_sessions(&mut repos, &active);

        Ok(repos)
    }

    pub async fn load_session(&self, id: &str) -> Result<Option<SessionDetail>, ClaudeError> {
        let cached = {
            let files = self.session_files.lock().unwrap_or_else(|e| e.into_inner());
            files.get(id).cloned()
        };
        let projects_dir = self.projects_dir.clone();
        let id = id.to_string();

        tokio::task::spawn_blocking(move || -> Result<Option<SessionDetail>, ClaudeError> {
            let path = match cached.filter(|path| path.is_file()) {
                Some(path) => path,
                None => match find_session_file(&projects_dir, &id) {
                    Some(path) => path,
                    None => return Ok(None),
                },
            };
            let records = read_all_records(&path).map_err(|source| ClaudeError::ReadSession {
                path: path.clone(),
                source,
            })?;
            Ok(Some(build_session_detail(&id, &records)))
        })
        .await?
    }

    pub fn clear(&self) {
        let mut files = self.session_files.lock().unwrap_or_else(|e| e.into_inner());
        files.clear();
    }
}

fn empty_repo(repo_path: &str) -> AgentRepoSummary {
    AgentRepoSummary {
        path: repo_path.to_string(),
        branch: "HEAD".to_string(),
        sessions: Vec::new(),
    }
}

fn remember_session_files(cache: &Mutex<HashMap<String, PathBuf>>, files: Vec<(String, PathBuf)>) {
    if files.is_empty() {
        return;
    }
    let mut cache = cache.lock().unwrap_or_else(|e| e.into_inner());
    cache.extend(files);
}

/// Maps each project's working directory (lowercased) to its directory under
/// the projects root, by peeking at the first user record of its logs.
fn index_project_dirs(projects_dir: &Path) -> Result<HashMap<String, PathBuf>, ClaudeError> {
    let mut index = HashMap::new();
    let entries = match fs::read_dir(projects_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(index),
        Err(source) => {
            return Err(ClaudeError::ReadProjectsDir {
                path: projects_dir.to_path_buf(),
                source,
            });
        }
    };

    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        for log in session_logs(&dir) {
            match read_first_user_record(&log) {
                Ok(Some(record)) if !record.cwd.is_empty() => {
                    index.insert(path_key(&record.cwd), dir.clone());
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(path = %log.display(), error = %err, "skipping unreadable session log");
                }
            }
        }
    }
    Ok(index)
}

fn find_project_dir(
    projects_dir: &Path,
    index: &HashMap<String, PathBuf>,
    repo_path: &str,
) -> Option<PathBuf> {
    if let Some(dir) = index.get(&path_key(repo_path)) {
        return Some(dir.clone());
    }
    let encoded = projects_dir.join(claude_project_dir_name(repo_path));
    encoded.is_dir().then_some(encoded)
}

fn session_logs(dir: &Path) -> Vec<PathBuf> {
    let mut logs: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("jsonl"))
        .collect();
    logs.sort();
    logs
}

type SessionFiles = Vec<(String, PathBuf)>;

fn load_project(
    dir: &Path,
    repo_path: &str,
    max_sessions: usize,
) -> Result<(AgentRepoSummary, SessionFiles), ClaudeError> {
    let mut overviews: Vec<(SessionOverview, PathBuf)> = Vec::new();
    for log in session_logs(dir) {
        match read_session_overview(&log) {
            Ok(Some(overview)) if overview.has_content => overviews.push((overview, log)),
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(path = %log.display(), error = %err, "skipping session log");
            }
        }
    }

    overviews.sort_by(|(a, _), (b, _)| b.last_timestamp.cmp(&a.last_timestamp));
    overviews.truncate(max_sessions);

    let branch = overviews
        .first()
        .map(|(overview, _)| overview.git_branch.clone())
        .filter(|branch| !branch.is_empty())
        .unwrap_or_else(|| "HEAD".to_string());

    let files = overviews
        .iter()
        .map(|(overview, path)| (overview.session_id.clone(), path.clone()))
        .collect();
    let sessions = overviews
        .iter()
        .map(|(overview, _)| summarize_overview(overview, repo_path))
        .collect();

    Ok((
        AgentRepoSummary {
            path: repo_path.to_string(),
            branch,
            sessions,
        },
        files,
    ))
}

pub fn mode_from_permission(permission_mode: Option<&str>) -> Option<SessionMode> {
    match permission_mode? {
        "plan" => Some(SessionMode::Plan),
        "bypassPermissions" => Some(SessionMode::Yolo),
        _ => Some(SessionMode::Standard),
    }
}

fn summarize_overview(overview: &SessionOverview, repo_path: &str) -> AgentSessionSummary {
    let title = overview
        .first_user_text
        .as_deref()
        .and_then(derive_title_from_user_text)
        .unwrap_or_else(|| overview.session_id.clone());

    AgentSessionSummary {
        id: overview.session_id.clone(),
        workspace: repo_path.to_string(),
        title,
        status: SessionStatus::Inactive,
        mode: mode_from_permission(overview.permission_mode.as_deref()),
        timestamp: parse_rfc3339_to_unix_ms(&overview.last_timestamp).unwrap_or(0),
        last_entries: overview.preview.last_entries(),
    }
}

fn find_session_file(projects_dir: &Path, id: &str) -> Option<PathBuf> {
    let file_name = format!("{id}.jsonl");
    WalkDir::new(projects_dir)
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .filter_map(Result::ok)
        .find(|entry| entry.file_type().is_file() && entry.file_name().to_str() == Some(file_name.as_str()))
        .map(|entry| entry.into_path())
}

/// Transcript of a session: prompts, assistant text and tool calls in file
/// order. Meta messages are left out.
pub fn build_session_detail(id: &str, records: &[SessionRecord]) -> SessionDetail {
    let mut results: HashMap<String, bool> = HashMap::new();
    for record in records {
        if let SessionRecord::User(user) = record {
            results.extend(tool_results(user));
        }
    }

    let mut title: Option<String> = None;
    let mut log = Vec::new();
    for record in records {
        match record {
            SessionRecord::User(user) => {
                if is_meta_message(user) {
                    continue;
                }
                let text = user_text(user);
                if text.is_empty() {
                    continue;
                }
                if title.is_none() {
                    title = derive_title_from_user_text(&text);
                }
                log.push(LogEntry::User {
                    text,
                    timestamp: user.timestamp.clone(),
                });
            }
            SessionRecord::Assistant(assistant) => {
                let text = assistant_text(assistant);
                if !text.is_empty() {
                    log.push(LogEntry::Assistant {
                        text,
                        timestamp: assistant.timestamp.clone(),
                    });
                }
                for tool_use in tool_uses(assistant) {
                    log.push(LogEntry::ToolUse {
                        tool: tool_use.name.to_string(),
                        args: input_as_args(tool_use.input),
                        success: results.get(tool_use.id).copied().unwrap_or(true),
                        timestamp: assistant.timestamp.clone(),
                    });
                }
            }
        }
    }

    SessionDetail {
        id: id.to_string(),
        title: title.unwrap_or_else(|| id.to_string()),
        log,
    }
}
