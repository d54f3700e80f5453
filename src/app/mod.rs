use crate::domain::{
    ActiveOrder, AgentBrand, AgentDetail, AgentRepoSummary, RepoError, RepoSessionSummary,
    RepoSummary, SessionDetail, active_first_compare, display_path, path_key,
};
use crate::infra::{
    ClaudeBackend, ClaudeError, CopilotBackend, CopilotError, DEFAULT_PROCESS_TABLE_TTL,
    OpenCodeBackend, OpenCodeError, ProcessTable, ResolveClaudeProjectsDirError, ServerLaunch,
    resolve_claude_projects_dir, resolve_opencode_bin,
};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MAX_SESSIONS_PER_REPO: usize = 10;

/// Branch name backends report when they know nothing better.
const PLACEHOLDER_BRANCH: &str = "HEAD";

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Claude(#[from] ClaudeError),

    #[error(transparent)]
    OpenCode(#[from] OpenCodeError),

    #[error(transparent)]
    Copilot(#[from] CopilotError),
}

/// No backend returned the session and at least one of them failed.
#[derive(Debug, Error)]
#[error("Session not found. Agent errors:\n{}", format_agent_errors(.errors))]
pub struct SessionLookupError {
    pub errors: Vec<RepoError>,
}

fn format_agent_errors(errors: &[RepoError]) -> String {
    errors
        .iter()
        .map(|error| format!("[{}] {}", error.brand.code(), error.message))
        .collect::<Vec<_>>()
        .join("\n")
}

/// One source of agent sessions.
#[async_trait]
pub trait Agent: Send + Sync {
    fn brand(&self) -> AgentBrand;

    async fn load_repos(
        &self,
        repo_paths: &[String],
        max_sessions: usize,
    ) -> Result<Vec<AgentRepoSummary>, AgentError>;

    async fn load_session(&self, id: &str) -> Result<Option<SessionDetail>, AgentError>;

    /// Releases whatever the backend started or cached.
    async fn shutdown(&self) {}
}

pub enum Backend {
    Claude(ClaudeBackend),
    OpenCode(OpenCodeBackend),
    Copilot(CopilotBackend),
}

#[async_trait]
impl Agent for Backend {
    fn brand(&self) -> AgentBrand {
        match self {
            Self::Claude(_) => AgentBrand::Claude,
            Self::OpenCode(_) => AgentBrand::OpenCode,
            Self::Copilot(_) => AgentBrand::Copilot,
        }
    }

    async fn load_repos(
        &self,
        repo_paths: &[String],
        max_sessions: usize,
    ) -> Result<Vec<AgentRepoSummary>, AgentError> {
        match self {
            Self::Claude(claude) => Ok(claude.load_repos(repo_paths, max_sessions).await?),
            Self::OpenCode(opencode) => Ok(opencode.load_repos(repo_paths, max_sessions).await?),
            Self::Copilot(copilot) => Ok(copilot.load_repos(repo_paths, max_sessions).await?),
        }
    }

    async fn load_session(&self, id: &str) -> Result<Option<SessionDetail>, AgentError> {
        match self {
            Self::Claude(claude) => Ok(claude.load_session(id).await?),
            Self::OpenCode(opencode) => Ok(opencode.load_session(id).await?),
            Self::Copilot(copilot) => Ok(copilot.load_session(id).await?),
        }
    }

    async fn shutdown(&self) {
        match self {
            Self::Claude(claude) => claude.clear(),
            Self::OpenCode(opencode) => opencode.shutdown(),
            Self::Copilot(copilot) => copilot.shutdown().await,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DashboardConfig {
    pub max_sessions_per_repo: usize,
    pub claude_projects_dir: PathBuf,
    pub opencode: ServerLaunch,
    pub process_table_ttl: Duration,
}

impl DashboardConfig {
    /// Defaults, with directories and binaries taken from the environment.
    pub fn resolve() -> Result<Self, ResolveClaudeProjectsDirError> {
        Ok(Self {
            max_sessions_per_repo: DEFAULT_MAX_SESSIONS_PER_REPO,
            claude_projects_dir: resolve_claude_projects_dir()?,
            opencode: ServerLaunch::opencode(resolve_opencode_bin()),
            process_table_ttl: DEFAULT_PROCESS_TABLE_TTL,
        })
    }
}

/// Merges every backend's view of the registered repositories into one
/// dashboard. Exactly one instance lives per process; it owns every cache
/// the backends keep, and `shutdown` resets all of them.
pub struct Dashboard<A: Agent = Backend> {
    agents: Vec<A>,
    processes: Arc<ProcessTable>,
    max_sessions_per_repo: usize,
    home: Option<PathBuf>,
    session_order: Mutex<ActiveOrder>,
    repo_order: Mutex<ActiveOrder>,
}

impl Dashboard<Backend> {
    /// Claude Code and OpenCode. Copilot needs an SDK client and is added
    /// with [`Dashboard::new`].
    pub fn from_config(config: DashboardConfig) -> Self {
        let processes = Arc::new(ProcessTable::new(config.process_table_ttl));
        let agents = vec![
            Backend::Claude(ClaudeBackend::new(
                config.claude_projects_dir,
                Arc::clone(&processes),
            )),
            Backend::OpenCode(OpenCodeBackend::new(config.opencode, Arc::clone(&processes))),
        ];
        Self::new(agents, processes, config.max_sessions_per_repo)
    }
}

impl<A: Agent> Dashboard<A> {
    pub fn new(agents: Vec<A>, processes: Arc<ProcessTable>, max_sessions_per_repo: usize) -> Self {
        Self {
            agents,
            processes,
            max_sessions_per_repo,
            home: dirs::home_dir(),
            session_order: Mutex::new(ActiveOrder::new()),
            repo_order: Mutex::new(ActiveOrder::new()),
        }
    }

    pub fn with_home(mut self, home: Option<PathBuf>) -> Self {
        self.home = home;
        self
    }

    pub fn agents(&self) -> &[A] {
        &self.agents
    }

    /// Sessions for `repo_paths` from every backend. A failing backend never
    /// hides the others: its error is attached to every repository instead.
    pub async fn load_repos(&self, repo_paths: &[String]) -> Vec<RepoSummary> {
        let results = join_all(
            self.agents
                .iter()
                .map(|agent| agent.load_repos(repo_paths, self.max_sessions_per_repo)),
        )
        .await;

        let mut merged = MergedRepos::default();
        let mut agent_errors: Vec<RepoError> = Vec::new();

        for (agent, result) in self.agents.iter().zip(results) {
            let brand = agent.brand();
            match result {
                Ok(repos) => {
                    for repo in repos {
                        merged.add(repo, brand);
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        brand = brand.code(),
                        backend = brand.label(),
                        error = %err,
                        "backend failed to load repos"
                    );
                    agent_errors.push(RepoError {
                        brand,
                        message: err.to_string(),
                    });
                }
            }
        }

        for repo_path in repo_paths {
            merged.ensure(repo_path);
        }

        let mut repos = merged.into_repos();
        if !agent_errors.is_empty() {
            for repo in &mut repos {
                repo.errors.extend(agent_errors.iter().cloned());
            }
        }

        self.sort(&mut repos);

        for repo in &mut repos {
            repo.path = display_path(&repo.path, self.home.as_deref());
        }
        repos
    }

    fn sort(&self, repos: &mut [RepoSummary]) {
        let active_sessions: Vec<String> = repos
            .iter()
            .flat_map(|repo| &repo.sessions)
            .filter(|session| session.session.status.is_active())
            .map(|session| session.session.id.clone())
            .collect();
        let session_index = self
            .session_order
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .update(active_sessions);

        for repo in repos.iter_mut() {
            repo.sessions.sort_by(|a, b| {
                active_first_compare(
                    &session_index,
                    &a.session.id,
                    a.session.timestamp,
                    &b.session.id,
                    b.session.timestamp,
                )
            });
        }

        let active_repos: Vec<String> = repos
            .iter()
            .filter(|repo| {
                repo.sessions
                    .iter()
                    .any(|session| session_index.contains_key(&session.session.id))
            })
            .map(|repo| path_key(&repo.path))
            .collect();
        let repo_index = self
            .repo_order
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .update(active_repos);

        repos.sort_by(|a, b| {
            active_first_compare(
                &repo_index,
                &path_key(&a.path),
                newest_timestamp(a),
                &path_key(&b.path),
                newest_timestamp(b),
            )
        });
    }

    /// First backend that knows `id` wins. When none does and some failed,
    /// the failures are reported since one of them may have owned it.
    pub async fn load_agent_detail(
        &self,
        id: &str,
    ) -> Result<Option<AgentDetail>, SessionLookupError> {
        let results = join_all(self.agents.iter().map(|agent| agent.load_session(id))).await;

        let mut errors: Vec<RepoError> = Vec::new();
        for (agent, result) in self.agents.iter().zip(results) {
            match result {
                Ok(Some(detail)) => {
                    return Ok(Some(AgentDetail {
                        brand: agent.brand(),
                        detail,
                    }));
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(
                        brand = agent.brand().code(),
                        backend = agent.brand().label(),
                        %id,
                        error = %err,
                        "session lookup failed"
                    );
                    errors.push(RepoError {
                        brand: agent.brand(),
                        message: err.to_string(),
                    });
                }
            }
        }

        if errors.is_empty() {
            Ok(None)
        } else {
            Err(SessionLookupError { errors })
        }
    }

    /// Stops spawned servers and SDK clients and forgets every cache, so the
    /// next call starts from scratch.
    pub async fn shutdown(&self) {
        join_all(self.agents.iter().map(|agent| agent.shutdown())).await;
        self.processes.clear();
        self.session_order
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.repo_order
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        tracing::debug!("dashboard shut down");
    }
}

fn newest_timestamp(repo: &RepoSummary) -> i64 {
    repo.sessions
        .first()
        .map(|session| session.session.timestamp)
        .unwrap_or(0)
}

/// Repositories keyed case-insensitively, in first-seen order.
#[derive(Default)]
struct MergedRepos {
    repos: Vec<RepoSummary>,
    by_key: HashMap<String, usize>,
}

impl MergedRepos {
    fn add(&mut self, repo: AgentRepoSummary, brand: AgentBrand) {
        let sessions = repo.sessions.into_iter().map(|mut session| {
            if !session.status.is_active() {
                session.mode = None;
            }
            RepoSessionSummary { session, brand }
        });

        let key = path_key(&repo.path);
        match self.by_key.get(&key) {
            Some(&slot) => {
                let existing = &mut self.repos[slot];
                existing.sessions.extend(sessions);
                if existing.branch.is_empty() || existing.branch == PLACEHOLDER_BRANCH {
                    existing.branch = repo.branch;
                }
            }
            None => {
                self.by_key.insert(key, self.repos.len());
                self.repos.push(RepoSummary {
                    path: repo.path,
                    branch: repo.branch,
                    sessions: sessions.collect(),
                    errors: Vec::new(),
                });
            }
        }
    }

    fn ensure(&mut self, repo_path: &str) {
        let key = path_key(repo_path);
        if self.by_key.contains_key(&key) {
            return;
        }
        self.by_key.insert(key, self.repos.len());
        self.repos.push(RepoSummary {
            path: repo_path.to_string(),
            branch: String::new(),
            sessions: Vec::new(),
            errors: Vec::new(),
        });
    }

    fn into_repos(self) -> Vec<RepoSummary> {
        self.repos
    }
}
