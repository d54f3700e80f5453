mod client;
mod server;

pub use client::*;
pub use server::*;

use crate::domain::{
    AgentRepoSummary, SessionDetail, mark_external_sessions, path_key, workspaces_with_agent,
};
use crate::infra::ProcessTable;
use futures_util::future::try_join_all;
use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex};

const OPENCODE_PROCESS_NAME: &str = "opencode";

/// Matches our own managed server (and other non-interactive runs) so they
/// are not mistaken for a user's terminal session.
static MANAGED_COMMAND_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bopencode(?:\.exe)?\s+(?:serve|x|run)\b").expect("managed command regex is valid")
});

/// Sessions from an opencode server that we spawn and own. One client per
/// project directory; session ids are remembered with their directory so
/// detail lookups go straight to the right client.
pub struct OpenCodeBackend {
    server: ServerSupervisor,
    processes: Arc<ProcessTable>,
    clients: Mutex<HashMap<String, Arc<OpenCodeClient>>>,
    session_dirs: Mutex<HashMap<String, String>>,
    clients_created: AtomicUsize,
}

impl OpenCodeBackend {
    pub fn new(launch: ServerLaunch, processes: Arc<ProcessTable>) -> Self {
        Self {
            server: ServerSupervisor::new(launch),
            processes,
            clients: Mutex::new(HashMap::new()),
            session_dirs: Mutex::new(HashMap::new()),
            clients_created: AtomicUsize::new(0),
        }
    }

    /// Cached client for `directory`, creating it (and starting the server)
    /// on first use.
    pub async fn client_for(&self, directory: &str) -> Result<Arc<OpenCodeClient>, OpenCodeError> {
        let key = path_key(directory);
        if let Some(client) = self.cached_client(&key) {
            return Ok(client);
        }

        let base_url = self.server.ensure_server().await?;

        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        let client = clients.entry(key).or_insert_with(|| {
            self.clients_created.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(%directory, "creating opencode client");
            Arc::new(OpenCodeClient::new(&base_url, directory))
        });
        Ok(Arc::clone(client))
    }

    fn cached_client(&self, key: &str) -> Option<Arc<OpenCodeClient>> {
        let clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        clients.get(key).cloned()
    }

    /// Number of per-directory clients created since start.
    pub fn clients_created(&self) -> usize {
        self.clients_created.load(Ordering::SeqCst)
    }

    pub async fn load_repos(
        &self,
        repo_paths: &[String],
        max_sessions: usize,
    ) -> Result<Vec<AgentRepoSummary>, OpenCodeError> {
        let mut repos = try_join_all(
            repo_paths
                .iter()
                .map(|repo_path| self.load_repo(repo_path, max_sessions)),
        )
        .await?;

        let processes = self.processes.agent_processes().await;
        let active = workspaces_with_agent(
            &processes,
            OPENCODE_PROCESS_NAME,
            Some(&*MANAGED_COMMAND_REGEX),
        );
        mark_external_sessions(&mut repos, &active);

        Ok(repos)
    }

    async fn load_repo(
        &self,
        repo_path: &str,
        max_sessions: usize,
    ) -> Result<AgentRepoSummary, OpenCodeError> {
        let client = self.client_for(repo_path).await?;

        let (sessions, statuses, vcs) = tokio::try_join!(
            client.list_sessions(),
            client.session_statuses(),
            client.vcs()
        )?;

        let key = path_key(repo_path);
        let mut sessions: Vec<OcSession> = sessions
            .into_iter()
            .filter(|session| path_key(&session.directory) == key)
            .collect();
        sessions.sort_by(|a, b| b.time.updated.cmp(&a.time.updated));
        sessions.truncate(max_sessions);

        self.remember_sessions(&sessions, repo_path);

        let summaries = try_join_all(sessions.iter().map(|session| {
            let client = Arc::clone(&client);
            let status = statuses.get(&session.id);
            async move {
                let messages = client.messages(&session.id).await?;
                Ok::<_, OpenCodeError>(summarize_session(session, &messages, status, repo_path))
            }
        }))
        .await?;

        Ok(AgentRepoSummary {
            path: repo_path.to_string(),
            branch: vcs
                .branch
                .filter(|branch| !branch.is_empty())
                .unwrap_or_else(|| "HEAD".to_string()),
            sessions: summaries,
        })
    }

    fn remember_sessions(&self, sessions: &[OcSession], repo_path: &str) {
        let mut dirs = self.session_dirs.lock().unwrap_or_else(|e| e.into_inner());
        for session in sessions {
            dirs.insert(session.id.clone(), repo_path.to_string());
        }
    }

    pub async fn load_session(&self, id: &str) -> Result<Option<SessionDetail>, OpenCodeError> {
        let known_dir = {
            let dirs = self.session_dirs.lock().unwrap_or_else(|e| e.into_inner());
            dirs.get(id).cloned()
        };
        if let Some(directory) = known_dir {
            return self.fetch_session(id, &directory).await;
        }

        let directories: Vec<String> = {
            let clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            clients
                .values()
                .map(|client| client.directory().to_string())
                .collect()
        };
        for directory in directories {
            if let Some(detail) = self.fetch_session(id, &directory).await? {
                return Ok(Some(detail));
            }
        }
        Ok(None)
    }

    async fn fetch_session(
        &self,
        id: &str,
        directory: &str,
    ) -> Result<Option<SessionDetail>, OpenCodeError> {
        let client = self.client_for(directory).await?;
        let (session, messages) = tokio::try_join!(client.session(id), client.messages(id))?;
        Ok(session.map(|session| session_detail(&session, &messages)))
    }

    /// Stops the server and drops every cached client and session route.
    pub fn shutdown(&self) {
        self.server.shutdown();
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.session_dirs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn server(&self) -> &ServerSupervisor {
        &self.server
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use std::time::Duration;

    #[cfg(unix)]
    fn backend(script: &str) -> OpenCodeBackend {
        OpenCodeBackend::new(
            ServerLaunch {
                program: OsString::from("sh"),
                args: vec!["-c".to_string(), script.to_string()],
                env: Vec::new(),
                ready_timeout: Duration::from_secs(5),
            },
            Arc::new(ProcessTable::new(Duration::from_secs(60))),
        )
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reuses_client_per_directory() {
        let opencode = backend("echo 'opencode server listening on http://127.0.0.1:1'; exec sleep 30");

        let first = opencode.client_for("/Work/App").await.expect("client");
        let second = opencode.client_for("/work/app").await.expect("client");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(opencode.clients_created(), 1);

        opencode.client_for("/work/other").await.expect("client");
        assert_eq!(opencode.clients_created(), 2);
        opencode.shutdown();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_clears_clients_and_respawns() {
        let opencode = backend("echo 'opencode server listening on http://127.0.0.1:1'; exec sleep 30");

        opencode.client_for("/work/app").await.expect("client");
        opencode.shutdown();
        assert_eq!(opencode.server().base_url(), None);

        opencode.client_for("/work/app").await.expect("client");
        assert_eq!(opencode.clients_created(), 2);
        assert_eq!(opencode.server().spawn_count(), 2);
        opencode.shutdown();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn load_repos_rejects_when_server_exits() {
        let opencode = backend("echo 'missing api key' >&2; exit 1");

        let err = opencode
            .load_repos(&["/work/app".to_string()], 10)
            .await
            .expect_err("server exits");
        let message = err.to_string();
        assert!(message.contains("exited with code 1"), "{message}");
        assert!(message.contains("missing api key"), "{message}");
    }

    #[tokio::test]
    async fn unknown_session_without_clients_is_none() {
        let opencode = OpenCodeBackend::new(
            ServerLaunch::opencode(OsString::from("opencode-not-installed")),
            Arc::new(ProcessTable::new(Duration::from_secs(60))),
        );
        assert_eq!(opencode.load_session("ses_x").await.expect("lookup"), None);
    }

    #[test]
    fn managed_command_pattern() {
        assert!(MANAGED_COMMAND_REGEX.is_match("opencode serve --hostname=127.0.0.1 --port=0"));
        assert!(MANAGED_COMMAND_REGEX.is_match(r"C:\bin\opencode.exe run fix"));
        assert!(!MANAGED_COMMAND_REGEX.is_match("opencode"));
        assert!(!MANAGED_COMMAND_REGEX.is_match("opencode --continue"));
    }
}
