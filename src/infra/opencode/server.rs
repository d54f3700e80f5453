use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use regex::Regex;
use std::ffi::OsString;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

const LISTENING_PREFIX: &str = "opencode server listening";
const MAX_CAPTURED_OUTPUT: usize = 64 * 1024;
const EXIT_OUTPUT_GRACE: Duration = Duration::from_millis(500);

pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(5);

static LISTENING_URL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"on\s+(https?://[^\s]+)").expect("listening url regex is valid")
});

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ServerStartError {
    #[error("failed to spawn opencode server: {0}")]
    Spawn(String),

    #[error("{}", exited_message(.code, .output))]
    Exited { code: Option<i32>, output: String },

    #[error("Failed to parse server url from output: {line}")]
    UnparsableUrl { line: String },

    #[error("Timeout waiting for opencode server to start after {ms}ms")]
    Timeout { ms: u128 },

    #[error("failed to read opencode server output: {0}")]
    Output(String),

    #[error("opencode server start was cancelled by shutdown")]
    Cancelled,
}

fn exited_message(code: &Option<i32>, output: &str) -> String {
    let code = code.map_or_else(|| "null".to_string(), |code| code.to_string());
    let mut message = format!("opencode server exited with code {code}");
    if !output.trim().is_empty() {
        message.push_str("\nServer output: ");
        message.push_str(output);
    }
    message
}

/// How to launch the server: program, arguments, extra environment and how
/// long to wait for it to report its URL.
#[derive(Clone, Debug)]
pub struct ServerLaunch {
    pub program: OsString,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub ready_timeout: Duration,
}

impl ServerLaunch {
    pub fn opencode(program: OsString) -> Self {
        Self {
            program,
            args: vec![
                "serve".to_string(),
                "--hostname=127.0.0.1".to_string(),
                "--port=0".to_string(),
            ],
            env: vec![("OPENCODE_CONFIG_CONTENT".to_string(), "{}".to_string())],
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

/// Reads a stdout line for the readiness marker. `None` when the line is not
/// the marker, otherwise the URL or the reason it could not be read.
pub fn parse_listening_line(line: &str) -> Option<Result<String, ServerStartError>> {
    if !line.trim_start().starts_with(LISTENING_PREFIX) {
        return None;
    }
    let url = LISTENING_URL_REGEX
        .captures(line)
        .and_then(|captures| captures.get(1))
        .map(|url| url.as_str().to_string());
    Some(url.ok_or_else(|| ServerStartError::UnparsableUrl {
        line: line.to_string(),
    }))
}

type StartFuture = Shared<BoxFuture<'static, Result<String, ServerStartError>>>;

struct ServerHandle {
    base_url: String,
    child: Child,
}

#[derive(Default)]
struct SupervisorState {
    handle: Option<ServerHandle>,
    starting: Option<StartFuture>,
    generation: u64,
}

/// Owns the single spawned server process. Concurrent callers share one
/// in-flight start; a failed start leaves the supervisor ready to retry.
#[derive(Clone)]
pub struct ServerSupervisor {
    launch: ServerLaunch,
    state: Arc<Mutex<SupervisorState>>,
    spawn_count: Arc<AtomicUsize>,
}

impl ServerSupervisor {
    pub fn new(launch: ServerLaunch) -> Self {
        Self {
            launch,
            state: Arc::new(Mutex::new(SupervisorState::default())),
            spawn_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Base URL of the running server, spawning it first if needed.
    pub async fn ensure_server(&self) -> Result<String, ServerStartError> {
        let start = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(handle) = &state.handle {
                return Ok(handle.base_url.clone());
            }
            match &state.starting {
                Some(starting) => starting.clone(),
                None => {
                    let start = run_start(
                        self.launch.clone(),
                        Arc::clone(&self.state),
                        Arc::clone(&self.spawn_count),
                        state.generation,
                    )
                    .boxed()
                    .shared();
                    state.starting = Some(start.clone());
                    start
                }
            }
        };
        start.await
    }

    pub fn base_url(&self) -> Option<String> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.handle.as_ref().map(|handle| handle.base_url.clone())
    }

    /// Kills the server and forgets it, so the next call spawns a new one.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.generation += 1;
        state.starting = None;
        if let Some(mut handle) = state.handle.take() {
            tracing::info!(url = %handle.base_url, "stopping opencode server");
            if let Err(err) = handle.child.start_kill() {
                tracing::warn!(error = %err, "failed to kill opencode server");
            }
        }
    }

    /// Number of processes spawned so far.
    pub fn spawn_count(&self) -> usize {
        self.spawn_count.load(Ordering::SeqCst)
    }
}

async fn run_start(
    launch: ServerLaunch,
    state: Arc<Mutex<SupervisorState>>,
    spawn_count: Arc<AtomicUsize>,
    generation: u64,
) -> Result<String, ServerStartError> {
    spawn_count.fetch_add(1, Ordering::SeqCst);
    let result = launch_server(&launch).await;

    let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
    if state.generation != generation {
        if let Ok((mut child, _)) = result {
            let _ = child.start_kill();
        }
        return Err(ServerStartError::Cancelled);
    }
    state.starting = None;

    let (child, base_url) = result?;
    state.handle = Some(ServerHandle {
        base_url: base_url.clone(),
        child,
    });
    Ok(base_url)
}

async fn launch_server(launch: &ServerLaunch) -> Result<(Child, String), ServerStartError> {
    let mut command = Command::new(&launch.program);
    command
        .args(&launch.args)
        .envs(launch.env.iter().map(|(key, value)| (key.as_str(), value.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::debug!(program = ?launch.program, args = ?launch.args, "spawning opencode server");
    let mut child = command
        .spawn()
        .map_err(|err| ServerStartError::Spawn(err.to_string()))?;

    let output = Arc::new(Mutex::new(String::new()));
    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        let _ = child.start_kill();
        return Err(ServerStartError::Output("server pipes were not captured".to_string()));
    };
    let mut stderr_task = tokio::spawn(forward_stderr(stderr, Arc::clone(&output)));
    let mut lines = BufReader::new(stdout).lines();

    let deadline = tokio::time::sleep(launch.ready_timeout);
    tokio::pin!(deadline);

    let timeout = || ServerStartError::Timeout {
        ms: launch.ready_timeout.as_millis(),
    };

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    append_output(&output, &line);
                    match parse_listening_line(&line) {
                        Some(Ok(url)) => {
                            tracing::info!(%url, pid = ?child.id(), "opencode server ready");
                            tokio::spawn(forward_lines_from(lines));
                            return Ok((child, url));
                        }
                        Some(Err(err)) => {
                            let _ = child.start_kill();
                            return Err(err);
                        }
                        None => {}
                    }
                }
                Ok(None) | Err(_) => {
                    // Stdout closed without a marker; the process is on its way out.
                    tokio::select! {
                        status = child.wait() => {
                            let code = status.ok().and_then(|status| status.code());
                            let _ = tokio::time::timeout(EXIT_OUTPUT_GRACE, &mut stderr_task).await;
                            return Err(exited(code, &output));
                        }
                        _ = &mut deadline => {
                            keep_running(child);
                            return Err(timeout());
                        }
                    }
                }
            },
            status = child.wait() => {
                let code = status.ok().and_then(|status| status.code());
                while let Ok(Ok(Some(line))) =
                    tokio::time::timeout(EXIT_OUTPUT_GRACE, lines.next_line()).await
                {
                    append_output(&output, &line);
                }
                let _ = tokio::time::timeout(EXIT_OUTPUT_GRACE, &mut stderr_task).await;
                return Err(exited(code, &output));
            }
            _ = &mut deadline => {
                tracing::warn!(
                    timeout_ms = launch.ready_timeout.as_millis(),
                    "opencode server did not report readiness; leaving it running"
                );
                tokio::spawn(forward_lines_from(lines));
                keep_running(child);
                return Err(timeout());
            }
        }
    }
}

fn exited(code: Option<i32>, output: &Mutex<String>) -> ServerStartError {
    let output = output.lock().unwrap_or_else(|e| e.into_inner()).clone();
    tracing::warn!(?code, "opencode server exited before becoming ready");
    ServerStartError::Exited { code, output }
}

fn append_output(output: &Mutex<String>, line: &str) {
    let mut output = output.lock().unwrap_or_else(|e| e.into_inner());
    if output.len() >= MAX_CAPTURED_OUTPUT {
        return;
    }
    output.push_str(line);
    output.push('\n');
}

/// Reaps the child in the background without killing it.
fn keep_running(mut child: Child) {
    tokio::spawn(async move {
        let status = child.wait().await;
        tracing::debug!(?status, "opencode server exited");
    });
}

async fn forward_stderr(stderr: ChildStderr, capture: Arc<Mutex<String>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        append_output(&capture, &line);
        tracing::debug!(target: "jagman::opencode::server", "{line}");
    }
}

async fn forward_lines_from(mut lines: tokio::io::Lines<BufReader<ChildStdout>>) {
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: "jagman::opencode::server", "{line}");
    }
}
