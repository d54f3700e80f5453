use crate::app::{
    DEFAULT_MAX_SESSIONS_PER_REPO, Dashboard, DashboardConfig, SessionLookupError,
};
use crate::infra::{
    Registry, RegistryError, ResolveClaudeProjectsDirError, ResolveConfigDirError, resolve_db_path,
};
use serde::Serialize;
use std::io::{self, Write};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CliInvocation {
    PrintHelp,
    PrintVersion,
    Command(CliCommand),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CliCommand {
    Repos { max_sessions: usize },
    Session { id: String },
    Watch { max_sessions: usize, interval: Duration },
    Repo(RepoCommand),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RepoCommand {
    List,
    Add { path: String },
    Remove { id: i64 },
    Status,
    Migrate,
    Reset,
}

#[derive(Debug, Error)]
pub enum CliParseError {
    #[error("unknown subcommand: {0}")]
    UnknownSubcommand(String),

    #[error("unknown flag: {0}")]
    UnknownFlag(String),

    #[error("missing value for flag: {0}")]
    MissingFlagValue(String),

    #[error("invalid value for {flag}: {value}")]
    InvalidFlagValue { flag: String, value: String },

    #[error("missing argument: {0}")]
    MissingArgument(String),

    #[error("unexpected argument: {0}")]
    UnexpectedArgument(String),
}

pub fn parse_invocation(args: &[String]) -> Result<CliInvocation, CliParseError> {
    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        return Ok(CliInvocation::PrintHelp);
    }
    if args.iter().any(|arg| arg == "--version" || arg == "-V") {
        return Ok(CliInvocation::PrintVersion);
    }

    let mut iter = args.iter().skip(1);
    let Some(subcommand) = iter.next() else {
        return Ok(CliInvocation::Command(CliCommand::Repos {
            max_sessions: DEFAULT_MAX_SESSIONS_PER_REPO,
        }));
    };

    match subcommand.as_str() {
        "repos" => {
            let mut max_sessions = DEFAULT_MAX_SESSIONS_PER_REPO;
            while let Some(arg) = iter.next() {
                match arg.as_str() {
                    "--max-sessions" | "-n" => {
                        let value = iter.next().ok_or_else(|| {
                            CliParseError::MissingFlagValue("--max-sessions".to_string())
                        })?;
                        max_sessions = parse_usize_flag("--max-sessions", value)?;
                    }
                    _ => return Err(unexpected(arg)),
                }
            }
            Ok(CliInvocation::Command(CliCommand::Repos { max_sessions }))
        }
        "session" => {
            let mut id: Option<String> = None;
            for arg in iter {
                if arg.starts_with('-') || id.is_some() {
                    return Err(unexpected(arg));
                }
                id = Some(arg.to_string());
            }
            let id = id.ok_or_else(|| CliParseError::MissingArgument("session id".to_string()))?;
            Ok(CliInvocation::Command(CliCommand::Session { id }))
        }
        "watch" => {
            let mut max_sessions = DEFAULT_MAX_SESSIONS_PER_REPO;
            let mut interval = DEFAULT_WATCH_INTERVAL;
            while let Some(arg) = iter.next() {
                match arg.as_str() {
                    "--max-sessions" | "-n" => {
                        let value = iter.next().ok_or_else(|| {
                            CliParseError::MissingFlagValue("--max-sessions".to_string())
                        })?;
                        max_sessions = parse_usize_flag("--max-sessions", value)?;
                    }
                    "--interval" | "-i" => {
                        let value = iter.next().ok_or_else(|| {
                            CliParseError::MissingFlagValue("--interval".to_string())
                        })?;
                        interval = parse_interval_flag("--interval", value)?;
                    }
                    _ => return Err(unexpected(arg)),
                }
            }
            Ok(CliInvocation::Command(CliCommand::Watch {
                max_sessions,
                interval,
            }))
        }
        "repo" => {
            let action = iter
                .next()
                .ok_or_else(|| CliParseError::MissingArgument("repo action".to_string()))?;
            let command = match action.as_str() {
                "list" => RepoCommand::List,
                "status" => RepoCommand::Status,
                "migrate" => RepoCommand::Migrate,
                "reset" => RepoCommand::Reset,
                "add" => {
                    let path = iter
                        .next()
                        .ok_or_else(|| CliParseError::MissingArgument("repository path".to_string()))?;
                    RepoCommand::Add {
                        path: path.to_string(),
                    }
                }
                "remove" | "rm" => {
                    let value = iter
                        .next()
                        .ok_or_else(|| CliParseError::MissingArgument("repository id".to_string()))?;
                    let id = value
                        .parse::<i64>()
                        .map_err(|_| CliParseError::InvalidFlagValue {
                            flag: "id".to_string(),
                            value: value.to_string(),
                        })?;
                    RepoCommand::Remove { id }
                }
                other => return Err(CliParseError::UnknownSubcommand(format!("repo {other}"))),
            };
            if let Some(extra) = iter.next() {
                return Err(unexpected(extra));
            }
            Ok(CliInvocation::Command(CliCommand::Repo(command)))
        }
        other => Err(CliParseError::UnknownSubcommand(other.to_string())),
    }
}

fn unexpected(arg: &str) -> CliParseError {
    if arg.starts_with('-') {
        CliParseError::UnknownFlag(arg.to_string())
    } else {
        CliParseError::UnexpectedArgument(arg.to_string())
    }
}

fn parse_usize_flag(flag: &str, value: &str) -> Result<usize, CliParseError> {
    value
        .parse::<usize>()
        .map_err(|_| CliParseError::InvalidFlagValue {
            flag: flag.to_string(),
            value: value.to_string(),
        })
}

fn parse_interval_flag(flag: &str, value: &str) -> Result<Duration, CliParseError> {
    value
        .parse::<f64>()
        .ok()
        .filter(|seconds| *seconds > 0.0)
        .and_then(|seconds| Duration::try_from_secs_f64(seconds).ok())
        .ok_or_else(|| CliParseError::InvalidFlagValue {
            flag: flag.to_string(),
            value: value.to_string(),
        })
}

#[derive(Debug, Error)]
pub enum CliRunError {
    #[error(transparent)]
    ResolveConfigDir(#[from] ResolveConfigDirError),

    #[error(transparent)]
    ResolveClaudeProjectsDir(#[from] ResolveClaudeProjectsDirError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    SessionLookup(#[from] SessionLookupError),

    #[error("session not found: {0}\nHint: run `jagman repos` and copy a session id.")]
    SessionNotFound(String),

    #[error("failed to start async runtime: {0}")]
    Runtime(io::Error),

    #[error("failed to encode output: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    WriteOutput(#[from] io::Error),
}

pub fn run(command: CliCommand) -> Result<(), CliRunError> {
    match command {
        CliCommand::Repo(command) => run_repo_command(command),
        command => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(CliRunError::Runtime)?;
            runtime.block_on(run_dashboard_command(command))
        }
    }
}

fn open_registry() -> Result<Registry, CliRunError> {
    let db_path = resolve_db_path()?;
    tracing::debug!(path = %db_path.display(), "opening repository registry");
    Ok(Registry::open(&db_path)?)
}

fn registered_repo_paths() -> Result<Vec<String>, CliRunError> {
    let registry = open_registry()?;
    if !registry.status()?.migrated {
        tracing::warn!("repository registry is not migrated; run `jagman repo migrate`");
    }
    Ok(registry.repository_paths()?)
}

async fn run_dashboard_command(command: CliCommand) -> Result<(), CliRunError> {
    let mut config = DashboardConfig::resolve()?;
    if let CliCommand::Repos { max_sessions } | CliCommand::Watch { max_sessions, .. } = &command {
        config.max_sessions_per_repo = *max_sessions;
    }
    let dashboard = Dashboard::from_config(config);

    let signal = ShutdownSignal::register();
    let result = tokio::select! {
        result = execute(&dashboard, command) => result,
        reason = signal.recv() => {
            tracing::info!(signal = reason, "shutting down");
            Ok(())
        }
    };

    dashboard.shutdown().await;
    result
}

/// Resolves on Ctrl-C, or on SIGTERM where the platform has it.
struct ShutdownSignal {
    #[cfg(unix)]
    terminate: Option<tokio::signal::unix::Signal>,
}

impl ShutdownSignal {
    fn register() -> Self {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let terminate = signal(SignalKind::terminate())
                .map_err(|err| tracing::warn!(error = %err, "failed to listen for SIGTERM"))
                .ok();
            Self { terminate }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }

    async fn recv(self) -> &'static str {
        #[cfg(unix)]
        {
            if let Some(mut terminate) = self.terminate {
                return tokio::select! {
                    _ = tokio::signal::ctrl_c() => "interrupt",
                    _ = terminate.recv() => "terminate",
                };
            }
        }
        let _ = tokio::signal::ctrl_c().await;
        "interrupt"
    }
}

async fn execute(dashboard: &Dashboard, command: CliCommand) -> Result<(), CliRunError> {
    match command {
        CliCommand::Repos { .. } => {
            let repo_paths = registered_repo_paths()?;
            let repos = dashboard.load_repos(&repo_paths).await;
            write_json_pretty(&repos)
        }
        CliCommand::Session { id } => match dashboard.load_agent_detail(&id).await? {
            Some(detail) => write_json_pretty(&detail),
            None => Err(CliRunError::SessionNotFound(id)),
        },
        CliCommand::Watch { interval, .. } => loop {
            let repo_paths = registered_repo_paths()?;
            let repos = dashboard.load_repos(&repo_paths).await;
            write_json_line(&repos)?;
            tokio::time::sleep(interval).await;
        },
        CliCommand::Repo(_) => Ok(()),
    }
}

fn run_repo_command(command: RepoCommand) -> Result<(), CliRunError> {
    let registry = open_registry()?;
    let mut out = io::stdout().lock();
    match command {
        RepoCommand::List => {
            for repo in registry.list()? {
                writeln!(out, "{}\t{}", repo.id, repo.path)?;
            }
        }
        RepoCommand::Add { path } => {
            let repo = registry.add(&path)?;
            writeln!(out, "{}\t{}", repo.id, repo.path)?;
        }
        RepoCommand::Remove { id } => registry.remove(id)?,
        RepoCommand::Status => {
            let status = registry.status()?;
            if status.migrated {
                writeln!(out, "migrated")?;
            } else {
                writeln!(
                    out,
                    "not migrated (missing tables: {})",
                    status.missing_tables.join(", ")
                )?;
            }
        }
        RepoCommand::Migrate => registry.migrate()?,
        RepoCommand::Reset => registry.reset()?,
    }
    Ok(())
}

fn write_json_pretty<T: Serialize>(value: &T) -> Result<(), CliRunError> {
    let mut out = io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}

fn write_json_line<T: Serialize>(value: &T) -> Result<(), CliRunError> {
    let mut out = io::stdout().lock();
    serde_json::to_writer(&mut out, value)?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| (*v).to_string()).collect()
    }

    #[test]
    fn parse_defaults_to_repos() {
        let parsed = parse_invocation(&args(&["jagman"])).expect("parse");
        assert_eq!(
            parsed,
            CliInvocation::Command(CliCommand::Repos {
                max_sessions: DEFAULT_MAX_SESSIONS_PER_REPO
            })
        );
    }

    #[test]
    fn parse_help_and_version_win() {
        let parsed = parse_invocation(&args(&["jagman", "repo", "add", "--help"])).expect("parse");
        assert_eq!(parsed, CliInvocation::PrintHelp);
        let parsed = parse_invocation(&args(&["jagman", "-V"])).expect("parse");
        assert_eq!(parsed, CliInvocation::PrintVersion);
    }

    #[test]
    fn parse_repos_with_max_sessions() {
        let parsed =
            parse_invocation(&args(&["jagman", "repos", "--max-sessions", "3"])).expect("parse");
        assert_eq!(
            parsed,
            CliInvocation::Command(CliCommand::Repos { max_sessions: 3 })
        );

        let err = parse_invocation(&args(&["jagman", "repos", "--max-sessions", "x"]))
            .expect_err("invalid");
        assert!(matches!(err, CliParseError::InvalidFlagValue { .. }));
    }

    #[test]
    fn parse_session_requires_one_id() {
        let parsed = parse_invocation(&args(&["jagman", "session", "ses_1"])).expect("parse");
        assert_eq!(
            parsed,
            CliInvocation::Command(CliCommand::Session {
                id: "ses_1".to_string()
            })
        );

        assert!(matches!(
            parse_invocation(&args(&["jagman", "session"])),
            Err(CliParseError::MissingArgument(_))
        ));
        assert!(matches!(
            parse_invocation(&args(&["jagman", "session", "a", "b"])),
            Err(CliParseError::UnexpectedArgument(_))
        ));
    }

    #[test]
    fn parse_watch_interval() {
        let parsed =
            parse_invocation(&args(&["jagman", "watch", "--interval", "1.5"])).expect("parse");
        assert_eq!(
            parsed,
            CliInvocation::Command(CliCommand::Watch {
                max_sessions: DEFAULT_MAX_SESSIONS_PER_REPO,
                interval: Duration::from_millis(1500),
            })
        );

        assert!(matches!(
            parse_invocation(&args(&["jagman", "watch", "--interval", "0"])),
            Err(CliParseError::InvalidFlagValue { .. })
        ));
        assert!(matches!(
            parse_invocation(&args(&["jagman", "watch", "--interval"])),
            Err(CliParseError::MissingFlagValue(_))
        ));
    }

    #[test]
    fn parse_watch_rejects_out_of_range_interval() {
        for value in ["1e300", "inf", "NaN", "-2"] {
            let parsed = parse_invocation(&args(&["jagman", "watch", "--interval", value]));
            assert!(
                matches!(
                    &parsed,
                    Err(CliParseError::InvalidFlagValue { flag, value: got })
                        if flag == "--interval" && got == value
                ),
                "{value}: {parsed:?}"
            );
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sigterm_resolves_shutdown_signal() {
        let signal = ShutdownSignal::register();
        assert!(signal.terminate.is_some());

        let status = std::process::Command::new("sh")
            .args(["-c", &format!("kill -TERM {}", std::process::id())])
            .status()
            .expect("run kill");
        assert!(status.success());

        let reason = tokio::time::timeout(Duration::from_secs(5), signal.recv())
            .await
            .expect("signal delivered");
        assert_eq!(reason, "terminate");
    }

    #[test]
    fn parse_repo_actions() {
        assert_eq!(
            parse_invocation(&args(&["jagman", "repo", "add", "/work/app"])).expect("parse"),
            CliInvocation::Command(CliCommand::Repo(RepoCommand::Add {
                path: "/work/app".to_string()
            }))
        );
        assert_eq!(
            parse_invocation(&args(&["jagman", "repo", "remove", "7"])).expect("parse"),
            CliInvocation::Command(CliCommand::Repo(RepoCommand::Remove { id: 7 }))
        );
        assert_eq!(
            parse_invocation(&args(&["jagman", "repo", "migrate"])).expect("parse"),
            CliInvocation::Command(CliCommand::Repo(RepoCommand::Migrate))
        );
        assert!(matches!(
            parse_invocation(&args(&["jagman", "repo", "remove", "seven"])),
            Err(CliParseError::InvalidFlagValue { .. })
        ));
        assert!(matches!(
            parse_invocation(&args(&["jagman", "repo", "list", "extra"])),
            Err(CliParseError::UnexpectedArgument(_))
        ));
    }

    #[test]
    fn parse_rejects_unknown_input() {
        assert!(matches!(
            parse_invocation(&args(&["jagman", "projects"])),
            Err(CliParseError::UnknownSubcommand(_))
        ));
        assert!(matches!(
            parse_invocation(&args(&["jagman", "repos", "--full"])),
            Err(CliParseError::UnknownFlag(_))
        ));
    }
}
