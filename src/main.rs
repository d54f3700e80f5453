mod app;
mod cli;
mod domain;
mod infra;

use crate::cli::CliInvocation;
use std::io::{self, Write};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
enum MainError {
    #[error(transparent)]
    Cli(#[from] crate::cli::CliRunError),
}

fn main() {
    init_tracing();
    if let Err(error) = run_main() {
        let mut err = io::stderr().lock();
        let _ = writeln!(err, "{error}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("jagman=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run_main() -> Result<(), MainError> {
    let args = std::env::args().collect::<Vec<_>>();
    let invocation = match crate::cli::parse_invocation(&args) {
        Ok(invocation) => invocation,
        Err(error) => {
            let mut err = io::stderr().lock();
            let _ = writeln!(err, "{error}");
            let _ = writeln!(err);
            drop(err);
            print_help();
            std::process::exit(2);
        }
    };

    match invocation {
        CliInvocation::PrintHelp => {
            print_help();
            Ok(())
        }
        CliInvocation::PrintVersion => {
            let mut out = io::stdout().lock();
            let _ = writeln!(out, "{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliInvocation::Command(command) => Ok(crate::cli::run(command)?),
    }
}

fn print_help() {
    let text = format!(
        "{name} - dashboard of coding-agent sessions (Claude Code + OpenCode)\n\nUSAGE:\n  {name} [repos] [--max-sessions N]     Print every registered repo with its sessions (JSON)\n  {name} session <id>                  Print one session transcript (JSON)\n  {name} watch [--interval S] [--max-sessions N]  Re-poll until Ctrl-C, one JSON line per poll\n  {name} repo list                     List registered repositories (id<TAB>path)\n  {name} repo add <path>               Register an absolute repository path\n  {name} repo remove <id>              Unregister a repository\n  {name} repo status | migrate | reset Inspect, create or drop the registry schema\n  {name} --help | --version\n\nFLAGS:\n  --max-sessions N  Sessions per repo and backend (default: 10)\n  --interval S      Seconds between polls for watch (default: 5)\n\nENV:\n  JAGMAN_CONFIG_DIR     Override config dir holding the registry (default: OS config dir/jagman)\n  CLAUDE_PROJECTS_DIR   Override Claude projects dir (default: ~/.claude/projects)\n  JAGMAN_OPENCODE_BIN   opencode executable to spawn (default: opencode)\n  RUST_LOG              Log filter for stderr (default: jagman=info)\n",
        name = env!("CARGO_PKG_NAME")
    );
    let mut out = io::stdout().lock();
    let _ = write!(out, "{text}");
}
