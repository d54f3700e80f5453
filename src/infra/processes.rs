use crate::domain::AgentProcess;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Executable names of the agents we look for in the process table.
pub const AGENT_NAMES: [&str; 3] = ["claude", "opencode", "copilot"];

pub const DEFAULT_PROCESS_TABLE_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ListProcessesError {
    #[error("failed to read process table: {0}")]
    Io(#[from] std::io::Error),

    #[error("process listing command `{command}` failed: {message}")]
    Command { command: String, message: String },
}

struct CachedTable {
    fetched_at: Instant,
    processes: Arc<Vec<AgentProcess>>,
}

/// Short-lived cache over the OS process table, shared by every backend
/// that needs to spot agents running outside our control.
pub struct ProcessTable {
    ttl: Duration,
    cached: Mutex<Option<CachedTable>>,
}

impl ProcessTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cached: Mutex::new(None),
        }
    }

    /// Agent processes, refreshed at most once per TTL. A failed refresh is
    /// logged and reported as an empty table.
    pub async fn agent_processes(&self) -> Arc<Vec<AgentProcess>> {
        if let Some(processes) = self.fresh() {
            return processes;
        }

        let listed = tokio::task::spawn_blocking(list_agent_processes).await;
        let processes = match listed {
            Ok(Ok(processes)) => processes,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "process table refresh failed");
                Vec::new()
            }
            Err(err) => {
                tracing::warn!(error = %err, "process table task failed");
                Vec::new()
            }
        };
        tracing::debug!(count = processes.len(), "refreshed agent process table");

        let processes = Arc::new(processes);
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        *cached = Some(CachedTable {
            fetched_at: Instant::now(),
            processes: Arc::clone(&processes),
        });
        processes
    }

    pub fn clear(&self) {
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        *cached = None;
    }

    fn fresh(&self) -> Option<Arc<Vec<AgentProcess>>> {
        let cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        let table = cached.as_ref()?;
        (table.fetched_at.elapsed() < self.ttl).then(|| Arc::clone(&table.processes))
    }

    #[cfg(test)]
    fn seed(&self, processes: Vec<AgentProcess>) {
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        *cached = Some(CachedTable {
            fetched_at: Instant::now(),
            processes: Arc::new(processes),
        });
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new(DEFAULT_PROCESS_TABLE_TTL)
    }
}

fn is_agent_name(name: &str) -> bool {
    AGENT_NAMES.contains(&name)
}

#[cfg(target_os = "linux")]
pub fn list_agent_processes() -> Result<Vec<AgentProcess>, ListProcessesError> {
    use std::fs;

    let mut processes = Vec::new();
    for entry in fs::read_dir("/proc")? {
        let Ok(entry) = entry else {
            continue;
        };
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let dir = entry.path();

        // Processes can vanish between listing and reading.
        let Ok(comm) = fs::read_to_string(dir.join("comm")) else {
            continue;
        };
        let name = comm.trim();
        if !is_agent_name(name) {
            continue;
        }
        let Ok(cwd) = fs::read_link(dir.join("cwd")) else {
            continue;
        };
        let command_line = fs::read(dir.join("cmdline"))
            .map(|bytes| String::from_utf8_lossy(&bytes).replace('\0', " ").trim().to_string())
            .unwrap_or_default();

        processes.push(AgentProcess {
            name: name.to_string(),
            pid,
            cwd: cwd.to_string_lossy().into_owned(),
            command_line,
        });
    }
    Ok(processes)
}

#[cfg(target_os = "macos")]
pub fn list_agent_processes() -> Result<Vec<AgentProcess>, ListProcessesError> {
    let ps = run_command("ps", &["-axo", "pid=,comm=,args="])?;
    let candidates = parse_ps_output(&ps);
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let pids = candidates
        .iter()
        .map(|(pid, _, _)| pid.to_string())
        .collect::<Vec<_>>()
        .join(",");
    // lsof exits non-zero when any pid has gone away; take what it printed.
    let lsof = std::process::Command::new("lsof")
        .args(["-d", "cwd", "-Fn", "-p", &pids])
        .output()
        .map(|output| String::from_utf8_lossy(&output.stdout).into_owned())
        .unwrap_or_default();
    let cwds = parse_lsof_cwds(&lsof);

    Ok(candidates
        .into_iter()
        .filter_map(|(pid, name, command_line)| {
            let cwd = cwds.get(&pid)?.clone();
            Some(AgentProcess {
                name,
                pid,
                cwd,
                command_line,
            })
        })
        .collect())
}

#[cfg(target_os = "macos")]
fn run_command(program: &str, args: &[&str]) -> Result<String, ListProcessesError> {
    let output = std::process::Command::new(program).args(args).output()?;
    if !output.status.success() {
        return Err(ListProcessesError::Command {
            command: program.to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// The default refresh leaves cwd and cmd unloaded.
#[cfg(windows)]
fn agent_refresh_kind() -> sysinfo::ProcessRefreshKind {
    use sysinfo::{ProcessRefreshKind, UpdateKind};

    ProcessRefreshKind::nothing()
        .with_cwd(UpdateKind::Always)
        .with_cmd(UpdateKind::Always)
}

#[cfg(windows)]
pub fn list_agent_processes() -> Result<Vec<AgentProcess>, ListProcessesError> {
    use sysinfo::{ProcessesToUpdate, System};

    let mut sys = System::new();
    sys.refresh_processes_specifics(ProcessesToUpdate::All, true, agent_refresh_kind());

    let mut processes = Vec::new();
    for (pid, process) in sys.processes() {
        let name = process.name().to_string_lossy().to_lowercase();
        let name = name.strip_suffix(".exe").unwrap_or(&name);
        if !is_agent_name(name) {
            continue;
        }
        let Some(cwd) = process.cwd() else {
            continue;
        };
        let command_line = process
            .cmd()
            .iter()
            .map(|part| part.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        processes.push(AgentProcess {
            name: name.to_string(),
            pid: pid.as_u32(),
            cwd: cwd.to_string_lossy().into_owned(),
            command_line,
        });
    }
    Ok(processes)
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
pub fn list_agent_processes() -> Result<Vec<AgentProcess>, ListProcessesError> {
    Ok(Vec::new())
}

/// `(pid, name, command line)` for agent rows of `ps -axo pid=,comm=,args=`.
#[cfg_attr(not(any(target_os = "macos", test)), allow(dead_code))]
fn parse_ps_output(output: &str) -> Vec<(u32, String, String)> {
    output
        .lines()
        .filter_map(|line| {
            let (pid, rest) = line.trim().split_once(char::is_whitespace)?;
            let pid = pid.parse::<u32>().ok()?;
            let rest = rest.trim_start();
            let (comm, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            let args = args.trim().to_string();
            let name = comm.rsplit('/').next().unwrap_or(comm).to_lowercase();
            is_agent_name(&name).then_some((pid, name, args))
        })
        .collect()
}

/// Maps pid to cwd from `lsof -Fn` output (`p<pid>` then `n<path>` lines).
#[cfg_attr(not(any(target_os = "macos", test)), allow(dead_code))]
fn parse_lsof_cwds(output: &str) -> std::collections::HashMap<u32, String> {
    let mut cwds = std::collections::HashMap::new();
    let mut current: Option<u32> = None;
    for line in output.lines() {
        if let Some(pid) = line.strip_prefix('p') {
            current = pid.trim().parse().ok();
        } else if let (Some(path), Some(pid)) = (line.strip_prefix('n'), current) {
            cwds.insert(pid, path.to_string());
        }
    }
    cwds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ps_rows_for_agents_only() {
        let output = "  101 /usr/local/bin/opencode opencode serve --port=0\n\
                      202 /bin/zsh -zsh\n\
                      303 claude claude --resume\n\
                      garbage line\n";
        assert_eq!(
            parse_ps_output(output),
            vec![
                (
                    101,
                    "opencode".to_string(),
                    "opencode serve --port=0".to_string()
                ),
                (303, "claude".to_string(), "claude --resume".to_string()),
            ]
        );
    }

    #[test]
    fn parses_lsof_cwd_fields() {
        let output = "p101\nfcwd\nn/Users/me/app\np303\nfcwd\nn/Users/me/other\n";
        let cwds = parse_lsof_cwds(output);
        assert_eq!(cwds.get(&101).map(String::as_str), Some("/Users/me/app"));
        assert_eq!(cwds.get(&303).map(String::as_str), Some("/Users/me/other"));
    }

    #[tokio::test]
    async fn serves_cached_table_within_ttl() {
        let table = ProcessTable::new(Duration::from_secs(60));
        table.seed(vec![AgentProcess {
            name: "claude".to_string(),
            pid: 7,
            cwd: "/w".to_string(),
            command_line: "claude".to_string(),
        }]);

        let processes = table.agent_processes().await;
        assert_eq!(processes.len(), 1);
        assert_eq!(processes[0].pid, 7);

        table.clear();
        assert!(table.fresh().is_none());
    }

    #[cfg(windows)]
    #[test]
    fn windows_refresh_loads_cwd_and_cmd() {
        use sysinfo::UpdateKind;

        let kind = agent_refresh_kind();
        assert_eq!(kind.cwd(), UpdateKind::Always);
        assert_eq!(kind.cmd(), UpdateKind::Always);
    }

    #[test]
    fn listing_does_not_fail_on_this_platform() {
        assert!(list_agent_processes().is_ok());
    }
}
