use crate::domain::{AgentRepoSummary, AgentSessionSummary, SessionStatus, path_key};
use regex::Regex;
use std::collections::{HashMap, HashSet};

/// One agent binary found in the OS process table.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AgentProcess {
    pub name: String,
    pub pid: u32,
    pub cwd: String,
    pub command_line: String,
}

/// Lowercased working directories where `agent_name` is running. Processes
/// whose command line matches `exclude` (our own managed server) are ignored.
pub fn workspaces_with_agent(
    processes: &[AgentProcess],
    agent_name: &str,
    exclude: Option<&Regex>,
) -> HashSet<String> {
    processes
        .iter()
        .filter(|process| process.name == agent_name)
        .filter(|process| !exclude.is_some_and(|pattern| pattern.is_match(&process.command_line)))
        .filter(|process| !process.cwd.is_empty())
        .map(|process| path_key(&process.cwd))
        .collect()
}

/// In every workspace with a live agent process, flags the newest inactive
/// session as external. At most one session per workspace changes.
pub fn mark_external_sessions(repos: &mut [AgentRepoSummary], active_workspaces: &HashSet<String>) {
    if active_workspaces.is_empty() {
        return;
    }

    let mut newest: HashMap<String, &mut AgentSessionSummary> = HashMap::new();
    for session in repos.iter_mut().flat_map(|repo| repo.sessions.iter_mut()) {
        if session.status != SessionStatus::Inactive {
            continue;
        }
        let key = path_key(&session.workspace);
        if !active_workspaces.contains(&key) {
            continue;
        }
        let is_newer = newest
            .get(&key)
            .is_none_or(|current| session.timestamp > current.timestamp);
        if is_newer {
            newest.insert(key, session);
        }
    }

    for session in newest.into_values() {
        session.status = SessionStatus::External;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process(name: &str, cwd: &str, command_line: &str) -> AgentProcess {
        AgentProcess {
            name: name.to_string(),
            pid: 1,
            cwd: cwd.to_string(),
            command_line: command_line.to_string(),
        }
    }

    fn session(id: &str, workspace: &str, status: SessionStatus, timestamp: i64) -> AgentSessionSummary {
        AgentSessionSummary {
            id: id.to_string(),
            workspace: workspace.to_string(),
            title: id.to_string(),
            status,
            mode: None,
            timestamp,
            last_entries: Vec::new(),
        }
    }

    #[test]
    fn collects_workspaces_for_named_agent_only() {
        let exclude = Regex::new(r"\bopencode(?:\.exe)?\s+(?:serve|x|run)\b").expect("regex");
        let processes = vec![
            process("opencode", "/Work/App", "opencode"),
            process("opencode", "/srv/managed", "opencode serve --port=0"),
            process("claude", "/work/other", "claude"),
            process("opencode", "", "opencode"),
        ];

        let workspaces = workspaces_with_agent(&processes, "opencode", Some(&exclude));
        assert_eq!(workspaces, HashSet::from(["/work/app".to_string()]));

        let all = workspaces_with_agent(&processes, "opencode", None);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn marks_only_newest_inactive_session_per_workspace() {
        let mut repos = vec![
            AgentRepoSummary {
                path: "/work/app".to_string(),
                branch: "main".to_string(),
                sessions: vec![
                    session("old", "/Work/App", SessionStatus::Inactive, 10),
                    session("new", "/work/app", SessionStatus::Inactive, 30),
                    session("busy", "/work/app", SessionStatus::Running, 50),
                ],
            },
            AgentRepoSummary {
                path: "/work/idle".to_string(),
                branch: "main".to_string(),
                sessions: vec![session("idle", "/work/idle", SessionStatus::Inactive, 99)],
            },
        ];
        let active = HashSet::from(["/work/app".to_string()]);

        mark_external_sessions(&mut repos, &active);

        let statuses: Vec<(&str, SessionStatus)> = repos
            .iter()
            .flat_map(|repo| repo.sessions.iter())
            .map(|session| (session.id.as_str(), session.status))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("old", SessionStatus::Inactive),
                ("new", SessionStatus::External),
                ("busy", SessionStatus::Running),
                ("idle", SessionStatus::Inactive),
            ]
        );
    }

    #[test]
    fn equal_timestamps_keep_the_first_session() {
        let mut repos = vec![AgentRepoSummary {
            path: "/r".to_string(),
            branch: String::new(),
            sessions: vec![
                session("a", "/r", SessionStatus::Inactive, 5),
                session("b", "/r", SessionStatus::Inactive, 5),
            ],
        }];

        mark_external_sessions(&mut repos, &HashSet::from(["/r".to_string()]));

        assert_eq!(repos[0].sessions[0].status, SessionStatus::External);
        assert_eq!(repos[0].sessions[1].status, SessionStatus::Inactive);
    }
}
