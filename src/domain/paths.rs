use std::path::Path;

/// Key used to compare repository paths; paths are matched case-insensitively.
pub fn path_key(path: &str) -> String {
    path.to_lowercase()
}

/// Renders `path` relative to `home` as `~/...` when it lives underneath it.
pub fn display_path(path: &str, home: Option<&Path>) -> String {
    let Some(home) = home.and_then(|home| home.to_str()) else {
        return path.to_string();
    };
    let home = home.trim_end_matches(['/', '\\']);
    if home.is_empty() {
        return path.to_string();
    }
    let Some(prefix) = path.get(..home.len()) else {
        return path.to_string();
    };
    if !prefix.eq_ignore_ascii_case(home) {
        return path.to_string();
    }
    let rest = &path[home.len()..];
    if rest.is_empty() {
        "~".to_string()
    } else if rest.starts_with('/') || rest.starts_with('\\') {
        format!("~{rest}")
    } else {
        path.to_string()
    }
}

/// Directory name Claude Code uses under its projects root for a working
/// directory: every non-alphanumeric character becomes `-`.
pub fn claude_project_dir_name(cwd: &str) -> String {
    cwd.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '-' })
        .collect()
}
