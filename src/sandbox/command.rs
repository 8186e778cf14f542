//! Install-then-run command lines.

use crate::deps::Package;

/// Exit code reported when the deadline elapses.
///
/// This is what coreutils `timeout` returns after terminating its child,
/// and what the host-side watchdog reports when it has to kill the
/// container itself.
pub const TIMEOUT_EXIT_CODE: i64 = 124;

/// `pip install` step pinning every package to its snapshotted version, or
/// `None` when there is nothing to install.
pub fn install_command(packages: &[Package]) -> Option<String> {
    if packages.is_empty() {
        return None;
    }
    let requirements: Vec<String> = packages
        .iter()
        .map(|p| shell_quote(&p.requirement()))
        .collect();
    Some(format!(
        "pip install --quiet --disable-pip-version-check --root-user-action=ignore {}",
        requirements.join(" ")
    ))
}

/// The shell line run inside the container: the install step (if any)
/// joined to the caller's command with `&&`.
pub fn command_line(packages: &[Package], command: &str) -> String {
    match install_command(packages) {
        Some(install) => format!("{} && {}", install, command),
        None => command.to_string(),
    }
}

/// Container argv wrapping `line` in a hard deadline.
///
/// `timeout` sends SIGTERM at the deadline and SIGKILL `grace_secs` later.
pub fn container_cmd(line: &str, timeout_secs: u64, grace_secs: u64) -> Vec<String> {
    vec![
        "timeout".to_string(),
        "-k".to_string(),
        format!("{}s", grace_secs),
        format!("{}s", timeout_secs),
        "bash".to_string(),
        "-c".to_string(),
        line.to_string(),
    ]
}

/// Quote `s` for a POSIX shell unless it is made only of safe characters.
pub fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_.=+,:/@%".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}
