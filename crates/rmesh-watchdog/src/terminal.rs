// SPDX-License-Identifier: MIT OR Apache-2.0
//! Optional detached terminal windows tailing service logs.

use std::path::Path;
use tokio::process::{Child, Command};
use tracing::debug;

/// Known terminal emulators, tried in order. `{title}` and `{cmd}` are
/// substituted before spawning.
const TEMPLATES: &[&[&str]] = &[
    &["x-terminal-emulator", "-T", "{title}", "-e", "bash", "-lc", "{cmd}"],
    &["gnome-terminal", "--title", "{title}", "--", "bash", "-lc", "{cmd}"],
    &["konsole", "-T", "{title}", "-e", "bash", "-lc", "{cmd}"],
    &["xterm", "-T", "{title}", "-e", "bash", "-lc", "{cmd}"],
    &["alacritty", "-t", "{title}", "-e", "bash", "-lc", "{cmd}"],
];

/// The first available terminal template, if any.
pub(crate) fn detect_template() -> Option<Vec<String>> {
    TEMPLATES
        .iter()
        .find(|tpl| crate::ports::binary_on_path(tpl[0]))
        .map(|tpl| tpl.iter().map(|s| s.to_string()).collect())
}

/// Spawn a detached terminal tailing `log_path`.
pub(crate) fn spawn_tailer(
    template: &[String],
    service: &str,
    log_path: &Path,
    cwd: &Path,
) -> Option<Child> {
    let title = format!("{service} logs");
    let cmd = format!("tail -n 200 -f '{}'", log_path.display());
    let args: Vec<String> = template
        .iter()
        .map(|seg| seg.replace("{title}", &title).replace("{cmd}", &cmd))
        .collect();
    let (program, rest) = args.split_first()?;
    match Command::new(program).args(rest).current_dir(cwd).spawn() {
        Ok(child) => Some(child),
        Err(err) => {
            debug!(target: "rmesh_watchdog", %err, "terminal launch failed");
            None
        }
    }
}
