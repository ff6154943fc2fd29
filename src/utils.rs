//! Process spawning helpers.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};

/// Spawn a command and stream its output via a per-line callback.
///
/// The callback receives each line and whether it came from stderr.
/// Returns the child process handle (caller must manage lifecycle).
pub fn spawn_streaming<F>(
    mut cmd: tokio::process::Command,
    log_line: F,
) -> anyhow::Result<tokio::process::Child>
where
    F: Fn(&str, bool) + Send + Sync + Clone + 'static,
{
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn()?;

    if let Some(stdout) = child.stdout.take() {
        let reader = BufReader::new(stdout);
        let mut lines = reader.lines();
        let log = log_line.clone();
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                log(&line, false);
            }
        });
    }

    if let Some(stderr) = child.stderr.take() {
        let reader = BufReader::new(stderr);
        let mut lines = reader.lines();
        let log = log_line;
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                log(&line, true);
            }
        });
    }

    Ok(child)
}
