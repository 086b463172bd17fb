//! Subprocess plumbing shared by the command-line collaborators.

use std::ffi::OsStr;
use std::process::{Output, Stdio};

use tokio::process::Command;

use super::CollaboratorError;

/// Run a tool to completion and return its output.
///
/// The child is killed if the future is dropped, so an outer timeout
/// does not leave stray processes. A missing binary is permanent; a
/// non-zero exit is reported with the tail of stderr.
pub(crate) async fn run_tool<I, S>(binary: &str, args: I) -> Result<Output, CollaboratorError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| CollaboratorError::permanent(format!("failed to spawn {binary}: {e}")))?;

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| CollaboratorError::transient(format!("failed to wait for {binary}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);
        return Err(CollaboratorError::transient(format!(
            "{binary} failed with exit code {exit_code}: {}",
            tail(stderr.trim(), 400)
        )));
    }

    Ok(output)
}

/// Last `max` characters of a message
fn tail(s: &str, max: usize) -> &str {
    let count = s.chars().count();
    if count <= max {
        return s;
    }
    let skip = count - max;
    let start = s.char_indices().nth(skip).map(|(i, _)| i).unwrap_or(0);
    &s[start..]
}
