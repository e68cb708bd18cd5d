use crate::error::{Result, ZfsError};
use tracing::debug;

/// Run the `zfs` binary with the given arguments and return its stdout
///
/// Non-zero exits are classified into `ZfsErrorKind` from stderr.
pub(crate) async fn zfs(args: &[&str]) -> Result<String> {
    debug!("Running: zfs {}", args.join(" "));

    let output = tokio::process::Command::new("zfs")
        .args(args)
        .output()
        .await
        .map_err(|e| ZfsError::io(format!("zfs {}: {}", args.join(" "), e)))?;

    if !output.status.success() {
        return Err(ZfsError::from_stderr(&String::from_utf8_lossy(
            &output.stderr,
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
