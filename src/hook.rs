use std::path::Path;
use std::process::Command;

/// Invokes the device-reset hook as a child process with no arguments and
/// waits synchronously for it to exit. Exit status is logged but never
/// gates recovery — a misbehaving hook does not stop the reopen attempt.
///
/// Runs inside the thread that drove the reset, which is acceptable only
/// because resets are a rare path; revisit with a non-blocking spawn if a
/// slow hook is ever observed to stall recovery.
pub fn run_reset_hook(path: &Path) {
    match Command::new(path).status() {
        Ok(status) => {
            tracing::info!(hook = %path.display(), ?status, "reset hook exited");
        }
        Err(err) => {
            tracing::warn!(hook = %path.display(), %err, "failed to spawn reset hook");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn missing_hook_does_not_panic() {
        run_reset_hook(&PathBuf::from("/nonexistent/hook-binary-koruza"));
    }

    #[test]
    fn real_hook_runs_to_completion() {
        run_reset_hook(&PathBuf::from("/bin/true"));
    }
}
