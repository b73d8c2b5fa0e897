use std::process::Stdio;

use tokio::process::{Child, Command};

/// A runOn* command kept alive for the duration of the matching
/// lifecycle span. Dropping the hook kills the process.
pub(crate) struct Hook {
    label: &'static str,
    path_name: String,
    _child: Child,
}

impl Hook {
    /// Spawn failure is logged and swallowed: a broken hook never takes
    /// the path down.
    pub(crate) fn spawn(label: &'static str, command: &str, path_name: &str) -> Option<Self> {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(command)
            .env("XRELAY_PATH", path_name)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        match cmd.spawn() {
            Ok(child) => {
                log::debug!("[path {}] {} command started", path_name, label);
                Some(Self {
                    label,
                    path_name: path_name.to_string(),
                    _child: child,
                })
            }
            Err(err) => {
                log::warn!(
                    "[path {}] unable to start {} command: {}",
                    path_name,
                    label,
                    err
                );
                None
            }
        }
    }
}

impl Drop for Hook {
    fn drop(&mut self) {
        log::debug!("[path {}] {} command stopped", self.path_name, self.label);
    }
}
