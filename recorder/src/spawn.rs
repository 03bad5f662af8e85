//! Launching the profiled child process

use crate::config::SpawnConfig;
use crate::error::RecorderError;
use crate::source::Message;
use std::process::{Command, Stdio};
use tokio::sync::mpsc::UnboundedSender;
use tracefold_capture::Pid;
use tracing::{debug, info, warn};

/// Launch `spawn` and report its exit on `tx`. Returns the child's pid.
pub(crate) fn spawn_child(
    spawn: &SpawnConfig,
    tx: UnboundedSender<Message>,
) -> Result<Pid, RecorderError> {
    let program = spawn.argv.first().cloned().unwrap_or_default();
    let spawn_error = |source| RecorderError::Spawn {
        program: program.clone(),
        source,
    };

    let mut command = Command::new(&program);
    command.args(spawn.argv.iter().skip(1));
    if !spawn.inherit_environ {
        command.env_clear();
    }
    command.envs(spawn.env.iter().map(|(k, v)| (k, v)));
    if let Some(cwd) = &spawn.cwd {
        command.current_dir(cwd);
    }
    command.stdin(Stdio::null());

    let mut child = command.spawn().map_err(spawn_error)?;
    let pid = Pid::try_from(child.id()).map_err(|_| {
        spawn_error(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "child pid out of range",
        ))
    })?;
    info!("Spawned {} as pid {}", program, pid);

    std::thread::Builder::new()
        .name(format!("wait-{}", pid))
        .spawn(move || {
            let status = match child.wait() {
                Ok(status) => status.to_string(),
                Err(e) => {
                    warn!("Failed to wait for pid {}: {}", pid, e);
                    e.to_string()
                }
            };
            debug!("Child {} exited: {}", pid, status);
            let _ = tx.send(Message::ChildExited { pid, status });
        })
        .map_err(spawn_error)?;

    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_missing_program_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let spawn = SpawnConfig::new(["/nonexistent/tracefold-test-binary"]);
        assert!(matches!(
            spawn_child(&spawn, tx),
            Err(RecorderError::Spawn { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_is_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pid = spawn_child(&SpawnConfig::new(["true"]), tx).unwrap();
        match rx.recv().await {
            Some(Message::ChildExited { pid: exited, .. }) => assert_eq!(exited, pid),
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
