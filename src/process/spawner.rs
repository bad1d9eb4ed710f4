use crate::config::CommandSpec;
use crate::error::{Result, StokerError};
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Handles returned by a successful spawn
#[derive(Debug)]
pub(crate) struct SpawnedChild {
    pub child: Child,
    pub pid: u32,
}

/// Spawn a child process from a command spec.
///
/// Applies every spawn option: environment overrides merged over the
/// inherited environment, working directory, shell wrapping, detached
/// process group. Stdin, stdout and stderr are always piped so the manager
/// can own the process's I/O.
pub(crate) fn spawn_child(spec: &CommandSpec) -> Result<SpawnedChild> {
    validate_spec(spec)?;

    let mut command = if spec.options.shell {
        let mut line = spec.command.clone();
        for arg in &spec.args {
            line.push(' ');
            line.push_str(arg);
        }
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(line);
        cmd
    } else {
        let mut cmd = Command::new(&spec.command);
        if !spec.args.is_empty() {
            cmd.args(&spec.args);
        }
        cmd
    };

    if let Some(ref cwd) = spec.options.cwd {
        command.current_dir(cwd);
    }

    for (key, value) in &spec.options.env {
        command.env(key, value);
    }

    #[cfg(unix)]
    if spec.options.detached {
        command.process_group(0);
    }

    command.stdin(Stdio::piped());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let child = command.spawn().map_err(|e| {
        StokerError::SpawnError(format!("Failed to spawn '{}': {}", spec.command, e))
    })?;

    let pid = child.id().ok_or_else(|| {
        StokerError::SpawnError(format!("Failed to get PID for '{}'", spec.command))
    })?;

    Ok(SpawnedChild { child, pid })
}

fn validate_spec(spec: &CommandSpec) -> Result<()> {
    if spec.command.is_empty() {
        return Err(StokerError::SpawnError("Command is empty".to_string()));
    }

    // Commands given as paths must exist; bare names resolve on PATH
    if !spec.options.shell && spec.command.contains('/') && !Path::new(&spec.command).exists() {
        return Err(StokerError::SpawnError(format!(
            "Command does not exist: {}",
            spec.command
        )));
    }

    if let Some(ref cwd) = spec.options.cwd {
        if !cwd.is_dir() {
            return Err(StokerError::SpawnError(format!(
                "Working directory does not exist: {}",
                cwd.display()
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpawnOptions;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_spawn_simple_process() {
        let spec = CommandSpec::new("/bin/echo").with_args(["hello"]);

        let spawned = spawn_child(&spec).unwrap();
        assert!(spawned.pid > 0);
    }

    #[tokio::test]
    async fn test_spawn_pipes_all_stdio() {
        let spec = CommandSpec::new("/bin/echo");

        let spawned = spawn_child(&spec).unwrap();
        assert!(spawned.child.stdin.is_some());
        assert!(spawned.child.stdout.is_some());
        assert!(spawned.child.stderr.is_some());
    }

    #[tokio::test]
    async fn test_spawn_with_working_directory() {
        let temp_dir = TempDir::new().unwrap();
        let spec = CommandSpec::new("/bin/pwd").with_options(SpawnOptions {
            cwd: Some(temp_dir.path().to_path_buf()),
            ..Default::default()
        });

        assert!(spawn_child(&spec).is_ok());
    }

    #[tokio::test]
    async fn test_spawn_with_env_override() {
        let mut options = SpawnOptions::default();
        options
            .env
            .insert("STOKER_TEST_VAR".to_string(), "value".to_string());
        let spec = CommandSpec::new("/bin/sh")
            .with_args(["-c", "test -n \"$STOKER_TEST_VAR\""])
            .with_options(options);

        let mut spawned = spawn_child(&spec).unwrap();
        let status = spawned.child.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_spawn_shell_mode() {
        let spec = CommandSpec::new("echo hello | tr a-z A-Z").with_options(SpawnOptions {
            shell: true,
            ..Default::default()
        });

        let mut spawned = spawn_child(&spec).unwrap();
        let status = spawned.child.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_spawn_nonexistent_path() {
        let spec = CommandSpec::new("/nonexistent/binary");

        match spawn_child(&spec) {
            Err(StokerError::SpawnError(msg)) => assert!(msg.contains("does not exist")),
            other => panic!("Expected SpawnError, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_spawn_invalid_working_directory() {
        let spec = CommandSpec::new("/bin/echo").with_options(SpawnOptions {
            cwd: Some("/nonexistent/directory".into()),
            ..Default::default()
        });

        assert!(matches!(spawn_child(&spec), Err(StokerError::SpawnError(_))));
    }
}
