use std::{
    io::{BufRead, BufReader, Read},
    path::Path,
    process::{Command, Stdio},
    sync::mpsc::{self, RecvTimeoutError},
    thread,
    time::Duration,
};

use tracing::{debug, instrument, trace, warn};

use crate::{
    diagnostics::ENGINE_TARGET,
    render::{CancelToken, RenderError},
};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Exit status and merged stdout/stderr of one engine run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessRun {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub lines: Vec<String>,
}

impl ProcessRun {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

fn forward_lines(
    stream: impl Read + Send + 'static,
    sender: mpsc::Sender<String>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for line in BufReader::new(stream).lines() {
            let Ok(line) = line else {
                break;
            };
            if sender.send(line).is_err() {
                break;
            }
        }
    })
}

fn log_line(line: &str) {
    if let Some(progress) = line.strip_prefix("nextOSCPacket") {
        debug!(target: ENGINE_TARGET, seconds = progress.trim(), "engine progress");
    } else if line.contains("FAILURE") {
        warn!(target: ENGINE_TARGET, line, "engine reported failure");
    } else {
        trace!(target: ENGINE_TARGET, line, "engine output");
    }
}

/// Runs the engine in `cwd`, streaming its output until it exits or
/// `cancel` fires. Cancelling kills the child.
#[instrument(skip(args, cancel), fields(program = %program.display(), cwd = %cwd.display()))]
pub fn run_engine(
    program: &Path,
    args: &[String],
    cwd: &Path,
    cancel: &CancelToken,
) -> Result<ProcessRun, RenderError> {
    let mut child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| RenderError::Spawn {
            path: program.to_path_buf(),
            source,
        })?;

    let (sender, receiver) = mpsc::channel();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(forward_lines(stdout, sender.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(forward_lines(stderr, sender.clone()));
    }
    drop(sender);

    let mut lines = Vec::new();
    let status = loop {
        match receiver.recv_timeout(POLL_INTERVAL) {
            Ok(line) => {
                log_line(&line);
                lines.push(line);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => thread::sleep(POLL_INTERVAL),
        }
        if cancel.is_cancelled() {
            warn!("render cancelled, killing engine");
            child.kill()?;
            child.wait()?;
            return Err(RenderError::Cancelled);
        }
        if let Some(status) = child.try_wait()? {
            break status;
        }
    };

    for reader in readers {
        if reader.join().is_err() {
            warn!("engine output reader panicked");
        }
    }
    for line in receiver.try_iter() {
        log_line(&line);
        lines.push(line);
    }

    Ok(ProcessRun {
        exit_code: status.code(),
        signal: exit_signal(status),
        lines,
    })
}

#[cfg(unix)]
fn exit_signal(status: std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_: std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn output_from_both_streams_is_captured() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let run = run_engine(
            &PathBuf::from("/bin/sh"),
            &[
                "-c".to_string(),
                "echo 'nextOSCPacket 0.5'; echo 'FAILURE oops' 1>&2; exit 3".to_string(),
            ],
            dir.path(),
            &CancelToken::new(),
        )
        .expect("shell should run");
        assert_eq!(run.exit_code, Some(3));
        assert!(!run.success());
        assert!(run.lines.contains(&"nextOSCPacket 0.5".to_string()));
        assert!(run.lines.contains(&"FAILURE oops".to_string()));
    }

    #[test]
    fn cancelled_runs_are_killed() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = run_engine(
            &PathBuf::from("/bin/sh"),
            &["-c".to_string(), "sleep 5".to_string()],
            dir.path(),
            &cancel,
        );
        assert!(matches!(result, Err(RenderError::Cancelled)));
    }

    #[test]
    fn missing_programs_fail_to_spawn() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let result = run_engine(
            &PathBuf::from("/definitely/not/an/engine"),
            &[],
            dir.path(),
            &CancelToken::new(),
        );
        assert!(matches!(result, Err(RenderError::Spawn { .. })));
    }
}
