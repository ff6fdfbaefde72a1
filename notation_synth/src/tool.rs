// Running external command-line tools with captured diagnostics.
//
// Both external collaborators (the MuseScore-style normalizer and the
// handwritten renderer) are driven the same way: spawn, block until exit,
// keep stderr verbatim for the error message. stdout is discarded. An optional
// timeout kills a hung tool; the run then reports failure like any other
// non-zero exit. A process the tool left behind can keep stderr open after
// the kill, so with a timeout set the diagnostics are only awaited for a short
// grace period and whatever has not arrived by then is given up.

use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// How an external tool invocation ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolStatus {
    pub success: bool,
    /// Human-readable exit status ("exit status: 1", "timed out after 5s").
    pub status: String,
    /// Everything the tool wrote to stderr.
    pub diagnostics: String,
}

impl ToolStatus {
    pub fn succeeded() -> Self {
        Self {
            success: true,
            status: "exit status: 0".to_string(),
            diagnostics: String::new(),
        }
    }
}

/// Poll interval while waiting on a tool with a timeout.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How long to wait for stderr to close once a timed tool has exited.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Spawn `command`, wait for it, and collect its stderr.
///
/// Only failure to spawn (or to wait) is an `Err`; a tool that runs and
/// fails is reported through `ToolStatus::success`.
pub fn run_captured(mut command: Command, timeout: Option<Duration>) -> io::Result<ToolStatus> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;

    // Drain stderr on the side so a chatty tool cannot fill the pipe and
    // stall while we wait on it.
    let stderr = child.stderr.take();
    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        let mut bytes = Vec::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_end(&mut bytes);
        }
        let _ = sender.send(String::from_utf8_lossy(&bytes).into_owned());
    });

    let exit = wait_with_timeout(&mut child, timeout)?;
    // Without a timeout the caller accepts an unbounded wait.
    let diagnostics = match timeout {
        Some(_) => receiver.recv_timeout(DRAIN_GRACE).unwrap_or_default(),
        None => receiver.recv().unwrap_or_default(),
    };

    Ok(match exit {
        Some(status) => ToolStatus {
            success: status.success(),
            status: status.to_string(),
            diagnostics,
        },
        None => ToolStatus {
            success: false,
            status: format!("timed out after {:?}", timeout.unwrap_or_default()),
            diagnostics,
        },
    })
}

/// Wait for the child; `None` means it was killed after `timeout`.
fn wait_with_timeout(child: &mut Child, timeout: Option<Duration>) -> io::Result<Option<ExitStatus>> {
    let Some(timeout) = timeout else {
        return child.wait().map(Some);
    };
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            child.kill()?;
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    #[test]
    fn reports_success() {
        let status = run_captured(sh("exit 0"), None).unwrap();
        assert!(status.success);
        assert!(status.diagnostics.is_empty());
    }

    #[test]
    fn keeps_stderr_verbatim_on_failure() {
        let status = run_captured(sh("echo 'bad  input' >&2; exit 3"), None).unwrap();
        assert!(!status.success);
        assert_eq!(status.diagnostics, "bad  input\n");
        assert!(status.status.contains('3'), "{}", status.status);
    }

    #[test]
    fn kills_hung_tool() {
        let status = run_captured(sh("sleep 5"), Some(Duration::from_millis(100))).unwrap();
        assert!(!status.success);
        assert!(status.status.starts_with("timed out"), "{}", status.status);
    }

    #[test]
    fn orphaned_grandchild_does_not_hold_up_a_timeout() {
        // The sleep outlives the killed shell and keeps stderr open.
        let started = Instant::now();
        let status = run_captured(sh("sleep 5; true"), Some(Duration::from_millis(100))).unwrap();
        assert!(!status.success);
        assert!(status.status.starts_with("timed out"), "{}", status.status);
        assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());
    }

    #[test]
    fn stderr_is_kept_when_a_timed_tool_finishes() {
        let status = run_captured(sh("echo oops >&2; exit 1"), Some(Duration::from_secs(5))).unwrap();
        assert!(!status.success);
        assert_eq!(status.diagnostics, "oops\n");
    }

    #[test]
    fn missing_program_is_an_io_error() {
        let command = Command::new("/nonexistent/tool-binary");
        assert!(run_captured(command, None).is_err());
    }
}
