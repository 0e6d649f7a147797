use crate::error::Error;
use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Output of a finished external process.
#[derive(Debug)]
pub struct CapturedOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn status_text(&self) -> String {
        match self.status.code() {
            Some(code) => format!("exit code {}", code),
            None => "termination by signal".to_string(),
        }
    }

    /// Text used to explain a failure: stderr when present, else stdout.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Run `command` to completion, capturing both streams.
///
/// The child is polled rather than waited on so a `timeout` can kill it; the
/// pipes are drained on helper threads so a chatty child cannot stall on a
/// full pipe while we poll.
pub fn run_captured(command: &mut Command, timeout: Option<Duration>) -> Result<CapturedOutput, Error> {
    let program = command.get_program().to_string_lossy().into_owned();
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let start = Instant::now();
    let mut child = command.spawn().map_err(|source| Error::Spawn {
        program: program.clone(),
        source,
    })?;
    debug!("Started '{}' (pid {})", program, child.id());

    let stdout_reader = drain(child.stdout.take());
    let stderr_reader = drain(child.stderr.take());

    // On timeout the reader threads are left detached: grandchildren may still hold the pipes.
    let status = wait_for_exit(&mut child, timeout, start)?;

    Ok(CapturedOutput {
        status,
        stdout: join(stdout_reader),
        stderr: join(stderr_reader),
        duration: start.elapsed(),
    })
}

fn wait_for_exit(child: &mut Child, timeout: Option<Duration>, start: Instant) -> Result<ExitStatus, Error> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if let Some(limit) = timeout {
            if start.elapsed() >= limit {
                warn!("Killing pid {} after {}s", child.id(), limit.as_secs());
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::Timeout(limit));
            }
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn drain<R: Read + Send + 'static>(stream: Option<R>) -> Option<JoinHandle<String>> {
    stream.map(|mut s| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = s.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn join(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}
