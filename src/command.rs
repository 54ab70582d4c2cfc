//! Running external commands with a deadline

use crate::error::ControlError;
use log::{debug, warn};
use std::io::{self, Read};
use std::process::{Command, Output, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Render a command line for logs and error messages
pub fn describe(command: &Command) -> String {
    let mut text = command.get_program().to_string_lossy().into_owned();
    for arg in command.get_args() {
        text.push(' ');
        text.push_str(&arg.to_string_lossy());
    }
    text
}

/// Read a child's pipe to the end on its own thread so the child never blocks on a full pipe
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<io::Result<Vec<u8>>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_end(&mut buffer)?;
        }
        Ok(buffer)
    })
}

fn collect(reader: JoinHandle<io::Result<Vec<u8>>>) -> io::Result<Vec<u8>> {
    reader
        .join()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "output reader panicked"))?
}

/// Run `command` to completion, killing it once `timeout` has elapsed
///
/// Returns the captured output whatever the exit status; callers decide what a non-zero
/// status means. Output is read while the command runs, so its size is not limited by the
/// pipe buffer.
pub fn run_with_timeout(command: &mut Command, timeout: Duration) -> Result<Output, ControlError> {
    let description = describe(command);
    debug!("Running: {}", description);

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ControlError::Spawn {
            command: description.clone(),
            source,
        })?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Output {
                status,
                stdout: collect(stdout)?,
                stderr: collect(stderr)?,
            });
        }
        if started.elapsed() >= timeout {
            warn!("{} exceeded {:?}, killing it", description, timeout);
            let _ = child.kill();
            let _ = child.wait();
            return Err(ControlError::Timeout {
                command: description,
                timeout,
            });
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Run `command` and treat any non-zero exit as a failure
pub fn run_checked(command: &mut Command, timeout: Duration) -> Result<Output, ControlError> {
    let description = describe(command);
    let output = run_with_timeout(command, timeout)?;
    if output.status.success() {
        Ok(output)
    } else {
        Err(ControlError::CommandFailed {
            command: description,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}
