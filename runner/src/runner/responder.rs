use crate::hooks::{HookError, Responder};
use std::{
    ffi::OsString,
    io::{ErrorKind, Read, Write},
    process::{Command, Stdio},
    thread,
    time::Duration,
};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// Answer server requests by piping each one through an external command
#[derive(Debug, Clone)]
pub struct CommandResponder {
    exec: OsString,
    params: Vec<OsString>,
    timeout: Duration,
}

impl CommandResponder {
    /// `None` if the command is empty
    pub fn new(command: &[String], timeout: Duration) -> Option<Self> {
        let (exec, params) = command.split_first()?;

        Some(Self {
            exec: OsString::from(exec),
            params: params.iter().map(OsString::from).collect(),
            timeout,
        })
    }
}

impl Responder for CommandResponder {
    #[tracing::instrument(level = "trace", skip(self))]
    fn respond(&self, sim: usize, request: &str) -> Result<String, HookError> {
        let name = self.exec.to_string_lossy().into_owned();
        let mut handle = Command::new(&self.exec)
            .args(&self.params)
            .env("SIMCAMP_SIM", sim.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|error| HookError::Spawn(name.clone(), error))?;

        let io_error = |source: std::io::Error| HookError::Io {
            path: name.clone().into(),
            source,
        };

        if let Some(mut stdin) = handle.stdin.take() {
            match stdin.write_all(request.as_bytes()) {
                // a responder may answer without reading its input
                Err(error) if error.kind() != ErrorKind::BrokenPipe => return Err(io_error(error)),
                _ => {}
            }
            // Dropping stdin here will close the underlying file descriptor
            // this gives the responder a clear end of input
            drop(stdin);
        }

        debug!("Responder waiting on {}", handle.id());
        let stdout = handle.stdout.take();
        let stderr = handle.stderr.take();

        // drain both pipes while waiting, a full pipe would block the responder
        let (status, output, errors) = thread::scope(|scope| {
            let output = scope.spawn(move || read_pipe(stdout));
            let errors = scope.spawn(move || read_pipe(stderr));

            let status = match handle.wait_timeout(self.timeout) {
                Ok(Some(status)) => Ok(status),
                Ok(None) => {
                    warn!(sim, "Responder ran into timeout");
                    // the child may exit between the timeout and the kill
                    let _ = handle.kill();
                    let _ = handle.wait();

                    Err(HookError::Timeout)
                }
                Err(error) => Err(io_error(error)),
            };

            (status, output.join(), errors.join())
        });

        let status = status?;
        let output = output.map_err(|_| HookError::OutputLost)?.map_err(io_error)?;
        let errors = errors.map_err(|_| HookError::OutputLost)?.map_err(io_error)?;

        if !status.success() {
            debug!(stderr = errors, "Responder failed to answer");

            return Err(HookError::Command {
                command: name,
                status: status.to_string(),
            });
        }

        Ok(output.trim_end().to_string())
    }
}

fn read_pipe<R: Read>(pipe: Option<R>) -> std::io::Result<String> {
    let mut buffer = String::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_string(&mut buffer)?;
    }

    Ok(buffer)
}
