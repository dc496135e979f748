//! Server mode: the worker listens on a per-simulation port and a client answers its
//! requests until the worker asks to stop or hangs up. The server is always torn down after
//! the client returned, so no listener outlives its attempt. The client is a scoped thread,
//! a panic in it surfaces through `join` as an error and the teardown still runs.

use super::{AttemptOutcome, RunMode, RunnerError, WorkerInvocation};
use crate::{config::ServerConfig, hooks::Responder};
use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use std::{
    io::{Read, Write},
    net::TcpStream,
    process::{Child, ExitStatus},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, error, info, trace, warn};
use wait_timeout::ChildExt;

const CONNECT_RETRY: Duration = Duration::from_millis(100);

/// Why the client stopped talking to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientExit {
    /// the server sent the terminate sentinel
    Terminated,
    /// the server closed the connection
    Closed,
}

/// How the server process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerExit {
    /// exited on its own before the client returned
    Exited(ExitStatus),
    /// stopped by SIGTERM within the grace period
    Terminated(ExitStatus),
    /// had to be killed
    Killed(ExitStatus),
}

/// port of a simulation's server
pub fn port(config: &ServerConfig, sim: usize) -> u16 {
    config.port.saturating_add(u16::try_from(sim).unwrap_or(u16::MAX))
}

/// start the worker as a server, talk to it until done, then tear it down
#[tracing::instrument(skip(invocation, config, responder), level = "debug")]
pub fn run(
    invocation: &WorkerInvocation,
    sim: usize,
    config: &ServerConfig,
    responder: &dyn Responder,
    mode: RunMode,
) -> Result<AttemptOutcome, RunnerError> {
    let port = port(config, sim);
    let mut server = invocation
        .command()?
        .spawn()
        .map_err(invocation.spawn_error())?;

    info!(sim, pid = server.id(), port, "Started worker server");

    let client = thread::scope(|scope| {
        let handle = thread::Builder::new()
            .name(format!("client-{sim}"))
            .spawn_scoped(scope, || {
                let stream = connect(&config.host, port, config.connect_timeout_ms)?;
                converse(stream, sim, config, responder)
            })
            .map_err(RunnerError::ClientThread)?;

        handle.join().map_err(|_| RunnerError::ClientPanicked)?
    });

    let server_exit = terminate(&mut server, Duration::from_millis(config.grace_ms))?;

    Ok(decide(client, server_exit, mode))
}

/// combine how both sides ended into the outcome of the attempt
pub fn decide(
    client: Result<ClientExit, RunnerError>,
    server: ServerExit,
    mode: RunMode,
) -> AttemptOutcome {
    match (client, server) {
        // a server that finished by itself has the final word
        (_, ServerExit::Exited(status)) => AttemptOutcome::from_status(status, mode),
        (Ok(exit), _) => {
            debug!(?exit, "Client finished the conversation");
            AttemptOutcome::succeeded(mode)
        }
        (Err(error), server) => {
            error!(error = ?error, ?server, "Client failed to serve the worker");
            AttemptOutcome::Failed { code: None }
        }
    }
}

/// connect to the server, retrying while it is starting up
pub fn connect(host: &str, port: u16, timeout_ms: u64) -> Result<TcpStream, RunnerError> {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);

    loop {
        match TcpStream::connect((host, port)) {
            Ok(stream) => {
                debug!(host, port, "Connected to worker server");
                return Ok(stream);
            }
            Err(error) if Instant::now() < deadline => {
                trace!(error = ?error, "Worker server not ready yet");
                thread::sleep(CONNECT_RETRY);
            }
            Err(source) => {
                return Err(RunnerError::Connect {
                    address: format!("{host}:{port}"),
                    source,
                })
            }
        }
    }
}

/// answer requests until the terminate sentinel arrives or the server hangs up
pub fn converse(
    mut stream: TcpStream,
    sim: usize,
    config: &ServerConfig,
    responder: &dyn Responder,
) -> Result<ClientExit, RunnerError> {
    let mut buffer = vec![0u8; config.buffer_size.max(1)];

    loop {
        let read = stream
            .read(&mut buffer)
            .map_err(RunnerError::Conversation)?;
        if read == 0 {
            return Ok(ClientExit::Closed);
        }

        let request = String::from_utf8_lossy(&buffer[..read]);
        let request = request.trim();
        if request == config.terminate {
            return Ok(ClientExit::Terminated);
        }

        trace!(sim, request, "Server request");
        let response = responder
            .respond(sim, request)
            .map_err(RunnerError::Respond)?;
        stream
            .write_all(response.as_bytes())
            .map_err(RunnerError::Conversation)?;
    }
}

/// stop the server: SIGTERM, wait for the grace period, then kill
pub fn terminate(server: &mut Child, grace: Duration) -> Result<ServerExit, RunnerError> {
    if let Some(status) = server.try_wait().map_err(RunnerError::Wait)? {
        return Ok(ServerExit::Exited(status));
    }

    let pid = Pid::from_raw(server.id() as i32);
    match signal::kill(pid, Signal::SIGTERM) {
        // exited between the check and the signal
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(error) => return Err(error.into()),
    }

    match server.wait_timeout(grace).map_err(RunnerError::Wait)? {
        Some(status) => Ok(ServerExit::Terminated(status)),
        None => {
            warn!(pid = server.id(), "Worker server ignored SIGTERM, killing it");
            server.kill().map_err(RunnerError::Wait)?;
            let status = server.wait().map_err(RunnerError::Wait)?;

            Ok(ServerExit::Killed(status))
        }
    }
}
