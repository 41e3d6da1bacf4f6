//! Parent role: spawn the child, accept its connection, supervise its exit.

use crate::config::IpcConfig;
use crate::session::{ConnectionState, IpcHandle, Role, Session};
use crate::value::Value;
use crate::{IpcError, Result};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Launches a child process and talks to it over a private socket.
///
/// The child receives `<socket_flag> <path>` appended to its arguments and
/// must dial that path within the accept timeout.
///
/// # Example
///
/// ```rust,no_run
/// use tandem_ipc::{IpcConfig, ParentIpc, Value};
///
/// # async fn example() -> tandem_ipc::Result<()> {
/// let mut ipc = ParentIpc::new("./worker", ["--verbose"], IpcConfig::new());
/// ipc.start().await?;
///
/// let result = ipc.call("Math.Div", [10, 2]).await?;
/// assert_eq!(result, vec![Value::Int(5)]);
///
/// ipc.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct ParentIpc {
    program: PathBuf,
    args: Vec<String>,
    config: IpcConfig,
    session: Arc<Session>,
    socket_path: Option<PathBuf>,
    child: Option<Child>,
    pid: Option<u32>,
    exit_status: Option<ExitStatus>,
}

enum WaitEvent {
    Exited(std::io::Result<ExitStatus>),
    Failed(IpcError),
    Elapsed,
}

impl ParentIpc {
    /// Create a parent for `program` with user arguments `args`.
    ///
    /// Nothing is spawned until [`start`](Self::start).
    pub fn new<P, I, S>(program: P, args: I, config: IpcConfig) -> Self
    where
        P: AsRef<Path>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let session = Session::new(&config, Role::Parent);
        Self {
            program: program.as_ref().to_path_buf(),
            args: args.into_iter().map(Into::into).collect(),
            config,
            session,
            socket_path: None,
            child: None,
            pid: None,
            exit_status: None,
        }
    }

    /// Spawn the child and wait for it to connect.
    ///
    /// Fails with [`IpcError::AcceptTimeout`] if the child does not dial in
    /// within the configured timeout, and with [`IpcError::ChildExitedEarly`]
    /// if it exits first. The child is killed and reaped on every failure
    /// after spawning.
    pub async fn start(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Err(IpcError::Config {
                message: "ipc is already started".to_string(),
            });
        }
        self.check_args()?;

        let socket_path = self.config.new_socket_path();
        // Stale file from a crashed run with the same name
        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)
            .map_err(|e| IpcError::io_context("listen unix socket", e))?;
        debug!("IPC parent listening on {}", socket_path.display());

        let result = self.spawn_and_accept(&listener, &socket_path).await;

        // The connection is established or abandoned; either way the path is done.
        drop(listener);
        if let Err(e) = std::fs::remove_file(&socket_path) {
            debug!("Failed to remove socket {}: {}", socket_path.display(), e);
        }
        self.socket_path = Some(socket_path);

        let (child, stream) = result?;
        self.pid = child.id();
        self.child = Some(child);
        self.session.attach(stream).await;

        info!(
            "IPC parent started {} (pid {:?})",
            self.program.display(),
            self.pid
        );
        Ok(())
    }

    async fn spawn_and_accept(
        &self,
        listener: &UnixListener,
        socket_path: &Path,
    ) -> Result<(Child, tokio::net::UnixStream)> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(&self.config.socket_flag)
            .arg(socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| IpcError::SpawnFailed {
                program: self.program.clone(),
                message: e.to_string(),
            })?;

        let accept_timeout = self.config.accept_timeout;
        let accepted = tokio::select! {
            res = tokio::time::timeout(accept_timeout, listener.accept()) => match res {
                Ok(Ok((stream, _))) => Ok(stream),
                Ok(Err(e)) => Err(IpcError::io_context("accept", e)),
                Err(_) => Err(IpcError::AcceptTimeout(accept_timeout)),
            },
            status = child.wait() => Err(match status {
                Ok(status) => IpcError::ChildExitedEarly {
                    status: status.to_string(),
                },
                Err(e) => IpcError::io_context("wait for child", e),
            }),
        };

        match accepted {
            Ok(stream) => Ok((child, stream)),
            Err(e) => {
                warn!("IPC parent failed to connect to {}: {}", self.program.display(), e);
                if let Err(kill_err) = child.kill().await {
                    debug!("Failed to kill child: {}", kill_err);
                }
                Err(e)
            }
        }
    }

    fn check_args(&self) -> Result<()> {
        let flag = self.config.socket_flag.as_str();
        let prefixed = format!("{}=", flag);
        if self
            .args
            .iter()
            .any(|arg| arg == flag || arg.starts_with(&prefixed))
        {
            return Err(IpcError::Config {
                message: format!("argument {} is reserved for ipc", flag),
            });
        }
        Ok(())
    }

    /// Ask the child to exit and wait for it.
    ///
    /// Refuses with [`IpcError::CallsPending`] or [`IpcError::CallsProcessing`]
    /// while work is outstanding in either direction.
    pub async fn stop(&mut self) -> Result<()> {
        if self.child.is_none() {
            return Err(IpcError::NotStarted);
        }
        self.session.ensure_idle()?;

        self.session.request_stop();
        info!("IPC parent stopping child (pid {:?})", self.pid);
        self.interrupt()?;
        self.wait(None).await
    }

    /// Wait for the child to exit or for the connection to fail.
    ///
    /// With a timeout, each elapsed period sends the child another interrupt
    /// and keeps waiting. On return the connection is closed and all pending
    /// calls are cancelled. Calling it again returns the same exit outcome.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> Result<()> {
        let session = self.session.clone();
        let Some(child) = self.child.as_mut() else {
            return Err(IpcError::NotStarted);
        };

        let mut errors = Vec::new();
        while self.exit_status.is_none() {
            let event = tokio::select! {
                status = child.wait() => WaitEvent::Exited(status),
                Some(err) = session.next_error() => WaitEvent::Failed(err),
                _ = sleep_or_forever(timeout) => WaitEvent::Elapsed,
            };

            match event {
                WaitEvent::Exited(Ok(status)) => {
                    self.exit_status = Some(status);
                }
                WaitEvent::Exited(Err(e)) => {
                    errors.push(IpcError::io_context("wait for child", e));
                    break;
                }
                WaitEvent::Failed(err) => {
                    errors.push(err);
                    // Pick up the exit if it raced with the failure.
                    if let Ok(Some(status)) = child.try_wait() {
                        self.exit_status = Some(status);
                    }
                    break;
                }
                WaitEvent::Elapsed => {
                    warn!("IPC parent wait timed out, interrupting child (pid {:?})", self.pid);
                    session.request_stop();
                    if let Err(e) = signal_interrupt(child) {
                        errors.push(e);
                    }
                }
            }
        }

        if let Some(status) = self.exit_status {
            if let Err(e) = classify_exit(status, session.is_stop_requested()) {
                errors.push(e);
            }
        }
        if let Some(err) = session.try_next_error() {
            errors.push(err);
        }

        session.teardown().await;

        match IpcError::merge(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn interrupt(&mut self) -> Result<()> {
        if self.exit_status.is_some() {
            return Ok(());
        }
        match self.child.as_mut() {
            Some(child) => signal_interrupt(child),
            None => Ok(()),
        }
    }

    /// Call `"<Endpoint>.<Method>"` in the child.
    pub async fn call<I>(&self, method: &str, args: I) -> Result<Vec<Value>>
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        let args = args.into_iter().map(Into::into).collect();
        self.session.call(method, args).await
    }

    /// Cloneable handle for calls from other tasks.
    pub fn handle(&self) -> IpcHandle {
        IpcHandle::new(self.session.clone())
    }

    /// Child process id, once started.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Socket path handed to the child, once started.
    pub fn socket_path(&self) -> Option<&Path> {
        self.socket_path.as_deref()
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn pending_calls(&self) -> usize {
        self.session.pending_calls()
    }

    pub fn processing_calls(&self) -> usize {
        self.session.processing_calls()
    }
}

async fn sleep_or_forever(timeout: Option<Duration>) {
    match timeout {
        Some(period) => tokio::time::sleep(period).await,
        None => std::future::pending().await,
    }
}

/// Send SIGINT unless the child has already been reaped.
fn signal_interrupt(child: &mut Child) -> Result<()> {
    if let Ok(Some(_)) = child.try_wait() {
        return Ok(());
    }
    match child.id() {
        Some(pid) => send_sigint(pid),
        None => Ok(()),
    }
}

#[cfg(unix)]
fn send_sigint(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    debug!("Sending SIGINT to process {}", pid);
    match kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
        Ok(()) => Ok(()),
        // Already gone
        Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(IpcError::Signal {
            pid,
            message: e.to_string(),
        }),
    }
}

/// A clean exit, or death by our own interrupt after a stop request, is success.
fn classify_exit(status: ExitStatus, stop_requested: bool) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if stop_requested && status.signal() == Some(nix::sys::signal::Signal::SIGINT as i32) {
            return Ok(());
        }
    }
    Err(IpcError::ChildExited {
        status: status.to_string(),
    })
}
