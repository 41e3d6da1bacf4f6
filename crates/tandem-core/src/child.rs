//! Child role: dial the socket the parent handed over in our arguments.

use crate::config::IpcConfig;
use crate::session::{ConnectionState, IpcHandle, Role, Session};
use crate::value::Value;
use crate::{IpcError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::UnixStream;
use tracing::{debug, info};

/// The child side of a parent/child connection.
///
/// # Example
///
/// ```rust,no_run
/// use tandem_ipc::{ChildIpc, IpcConfig};
///
/// # async fn example() -> tandem_ipc::Result<()> {
/// let mut ipc = ChildIpc::from_args(IpcConfig::new())?;
/// ipc.start().await?;
/// ipc.wait().await
/// # }
/// ```
pub struct ChildIpc {
    socket_path: PathBuf,
    session: Arc<Session>,
    started: bool,
}

impl ChildIpc {
    /// Create a child that will dial `socket_path`.
    pub fn new(socket_path: impl AsRef<Path>, config: IpcConfig) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            session: Session::new(&config, Role::Child),
            started: false,
        }
    }

    /// Create a child from the process arguments.
    ///
    /// Fails with [`IpcError::MissingSocketArg`] if the socket flag is absent.
    pub fn from_args(config: IpcConfig) -> Result<Self> {
        Self::from_arg_list(std::env::args().skip(1), config)
    }

    /// Create a child from an explicit argument list.
    pub fn from_arg_list<I, S>(args: I, config: IpcConfig) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let path = socket_path_from_args(args, &config.socket_flag).ok_or_else(|| {
            IpcError::MissingSocketArg {
                flag: config.socket_flag.clone(),
            }
        })?;
        Ok(Self::new(path, config))
    }

    /// Connect to the parent and start serving calls.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(IpcError::Config {
                message: "ipc is already started".to_string(),
            });
        }
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| IpcError::io_context("connect to parent socket", e))?;
        self.started = true;
        self.session.attach(stream).await;
        info!("IPC child connected to {}", self.socket_path.display());
        Ok(())
    }

    /// Wait until the parent closes the connection or it fails.
    ///
    /// A clean close returns `Ok`. Pending calls are cancelled on return.
    pub async fn wait(&mut self) -> Result<()> {
        if !self.started {
            return Err(IpcError::NotStarted);
        }
        let session = self.session.clone();

        let result = tokio::select! {
            Some(err) = session.next_error() => Err(err),
            _ = session.disconnected() => Ok(()),
        };
        // The reader raises before it marks the connection closed.
        let result = match result {
            Ok(()) => session.try_next_error().map_or(Ok(()), Err),
            err => err,
        };

        debug!("IPC child connection ended");
        session.teardown().await;
        result
    }

    /// Call `"<Endpoint>.<Method>"` in the parent.
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

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }
}

/// Find the value of `flag` in `args`, as `flag <path>` or `flag=<path>`.
pub fn socket_path_from_args<I, S>(args: I, flag: &str) -> Option<PathBuf>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let arg = arg.as_ref();
        if arg == flag {
            return args
                .next()
                .map(|value| PathBuf::from(value.as_ref()))
                .filter(|path| !path.as_os_str().is_empty());
        }
        if let Some(value) = arg.strip_prefix(flag).and_then(|rest| rest.strip_prefix('=')) {
            if !value.is_empty() {
                return Some(PathBuf::from(value));
            }
        }
    }
    None
}
