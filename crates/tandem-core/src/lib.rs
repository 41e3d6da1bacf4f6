//! Tandem IPC
//!
//! Bidirectional RPC between a parent process and a child it spawns. Either
//! side registers named endpoints and calls the other's methods as
//! `"<Endpoint>.<Method>"` over a private Unix domain socket.
//!
//! # Architecture
//!
//! - [`ParentIpc`] binds a socket, spawns the child with
//!   `--ipc-socket <path>` appended to its arguments and accepts one
//!   connection. It owns the child's lifecycle: `start`, `stop`, `wait`.
//! - [`ChildIpc`] reads the socket path from its arguments and dials in.
//! - Both sides share one session implementation: a reader task decodes
//!   newline-delimited JSON records, dispatches calls concurrently and
//!   correlates responses with waiting callers by id.
//!
//! # Example
//!
//! ```rust,no_run
//! use tandem_ipc::{Endpoint, IpcConfig, ParentIpc, Value, ValueType};
//!
//! # async fn example() -> tandem_ipc::Result<()> {
//! let host = Endpoint::new("Host")
//!     .method("Ping", [ValueType::Str], |_, args| async move {
//!         Ok(vec![Value::from(format!("pong: {}", args.str(0)?))])
//!     })
//!     .build();
//!
//! let mut ipc = ParentIpc::new("./worker", Vec::<String>::new(), IpcConfig::new().register(host));
//! ipc.start().await?;
//! let quotient = ipc.call("Math.Div", [10, 2]).await?;
//! println!("{:?}", quotient);
//! ipc.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Unix only.

pub mod child;
pub mod config;
pub mod error;
pub mod parent;
mod pending;
pub mod protocol;
pub mod registry;
mod session;
pub mod value;

// Re-export commonly used types
pub use child::{socket_path_from_args, ChildIpc};
pub use config::{IpcConfig, IpcDefaults};
pub use error::{IpcError, Result};
pub use parent::ParentIpc;
pub use protocol::{Message, MessageKind};
pub use registry::{Args, Endpoint, EndpointBuilder, HandlerError, HandlerResult, Registry};
pub use session::{ConnectionState, IpcHandle, WeakIpcHandle};
pub use value::{CoercionError, Value, ValueType};
