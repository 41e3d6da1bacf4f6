//! Connection state shared by the parent and child roles.
//!
//! A session owns one socket. A single reader task consumes frames and
//! routes them: calls are dispatched on their own tasks, responses are
//! handed to the pending-call table. Writes go through a mutex-guarded
//! optional write half, so sends may race with teardown and simply fail
//! once the half has been taken.
//!
//! # Thread Safety
//!
//! The pending table and id counter sit behind one mutex (see `pending`).
//! The in-flight counter and the stop flag are atomics so the dispatch path
//! checks them without locking.

use crate::config::IpcConfig;
use crate::pending::PendingCalls;
use crate::protocol::{read_frame, Message, MessageKind};
use crate::registry::Registry;
use crate::value::Value;
use crate::{IpcError, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connected,
    Closing,
    Closed,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Unconnected,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Unconnected => 0,
            ConnectionState::Connected => 1,
            ConnectionState::Closing => 2,
            ConnectionState::Closed => 3,
        }
    }
}

/// Which side of the connection a session serves. Used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Parent,
    Child,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Parent => f.write_str("parent"),
            Role::Child => f.write_str("child"),
        }
    }
}

pub(crate) struct Session {
    role: Role,
    registry: Registry,
    max_frame_size: usize,
    pending: PendingCalls,
    processing: AtomicUsize,
    stop_requested: AtomicBool,
    state: AtomicU8,
    torn_down: AtomicBool,
    writer: Mutex<Option<OwnedWriteHalf>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
    errors_tx: mpsc::Sender<IpcError>,
    errors_rx: Mutex<mpsc::Receiver<IpcError>>,
    disconnected: watch::Sender<bool>,
}

/// Counts one inbound call as in flight until dropped.
struct InFlight(Arc<Session>);

impl InFlight {
    fn enter(session: &Arc<Session>) -> Self {
        session.processing.fetch_add(1, Ordering::SeqCst);
        Self(session.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.processing.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Session {
    pub(crate) fn new(config: &IpcConfig, role: Role) -> Arc<Self> {
        // Single slot: only the first fatal error matters.
        let (errors_tx, errors_rx) = mpsc::channel(1);
        let (disconnected, _) = watch::channel(false);
        Arc::new(Self {
            role,
            registry: config.registry.clone(),
            max_frame_size: config.max_frame_size,
            pending: PendingCalls::new(),
            processing: AtomicUsize::new(0),
            stop_requested: AtomicBool::new(false),
            state: AtomicU8::new(ConnectionState::Unconnected.as_u8()),
            torn_down: AtomicBool::new(false),
            writer: Mutex::new(None),
            reader: StdMutex::new(None),
            errors_tx,
            errors_rx: Mutex::new(errors_rx),
            disconnected,
        })
    }

    /// Take ownership of a connected stream and start the reader loop.
    pub(crate) async fn attach(self: &Arc<Self>, stream: UnixStream) {
        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);
        self.set_state(ConnectionState::Connected);

        let session = self.clone();
        let handle = tokio::spawn(session.read_loop(read_half));
        *self.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!("IPC {} connected", self.role);
    }

    pub(crate) fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    pub(crate) fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn processing_calls(&self) -> usize {
        self.processing.load(Ordering::SeqCst)
    }

    pub(crate) fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Fail if any outbound call is unanswered or any inbound call is running.
    pub(crate) fn ensure_idle(&self) -> Result<()> {
        let pending = self.pending_calls();
        if pending > 0 {
            return Err(IpcError::CallsPending(pending));
        }
        let processing = self.processing_calls();
        if processing > 0 {
            return Err(IpcError::CallsProcessing(processing));
        }
        Ok(())
    }

    /// Call a method on the remote side and wait for its results.
    pub(crate) async fn call(&self, method: &str, args: Vec<Value>) -> Result<Vec<Value>> {
        if self.is_stop_requested() {
            return Err(IpcError::IpcStopping);
        }
        if self.state() == ConnectionState::Unconnected {
            return Err(IpcError::NotStarted);
        }

        let (id, rx) = self.pending.register()?;
        let msg = Message::call(id, method, args.iter().map(Value::to_wire).collect());

        debug!("IPC {} call id={} {}", self.role, id, method);

        if let Err(e) = self.send(&msg).await {
            self.pending.deregister(id);
            return Err(e);
        }

        // A dropped sender means the slot was discarded without delivery.
        let raw = rx.await.map_err(|_| IpcError::CallCancelled)??;

        raw.iter()
            .map(Value::from_wire)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| IpcError::Value(e.to_string()))
    }

    async fn send(&self, msg: &Message) -> Result<()> {
        let data = msg.encode(self.max_frame_size)?;
        let mut writer = self.writer.lock().await;
        let half = writer.as_mut().ok_or_else(|| {
            IpcError::io_context(
                "write message",
                std::io::Error::new(std::io::ErrorKind::NotConnected, "connection closed"),
            )
        })?;
        half.write_all(&data)
            .await
            .map_err(|e| IpcError::io_context("write message", e))?;
        half.flush()
            .await
            .map_err(|e| IpcError::io_context("write message", e))?;
        Ok(())
    }

    /// Record a fatal error. Only the first one is kept until it is taken.
    pub(crate) fn raise(&self, err: IpcError) {
        error!("IPC {} error: {}", self.role, err);
        if self.errors_tx.try_send(err).is_err() {
            debug!("IPC {} error slot already full", self.role);
        }
    }

    /// Wait for the next fatal error.
    pub(crate) async fn next_error(&self) -> Option<IpcError> {
        self.errors_rx.lock().await.recv().await
    }

    /// Take a pending fatal error without waiting.
    pub(crate) fn try_next_error(&self) -> Option<IpcError> {
        self.errors_rx.try_lock().ok()?.try_recv().ok()
    }

    /// Wait until the reader loop has ended.
    pub(crate) async fn disconnected(&self) {
        let mut rx = self.disconnected.subscribe();
        // The sender lives as long as the session, so this only returns on `true`.
        let _ = rx.wait_for(|done| *done).await;
    }

    async fn read_loop(self: Arc<Self>, read_half: OwnedReadHalf) {
        let mut reader = BufReader::new(read_half);
        loop {
            let frame = match read_frame(&mut reader, self.max_frame_size).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!("IPC {} connection closed by peer", self.role);
                    break;
                }
                Err(e) => {
                    self.raise(e);
                    break;
                }
            };

            if let Err(e) = Message::decode(&frame).and_then(|msg| self.route(msg)) {
                self.raise(e);
                break;
            }
        }

        // Remote close or fatal error; a local teardown may already be further along.
        let _ = self.state.compare_exchange(
            ConnectionState::Connected.as_u8(),
            ConnectionState::Closing.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        let cancelled = self.pending.close();
        if cancelled > 0 {
            warn!("IPC {} cancelled {} pending calls", self.role, cancelled);
        }
        self.disconnected.send_replace(true);
    }

    fn route(self: &Arc<Self>, msg: Message) -> Result<()> {
        match msg.kind {
            MessageKind::Call => {
                self.handle_call(msg);
                Ok(())
            }
            MessageKind::Response => self.handle_response(msg),
        }
    }

    fn handle_call(self: &Arc<Self>, msg: Message) {
        let in_flight = InFlight::enter(self);

        if self.is_stop_requested() {
            debug!(
                "IPC {} dropping call id={} {}: stop requested",
                self.role, msg.id, msg.method
            );
            return;
        }

        let session = self.clone();
        tokio::spawn(async move {
            let outcome = session.registry.dispatch(&msg.method, msg.args).await;
            if let Err(ref e) = outcome {
                debug!("IPC {} call id={} {} failed: {}", session.role, msg.id, msg.method, e);
            }
            session.respond(msg.id, outcome).await;
            drop(in_flight);
        });
    }

    async fn respond(&self, id: i64, outcome: Result<Vec<Value>>) {
        let msg = match outcome {
            Ok(results) => Message::success(id, results.iter().map(Value::to_wire).collect()),
            Err(e) => Message::failure(id, e.to_string()),
        };

        let result = match self.send(&msg).await {
            Err(e @ IpcError::FrameTooLarge { .. }) => {
                warn!("IPC {} response id={} too large: {}", self.role, id, e);
                self.send(&Message::failure(id, e.to_string())).await
            }
            other => other,
        };

        if let Err(e) = result {
            warn!("IPC {} failed to send response id={}", self.role, id);
            self.raise(e);
        }
    }

    /// A response nobody is waiting for means the peers disagree on state.
    fn handle_response(&self, msg: Message) -> Result<()> {
        let outcome = if msg.error.is_empty() {
            Ok(msg.result)
        } else {
            Err(IpcError::Remote(msg.error))
        };
        if !self.pending.resolve(msg.id, outcome) {
            return Err(IpcError::UnknownCallId(msg.id));
        }
        Ok(())
    }

    /// Close the socket and cancel every pending call. Runs once.
    pub(crate) async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(ConnectionState::Closing);

        let cancelled = self.pending.close();
        if cancelled > 0 {
            info!("IPC {} cancelled {} pending calls", self.role, cancelled);
        }

        if let Some(mut half) = self.writer.lock().await.take() {
            let _ = half.shutdown().await;
        }
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = reader {
            handle.abort();
        }

        self.set_state(ConnectionState::Closed);
        self.disconnected.send_replace(true);
        info!("IPC {} connection closed", self.role);
    }
}

/// Cloneable handle for issuing calls while the owner drives the lifecycle.
#[derive(Clone)]
pub struct IpcHandle {
    session: Arc<Session>,
}

impl IpcHandle {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Call `"<Endpoint>.<Method>"` on the remote side.
    ///
    /// Returns the remote method's ordinary results. Remote application
    /// errors come back as [`IpcError::Remote`]; teardown while waiting
    /// yields [`IpcError::CallCancelled`].
    pub async fn call<I>(&self, method: &str, args: I) -> Result<Vec<Value>>
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        let args = args.into_iter().map(Into::into).collect();
        self.session.call(method, args).await
    }

    /// Outbound calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.session.pending_calls()
    }

    /// Inbound calls currently being dispatched.
    pub fn processing_calls(&self) -> usize {
        self.session.processing_calls()
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn is_stopping(&self) -> bool {
        self.session.is_stop_requested()
    }

    /// A handle that does not keep the connection alive.
    ///
    /// Endpoints that call back into the remote side should hold this, since
    /// the connection's registry already holds the endpoint.
    pub fn downgrade(&self) -> WeakIpcHandle {
        WeakIpcHandle {
            session: Arc::downgrade(&self.session),
        }
    }
}

/// Non-owning counterpart of [`IpcHandle`].
#[derive(Clone, Debug)]
pub struct WeakIpcHandle {
    session: Weak<Session>,
}

impl WeakIpcHandle {
    /// The live handle, or `None` once the connection has been dropped.
    pub fn upgrade(&self) -> Option<IpcHandle> {
        self.session.upgrade().map(IpcHandle::new)
    }
}

impl fmt::Debug for IpcHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcHandle")
            .field("role", &self.session.role)
            .field("state", &self.session.state())
            .field("pending_calls", &self.session.pending_calls())
            .field("processing_calls", &self.session.processing_calls())
            .finish()
    }
}
