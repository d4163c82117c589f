// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! IPC router: the single local listener.
//!
//! One Unix socket connection per client. The first frame on every
//! connection must target the AUTH route and carry a bearer token; on
//! failure the router sends a single error frame and closes. After
//! auth, each request is checked against the authorization policy and
//! dispatched to the in-process handler registered for its destination
//! code. Handlers may push EVENT frames at any time; a bounded
//! per-connection outbox pauses reads when the client stops draining.

mod auth;
mod handlers;

pub use auth::{AuthzPolicy, Principal, TokenRegistry};
pub use handlers::{CliHandler, ConfigHandler, CredentialsHandler, LifecycleHandler};

use crate::deployment::Rejection;
use crate::env::{ipc_timeout, AUTH_TIMEOUT, CONNECTION_FRAME_BOUND};
use async_trait::async_trait;
use ember_core::ErrorKind;
use ember_wire::{
    decode_payload, encode_payload, read_frame, read_frame_unbounded, write_frame, AuthAck,
    AuthRequest, Destination, ErrorBody, Frame, FrameType, ProtocolError, ValidityStatus,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{unix::OwnedWriteHalf, UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Token lookup, object-safe so the router does not carry the clock
/// type parameter.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Option<Principal>;
}

impl<C: ember_core::Clock> Authenticator for TokenRegistry<C> {
    fn authenticate(&self, token: &str) -> Option<Principal> {
        TokenRegistry::authenticate(self, token)
    }
}

/// Handler failure, translated into an error response frame.
#[derive(Debug)]
pub struct HandlerError {
    pub kind: ErrorKind,
    pub message: String,
}

impl HandlerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    fn body(&self) -> Vec<u8> {
        encode_payload(&ErrorBody::new(self.kind, self.message.clone())).unwrap_or_default()
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<ember_wire::PayloadError> for HandlerError {
    fn from(e: ember_wire::PayloadError) -> Self {
        HandlerError::new(ErrorKind::MalformedConfig, e.to_string())
    }
}

/// An in-process request handler bound to one destination code.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        principal: &Principal,
        payload: &[u8],
        conn: &ConnHandle,
    ) -> Result<Vec<u8>, HandlerError>;
}

type Cleanup = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub struct ConnState {
    subscribed_updates: AtomicBool,
    next_event_id: AtomicU32,
    cleanups: Mutex<Vec<Cleanup>>,
}

/// Per-connection handle given to handlers; cheap to clone.
#[derive(Clone)]
pub struct ConnHandle {
    pub id: u64,
    pub principal: Principal,
    tx: mpsc::Sender<Frame>,
    state: Arc<ConnState>,
}

impl ConnHandle {
    /// Mark this connection as wanting component-update events.
    pub fn subscribe_component_updates(&self) {
        self.state.subscribed_updates.store(true, Ordering::SeqCst);
    }

    pub fn wants_component_updates(&self) -> bool {
        self.state.subscribed_updates.load(Ordering::SeqCst)
    }

    /// Push an EVENT frame without blocking (config watch callbacks).
    /// Returns false when the outbox is full or the peer is gone.
    pub fn push_event(&self, destination: Destination, payload: Vec<u8>) -> bool {
        let id = self.state.next_event_id.fetch_add(1, Ordering::SeqCst);
        self.tx
            .try_send(Frame::event(destination, id, payload))
            .is_ok()
    }

    /// Run `cleanup` when the connection goes away (e.g. drop a store
    /// subscription).
    pub fn on_disconnect(&self, cleanup: impl FnOnce() + Send + 'static) {
        self.state.cleanups.lock().push(Box::new(cleanup));
    }
}

type ValidityTx = mpsc::UnboundedSender<(String, ValidityStatus, Option<String>)>;

/// The IPC router.
pub struct Router {
    handlers: Mutex<HashMap<u16, Arc<dyn Handler>>>,
    authenticator: Arc<dyn Authenticator>,
    authz: AuthzPolicy,
    conns: Mutex<HashMap<u64, ConnHandle>>,
    next_conn_id: AtomicU64,
    validations: Mutex<HashMap<String, ValidityTx>>,
}

impl Router {
    pub fn new(authenticator: Arc<dyn Authenticator>, authz: AuthzPolicy) -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            authenticator,
            authz,
            conns: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            validations: Mutex::new(HashMap::new()),
        }
    }

    /// Register the handler for a destination (startup wiring).
    pub fn register(&self, destination: Destination, handler: Arc<dyn Handler>) {
        self.handlers.lock().insert(destination.code(), handler);
    }

    /// Accept connections until shutdown.
    pub async fn serve(self: Arc<Self>, listener: UnixListener, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = listener.accept() => match result {
                    Ok((stream, _)) => {
                        let router = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = router.handle_connection(stream).await {
                                match e {
                                    ProtocolError::ConnectionClosed => debug!("client disconnected"),
                                    other => warn!(error = %other, "connection error"),
                                }
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "accept error"),
                },
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: UnixStream) -> Result<(), ProtocolError> {
        let (mut reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::channel::<Frame>(CONNECTION_FRAME_BOUND);
        let writer_task = tokio::spawn(write_loop(writer, rx));

        // First frame must be AUTH; nothing else dispatches before it.
        let first = read_frame(&mut reader, AUTH_TIMEOUT).await?;
        let principal = self.authenticate_first_frame(&first);
        let Some(principal) = principal else {
            // Single error frame, then close. Logged once, without the
            // presented token.
            warn!(conn = "new", "AUTH_FAILED: rejecting connection");
            let body = encode_payload(&ErrorBody::new(
                ErrorKind::AuthFailed,
                "authentication failed",
            ))
            .unwrap_or_default();
            let _ = tx.send(Frame::response(first.destination, first.request_id, body)).await;
            drop(tx);
            let _ = writer_task.await;
            return Ok(());
        };

        let ack = encode_payload(&AuthAck { principal: principal.name().to_string() })
            .unwrap_or_default();
        if tx
            .send(Frame::response(Destination::Auth.code(), first.request_id, ack))
            .await
            .is_err()
        {
            return Ok(());
        }

        let id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let conn = ConnHandle {
            id,
            principal: principal.clone(),
            tx: tx.clone(),
            state: Arc::new(ConnState::default()),
        };
        self.conns.lock().insert(id, conn.clone());
        info!(conn = id, principal = %principal, "IPC connection authenticated");

        let result = self.serve_requests(&mut reader, &conn).await;

        self.conns.lock().remove(&id);
        for cleanup in conn.state.cleanups.lock().drain(..) {
            cleanup();
        }
        drop(tx);
        drop(conn);
        writer_task.abort();
        result
    }

    fn authenticate_first_frame(&self, frame: &Frame) -> Option<Principal> {
        if frame.destination != Destination::Auth.code()
            || frame.frame_type != FrameType::Request
        {
            return None;
        }
        let request: AuthRequest = decode_payload(&frame.payload).ok()?;
        self.authenticator.authenticate(&request.token)
    }

    async fn serve_requests(
        &self,
        reader: &mut tokio::net::unix::OwnedReadHalf,
        conn: &ConnHandle,
    ) -> Result<(), ProtocolError> {
        loop {
            let frame = match read_frame_unbounded(reader).await {
                Ok(frame) => frame,
                Err(ProtocolError::ConnectionClosed) => return Ok(()),
                Err(e) => return Err(e),
            };
            if frame.frame_type != FrameType::Request {
                debug!(conn = conn.id, "ignoring non-request frame");
                continue;
            }

            let response = self.dispatch(conn, &frame).await;
            if conn.tx.send(response).await.is_err() {
                return Ok(());
            }
        }
    }

    async fn dispatch(&self, conn: &ConnHandle, frame: &Frame) -> Frame {
        let Some(destination) = Destination::from_code(frame.destination) else {
            let error = HandlerError::new(
                ErrorKind::NotFound,
                format!("unknown destination {}", frame.destination),
            );
            return Frame::response(frame.destination, frame.request_id, error.body());
        };

        // Re-auth on an established connection is answered, not re-run.
        if destination == Destination::Auth {
            let ack = encode_payload(&AuthAck { principal: conn.principal.name().to_string() })
                .unwrap_or_default();
            return Frame::response(frame.destination, frame.request_id, ack);
        }

        if !self.authz.allowed(&conn.principal, destination, "") {
            // Denied requests get an error frame; the connection stays
            // open.
            let error = HandlerError::new(
                ErrorKind::AuthzDenied,
                format!("{} may not invoke {:?}", conn.principal, destination),
            );
            return Frame::response(frame.destination, frame.request_id, error.body());
        }

        let handler = self.handlers.lock().get(&frame.destination).cloned();
        let Some(handler) = handler else {
            let error = HandlerError::new(ErrorKind::NotFound, "no handler registered");
            return Frame::response(frame.destination, frame.request_id, error.body());
        };

        // Handler failures become error responses, never propagation.
        match handler.handle(&conn.principal, &frame.payload, conn).await {
            Ok(payload) => Frame::response(frame.destination, frame.request_id, payload),
            Err(error) => {
                debug!(conn = conn.id, error = %error, "handler error");
                Frame::response(frame.destination, frame.request_id, error.body())
            }
        }
    }

    // -- deployment validation plumbing --

    /// Announce a pending configuration to affected, subscribed
    /// services and collect rejections until `timeout`. Absent replies
    /// count as acceptance.
    pub async fn validate_config(
        &self,
        deployment_id: &str,
        configs: &indexmap::IndexMap<String, serde_json::Value>,
        timeout: std::time::Duration,
    ) -> Vec<Rejection> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.validations.lock().insert(deployment_id.to_string(), tx);

        let mut expected: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
        {
            let conns = self.conns.lock();
            for (service, configuration) in configs {
                for conn in conns.values() {
                    let is_target = conn.principal == Principal::Service(service.clone());
                    if !is_target || !conn.wants_component_updates() {
                        continue;
                    }
                    let event = ember_wire::ConfigEvent::ValidateRequest {
                        deployment_id: deployment_id.to_string(),
                        configuration: configuration.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    };
                    if let Ok(payload) = encode_payload(&event) {
                        if conn.push_event(Destination::ConfigStore, payload) {
                            expected.insert(service.clone());
                        }
                    }
                }
            }
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let mut rejections = Vec::new();
        while !expected.is_empty() {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some((service, status, reason))) => {
                    expected.remove(&service);
                    if status == ValidityStatus::Reject {
                        rejections.push(Rejection {
                            service,
                            reason: reason.unwrap_or_else(|| "rejected".to_string()),
                        });
                    }
                }
                Ok(None) => break,
                // Timeout: absent votes mean OK.
                Err(_) => break,
            }
        }

        self.validations.lock().remove(deployment_id);
        rejections
    }

    /// Route a validity report from a service into the waiting
    /// deployment. Returns false when no validation is pending.
    pub fn report_validity(
        &self,
        deployment_id: &str,
        principal: &Principal,
        status: ValidityStatus,
        reason: Option<String>,
    ) -> bool {
        match self.validations.lock().get(deployment_id) {
            Some(tx) => tx.send((principal.name().to_string(), status, reason)).is_ok(),
            None => false,
        }
    }

    /// Push a component-update event to every subscribed service
    /// connection among `services`.
    pub fn notify_component_update(&self, services: &[String], path: &str, value: Option<serde_json::Value>) {
        let event = ember_wire::ConfigEvent::Updated { path: path.to_string(), value };
        let Ok(payload) = encode_payload(&event) else { return };
        let conns = self.conns.lock();
        for conn in conns.values() {
            let target = services
                .iter()
                .any(|s| conn.principal == Principal::Service(s.clone()));
            if target && conn.wants_component_updates() {
                let _ = conn.push_event(Destination::ConfigStore, payload.clone());
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn test_conn(
        &self,
        principal: Principal,
    ) -> (ConnHandle, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(CONNECTION_FRAME_BOUND);
        let id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let conn = ConnHandle { id, principal, tx, state: Arc::new(ConnState::default()) };
        self.conns.lock().insert(id, conn.clone());
        (conn, rx)
    }
}

#[async_trait]
impl crate::deployment::ValidationBroadcaster for Router {
    async fn validate(
        &self,
        deployment_id: &str,
        configs: &indexmap::IndexMap<String, serde_json::Value>,
        timeout: std::time::Duration,
    ) -> Vec<Rejection> {
        self.validate_config(deployment_id, configs, timeout).await
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        if write_frame(&mut writer, &frame, ipc_timeout()).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
