// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! IPC auth specs (property 8).

use ember_config::ConfigStore;
use ember_core::{ErrorKind, SystemClock};
use ember_daemon::ipc::Authenticator;
use ember_daemon::{AuthzPolicy, ConnHandle, Handler, HandlerError, Principal, Router, TokenRegistry};
use ember_wire::{
    decode_payload, encode_payload, read_frame, write_frame, AuthAck, AuthRequest, Destination,
    ErrorBody, Frame, ProtocolError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(5);

/// Counts every dispatch it receives.
struct Counting(Arc<AtomicUsize>);

#[async_trait::async_trait]
impl Handler for Counting {
    async fn handle(
        &self,
        _principal: &Principal,
        payload: &[u8],
        _conn: &ConnHandle,
    ) -> Result<Vec<u8>, HandlerError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(payload.to_vec())
    }
}

struct Setup {
    socket: std::path::PathBuf,
    cli_token: String,
    dispatched: Arc<AtomicUsize>,
    _dir: tempfile::TempDir,
}

async fn setup() -> Setup {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(ConfigStore::new());
    let tokens = Arc::new(TokenRegistry::new(store, SystemClock::default()));
    let cli_token = tokens
        .write_bootstrap_token(&dir.path().join("cli.token"))
        .expect("token");

    let dispatched = Arc::new(AtomicUsize::new(0));
    let router = Arc::new(Router::new(
        Arc::clone(&tokens) as Arc<dyn Authenticator>,
        AuthzPolicy,
    ));
    router.register(Destination::Cli, Arc::new(Counting(Arc::clone(&dispatched))));

    let socket = dir.path().join("emberd.sock");
    let listener = tokio::net::UnixListener::bind(&socket).expect("bind");
    tokio::spawn(router.serve(listener, CancellationToken::new()));

    Setup { socket, cli_token, dispatched, _dir: dir }
}

/// Property 8 — nothing dispatches on an unauthenticated connection.
#[tokio::test]
async fn no_dispatch_before_auth() {
    let s = setup().await;
    let mut stream = UnixStream::connect(&s.socket).await.expect("connect");

    // A CLI request as the very first frame must be refused and the
    // connection closed, without reaching the handler.
    write_frame(
        &mut stream,
        &Frame::request(Destination::Cli, 1, b"sneaky".to_vec()),
        TIMEOUT,
    )
    .await
    .expect("write");

    let reply = read_frame(&mut stream, TIMEOUT).await.expect("reply");
    let error: ErrorBody = decode_payload(&reply.payload).expect("error body");
    assert_eq!(error.kind, ErrorKind::AuthFailed);
    assert!(matches!(
        read_frame(&mut stream, TIMEOUT).await,
        Err(ProtocolError::ConnectionClosed)
    ));
    assert_eq!(s.dispatched.load(Ordering::SeqCst), 0);
}

/// After a valid AUTH frame the same request goes through.
#[tokio::test]
async fn dispatch_after_auth() {
    let s = setup().await;
    let mut stream = UnixStream::connect(&s.socket).await.expect("connect");

    let auth = encode_payload(&AuthRequest { token: s.cli_token.clone() }).expect("payload");
    write_frame(&mut stream, &Frame::request(Destination::Auth, 1, auth), TIMEOUT)
        .await
        .expect("write auth");
    let ack_frame = read_frame(&mut stream, TIMEOUT).await.expect("ack");
    let ack: AuthAck = decode_payload(&ack_frame.payload).expect("ack body");
    assert_eq!(ack.principal, "cli");

    write_frame(
        &mut stream,
        &Frame::request(Destination::Cli, 2, b"hello".to_vec()),
        TIMEOUT,
    )
    .await
    .expect("write");
    let reply = read_frame(&mut stream, TIMEOUT).await.expect("reply");
    assert_eq!(reply.payload, b"hello");
    assert_eq!(s.dispatched.load(Ordering::SeqCst), 1);
}
