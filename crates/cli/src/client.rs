// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! IPC client: connect to the daemon socket, authenticate with the
//! bootstrap token, exchange CLI frames.

use crate::exit_error::{ExitError, EXIT_AUTH, EXIT_INTERNAL};
use ember_daemon::EmberPaths;
use ember_wire::{
    decode_payload, encode_payload, read_frame, write_frame, AuthAck, AuthRequest, CliRequest,
    CliResponse, Destination, ErrorBody, Frame, FrameType,
};
use std::time::Duration;
use tokio::net::UnixStream;

const IPC_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Client {
    stream: UnixStream,
    next_request_id: u32,
}

impl Client {
    /// Connect and authenticate using the bootstrap token file.
    pub async fn connect(paths: &EmberPaths) -> Result<Self, ExitError> {
        let token = std::fs::read_to_string(paths.cli_token_path()).map_err(|_| {
            ExitError::internal(format!(
                "cannot read {} (is emberd running?)",
                paths.cli_token_path().display()
            ))
        })?;

        let stream = UnixStream::connect(paths.socket_path()).await.map_err(|e| {
            ExitError::internal(format!(
                "cannot connect to {} ({e}); is emberd running?",
                paths.socket_path().display()
            ))
        })?;

        let mut client = Self { stream, next_request_id: 1 };
        let payload = encode_payload(&AuthRequest { token: token.trim().to_string() })
            .map_err(|e| ExitError::internal(e.to_string()))?;
        let reply = client.round_trip(Destination::Auth, payload).await?;
        match decode_payload::<AuthAck>(&reply) {
            Ok(_) => Ok(client),
            Err(_) => match decode_payload::<ErrorBody>(&reply) {
                Ok(body) => Err(ExitError::new(EXIT_AUTH, body.message)),
                Err(_) => Err(ExitError::new(EXIT_AUTH, "authentication failed")),
            },
        }
    }

    /// Send one CLI request and decode the reply.
    pub async fn call(&mut self, request: &CliRequest) -> Result<CliResponse, ExitError> {
        let payload =
            encode_payload(request).map_err(|e| ExitError::internal(e.to_string()))?;
        let reply = self.round_trip(Destination::Cli, payload).await?;

        if let Ok(response) = decode_payload::<CliResponse>(&reply) {
            return Ok(response);
        }
        match decode_payload::<ErrorBody>(&reply) {
            Ok(body) => Err(body.into()),
            Err(e) => Err(ExitError::new(
                EXIT_INTERNAL,
                format!("unintelligible daemon response: {e}"),
            )),
        }
    }

    async fn round_trip(
        &mut self,
        destination: Destination,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, ExitError> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let frame = Frame::request(destination, request_id, payload);
        write_frame(&mut self.stream, &frame, IPC_TIMEOUT)
            .await
            .map_err(|e| ExitError::internal(format!("write failed: {e}")))?;

        // Skip pushed events; the reply echoes our request id.
        loop {
            let frame = read_frame(&mut self.stream, IPC_TIMEOUT)
                .await
                .map_err(|e| ExitError::internal(format!("read failed: {e}")))?;
            if frame.frame_type == FrameType::Response && frame.request_id == request_id {
                return Ok(frame.payload);
            }
        }
    }
}
