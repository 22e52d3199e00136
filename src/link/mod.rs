/*
 * SPDX-FileCopyrightText: 2022 perillamint
 *
 * SPDX-License-Identifier: MPL-2.0
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Peripheral discovery, connection and busy-gated writes over an RPC session.

mod actor;
mod heartbeat;
mod types;
mod write_queue;

pub use actor::DataHandler;
pub use types::{LinkEvent, LinkMode, LinkState, PeripheralFilter, PeripheralInfo, SerialConfig};

use crate::codec::encode_payload;
use crate::config::LinkConfig;
use crate::consts::PAYLOAD_ENCODING;
use crate::error::LinkError;
use crate::transport::SocketConnector;
use actor::{Command, LinkActor};
use bytes::Bytes;
use futures::Stream;
use log::warn;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// Handle to one peripheral link.
///
/// The link state lives in a background task; handles are cheap to clone and
/// the task stops (closing the socket) once every handle is dropped.
#[derive(Clone)]
pub struct PeripheralLink {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<LinkState>,
    events: broadcast::Sender<LinkEvent>,
}

impl PeripheralLink {
    /// Spawn the link task. Must be called from within a tokio runtime.
    pub fn new<C: SocketConnector + 'static>(connector: C, config: LinkConfig) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(LinkState::Idle);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let actor = LinkActor::new(
            Arc::new(connector),
            config,
            commands_rx,
            events.clone(),
            state_tx,
        );
        tokio::spawn(actor.run());

        Self {
            commands,
            state,
            events,
        }
    }

    /// Subscribe to link events. Only events emitted after this call are seen.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Link events as a stream. Events missed by a lagging consumer are
    /// skipped with a warning.
    pub fn events(&self) -> impl Stream<Item = LinkEvent> + Send + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(|event| match event {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                warn!("Event consumer lagged behind, {} events dropped", missed);
                None
            }
        })
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// True iff a `connect` succeeded and no disconnect or link loss happened since.
    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    fn post(&self, command: Command) -> Result<(), LinkError> {
        self.commands
            .send(command)
            .map_err(|_| LinkError::LinkStopped)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, LinkError>>) -> Command,
    ) -> Result<T, LinkError> {
        let (reply, rx) = oneshot::channel();
        self.post(make(reply))?;
        rx.await.map_err(|_| LinkError::LinkStopped)?
    }

    /// Start a fresh discovery pass.
    ///
    /// Any existing session is torn down first and the peripheral list is
    /// cleared. Resolves once the socket is open and `discover` was sent;
    /// results arrive as `PeripheralListUpdate` events. Uses the configured
    /// filter when `filter` is None.
    pub async fn scan(&self, filter: Option<PeripheralFilter>) -> Result<(), LinkError> {
        self.request(|reply| Command::Scan { filter, reply }).await
    }

    /// Connect to a discovered peripheral.
    pub async fn connect(&self, peripheral_id: &str, config: SerialConfig) -> Result<(), LinkError> {
        let peripheral_id = peripheral_id.to_string();
        self.request(|reply| Command::Connect {
            peripheral_id,
            config,
            reply,
        })
        .await
    }

    /// Close the session and cancel every timer. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.post(Command::Disconnect { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Peripherals discovered during the current scan.
    pub async fn peripherals(&self) -> Result<HashMap<String, PeripheralInfo>, LinkError> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::Peripherals { reply })?;
        rx.await.map_err(|_| LinkError::LinkStopped)
    }

    /// Start streaming peripheral data. In real-time mode each inbound chunk
    /// is passed to `on_message`; in upload mode it is published as
    /// `PeripheralDataReceived` instead. The handler is dropped on disconnect.
    pub async fn read<F>(&self, on_message: F) -> Result<(), LinkError>
    where
        F: FnMut(Bytes) + Send + 'static,
    {
        let handler: DataHandler = Box::new(on_message);
        self.request(|reply| Command::Read { handler, reply }).await
    }

    /// Queue a payload for the peripheral.
    ///
    /// The payload is queued before this returns, so call order is write
    /// order. The future resolves when the write was acknowledged, and may be
    /// dropped for fire-and-forget use. While not connected the payload is
    /// dropped and the future resolves Ok.
    pub fn send(
        &self,
        payload: impl Into<Bytes>,
    ) -> impl Future<Output = Result<(), LinkError>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        let posted = self.post(Command::Send {
            payload: payload.into(),
            reply: Some(reply),
        });
        async move {
            posted?;
            rx.await.map_err(|_| LinkError::LinkStopped)?
        }
    }

    /// Flash a compiled program. `config` describes the board build and is
    /// passed through untouched.
    pub async fn upload(&self, program: &[u8], config: Value) -> Result<(), LinkError> {
        let params = json!({
            "message": encode_payload(program),
            "config": config,
            "encoding": PAYLOAD_ENCODING,
        });
        self.request(|reply| Command::Upload {
            method: "upload",
            params,
            reply,
        })
        .await
    }

    /// Flash the real-time firmware described by `config`.
    pub async fn upload_firmware(&self, config: Value) -> Result<(), LinkError> {
        self.request(|reply| Command::Upload {
            method: "uploadFirmware",
            params: config,
            reply,
        })
        .await
    }

    /// Switch between real-time and upload mode. Entering real-time mode while
    /// connected restarts the heartbeat; leaving it stops the heartbeat.
    pub fn set_mode(&self, mode: LinkMode) {
        let _ = self.post(Command::SetMode(mode));
    }

    /// Report that the firmware answered a heartbeat probe.
    pub fn mark_alive(&self) {
        let _ = self.post(Command::MarkAlive);
    }
}
