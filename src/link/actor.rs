/*
 * SPDX-FileCopyrightText: 2022 perillamint
 *
 * SPDX-License-Identifier: MPL-2.0
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::heartbeat::Heartbeat;
use super::types::{LinkEvent, LinkMode, LinkState, PeripheralFilter, PeripheralInfo, SerialConfig};
use super::write_queue::{settle, QueuedWrite, WriteQueue, WriteReply};
use crate::codec::{decode_payload, encode_payload};
use crate::config::LinkConfig;
use crate::consts::{PAYLOAD_ENCODING, PING_RESPONSE};
use crate::error::LinkError;
use crate::rpc::{CallHandler, RpcSession};
use crate::timer::TimerSlot;
use crate::transport::{SocketConnector, SocketHalves};
use bytes::Bytes;
use log::{debug, trace, warn};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

#[cfg(feature = "pretty-hex")]
use pretty_hex::*;

/// Receives inbound peripheral data in real-time mode.
pub type DataHandler = Box<dyn FnMut(Bytes) + Send>;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, LinkError>>;

pub(crate) enum Command {
    Scan {
        filter: Option<PeripheralFilter>,
        reply: Reply<()>,
    },
    Connect {
        peripheral_id: String,
        config: SerialConfig,
        reply: Reply<()>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Read {
        handler: DataHandler,
        reply: Reply<()>,
    },
    Send {
        payload: Bytes,
        reply: WriteReply,
    },
    Upload {
        method: &'static str,
        params: Value,
        reply: Reply<()>,
    },
    SetMode(LinkMode),
    MarkAlive,
    Peripherals {
        reply: oneshot::Sender<HashMap<String, PeripheralInfo>>,
    },
}

/// Completions reported back to the actor. Each carries the epoch of the
/// session it belongs to, so traffic from a replaced socket is ignored.
enum Event {
    Opened {
        epoch: u64,
        result: Result<SocketHalves, LinkError>,
    },
    Inbound {
        epoch: u64,
        method: String,
        params: Value,
    },
    Closed {
        epoch: u64,
        error: LinkError,
    },
    RequestFailed {
        epoch: u64,
        method: &'static str,
        error: LinkError,
    },
    ConnectDone {
        epoch: u64,
        result: Result<Value, LinkError>,
        reply: Reply<()>,
    },
    WriteDone {
        epoch: u64,
        seq: u64,
        result: Result<Value, LinkError>,
    },
    UploadDone {
        epoch: u64,
        result: Result<Value, LinkError>,
        reply: Reply<()>,
    },
}

/// Forwards remote calls of one session into the actor.
struct SessionEvents {
    epoch: u64,
    events: mpsc::UnboundedSender<Event>,
}

impl CallHandler for SessionEvents {
    fn did_receive_call(&self, method: &str, params: Value) -> Option<Value> {
        // Liveness probe of the daemon, answered on the spot.
        if method == "ping" {
            return Some(json!(PING_RESPONSE));
        }
        let _ = self.events.send(Event::Inbound {
            epoch: self.epoch,
            method: method.to_string(),
            params,
        });
        None
    }

    fn did_close(&self, error: LinkError) {
        let _ = self.events.send(Event::Closed {
            epoch: self.epoch,
            error,
        });
    }
}

pub(crate) struct LinkActor {
    connector: Arc<dyn SocketConnector>,
    config: LinkConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    notify: broadcast::Sender<LinkEvent>,
    state: watch::Sender<LinkState>,

    epoch: u64,
    session: Option<RpcSession>,
    pending_scan: Option<(PeripheralFilter, Reply<()>)>,
    peripherals: HashMap<String, PeripheralInfo>,
    discovery_timer: TimerSlot,

    mode: LinkMode,
    data_handler: Option<DataHandler>,
    uploading: bool,

    writes: WriteQueue,
    busy_timer: TimerSlot,
    heartbeat: Heartbeat,
}

impl LinkActor {
    pub fn new(
        connector: Arc<dyn SocketConnector>,
        config: LinkConfig,
        commands: mpsc::UnboundedReceiver<Command>,
        notify: broadcast::Sender<LinkEvent>,
        state: watch::Sender<LinkState>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            connector,
            mode: config.mode,
            heartbeat: Heartbeat::new(config.heartbeat.clone()),
            config,
            commands,
            events_tx,
            events_rx,
            notify,
            state,
            epoch: 0,
            session: None,
            pending_scan: None,
            peripherals: HashMap::new(),
            discovery_timer: TimerSlot::default(),
            data_handler: None,
            uploading: false,
            writes: WriteQueue::default(),
            busy_timer: TimerSlot::default(),
        }
    }

    /// Process commands, completions and timers one at a time until every
    /// link handle is dropped.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                _ = self.discovery_timer.fired() => self.on_discovery_timeout(),
                _ = self.busy_timer.fired() => self.on_busy_timeout(),
                _ = self.heartbeat.probe_timer.fired() => self.on_probe_due(),
                _ = self.heartbeat.liveness_timer.fired() => self.on_liveness_timeout(),
            }
        }

        self.teardown();
        debug!("Peripheral link stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Scan { filter, reply } => self.scan(filter, reply),
            Command::Connect {
                peripheral_id,
                config,
                reply,
            } => self.connect(peripheral_id, config, reply),
            Command::Disconnect { reply } => {
                self.teardown();
                let _ = reply.send(());
            }
            Command::Read { handler, reply } => self.read(handler, reply),
            Command::Send { payload, reply } => self.send(payload, reply),
            Command::Upload {
                method,
                params,
                reply,
            } => self.upload(method, params, reply),
            Command::SetMode(mode) => self.set_mode(mode),
            Command::MarkAlive => {
                if self.heartbeat.on_reply() {
                    self.emit(LinkEvent::RealtimeConnectSuccess);
                }
            }
            Command::Peripherals { reply } => {
                let _ = reply.send(self.peripherals.clone());
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Opened { epoch, result } if epoch == self.epoch => self.on_opened(result),
            Event::Inbound {
                epoch,
                method,
                params,
            } if epoch == self.epoch => self.on_inbound(&method, params),
            Event::Closed { epoch, error } if epoch == self.epoch => self.on_connection_lost(error),
            Event::RequestFailed {
                epoch,
                method,
                error,
            } if epoch == self.epoch => {
                warn!("{} request failed: {}", method, error);
                self.emit(LinkEvent::PeripheralRequestError(error.to_string()));
            }
            Event::ConnectDone {
                epoch,
                result,
                reply,
            } => self.on_connect_done(epoch, result, reply),
            Event::WriteDone { epoch, seq, result } if epoch == self.epoch => {
                self.on_write_done(seq, result)
            }
            Event::UploadDone {
                epoch,
                result,
                reply,
            } => {
                if let Err(e) = &result {
                    if epoch == self.epoch {
                        warn!("Upload request failed: {}", e);
                        self.finish_upload();
                    }
                }
                let _ = reply.send(result.map(|_| ()));
            }
            _ => trace!("Ignoring event from a closed session"),
        }
    }

    fn emit(&self, event: LinkEvent) {
        debug!("Event: {:?}", event);
        // Err only means nobody is subscribed.
        let _ = self.notify.send(event);
    }

    fn link_state(&self) -> LinkState {
        *self.state.borrow()
    }

    fn is_connected(&self) -> bool {
        self.link_state() == LinkState::Connected
    }

    fn set_state(&self, state: LinkState) {
        if self.link_state() != state {
            debug!("Link state: {:?} -> {:?}", self.link_state(), state);
            self.state.send_replace(state);
        }
    }

    /// Run `request` in the background and hand its outcome to `report`,
    /// which turns it into an actor event.
    fn spawn_request<F, R>(&self, request: F, report: R)
    where
        F: Future<Output = Result<Value, LinkError>> + Send + 'static,
        R: FnOnce(Result<Value, LinkError>) -> Option<Event> + Send + 'static,
    {
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            if let Some(event) = report(request.await) {
                let _ = events.send(event);
            }
        });
    }

    /// Fire a request whose reply only matters when it fails.
    fn request_or_report(&self, method: &'static str, params: Value) {
        let session = match &self.session {
            Some(session) => session,
            None => return,
        };
        let epoch = self.epoch;
        match session.call(method, params) {
            Ok(request) => self.spawn_request(request, move |result| {
                result.err().map(|error| Event::RequestFailed {
                    epoch,
                    method,
                    error,
                })
            }),
            Err(error) => {
                let _ = self.events_tx.send(Event::RequestFailed {
                    epoch,
                    method,
                    error,
                });
            }
        }
    }

    /// Close the session and cancel everything tied to it.
    /// Returns true if a session was actually closed.
    fn teardown(&mut self) -> bool {
        self.epoch += 1;
        self.discovery_timer.cancel();
        self.busy_timer.cancel();
        self.heartbeat.stop();
        self.uploading = false;
        self.data_handler = None;
        self.writes.fail_all(LinkError::Disconnected);
        if let Some((_, reply)) = self.pending_scan.take() {
            let _ = reply.send(Err(LinkError::Disconnected));
        }
        self.set_state(LinkState::Idle);

        match self.session.take() {
            Some(session) => {
                session.close();
                self.emit(LinkEvent::PeripheralDisconnected);
                true
            }
            None => false,
        }
    }

    fn scan(&mut self, filter: Option<PeripheralFilter>, reply: Reply<()>) {
        if self.teardown() {
            debug!("Rescan closed the previous session");
        }
        self.peripherals.clear();
        self.epoch += 1;
        self.set_state(LinkState::Discovering);

        let filter = filter.unwrap_or_else(|| self.config.filter.clone());
        self.pending_scan = Some((filter, reply));

        let connector = self.connector.clone();
        let events = self.events_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let result = connector.open().await;
            let _ = events.send(Event::Opened { epoch, result });
        });
    }

    fn on_opened(&mut self, result: Result<SocketHalves, LinkError>) {
        let (filter, reply) = match self.pending_scan.take() {
            Some(pending) => pending,
            None => return,
        };

        let halves = match result {
            Ok(halves) => halves,
            Err(e) => {
                warn!("Failed to open link socket: {}", e);
                self.set_state(LinkState::Idle);
                self.emit(LinkEvent::PeripheralRequestError(e.to_string()));
                let _ = reply.send(Err(e));
                return;
            }
        };

        let handler = Arc::new(SessionEvents {
            epoch: self.epoch,
            events: self.events_tx.clone(),
        });
        self.session = Some(RpcSession::start(halves, handler));
        self.request_or_report("discover", json!({ "filters": filter }));
        self.discovery_timer.arm(self.config.discovery_timeout);
        let _ = reply.send(Ok(()));
    }

    fn on_discovery_timeout(&mut self) {
        debug!("Nothing discovered within {:?}", self.config.discovery_timeout);
        self.emit(LinkEvent::PeripheralScanTimeout);
    }

    fn on_inbound(&mut self, method: &str, params: Value) {
        match method {
            "didDiscoverPeripheral" => match serde_json::from_value::<PeripheralInfo>(params) {
                Ok(info) => {
                    debug!("Discovered {}", info.peripheral_id);
                    self.peripherals.insert(info.peripheral_id.clone(), info);
                    self.discovery_timer.cancel();
                    self.emit(LinkEvent::PeripheralListUpdate(self.peripherals.clone()));
                }
                Err(e) => warn!("Bad didDiscoverPeripheral params: {}", e),
            },
            "peripheralUnplug" => {
                self.on_connection_lost(LinkError::IOFailure("Peripheral unplugged".to_string()))
            }
            "onMessage" => self.on_message(params),
            "uploadStdout" => self.emit(LinkEvent::UploadStdout(message_text(&params))),
            "uploadError" => {
                self.emit(LinkEvent::UploadError(message_text(&params)));
                self.finish_upload();
            }
            "uploadSuccess" => {
                self.emit(LinkEvent::UploadSuccess);
                self.finish_upload();
            }
            other => debug!("Unhandled call {}: {}", other, params),
        }
    }

    /// Transport failure or unplug. Terminal for the session.
    fn on_connection_lost(&mut self, error: LinkError) {
        let was_connected = self.is_connected();
        warn!("Link lost: {}", error);
        self.teardown();
        if was_connected {
            self.emit(LinkEvent::PeripheralConnectionLost);
        } else {
            self.emit(LinkEvent::PeripheralRequestError(error.to_string()));
        }
    }

    fn connect(&mut self, peripheral_id: String, config: SerialConfig, reply: Reply<()>) {
        let session = match &self.session {
            Some(session) => session,
            None => {
                let _ = reply.send(Err(LinkError::NoSession));
                return;
            }
        };

        let params = json!({ "peripheralId": peripheral_id, "peripheralConfig": config });
        match session.call("connect", params) {
            Ok(request) => {
                let epoch = self.epoch;
                self.spawn_request(request, move |result| {
                    Some(Event::ConnectDone {
                        epoch,
                        result,
                        reply,
                    })
                });
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn on_connect_done(&mut self, epoch: u64, result: Result<Value, LinkError>, reply: Reply<()>) {
        if epoch != self.epoch {
            let _ = reply.send(Err(LinkError::Disconnected));
            return;
        }

        match result {
            Ok(_) => {
                self.discovery_timer.cancel();
                self.set_state(LinkState::Connected);
                self.emit(LinkEvent::PeripheralConnected);
                if self.mode == LinkMode::RealTime {
                    self.heartbeat.start();
                }
                let _ = reply.send(Ok(()));
            }
            Err(e) => {
                warn!("Connect failed: {}", e);
                self.emit(LinkEvent::PeripheralRequestError(e.to_string()));
                let _ = reply.send(Err(e));
            }
        }
    }

    fn read(&mut self, handler: DataHandler, reply: Reply<()>) {
        let session = match (&self.session, self.is_connected()) {
            (Some(session), true) => session,
            _ => {
                let _ = reply.send(Err(LinkError::NotConnected));
                return;
            }
        };

        match session.call("read", Value::Null) {
            Ok(request) => {
                self.data_handler = Some(handler);
                tokio::spawn(async move {
                    let _ = reply.send(request.await.map(|_| ()));
                });
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn on_message(&mut self, params: Value) {
        if !self.is_connected() {
            trace!("Dropping data received while not connected");
            return;
        }

        let message = params.get("message").and_then(Value::as_str).unwrap_or("");
        let encoding = params.get("encoding").and_then(Value::as_str);
        let data = match decode_payload(message, encoding) {
            Ok(data) => data,
            Err(e) => {
                warn!("Dropping peripheral data: {}", e);
                return;
            }
        };

        #[cfg(feature = "pretty-hex")]
        trace!("Peripheral RX: {}", data.hex_dump());

        // Routed on the mode current at delivery time.
        match self.mode {
            LinkMode::RealTime => match self.data_handler.as_mut() {
                Some(handler) => handler(data),
                None => trace!("No read handler, dropping {} bytes", data.len()),
            },
            LinkMode::Upload => self.emit(LinkEvent::PeripheralDataReceived(data)),
        }
    }

    fn send(&mut self, payload: Bytes, reply: WriteReply) {
        if !self.is_connected() {
            debug!("Not connected, dropping {} byte write", payload.len());
            settle(reply, Ok(()));
            return;
        }

        if self.writes.is_busy() {
            self.writes.push(QueuedWrite { payload, reply });
            trace!("Link busy, {} writes queued", self.writes.len());
            return;
        }

        self.dispatch_write(payload, reply);
    }

    fn dispatch_write(&mut self, payload: Bytes, reply: WriteReply) {
        let session = match &self.session {
            Some(session) => session,
            None => {
                settle(reply, Err(LinkError::NotConnected));
                return;
            }
        };

        #[cfg(feature = "pretty-hex")]
        trace!("Peripheral TX: {}", payload.hex_dump());

        let params = json!({
            "message": encode_payload(&payload),
            "encoding": PAYLOAD_ENCODING,
        });
        match session.call("write", params) {
            Ok(request) => {
                let seq = self.writes.begin(reply);
                self.busy_timer.arm(self.config.busy_timeout);
                let epoch = self.epoch;
                self.spawn_request(request, move |result| {
                    Some(Event::WriteDone { epoch, seq, result })
                });
            }
            Err(e) => settle(reply, Err(e)),
        }
    }

    fn on_write_done(&mut self, seq: u64, result: Result<Value, LinkError>) {
        if let Err(e) = &result {
            warn!("Write #{} failed: {}", seq, e);
        }
        if !self.writes.complete(seq, result.map(|_| ())) {
            debug!("Ignoring completion of expired write #{}", seq);
            return;
        }
        self.busy_timer.cancel();
        self.pump_writes();
    }

    fn on_busy_timeout(&mut self) {
        let timeout = self.config.busy_timeout;
        if self.writes.expire(LinkError::WriteTimeout(timeout)) {
            warn!("Write not acknowledged within {:?}, releasing busy flag", timeout);
        }
        self.pump_writes();
    }

    fn pump_writes(&mut self) {
        while !self.writes.is_busy() {
            match self.writes.pop() {
                Some(write) => self.send(write.payload, write.reply),
                None => break,
            }
        }
    }

    fn set_mode(&mut self, mode: LinkMode) {
        if self.mode == mode {
            return;
        }
        debug!("Mode: {:?} -> {:?}", self.mode, mode);
        self.mode = mode;

        match mode {
            LinkMode::RealTime if self.is_connected() && !self.uploading => {
                self.heartbeat.start();
            }
            LinkMode::RealTime => {}
            LinkMode::Upload => self.heartbeat.stop(),
        }
    }

    fn on_probe_due(&mut self) {
        if let Some(probe) = self.heartbeat.on_probe_due() {
            self.send(probe, None);
        }
    }

    fn on_liveness_timeout(&mut self) {
        if self.heartbeat.on_liveness_expired() {
            self.emit(LinkEvent::RealtimeConnectionLost(
                "No reply from the device firmware. \
                 Make sure the board runs the real-time firmware."
                    .to_string(),
            ));
        }
    }

    fn upload(&mut self, method: &'static str, params: Value, reply: Reply<()>) {
        let session = match (&self.session, self.is_connected()) {
            (Some(session), true) => session,
            _ => {
                let _ = reply.send(Err(LinkError::NotConnected));
                return;
            }
        };

        match session.call(method, params) {
            Ok(request) => {
                // The board resets while flashing; probing would only report a loss.
                self.heartbeat.stop();
                self.uploading = true;
                let epoch = self.epoch;
                self.spawn_request(request, move |result| {
                    Some(Event::UploadDone {
                        epoch,
                        result,
                        reply,
                    })
                });
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn finish_upload(&mut self) {
        if !self.uploading {
            return;
        }
        self.uploading = false;
        if self.is_connected() && self.mode == LinkMode::RealTime {
            self.heartbeat.start();
        }
    }
}

/// `message` field of an upload notification, or the raw params.
fn message_text(params: &Value) -> String {
    match params.get("message") {
        Some(Value::String(message)) => message.clone(),
        _ => match params {
            Value::String(message) => message.clone(),
            other => other.to_string(),
        },
    }
}
