/*
 * SPDX-FileCopyrightText: 2022 perillamint
 *
 * SPDX-License-Identifier: MPL-2.0
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::message::{Incoming, Request, Response};
use crate::error::LinkError;
use crate::transport::{MessageReceiver, MessageSender, SocketHalves};
use log::{debug, trace, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Receiver of remote-initiated traffic.
pub trait CallHandler: Send + Sync + 'static {
    /// Called for every inbound call or notification, on the session's reader task.
    /// The returned value answers calls that carry an id (`null` when None).
    fn did_receive_call(&self, method: &str, params: Value) -> Option<Value>;
    /// Called once when the socket fails or the remote closes it.
    /// Not called for a local `close()`.
    fn did_close(&self, error: LinkError);
}

type Waiter = oneshot::Sender<Result<Value, LinkError>>;

struct Shared {
    next_id: AtomicU64,
    /// In-flight requests by id. None once the session is torn down.
    pending: Mutex<Option<HashMap<u64, Waiter>>>,
    outbound: mpsc::UnboundedSender<String>,
    shutdown: CancellationToken,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, Option<HashMap<u64, Waiter>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tear down and reject everything in flight.
    /// Returns false if the session was already torn down.
    fn shutdown(&self, error: LinkError) -> bool {
        let drained = self.pending().take();
        self.shutdown.cancel();

        match drained {
            Some(table) => {
                debug!("RPC session down ({}), rejecting {} requests", error, table.len());
                for (_, waiter) in table {
                    let _ = waiter.send(Err(error.clone()));
                }
                true
            }
            None => false,
        }
    }

    fn dispatch(&self, text: &str, handler: &dyn CallHandler) {
        match Incoming::parse(text) {
            Ok(Incoming::Call { id, method, params }) => {
                trace!("RPC call in: {} {}", method, params);
                let result = handler.did_receive_call(&method, params);
                if let Some(id) = id {
                    let response = Response::result(id, result.unwrap_or(Value::Null));
                    match serde_json::to_string(&response) {
                        Ok(text) => {
                            let _ = self.outbound.send(text);
                        }
                        Err(e) => warn!("Failed to encode response to {}: {}", method, e),
                    }
                }
            }
            Ok(Incoming::Reply { id, outcome }) => {
                let waiter = self.pending().as_mut().and_then(|table| table.remove(&id));
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(outcome);
                    }
                    None => warn!("Dropping reply for unknown request {}", id),
                }
            }
            Err(e) => warn!("Skipping inbound message: {}", e),
        }
    }
}

/// JSON-RPC session over one message socket.
///
/// Requests are matched to replies strictly by id. Dropping the session
/// closes it.
pub struct RpcSession {
    shared: Arc<Shared>,
}

impl RpcSession {
    /// Spawn the reader and writer tasks for an opened socket.
    pub fn start(halves: SocketHalves, handler: Arc<dyn CallHandler>) -> Self {
        let (sender, receiver) = halves;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            next_id: AtomicU64::new(0),
            pending: Mutex::new(Some(HashMap::new())),
            outbound,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(write_loop(
            shared.clone(),
            sender,
            outbound_rx,
            handler.clone(),
        ));
        tokio::spawn(read_loop(shared.clone(), receiver, handler));

        Self { shared }
    }

    /// Register and transmit a request right away. The returned future
    /// resolves with the reply, or with the error that tore the session down.
    pub fn call(
        &self,
        method: &str,
        params: Value,
    ) -> Result<impl Future<Output = Result<Value, LinkError>> + Send + 'static, LinkError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let text = serde_json::to_string(&Request::call(id, method, params))
            .map_err(|e| LinkError::Protocol(e.to_string()))?;

        let (waiter, reply) = oneshot::channel();
        self.shared
            .pending()
            .as_mut()
            .ok_or(LinkError::SessionClosed)?
            .insert(id, waiter);

        trace!("RPC call out: #{} {}", id, method);
        if self.shared.outbound.send(text).is_err() {
            if let Some(table) = self.shared.pending().as_mut() {
                table.remove(&id);
            }
            return Err(LinkError::SessionClosed);
        }

        Ok(async move { reply.await.unwrap_or(Err(LinkError::SessionClosed)) })
    }

    pub async fn send_remote_request(&self, method: &str, params: Value) -> Result<Value, LinkError> {
        self.call(method, params)?.await
    }

    pub fn send_remote_notification(&self, method: &str, params: Value) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::SessionClosed);
        }
        let text = serde_json::to_string(&Request::notification(method, params))
            .map_err(|e| LinkError::Protocol(e.to_string()))?;
        self.shared
            .outbound
            .send(text)
            .map_err(|_| LinkError::SessionClosed)
    }

    /// Close the socket. Every pending request is rejected before this returns.
    pub fn close(&self) {
        self.shared.shutdown(LinkError::SessionClosed);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.pending().as_ref().map_or(0, HashMap::len)
    }
}

impl Drop for RpcSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    mut receiver: Box<dyn MessageReceiver>,
    handler: Arc<dyn CallHandler>,
) {
    let error = loop {
        let received = tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            received = receiver.receive_message() => received,
        };

        match received {
            Ok(Some(text)) => shared.dispatch(&text, handler.as_ref()),
            Ok(None) => break LinkError::SocketClosed,
            Err(e) => break e,
        }
    };

    if shared.shutdown(error.clone()) {
        handler.did_close(error);
    }
}

async fn write_loop(
    shared: Arc<Shared>,
    mut sender: Box<dyn MessageSender>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    handler: Arc<dyn CallHandler>,
) {
    loop {
        let message = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            message = outbound.recv() => message,
        };
        let message = match message {
            Some(message) => message,
            None => break,
        };

        if let Err(e) = sender.send_message(message).await {
            if shared.shutdown(e.clone()) {
                handler.did_close(e);
            }
            break;
        }
    }

    if let Err(e) = sender.close().await {
        debug!("Closing socket failed: {}", e);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::memory::{self, MemoryPeer};
    use crate::transport::SocketConnector;
    use futures::FutureExt;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, Value)>>,
        closed: Mutex<Vec<LinkError>>,
    }

    impl CallHandler for Recorder {
        fn did_receive_call(&self, method: &str, params: Value) -> Option<Value> {
            self.calls.lock().unwrap().push((method.to_string(), params));
            match method {
                "echo" => Some(json!("echoed")),
                _ => None,
            }
        }

        fn did_close(&self, error: LinkError) {
            self.closed.lock().unwrap().push(error);
        }
    }

    async fn open() -> (RpcSession, MemoryPeer, Arc<Recorder>) {
        let (connector, mut listener) = memory::listener();
        let halves = connector.open().await.unwrap();
        let recorder = Arc::new(Recorder::default());
        let session = RpcSession::start(halves, recorder.clone());
        let peer = listener.accept().await.unwrap();
        (session, peer, recorder)
    }

    #[test_log::test(tokio::test)]
    async fn replies_are_matched_by_id() {
        let (session, mut peer, _) = open().await;

        let first = session.call("connect", json!({"peripheralId": "P1"})).unwrap();
        let second = session.call("read", Value::Null).unwrap();

        let call_a = peer.next_call().await.unwrap();
        let call_b = peer.next_call().await.unwrap();
        assert_eq!(call_a.method, "connect");
        assert_eq!(call_b.method, "read");

        // Answer in reverse order.
        peer.reply(call_b.id.as_ref().unwrap(), json!("b"));
        peer.reply(call_a.id.as_ref().unwrap(), json!("a"));

        assert_eq!(first.await, Ok(json!("a")));
        assert_eq!(second.await, Ok(json!("b")));
        assert_eq!(session.pending_requests(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn remote_error_only_fails_its_request() {
        let (session, mut peer, recorder) = open().await;

        let failing = session.call("write", json!({})).unwrap();
        let passing = session.call("write", json!({})).unwrap();
        let call_a = peer.next_call().await.unwrap();
        let call_b = peer.next_call().await.unwrap();

        peer.reply_error(call_a.id.as_ref().unwrap(), json!({"message": "busy"}));
        peer.reply(call_b.id.as_ref().unwrap(), Value::Null);

        assert_eq!(failing.await, Err(LinkError::Remote("busy".to_string())));
        assert_eq!(passing.await, Ok(Value::Null));
        assert!(!session.is_closed());
        assert!(recorder.closed.lock().unwrap().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn close_settles_every_pending_request() {
        let (session, mut peer, recorder) = open().await;

        let calls: Vec<_> = (0..8)
            .map(|_| session.call("discover", Value::Null).unwrap())
            .collect();
        assert_eq!(session.pending_requests(), 8);

        session.close();
        for call in calls {
            assert_eq!(call.now_or_never(), Some(Err(LinkError::SessionClosed)));
        }
        assert!(session.is_closed());
        assert!(matches!(
            session.call("discover", Value::Null),
            Err(LinkError::SessionClosed)
        ));

        peer.closed().await;
        assert!(recorder.closed.lock().unwrap().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn remote_hang_up_rejects_and_notifies_once() {
        let (session, mut peer, recorder) = open().await;

        let call = session.call("connect", Value::Null).unwrap();
        peer.next_call().await.unwrap();
        peer.hang_up();

        assert_eq!(call.await, Err(LinkError::SocketClosed));
        session.close();
        assert_eq!(
            *recorder.closed.lock().unwrap(),
            vec![LinkError::SocketClosed]
        );
    }

    #[test_log::test(tokio::test)]
    async fn socket_error_is_reported() {
        let (session, mut peer, recorder) = open().await;

        let call = session.call("connect", Value::Null).unwrap();
        peer.fail(LinkError::IOFailure("reset".to_string()));

        assert_eq!(call.await, Err(LinkError::IOFailure("reset".to_string())));
        assert_eq!(
            *recorder.closed.lock().unwrap(),
            vec![LinkError::IOFailure("reset".to_string())]
        );
    }

    #[test_log::test(tokio::test)]
    async fn inbound_calls_reach_handler_and_get_answered() {
        let (session, mut peer, recorder) = open().await;

        peer.send_text("{broken".to_string());
        peer.notify("onMessage", json!({"message": "AQI="}));
        peer.call(json!(10), "echo", Value::Null);
        peer.call(json!(11), "unknown", Value::Null);

        assert_eq!(
            peer.recv_json().await,
            Some(json!({"jsonrpc": "2.0", "id": 10, "result": "echoed"}))
        );
        assert_eq!(
            peer.recv_json().await,
            Some(json!({"jsonrpc": "2.0", "id": 11, "result": null}))
        );

        let calls = recorder.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0], ("onMessage".to_string(), json!({"message": "AQI="})));
        assert!(!session.is_closed());
    }

    #[test_log::test(tokio::test)]
    async fn notifications_carry_no_id() {
        let (session, mut peer, _) = open().await;

        session
            .send_remote_notification("read", Value::Null)
            .unwrap();
        let call = peer.next_call().await.unwrap();
        assert_eq!(call.method, "read");
        assert_eq!(call.id, None);

        session.close();
        assert_eq!(
            session.send_remote_notification("read", Value::Null),
            Err(LinkError::SessionClosed)
        );
    }
}
