/*
 * SPDX-FileCopyrightText: 2022 perillamint
 *
 * SPDX-License-Identifier: MPL-2.0
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! In-process sockets. The listener side plays the link daemon, which is
//! handy for tests and for adapters that simulate a board.

use super::{MessageReceiver, MessageSender, SocketConnector, SocketHalves};
use crate::error::LinkError;
use async_trait::async_trait;
use log::trace;
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Create a connected connector / listener pair.
pub fn listener() -> (MemoryConnector, MemoryListener) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    (
        MemoryConnector { accept_tx },
        MemoryListener { accept_rx },
    )
}

#[derive(Clone)]
pub struct MemoryConnector {
    accept_tx: UnboundedSender<MemoryPeer>,
}

#[async_trait]
impl SocketConnector for MemoryConnector {
    async fn open(&self) -> Result<SocketHalves, LinkError> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let peer = MemoryPeer {
            outbound: outbound_rx,
            inbound: Some(inbound_tx),
        };
        self.accept_tx
            .send(peer)
            .map_err(|_| LinkError::SocketOpen("Memory listener is gone".to_string()))?;

        Ok((
            Box::new(MemorySender {
                outbound: Some(outbound_tx),
            }),
            Box::new(MemoryReceiver {
                inbound: inbound_rx,
            }),
        ))
    }
}

pub struct MemoryListener {
    accept_rx: UnboundedReceiver<MemoryPeer>,
}

impl MemoryListener {
    /// Wait for the next socket opened through the connector.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }

    /// Take an already opened socket, if any.
    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.try_recv().ok()
    }
}

/// A call or notification sent by the client side.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerCall {
    pub id: Option<Value>,
    pub method: String,
    pub params: Value,
}

/// Daemon side of one in-memory socket.
pub struct MemoryPeer {
    outbound: UnboundedReceiver<String>,
    inbound: Option<UnboundedSender<Result<String, LinkError>>>,
}

impl MemoryPeer {
    /// Next raw message written by the client. None once the client closed the socket.
    pub async fn recv_text(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    /// Next message written by the client, parsed as JSON.
    /// Unparseable text is skipped.
    pub async fn recv_json(&mut self) -> Option<Value> {
        loop {
            let text = self.recv_text().await?;
            if let Ok(value) = serde_json::from_str(&text) {
                return Some(value);
            }
        }
    }

    /// Next request or notification written by the client, skipping replies.
    pub async fn next_call(&mut self) -> Option<PeerCall> {
        loop {
            let mut value = self.recv_json().await?;
            let method = match value.get("method").and_then(Value::as_str) {
                Some(method) => method.to_string(),
                None => continue,
            };
            return Some(PeerCall {
                id: value.get("id").cloned(),
                method,
                params: value.get_mut("params").map(Value::take).unwrap_or(Value::Null),
            });
        }
    }

    /// Resolves once the client closed its side of the socket.
    pub async fn closed(&mut self) {
        while self.outbound.recv().await.is_some() {}
    }

    pub fn send_text(&self, text: String) {
        if let Some(inbound) = &self.inbound {
            trace!("Memory peer TX: {}", text);
            let _ = inbound.send(Ok(text));
        }
    }

    pub fn reply(&self, id: &Value, result: Value) {
        self.send_text(json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string());
    }

    pub fn reply_error(&self, id: &Value, error: Value) {
        self.send_text(json!({"jsonrpc": "2.0", "id": id, "error": error}).to_string());
    }

    pub fn notify(&self, method: &str, params: Value) {
        self.send_text(json!({"jsonrpc": "2.0", "method": method, "params": params}).to_string());
    }

    pub fn call(&self, id: Value, method: &str, params: Value) {
        self.send_text(
            json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}).to_string(),
        );
    }

    /// Report a socket error to the client.
    pub fn fail(&mut self, error: LinkError) {
        if let Some(inbound) = self.inbound.take() {
            let _ = inbound.send(Err(error));
        }
    }

    /// Close the socket from the daemon side.
    pub fn hang_up(&mut self) {
        self.inbound = None;
    }
}

pub struct MemorySender {
    outbound: Option<UnboundedSender<String>>,
}

#[async_trait]
impl MessageSender for MemorySender {
    async fn send_message(&mut self, message: String) -> Result<(), LinkError> {
        let outbound = self.outbound.as_ref().ok_or(LinkError::SocketClosed)?;
        outbound.send(message).map_err(|_| LinkError::SocketClosed)
    }

    async fn close(&mut self) -> Result<(), LinkError> {
        self.outbound = None;
        Ok(())
    }
}

pub struct MemoryReceiver {
    inbound: UnboundedReceiver<Result<String, LinkError>>,
}

#[async_trait]
impl MessageReceiver for MemoryReceiver {
    async fn receive_message(&mut self) -> Result<Option<String>, LinkError> {
        match self.inbound.recv().await {
            Some(Ok(text)) => Ok(Some(text)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn messages_flow_both_ways() {
        let (connector, mut listener) = listener();
        let (mut sender, mut receiver) = connector.open().await.unwrap();
        let mut peer = listener.accept().await.unwrap();

        sender
            .send_message(r#"{"jsonrpc":"2.0","method":"read","id":0}"#.to_string())
            .await
            .unwrap();
        let call = peer.next_call().await.unwrap();
        assert_eq!(call.method, "read");
        assert_eq!(call.id, Some(json!(0)));

        peer.notify("onMessage", json!({"message": "AQI="}));
        let text = receiver.receive_message().await.unwrap().unwrap();
        assert!(text.contains("onMessage"));
    }

    #[tokio::test]
    async fn close_is_observed_by_both_sides() {
        let (connector, mut listener) = listener();
        let (mut sender, mut receiver) = connector.open().await.unwrap();
        let mut peer = listener.accept().await.unwrap();

        sender.close().await.unwrap();
        sender.close().await.unwrap();
        peer.closed().await;
        assert_eq!(
            sender.send_message("late".to_string()).await,
            Err(LinkError::SocketClosed)
        );

        peer.hang_up();
        assert_eq!(receiver.receive_message().await, Ok(None));
    }

    #[tokio::test]
    async fn open_fails_without_listener() {
        let (connector, listener) = listener();
        drop(listener);
        assert!(matches!(
            connector.open().await,
            Err(LinkError::SocketOpen(_))
        ));
    }
}
