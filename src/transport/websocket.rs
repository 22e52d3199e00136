/*
 * SPDX-FileCopyrightText: 2022 perillamint
 *
 * SPDX-License-Identifier: MPL-2.0
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::{MessageReceiver, MessageSender, SocketConnector, SocketHalves};
use crate::error::LinkError;
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, trace, warn};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl SocketConnector for WebSocketConnector {
    async fn open(&self) -> Result<SocketHalves, LinkError> {
        let (socket, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| LinkError::SocketOpen(format!("{}: {}", self.url, e)))?;
        debug!("WebSocket open: {}", self.url);

        let (sink, stream) = socket.split();
        Ok((
            Box::new(WebSocketSender { sink, closed: false }),
            Box::new(WebSocketReceiver { stream }),
        ))
    }
}

pub struct WebSocketSender {
    sink: SplitSink<Socket, Message>,
    closed: bool,
}

#[async_trait]
impl MessageSender for WebSocketSender {
    async fn send_message(&mut self, message: String) -> Result<(), LinkError> {
        trace!("WS TX: {}", message);
        self.sink
            .send(Message::Text(message))
            .await
            .map_err(|e| LinkError::IOFailure(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), LinkError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.sink
            .close()
            .await
            .map_err(|e| LinkError::IOFailure(e.to_string()))
    }
}

pub struct WebSocketReceiver {
    stream: SplitStream<Socket>,
}

#[async_trait]
impl MessageReceiver for WebSocketReceiver {
    async fn receive_message(&mut self) -> Result<Option<String>, LinkError> {
        loop {
            let message = match self.stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(LinkError::IOFailure(e.to_string())),
                None => return Ok(None),
            };

            match message {
                Message::Text(text) => {
                    trace!("WS RX: {}", text);
                    return Ok(Some(text));
                }
                Message::Binary(data) => match String::from_utf8(data) {
                    Ok(text) => {
                        trace!("WS RX: {}", text);
                        return Ok(Some(text));
                    }
                    Err(e) => warn!("Skipping binary frame that is not UTF-8: {}", e),
                },
                Message::Close(frame) => {
                    debug!("WebSocket closed by remote: {:?}", frame);
                    return Ok(None);
                }
                // Control frames are answered by tungstenite itself.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[test_log::test(tokio::test)]
    async fn undecodable_binary_frame_is_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let daemon = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = accept_async(stream).await.unwrap();
            socket.send(Message::Binary(vec![0xff, 0xfe])).await.unwrap();
            socket
                .send(Message::Binary(b"{\"method\":\"ping\"}".to_vec()))
                .await
                .unwrap();
            socket
                .send(Message::Text("{\"method\":\"read\"}".to_string()))
                .await
                .unwrap();
            let _ = socket.close(None).await;
        });

        let connector = WebSocketConnector::new(&format!("ws://{}", addr));
        let (_sender, mut receiver) = connector.open().await.unwrap();
        assert_eq!(
            receiver.receive_message().await,
            Ok(Some("{\"method\":\"ping\"}".to_string()))
        );
        assert_eq!(
            receiver.receive_message().await,
            Ok(Some("{\"method\":\"read\"}".to_string()))
        );
        assert_eq!(receiver.receive_message().await, Ok(None));

        daemon.await.unwrap();
    }
}
