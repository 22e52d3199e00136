/*
 * SPDX-FileCopyrightText: 2022 perillamint
 *
 * SPDX-License-Identifier: MPL-2.0
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::error::LinkError;
use async_trait::async_trait;

pub mod memory;
#[cfg(feature = "websocket")]
pub mod websocket;

/// Both halves of an opened message socket.
pub type SocketHalves = (Box<dyn MessageSender>, Box<dyn MessageReceiver>);

/// Opens message-oriented sockets to the link daemon.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    /// Open a fresh socket. Every call must produce an independent connection.
    async fn open(&self) -> Result<SocketHalves, LinkError>;
}

/// Write half of a message socket.
#[async_trait]
pub trait MessageSender: Send {
    /// Send one text message.
    async fn send_message(&mut self, message: String) -> Result<(), LinkError>;
    /// Close the socket. Closing twice is not an error.
    async fn close(&mut self) -> Result<(), LinkError>;
}

/// Read half of a message socket.
#[async_trait]
pub trait MessageReceiver: Send {
    /// Wait for the next text message. Returns Ok(None) once the socket was closed.
    async fn receive_message(&mut self) -> Result<Option<String>, LinkError>;
}
