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
use bytes::Bytes;
use std::collections::VecDeque;
use tokio::sync::oneshot;

/// Completion of a write. None for writes nobody waits on (heartbeat probes).
pub(crate) type WriteReply = Option<oneshot::Sender<Result<(), LinkError>>>;

pub(crate) fn settle(reply: WriteReply, outcome: Result<(), LinkError>) {
    if let Some(reply) = reply {
        let _ = reply.send(outcome);
    }
}

pub(crate) struct QueuedWrite {
    pub payload: Bytes,
    pub reply: WriteReply,
}

struct InFlight {
    seq: u64,
    reply: WriteReply,
}

/// Single-flight FIFO of outbound payloads.
///
/// At most one write is in flight. The rest wait in submission order until
/// the in-flight one completes or expires.
#[derive(Default)]
pub(crate) struct WriteQueue {
    in_flight: Option<InFlight>,
    pending: VecDeque<QueuedWrite>,
    next_seq: u64,
}

impl WriteQueue {
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn push(&mut self, write: QueuedWrite) {
        self.pending.push_back(write);
    }

    /// Oldest queued write, only while nothing is in flight.
    pub fn pop(&mut self) -> Option<QueuedWrite> {
        if self.is_busy() {
            return None;
        }
        self.pending.pop_front()
    }

    /// Mark a write as dispatched. Returns its sequence number.
    pub fn begin(&mut self, reply: WriteReply) -> u64 {
        debug_assert!(self.in_flight.is_none(), "second write dispatched while busy");
        let seq = self.next_seq;
        self.next_seq += 1;
        self.in_flight = Some(InFlight { seq, reply });
        seq
    }

    /// Settle the in-flight write if it is `seq`.
    /// Returns false for completions of writes that already expired.
    pub fn complete(&mut self, seq: u64, outcome: Result<(), LinkError>) -> bool {
        match self.in_flight.take() {
            Some(in_flight) if in_flight.seq == seq => {
                settle(in_flight.reply, outcome);
                true
            }
            other => {
                self.in_flight = other;
                false
            }
        }
    }

    /// Give up on the in-flight write. Returns false if nothing was in flight.
    pub fn expire(&mut self, error: LinkError) -> bool {
        match self.in_flight.take() {
            Some(in_flight) => {
                settle(in_flight.reply, Err(error));
                true
            }
            None => false,
        }
    }

    /// Settle the in-flight write and every queued one with `error`.
    pub fn fail_all(&mut self, error: LinkError) {
        self.expire(error.clone());
        for write in self.pending.drain(..) {
            settle(write.reply, Err(error.clone()));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn queued(byte: u8) -> (QueuedWrite, oneshot::Receiver<Result<(), LinkError>>) {
        let (tx, rx) = oneshot::channel();
        (
            QueuedWrite {
                payload: Bytes::from(vec![byte]),
                reply: Some(tx),
            },
            rx,
        )
    }

    #[test]
    fn drains_in_submission_order() {
        let mut queue = WriteQueue::default();
        for byte in 0..4 {
            queue.push(queued(byte).0);
        }

        let mut order = vec![];
        while let Some(write) = queue.pop() {
            order.push(write.payload[0]);
            let seq = queue.begin(write.reply);
            assert!(queue.pop().is_none());
            assert!(queue.complete(seq, Ok(())));
        }
        assert_eq!(order, vec![0, 1, 2, 3]);
        assert!(!queue.is_busy());
    }

    #[test]
    fn late_completion_is_ignored() {
        let mut queue = WriteQueue::default();
        let (first, mut first_rx) = queued(1);
        let seq = queue.begin(first.reply);

        assert!(queue.expire(LinkError::WriteTimeout(Duration::from_secs(5))));
        assert_eq!(
            first_rx.try_recv().unwrap(),
            Err(LinkError::WriteTimeout(Duration::from_secs(5)))
        );

        let (second, mut second_rx) = queued(2);
        let next = queue.begin(second.reply);
        assert!(!queue.complete(seq, Ok(())));
        assert!(queue.is_busy());
        assert!(second_rx.try_recv().is_err());

        assert!(queue.complete(next, Ok(())));
        assert_eq!(second_rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn fail_all_settles_everything() {
        let mut queue = WriteQueue::default();
        let (first, mut first_rx) = queued(1);
        queue.begin(first.reply);
        let (second, mut second_rx) = queued(2);
        queue.push(second);
        queue.push(QueuedWrite {
            payload: Bytes::from_static(&[0xF9]),
            reply: None,
        });
        assert_eq!(queue.len(), 2);

        queue.fail_all(LinkError::Disconnected);
        assert!(!queue.is_busy());
        assert_eq!(queue.len(), 0);
        assert_eq!(first_rx.try_recv().unwrap(), Err(LinkError::Disconnected));
        assert_eq!(second_rx.try_recv().unwrap(), Err(LinkError::Disconnected));
        assert!(!queue.expire(LinkError::Disconnected));
    }
}
