// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! In-process message queue, used for the shared-memory transport and for tests.

use std::sync::mpsc;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::Sender;

use crate::link::MessagePort;
use crate::Error;
use crate::Result;

/// One end of a bidirectional message queue.
pub struct QueuePort {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

impl QueuePort {
    pub fn pair() -> (QueuePort, QueuePort) {
        let (tx_a, rx_b) = mpsc::channel();
        let (tx_b, rx_a) = mpsc::channel();
        (
            QueuePort { tx: tx_a, rx: rx_a },
            QueuePort { tx: tx_b, rx: rx_b },
        )
    }
}

impl MessagePort for QueuePort {
    fn send_message(&mut self, message: &[u8]) -> Result<()> {
        self.tx
            .send(message.to_vec())
            .map_err(|_| Error::Disconnect)
    }

    fn recv_message(&mut self) -> Result<Vec<u8>> {
        self.rx.recv().map_err(|_| Error::Disconnect)
    }
}
