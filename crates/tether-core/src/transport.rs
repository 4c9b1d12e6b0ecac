// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Transport seam: framed bytes in, framed bytes out.
//!
//! The concrete transport (sockets, WebRTC, in-process pipes) lives outside
//! the core. Its receive callback deposits frames into a thread-safe inbound
//! queue; the controller drains that queue at the start of each tick.
//! Encryption and anti-cheat hooks wrap this seam; no algorithm is mandated
//! here.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::ident::PeerId;

/// Delivery target for an outbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dest {
    /// One peer.
    Peer(PeerId),
    /// Every connected peer.
    Broadcast,
}

/// Injected outbound half of the transport.
pub trait Transport: Send {
    /// Delivers framed bytes to a named peer or all peers. Bytes are opaque
    /// to the transport.
    fn send(&mut self, dest: &Dest, bytes: &[u8]);
}

/// Cloneable handle the transport thread uses to deposit received frames.
///
/// This queue and its outbound mirror are the only state crossing thread
/// boundaries; everything else is touched only inside the controller's tick.
#[derive(Debug, Clone, Default)]
pub struct InboundQueue {
    frames: Arc<Mutex<VecDeque<(PeerId, Vec<u8>)>>>,
}

impl InboundQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deposits a received frame from `peer`. Callable from any thread.
    pub fn deposit(&self, peer: PeerId, bytes: Vec<u8>) {
        self.frames.lock().push_back((peer, bytes));
    }

    /// Removes every queued frame in arrival order.
    #[must_use]
    pub fn drain(&self) -> Vec<(PeerId, Vec<u8>)> {
        self.frames.lock().drain(..).collect()
    }

    /// Queued frame count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }
}

/// Transport double that records every send behind a shared handle, so a
/// test can keep a clone while the controller owns the boxed original.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    sent: Arc<Mutex<Vec<(Dest, Vec<u8>)>>>,
}

impl RecordingTransport {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns everything sent since the last call.
    #[must_use]
    pub fn take_sent(&self) -> Vec<(Dest, Vec<u8>)> {
        self.sent.lock().drain(..).collect()
    }

    /// Frames sent and not yet taken.
    #[must_use]
    pub fn sent_len(&self) -> usize {
        self.sent.lock().len()
    }
}

impl Transport for RecordingTransport {
    fn send(&mut self, dest: &Dest, bytes: &[u8]) {
        self.sent.lock().push((dest.clone(), bytes.to_vec()));
    }
}

/// Transport that drops every frame (a dead link).
#[derive(Debug, Default)]
pub struct BlackholeTransport;

impl Transport for BlackholeTransport {
    fn send(&mut self, _dest: &Dest, _bytes: &[u8]) {}
}

/// Transport wired straight into a remote peer's inbound queue.
///
/// Pairs two controllers in-process: everything this side sends is
/// deposited on the remote queue tagged with the local peer id.
#[derive(Debug)]
pub struct LoopbackTransport {
    local: PeerId,
    remote: InboundQueue,
}

impl LoopbackTransport {
    /// Wires the local peer's sends into `remote`.
    #[must_use]
    pub fn new(local: PeerId, remote: InboundQueue) -> Self {
        Self { local, remote }
    }
}

impl Transport for LoopbackTransport {
    fn send(&mut self, _dest: &Dest, bytes: &[u8]) {
        self.remote.deposit(self.local.clone(), bytes.to_vec());
    }
}
