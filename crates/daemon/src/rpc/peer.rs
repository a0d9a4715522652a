//! Peer handles and the messages flowing between endpoints.

use std::sync::atomic::{AtomicU64, Ordering};

use protocol::{Envelope, Opcode, Payload};
use tokio::sync::mpsc;

use super::EndpointError;
use crate::pty::PtyPair;

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique identifier of a peer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// A message as it arrives at an endpoint.
#[derive(Debug)]
pub struct Inbound {
    pub envelope: Envelope,
    /// Where answers to this message go.
    pub reply_to: Option<PeerHandle>,
    /// Pty pair transferred alongside the envelope.
    pub attachment: Option<PtyPair>,
}

impl Inbound {
    pub fn opcode(&self) -> Opcode {
        self.envelope.opcode
    }

    pub fn take_attachment(&mut self) -> Option<PtyPair> {
        self.attachment.take()
    }
}

/// A message about to be sent.
#[derive(Debug)]
pub struct Outbound {
    pub opcode: Opcode,
    pub arg1: i32,
    pub arg2: i32,
    pub payload: Payload,
    pub attachment: Option<PtyPair>,
}

impl Outbound {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            arg1: 0,
            arg2: 0,
            payload: Payload::Empty,
            attachment: None,
        }
    }

    pub fn with_args(mut self, arg1: i32, arg2: i32) -> Self {
        self.arg1 = arg1;
        self.arg2 = arg2;
        self
    }

    /// Answer carrying a boolean in `arg1`.
    pub fn with_flag(self, flag: bool) -> Self {
        self.with_args(i32::from(flag), 0)
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_attachment(mut self, pair: PtyPair) -> Self {
        self.attachment = Some(pair);
        self
    }

    /// Split into the wire envelope and the descriptors travelling beside it.
    pub(crate) fn into_parts(
        self,
        correlation: Option<u64>,
        in_reply_to: Option<u64>,
    ) -> (Envelope, Option<PtyPair>) {
        let mut envelope = Envelope::new(self.opcode)
            .with_args(self.arg1, self.arg2)
            .with_payload(self.payload);
        envelope.correlation = correlation;
        envelope.in_reply_to = in_reply_to;
        envelope.attached_fds = if self.attachment.is_some() { 2 } else { 0 };
        (envelope, self.attachment)
    }
}

/// Send side of somebody's inbox.
///
/// Handles compare equal by id. A send fails once the receiving side is
/// gone, which is how dead peers are detected.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    id: PeerId,
    tx: mpsc::UnboundedSender<Inbound>,
}

impl PartialEq for PeerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerHandle {}

impl PeerHandle {
    /// Create a new inbox and the handle addressing it.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = PeerId(NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed));
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Hand a message to the peer.
    pub fn deliver(
        &self,
        envelope: Envelope,
        reply_to: Option<PeerHandle>,
        attachment: Option<PtyPair>,
    ) -> Result<(), EndpointError> {
        self.tx
            .send(Inbound {
                envelope,
                reply_to,
                attachment,
            })
            .map_err(|_| EndpointError::PeerGone(self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let (a, _ra) = PeerHandle::channel();
        let (b, _rb) = PeerHandle::channel();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone(), a);
        assert_ne!(a, b);
    }

    #[test]
    fn test_deliver_fails_when_receiver_dropped() {
        let (peer, rx) = PeerHandle::channel();
        drop(rx);
        assert!(peer.is_closed());
        let err = peer
            .deliver(Envelope::new(Opcode::START_TERMINAL), None, None)
            .unwrap_err();
        assert!(matches!(err, EndpointError::PeerGone(id) if id == peer.id()));
    }

    #[tokio::test]
    async fn test_deliver_carries_reply_to() {
        let (peer, mut rx) = PeerHandle::channel();
        let (me, _my_rx) = PeerHandle::channel();
        peer.deliver(Envelope::new(Opcode::REGISTER_CLIENT), Some(me.clone()), None)
            .unwrap();

        let inbound = rx.recv().await.unwrap();
        assert_eq!(inbound.opcode(), Opcode::REGISTER_CLIENT);
        assert_eq!(inbound.reply_to, Some(me));
    }

    #[test]
    fn test_outbound_parts() {
        let pair = PtyPair::open(80, 24).unwrap();
        let (env, attachment) = Outbound::new(Opcode::REGISTER_TRACKED_PROCESS)
            .with_args(3, 4)
            .with_attachment(pair)
            .into_parts(Some(9), None);
        assert_eq!(env.correlation, Some(9));
        assert_eq!((env.arg1, env.arg2), (3, 4));
        assert_eq!(env.attached_fds, 2);
        assert!(attachment.is_some());
    }

    #[test]
    fn test_with_flag() {
        let out = Outbound::new(Opcode::ARE_SESSIONS_EMPTY).with_flag(true);
        assert_eq!(out.arg1, 1);
    }
}
