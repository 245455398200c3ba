use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;

use shared::error::Result;

/// SIP message class. Requests get a transaction deadline when queued;
/// responses wait until the session can take them.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SipMessageKind {
    Request,
    Response,
}

/// Completion callback of one outbound message: the plaintext byte count on
/// success, or the mapped transport error. Invoked exactly once, from the
/// session worker.
pub type SendCallback = Box<dyn FnOnce(Result<usize>) + Send>;

/// One serialized outbound SIP message.
///
/// The `pending` flag is the operation key: a message with a send still in
/// flight cannot be submitted again until that send completed.
#[derive(Debug)]
pub struct TxMessage {
    kind: SipMessageKind,
    payload: Bytes,
    pending: AtomicBool,
}

impl TxMessage {
    pub fn new(kind: SipMessageKind, payload: Bytes) -> Self {
        TxMessage {
            kind,
            payload,
            pending: AtomicBool::new(false),
        }
    }

    pub fn request(payload: Bytes) -> Self {
        Self::new(SipMessageKind::Request, payload)
    }

    pub fn response(payload: Bytes) -> Self {
        Self::new(SipMessageKind::Response, payload)
    }

    pub fn kind(&self) -> SipMessageKind {
        self.kind
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Claim the message for a send. Fails when one is already in flight.
    pub(crate) fn claim(&self) -> bool {
        !self.pending.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn release(&self) {
        self.pending.store(false, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}
