use crate::error::FlowResult;
use crate::fairness::QueueInfo;
use crate::message::{ObjectId, ServerId};

/// Queue direction driven by a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Send,
    Receive,
    Objects,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Send => "send",
            Direction::Receive => "receive",
            Direction::Objects => "objects",
        }
    }
}

/// Snapshot of a link's queues.
#[derive(Debug, Clone, Default)]
pub struct LinkReport {
    pub send: Vec<QueueInfo<ServerId>>,
    pub receive: Vec<QueueInfo<ServerId>>,
    pub objects: Vec<QueueInfo<ObjectId>>,
    pub send_capacity: f64,
    pub receive_capacity: f64,
    pub send_blocked: bool,
    pub receive_blocked: bool,
}

/// Commands posted to a link's service loop.
///
/// Variants that expect a response carry a `tokio::sync::oneshot::Sender`
/// for the reply. Wake-ups are fire-and-forget.
pub enum LinkCommand {
    ServiceSend,
    ServiceReceive,
    ServiceObjects,
    ConnectionEstablished {
        peer: ServerId,
    },
    DataAvailable {
        peer: ServerId,
    },
    ServiceMessageReady {
        peer: ServerId,
    },
    /// Applies to both the send and the receive queue for `peer`.
    SetServerWeight {
        peer: ServerId,
        weight: f64,
        reply: tokio::sync::oneshot::Sender<FlowResult<()>>,
    },
    RemoveServer {
        peer: ServerId,
        reply: tokio::sync::oneshot::Sender<bool>,
    },
    Report {
        reply: tokio::sync::oneshot::Sender<LinkReport>,
    },
    Shutdown,
}
