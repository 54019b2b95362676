use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::message::{QueueMessage, ServerId, ServerMessage};

/// Outbound transport to peer servers.
pub trait Network: Send + Sync {
    /// Non-blocking send of an encoded message. `false` means the transport
    /// could not take it now; the caller keeps the message and retries.
    fn try_send(&self, destination: ServerId, bytes: &[u8]) -> bool;

    /// Open a connection to `destination` ahead of the first send.
    fn connect(&self, destination: ServerId) -> bool;
}

/// Transport callbacks. Implementations must only hand the event off (post
/// to a service loop); they run on the transport's thread.
pub trait NetworkListener: Send + Sync {
    fn connection_established(&self, peer: ServerId);

    /// Edge-triggered: fired when a peer's receive buffer goes from empty to
    /// non-empty.
    fn data_available(&self, peer: ServerId);
}

/// Final consumer of server messages on this server.
pub trait ServerMessageListener: Send + Sync {
    fn server_message_received(&self, message: ServerMessage);
}

/// Per-peer receive buffers owned by the transport. The receive queue
/// schedules directly over these instead of copying messages out.
pub trait ReceiveNetwork: Send + Sync {
    fn front_size(&self, peer: ServerId) -> Option<usize>;

    fn receive(&self, peer: ServerId) -> Option<ServerMessage>;

    /// Put a message back at the front of `peer`'s buffer.
    fn requeue_front(&self, peer: ServerId, message: ServerMessage);

    fn queued_messages(&self, peer: ServerId) -> usize;

    fn queued_bytes(&self, peer: ServerId) -> usize;
}

#[derive(Default)]
struct Stream {
    messages: VecDeque<ServerMessage>,
    bytes: usize,
    connected: bool,
    /// Refuse all sends, for exercising stalls.
    down: bool,
}

#[derive(Default)]
struct Fabric {
    /// Keyed by (source, destination).
    streams: HashMap<(ServerId, ServerId), Stream>,
    listeners: HashMap<ServerId, Arc<dyn NetworkListener>>,
}

/// In-process transport connecting any number of servers through
/// byte-bounded one-way streams.
#[derive(Clone)]
pub struct MemoryNetwork {
    fabric: Arc<Mutex<Fabric>>,
    stream_capacity_bytes: usize,
}

impl MemoryNetwork {
    pub fn new(stream_capacity_bytes: usize) -> Self {
        Self {
            fabric: Arc::new(Mutex::new(Fabric::default())),
            stream_capacity_bytes,
        }
    }

    /// The transport as seen from server `local`.
    pub fn endpoint(&self, local: ServerId) -> MemoryEndpoint {
        MemoryEndpoint {
            local,
            network: self.clone(),
        }
    }

    /// Route `server`'s receive callbacks to `listener`.
    pub fn attach(&self, server: ServerId, listener: Arc<dyn NetworkListener>) {
        self.fabric.lock().listeners.insert(server, listener);
    }

    pub fn detach(&self, server: ServerId) {
        self.fabric.lock().listeners.remove(&server);
    }

    /// Take the stream from `source` to `destination` down or back up.
    /// While down every send on it fails.
    pub fn set_stream_down(&self, source: ServerId, destination: ServerId, down: bool) {
        self.fabric
            .lock()
            .streams
            .entry((source, destination))
            .or_default()
            .down = down;
    }

    fn send(&self, source: ServerId, destination: ServerId, message: ServerMessage) -> bool {
        let size = message.size();
        let mut fabric = self.fabric.lock();
        let stream = fabric.streams.entry((source, destination)).or_default();
        if stream.down || stream.bytes + size > self.stream_capacity_bytes {
            return false;
        }
        let newly_connected = !std::mem::replace(&mut stream.connected, true);
        let was_empty = stream.messages.is_empty();
        stream.bytes += size;
        stream.messages.push_back(message);
        let listener = fabric.listeners.get(&destination).cloned();
        drop(fabric);

        if let Some(listener) = listener {
            if newly_connected {
                listener.connection_established(source);
            }
            if was_empty {
                listener.data_available(source);
            }
        }
        true
    }

    fn connect(&self, source: ServerId, destination: ServerId) -> bool {
        let mut fabric = self.fabric.lock();
        let stream = fabric.streams.entry((source, destination)).or_default();
        if stream.down {
            return false;
        }
        let newly_connected = !std::mem::replace(&mut stream.connected, true);
        let listener = fabric.listeners.get(&destination).cloned();
        drop(fabric);

        if newly_connected {
            if let Some(listener) = listener {
                listener.connection_established(source);
            }
        }
        true
    }

    fn with_stream<T>(
        &self,
        source: ServerId,
        destination: ServerId,
        f: impl FnOnce(&mut Stream) -> T,
    ) -> Option<T> {
        let mut fabric = self.fabric.lock();
        fabric.streams.get_mut(&(source, destination)).map(f)
    }
}

/// One server's handle on a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryEndpoint {
    local: ServerId,
    network: MemoryNetwork,
}

impl MemoryEndpoint {
    pub fn local(&self) -> ServerId {
        self.local
    }
}

impl Network for MemoryEndpoint {
    fn try_send(&self, destination: ServerId, bytes: &[u8]) -> bool {
        let message = match ServerMessage::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                // Undecodable bytes will never succeed; drop rather than stall.
                warn!(peer = %destination, error = %e, "dropping malformed message");
                return true;
            }
        };
        let accepted = self.network.send(self.local, destination, message);
        trace!(peer = %destination, bytes = bytes.len(), accepted, "memory send");
        accepted
    }

    fn connect(&self, destination: ServerId) -> bool {
        self.network.connect(self.local, destination)
    }
}

impl ReceiveNetwork for MemoryEndpoint {
    fn front_size(&self, peer: ServerId) -> Option<usize> {
        self.network
            .with_stream(peer, self.local, |s| s.messages.front().map(QueueMessage::size))
            .flatten()
    }

    fn receive(&self, peer: ServerId) -> Option<ServerMessage> {
        self.network
            .with_stream(peer, self.local, |s| {
                let message = s.messages.pop_front()?;
                s.bytes -= message.size();
                Some(message)
            })
            .flatten()
    }

    fn requeue_front(&self, peer: ServerId, message: ServerMessage) {
        let mut fabric = self.network.fabric.lock();
        let stream = fabric.streams.entry((peer, self.local)).or_default();
        stream.bytes += message.size();
        stream.messages.push_front(message);
    }

    fn queued_messages(&self, peer: ServerId) -> usize {
        self.network
            .with_stream(peer, self.local, |s| s.messages.len())
            .unwrap_or(0)
    }

    fn queued_bytes(&self, peer: ServerId) -> usize {
        self.network
            .with_stream(peer, self.local, |s| s.bytes)
            .unwrap_or(0)
    }
}
