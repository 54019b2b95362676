pub mod command;
mod service_loop;

use std::sync::Arc;
use std::thread;

use tracing::{info, warn};

use crate::config::DriverConfig;
use crate::error::{LinkError, LinkResult};
use crate::fairness::{
    ObjectMessageQueue, ServerMessageQueue, ServerMessageReceiver, ServiceQueueListener,
};
use crate::message::ServerId;
use crate::network::NetworkListener;
use crate::trace::Hooks;

pub use command::{Direction, LinkCommand, LinkReport};

use service_loop::ServiceLoop;

/// The queues one server's link drives.
pub struct LinkParts {
    pub local: ServerId,
    pub send: Arc<dyn ServerMessageQueue>,
    pub receive: Arc<dyn ServerMessageReceiver>,
    pub objects: Option<Arc<dyn ObjectMessageQueue>>,
    pub hooks: Hooks,
}

/// Cloneable sender side of a link's command channel.
///
/// Transport and forwarder callbacks go through here; they only post a
/// command and never block.
#[derive(Clone)]
pub struct LinkHandle {
    command_tx: crossbeam_channel::Sender<LinkCommand>,
}

impl LinkHandle {
    /// Post a command. Fails if the channel is full or the loop has stopped.
    pub fn send_command(&self, cmd: LinkCommand) -> LinkResult<()> {
        self.command_tx.try_send(cmd).map_err(|e| match e {
            crossbeam_channel::TrySendError::Full(_) => LinkError::ChannelFull,
            crossbeam_channel::TrySendError::Disconnected(_) => LinkError::ChannelDisconnected,
        })
    }

    /// Request a pass over one direction.
    pub fn service(&self, direction: Direction) -> LinkResult<()> {
        self.send_command(match direction {
            Direction::Send => LinkCommand::ServiceSend,
            Direction::Receive => LinkCommand::ServiceReceive,
            Direction::Objects => LinkCommand::ServiceObjects,
        })
    }

    /// Set `peer`'s weight on both the send and the receive queue and wait
    /// for the loop to apply it.
    #[tracing::instrument(skip(self))]
    pub fn set_server_weight(&self, peer: ServerId, weight: f64) -> LinkResult<()> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.send_command(LinkCommand::SetServerWeight {
            peer,
            weight,
            reply,
        })?;
        rx.blocking_recv()
            .map_err(|_| LinkError::ChannelDisconnected)??;
        Ok(())
    }

    /// Drop `peer` from both directions. Returns whether either knew it.
    #[tracing::instrument(skip(self))]
    pub fn remove_server(&self, peer: ServerId) -> LinkResult<bool> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.send_command(LinkCommand::RemoveServer { peer, reply })?;
        rx.blocking_recv().map_err(|_| LinkError::ChannelDisconnected)
    }

    pub fn report(&self) -> LinkResult<LinkReport> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.send_command(LinkCommand::Report { reply })?;
        rx.blocking_recv().map_err(|_| LinkError::ChannelDisconnected)
    }

    fn notify(&self, cmd: LinkCommand) {
        if let Err(e) = self.send_command(cmd) {
            // The idle sweep picks the work up.
            warn!(error = %e, "dropped link wake-up");
        }
    }
}

impl NetworkListener for LinkHandle {
    fn connection_established(&self, peer: ServerId) {
        self.notify(LinkCommand::ConnectionEstablished { peer });
    }

    fn data_available(&self, peer: ServerId) {
        self.notify(LinkCommand::DataAvailable { peer });
    }
}

impl ServiceQueueListener for LinkHandle {
    fn service_message_ready(&self, destination: ServerId) {
        self.notify(LinkCommand::ServiceMessageReady { peer: destination });
    }
}

/// Owns the thread that serializes every service pass of one server's
/// queues, and the inbound command channel feeding it.
pub struct Link {
    handle: LinkHandle,
    loop_thread: Option<thread::JoinHandle<()>>,
}

impl Link {
    /// Spawn the service loop on a dedicated OS thread.
    #[tracing::instrument(skip_all, fields(server = %parts.local))]
    pub fn start(parts: LinkParts, config: &DriverConfig) -> LinkResult<Self> {
        let (tx, rx) = crossbeam_channel::bounded::<LinkCommand>(config.command_channel_capacity);
        let loop_config = config.clone();

        let handle = thread::Builder::new()
            .name(format!("meridian-link-{}", parts.local))
            .spawn(move || {
                let mut service_loop = ServiceLoop::new(parts, rx, &loop_config);
                service_loop.run();
            })
            .map_err(|e| LinkError::Spawn(e.to_string()))?;

        info!("link started");

        Ok(Self {
            handle: LinkHandle { command_tx: tx },
            loop_thread: Some(handle),
        })
    }

    pub fn handle(&self) -> LinkHandle {
        self.handle.clone()
    }

    /// Send the shutdown command and wait for the loop thread to finish.
    #[tracing::instrument(skip_all)]
    pub fn shutdown(mut self) -> LinkResult<()> {
        info!("initiating link shutdown");

        let _ = self.handle.command_tx.send(LinkCommand::Shutdown);

        if let Some(handle) = self.loop_thread.take() {
            handle.join().map_err(|_| LinkError::Panicked)?;
        }

        info!("link shutdown complete");
        Ok(())
    }
}

impl std::ops::Deref for Link {
    type Target = LinkHandle;

    fn deref(&self) -> &LinkHandle {
        &self.handle
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if self.loop_thread.is_some() {
            let _ = self.handle.command_tx.send(LinkCommand::Shutdown);
            if let Some(handle) = self.loop_thread.take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::config::{EstimatorConfig, PacingConfig};
    use crate::error::FlowError;
    use crate::fairness::test_support::{CollectingListener, RecordingNetwork};
    use crate::fairness::{FairServerMessageQueue, FairServerMessageReceiver};
    use crate::message::{ServerMessage, ServiceTag};
    use crate::network::MemoryNetwork;

    fn driver() -> DriverConfig {
        DriverConfig {
            command_channel_capacity: 64,
            idle_timeout_ms: 5,
            send_retry_interval_ms: 1,
        }
    }

    fn pacing() -> PacingConfig {
        PacingConfig {
            rate_bytes_per_sec: 1_000_000.0,
            ..Default::default()
        }
    }

    struct Fixture {
        link: Link,
        send: Arc<FairServerMessageQueue<crate::fairness::BoundedQueue<ServerMessage>>>,
        sent: Arc<RecordingNetwork>,
    }

    fn fixture() -> Fixture {
        fixture_with(&driver())
    }

    fn fixture_with(config: &DriverConfig) -> Fixture {
        let local = ServerId(1);
        let hooks = Hooks::default();
        let sent = Arc::new(RecordingNetwork::default());
        let listener = Arc::new(CollectingListener::default());
        let send = Arc::new(FairServerMessageQueue::new(
            local,
            &pacing(),
            &EstimatorConfig::default(),
            sent.clone(),
            listener.clone(),
            hooks.clone(),
        ));
        let fabric = MemoryNetwork::new(1 << 20);
        let receive = Arc::new(FairServerMessageReceiver::new(
            &pacing(),
            &EstimatorConfig::default(),
            Arc::new(fabric.endpoint(local)),
            listener,
            hooks.clone(),
        ));
        let link = Link::start(
            LinkParts {
                local,
                send: send.clone(),
                receive,
                objects: None,
                hooks,
            },
            config,
        )
        .unwrap();
        Fixture { link, send, sent }
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..500 {
            if done() {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("condition not reached");
    }

    #[test]
    fn link_starts_and_shuts_down() {
        let f = fixture();
        f.link.shutdown().unwrap();
    }

    #[test]
    fn ready_message_is_sent_by_the_loop() {
        let f = fixture();
        let message = ServerMessage::new(
            7,
            ServerId(1),
            ServerId(2),
            ServiceTag::LOCATION,
            vec![0; 100],
        );
        f.send.add_message(message).unwrap();
        f.link.service(Direction::Send).unwrap();

        let sent = f.sent.clone();
        wait_for(|| sent.sent_ids() == vec![7]);
        f.link.shutdown().unwrap();
    }

    #[test]
    fn lost_trigger_is_recovered_under_steady_traffic() {
        let f = fixture_with(&DriverConfig {
            command_channel_capacity: 1,
            ..driver()
        });
        // Queued without a send trigger, as if the trigger was dropped.
        let message =
            ServerMessage::new(3, ServerId(1), ServerId(2), ServiceTag::LOCATION, vec![0; 50]);
        f.send.add_message(message).unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let chatter = {
            let handle = f.link.handle();
            let stop = stop.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    let _ = handle.service(Direction::Objects);
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
        };

        let sent = f.sent.clone();
        wait_for(|| sent.sent_ids() == vec![3]);
        stop.store(true, Ordering::SeqCst);
        chatter.join().unwrap();
        f.link.shutdown().unwrap();
    }

    #[test]
    fn set_server_weight_round_trips_through_loop() {
        let f = fixture();
        let message =
            ServerMessage::new(1, ServerId(1), ServerId(3), ServiceTag::PROXIMITY, vec![0; 8]);
        f.send.add_message(message).unwrap();

        f.link.set_server_weight(ServerId(3), 4.0).unwrap();
        let report = f.link.report().unwrap();
        let info = report.send.iter().find(|i| i.key == ServerId(3)).unwrap();
        assert_eq!(info.weight, 4.0);

        let err = f.link.set_server_weight(ServerId(3), -1.0).unwrap_err();
        assert!(matches!(err, LinkError::Flow(FlowError::InvalidWeight(_))));
        f.link.shutdown().unwrap();
    }

    #[test]
    fn commands_fail_after_shutdown() {
        let f = fixture();
        let handle = f.link.handle();
        f.link.shutdown().unwrap();
        assert!(matches!(
            handle.service(Direction::Send),
            Err(LinkError::ChannelDisconnected)
        ));
    }
}
