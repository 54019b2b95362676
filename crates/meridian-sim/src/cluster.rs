use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use meridian_core::fairness::{
    object_queue_from_config, DirectoryLocator, ObjectMessageQueue, ServerRoutingAdapter,
};
use meridian_core::{
    FairServerMessageQueue, FairServerMessageReceiver, ForwarderServiceQueue, Hooks, Link,
    LinkError, LinkParts, LinkReport, MemoryNetwork, MeridianConfig, QueueMessage, ServerId,
    ServerMessage, ServerMessageListener, ServiceTag,
};
use tracing::info;

/// Counts what reaches a server's local listener.
#[derive(Default)]
pub struct Tally {
    pub messages: AtomicU64,
    pub bytes: AtomicU64,
    pub object_messages: AtomicU64,
}

impl ServerMessageListener for Tally {
    fn server_message_received(&self, message: ServerMessage) {
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(message.size() as u64, Ordering::Relaxed);
        if message.service == ServiceTag::OBJECT_ROUTING {
            self.object_messages.fetch_add(1, Ordering::Relaxed);
        }
    }
}

pub struct SimServer {
    pub id: ServerId,
    pub link: Link,
    pub forwarder: Arc<ForwarderServiceQueue>,
    pub objects: Arc<dyn ObjectMessageQueue>,
    pub tally: Arc<Tally>,
}

/// Servers sharing one in-memory fabric and one object directory.
pub struct Cluster {
    pub servers: Vec<SimServer>,
    pub locator: Arc<DirectoryLocator>,
}

impl Cluster {
    #[tracing::instrument(skip(config, hooks))]
    pub fn start(
        config: &MeridianConfig,
        server_count: u32,
        stream_capacity_bytes: usize,
        hooks: Hooks,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let fabric = MemoryNetwork::new(stream_capacity_bytes);
        let locator = Arc::new(DirectoryLocator::default());
        let mut servers = Vec::with_capacity(server_count as usize);

        for n in 1..=server_count {
            let id = ServerId(n);
            let tally = Arc::new(Tally::default());
            let endpoint = Arc::new(fabric.endpoint(id));

            let forwarder = Arc::new(ForwarderServiceQueue::from_config(
                &config.forwarder,
                config.send.max_message_bytes,
            )?);
            let send = Arc::new(FairServerMessageQueue::with_source(
                id,
                &config.send,
                &config.estimator,
                forwarder.clone(),
                endpoint.clone(),
                tally.clone(),
                hooks.clone(),
            ));
            let receive = Arc::new(FairServerMessageReceiver::new(
                &config.receive,
                &config.estimator,
                endpoint,
                tally.clone(),
                hooks.clone(),
            ));
            let router = Arc::new(ServerRoutingAdapter::new(
                id,
                locator.clone(),
                forwarder.clone(),
            ));
            let objects =
                object_queue_from_config(&config.objects, &config.estimator, router, hooks.clone());

            let link = Link::start(
                LinkParts {
                    local: id,
                    send,
                    receive,
                    objects: Some(objects.clone()),
                    hooks: hooks.clone(),
                },
                &config.driver,
            )?;
            forwarder.set_listener(Arc::new(link.handle()));
            fabric.attach(id, Arc::new(link.handle()));

            servers.push(SimServer {
                id,
                link,
                forwarder,
                objects,
                tally,
            });
        }

        info!(servers = server_count, "cluster started");
        Ok(Self { servers, locator })
    }

    pub fn reports(&self) -> Result<Vec<(ServerId, LinkReport)>, LinkError> {
        self.servers
            .iter()
            .map(|s| Ok((s.id, s.link.report()?)))
            .collect()
    }

    pub fn shutdown(self) -> Result<(), LinkError> {
        for server in self.servers {
            server.link.shutdown()?;
        }
        info!("cluster stopped");
        Ok(())
    }
}
