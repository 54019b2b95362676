use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::DriverConfig;
use crate::fairness::ServiceOutcome;
use crate::link::command::{Direction, LinkCommand, LinkReport};
use crate::link::LinkParts;

/// Scheduling state of one direction.
#[derive(Default)]
struct Wake {
    /// A trigger arrived since the last pass.
    pending: bool,
    /// Retry time armed by a blocked or stalled pass.
    deadline: Option<Instant>,
}

impl Wake {
    fn due(&self, now: Instant) -> bool {
        self.pending || self.deadline.is_some_and(|d| d <= now)
    }
}

/// The serialized executor behind a `Link`. Runs on its own thread: every
/// service pass and control operation of the link goes through here, so
/// passes never overlap.
pub(crate) struct ServiceLoop {
    parts: LinkParts,
    inbound: crossbeam_channel::Receiver<LinkCommand>,
    idle_timeout: Duration,
    send_retry: Duration,
    send: Wake,
    receive: Wake,
    objects: Wake,
    last_sweep: Instant,
    running: bool,
}

impl ServiceLoop {
    pub fn new(
        parts: LinkParts,
        inbound: crossbeam_channel::Receiver<LinkCommand>,
        config: &DriverConfig,
    ) -> Self {
        Self {
            parts,
            inbound,
            idle_timeout: config.idle_timeout(),
            send_retry: config.send_retry_interval(),
            send: Wake::default(),
            receive: Wake::default(),
            objects: Wake::default(),
            last_sweep: Instant::now(),
            running: true,
        }
    }

    pub fn run(&mut self) {
        info!(server = %self.parts.local, "service loop started");

        while self.running {
            // Phase 1: drain buffered commands without blocking.
            let mut drained = 0;
            while let Ok(cmd) = self.inbound.try_recv() {
                self.handle_command(cmd);
                drained += 1;
                if !self.running {
                    break;
                }
            }
            if !self.running {
                break;
            }

            // Phase 2: run every direction that was triggered or whose retry
            // deadline passed. A busy channel never times out, so the sweep
            // also runs on the clock.
            let now = Instant::now();
            if now.saturating_duration_since(self.last_sweep) >= self.idle_timeout {
                self.sweep(now);
            }
            if self.service_due(now) {
                self.record_gauges();
            }

            // Phase 3: park until the next command or the earliest deadline.
            if drained == 0 {
                match self.inbound.recv_timeout(self.park_timeout(Instant::now())) {
                    Ok(cmd) => self.handle_command(cmd),
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                        self.sweep(Instant::now())
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                        info!("command channel disconnected, shutting down");
                        self.running = false;
                    }
                }
            }
        }

        info!(server = %self.parts.local, "service loop stopped");
    }

    fn handle_command(&mut self, cmd: LinkCommand) {
        match cmd {
            LinkCommand::ServiceSend => self.send.pending = true,
            LinkCommand::ServiceReceive => self.receive.pending = true,
            LinkCommand::ServiceObjects => self.objects.pending = true,
            LinkCommand::ConnectionEstablished { peer } => {
                debug!(%peer, "connection established");
                self.parts.receive.network_received_connection(peer);
            }
            LinkCommand::DataAvailable { peer } => {
                self.parts.receive.network_received_data(peer);
                self.receive.pending = true;
            }
            LinkCommand::ServiceMessageReady { peer } => {
                self.parts.send.message_ready(peer);
                self.send.pending = true;
            }
            LinkCommand::SetServerWeight {
                peer,
                weight,
                reply,
            } => {
                let result = self
                    .parts
                    .send
                    .set_server_weight(peer, weight)
                    .and_then(|()| self.parts.receive.set_server_weight(peer, weight));
                debug!(%peer, weight, ok = result.is_ok(), "set server weight");
                let _ = reply.send(result);
            }
            LinkCommand::RemoveServer { peer, reply } => {
                let sent = self.parts.send.remove_server(peer);
                let received = self.parts.receive.remove_server(peer);
                info!(%peer, "removed server");
                let _ = reply.send(sent || received);
            }
            LinkCommand::Report { reply } => {
                let _ = reply.send(self.report());
            }
            LinkCommand::Shutdown => {
                info!("shutdown command received");
                self.running = false;
            }
        }
    }

    /// Returns whether any pass ran.
    fn service_due(&mut self, now: Instant) -> bool {
        let mut ran = false;
        if self.send.due(now) {
            let outcome = self.parts.send.service(now);
            Self::rearm(
                &mut self.send,
                outcome,
                now,
                self.send_retry,
                Direction::Send,
            );
            ran = true;
        }
        if self.receive.due(now) {
            let outcome = self.parts.receive.service(now);
            Self::rearm(
                &mut self.receive,
                outcome,
                now,
                self.send_retry,
                Direction::Receive,
            );
            ran = true;
        }
        if let Some(objects) = &self.parts.objects {
            if self.objects.due(now) {
                let outcome = objects.service(now);
                Self::rearm(
                    &mut self.objects,
                    outcome,
                    now,
                    self.send_retry,
                    Direction::Objects,
                );
                ran = true;
            }
        }
        ran
    }

    fn rearm(
        wake: &mut Wake,
        outcome: ServiceOutcome,
        now: Instant,
        retry: Duration,
        direction: Direction,
    ) {
        wake.pending = false;
        wake.deadline = match outcome {
            ServiceOutcome::Drained => None,
            ServiceOutcome::Blocked { retry_after } => retry_after.map(|d| now + d),
            ServiceOutcome::Stalled | ServiceOutcome::Busy => Some(now + retry),
        };
        tracing::trace!(direction = direction.as_str(), ?outcome, "service pass");
    }

    /// Triggers posted while the channel was full are lost, so every
    /// direction gets a pass at least once per idle period.
    fn sweep(&mut self, now: Instant) {
        self.last_sweep = now;
        for wake in [&mut self.send, &mut self.receive, &mut self.objects] {
            if wake.deadline.map_or(true, |d| d <= now) {
                wake.pending = true;
            }
        }
    }

    fn park_timeout(&self, now: Instant) -> Duration {
        [self.send.deadline, self.receive.deadline, self.objects.deadline]
            .into_iter()
            .flatten()
            .min()
            .map(|d| d.saturating_duration_since(now))
            .map_or(self.idle_timeout, |d| d.min(self.idle_timeout))
    }

    fn report(&self) -> LinkReport {
        LinkReport {
            send: self.parts.send.queue_info(),
            receive: self.parts.receive.queue_info(),
            objects: self
                .parts
                .objects
                .as_ref()
                .map(|o| o.queue_info())
                .unwrap_or_default(),
            send_capacity: self.parts.send.capacity_estimate(),
            receive_capacity: self.parts.receive.capacity_estimate(),
            send_blocked: self.parts.send.is_blocked(),
            receive_blocked: self.parts.receive.is_blocked(),
        }
    }

    fn record_gauges(&self) {
        let metrics = &self.parts.hooks.metrics;
        for (direction, infos) in [
            (Direction::Send, self.parts.send.queue_info()),
            (Direction::Receive, self.parts.receive.queue_info()),
        ] {
            for info in infos {
                let key = info.key.to_string();
                metrics.set_queue_bytes(direction.as_str(), &key, info.used);
                metrics.set_queue_weight(direction.as_str(), &key, info.weight);
            }
        }
        metrics.set_capacity_estimate(
            Direction::Send.as_str(),
            self.parts.send.capacity_estimate(),
        );
        metrics.set_capacity_estimate(
            Direction::Receive.as_str(),
            self.parts.receive.capacity_estimate(),
        );
    }
}
