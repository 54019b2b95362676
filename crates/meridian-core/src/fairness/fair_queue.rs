use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::time::Duration;

use crate::error::{FlowError, FlowResult, PushError};
use crate::fairness::flow::{FlowQueue, PushQueue};
use crate::fairness::stats::QueueInfo;
use crate::message::QueueMessage;

/// Smallest virtual cost a message may have, so virtual time always moves.
const MIN_COST: Duration = Duration::from_nanos(1);

/// How flows without queued data take part in scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmptyQueuePolicy {
    /// Empty flows are skipped and their weight leaves the total.
    #[default]
    Skip,
    /// Every registered flow stays active. An empty flow competes with a
    /// phantom message of `message_bytes` and winning spends its slot, so
    /// its share of the budget is held back rather than redistributed.
    Reserve { message_bytes: usize },
}

impl EmptyQueuePolicy {
    /// Build from the configured empty-queue message length; zero skips.
    pub fn from_message_length(message_bytes: usize) -> Self {
        if message_bytes == 0 {
            EmptyQueuePolicy::Skip
        } else {
            EmptyQueuePolicy::Reserve { message_bytes }
        }
    }
}

#[derive(Debug, Clone)]
pub struct FairQueueOptions {
    pub empty_queue: EmptyQueuePolicy,
    /// Rescale a flow's pending head finish time when its weight changes.
    /// Without it the new weight only applies from the next message on.
    pub rescale_on_weight_change: bool,
    /// Pushes larger than this are rejected instead of blocking the flow forever.
    pub max_message_bytes: Option<usize>,
}

impl Default for FairQueueOptions {
    fn default() -> Self {
        Self {
            empty_queue: EmptyQueuePolicy::Skip,
            rescale_on_weight_change: true,
            max_message_bytes: None,
        }
    }
}

/// Result of one scheduling decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PopOutcome<K> {
    /// The head of `key` was handed over and `size` bytes were charged.
    Delivered { key: K, size: usize },
    /// The earliest-finishing head needs more budget than is left. Nothing
    /// else is considered: smaller messages on later flows wait too.
    Blocked { key: K, needed: usize },
    /// The next stage handed the message back; it is at its flow's head again.
    Refused { key: K },
    /// No flow has anything to send.
    Empty,
}

struct Flow<Q> {
    queue: Q,
    weight: f64,
    /// Virtual finish time of the head message (or of the phantom slot).
    next_finish: Option<Duration>,
}

impl<Q: FlowQueue> Flow<Q> {
    /// Compute a finish time for the head if none is pending.
    fn schedule(&mut self, virtual_time: Duration, policy: EmptyQueuePolicy) -> bool {
        if self.weight <= 0.0 || self.next_finish.is_some() {
            return false;
        }
        self.next_finish = match (self.queue.head_size(), policy) {
            (Some(size), _) => Some(finish_time(virtual_time, size, self.weight)),
            (None, EmptyQueuePolicy::Reserve { message_bytes }) => {
                Some(finish_time(virtual_time, message_bytes, self.weight))
            }
            (None, EmptyQueuePolicy::Skip) => None,
        };
        self.next_finish.is_some()
    }

    fn is_active(&self, policy: EmptyQueuePolicy) -> bool {
        matches!(policy, EmptyQueuePolicy::Reserve { .. }) || !self.queue.is_empty()
    }
}

fn finish_time(start: Duration, size: usize, weight: f64) -> Duration {
    let cost = Duration::try_from_secs_f64(size as f64 / weight).unwrap_or(Duration::MAX);
    start.saturating_add(cost.max(MIN_COST))
}

fn validate_weight(weight: f64) -> FlowResult<()> {
    if weight.is_finite() && weight >= 0.0 {
        Ok(())
    } else {
        Err(FlowError::InvalidWeight(weight))
    }
}

/// Self-clocked weighted fair queue over keyed flows.
///
/// Each flow's head message is stamped with a virtual finish time of
/// `virtual_time + size / weight`. A pop serves the flow with the smallest
/// finish time and advances virtual time to it. Ties go to the first key in
/// map order. Flows with zero weight are paused.
pub struct FairQueue<K, Q> {
    flows: BTreeMap<K, Flow<Q>>,
    virtual_time: Duration,
    /// Sum of weights over active flows.
    total_weight: f64,
    options: FairQueueOptions,
}

impl<K, Q> FairQueue<K, Q>
where
    K: Ord + Clone + Debug,
    Q: FlowQueue,
{
    pub fn new(mut options: FairQueueOptions) -> Self {
        if options.empty_queue == (EmptyQueuePolicy::Reserve { message_bytes: 0 }) {
            options.empty_queue = EmptyQueuePolicy::Skip;
        }
        Self {
            flows: BTreeMap::new(),
            virtual_time: Duration::ZERO,
            total_weight: 0.0,
            options,
        }
    }

    /// Register a flow with its storage.
    pub fn add_queue(&mut self, key: K, weight: f64, queue: Q) -> FlowResult<()> {
        validate_weight(weight)?;
        if self.flows.contains_key(&key) {
            return Err(FlowError::DuplicateFlow(format!("{key:?}")));
        }
        let mut flow = Flow {
            queue,
            weight,
            next_finish: None,
        };
        flow.schedule(self.virtual_time, self.options.empty_queue);
        self.flows.insert(key, flow);
        self.recount();
        Ok(())
    }

    /// Remove a flow and drop whatever it still holds. Returns false for
    /// unknown keys.
    pub fn remove_queue(&mut self, key: &K) -> bool {
        let removed = self.flows.remove(key).is_some();
        if removed {
            self.recount();
        }
        removed
    }

    /// Change a flow's weight. Zero pauses the flow.
    pub fn set_weight(&mut self, key: &K, weight: f64) -> FlowResult<()> {
        validate_weight(weight)?;
        let virtual_time = self.virtual_time;
        let policy = self.options.empty_queue;
        let rescale = self.options.rescale_on_weight_change;
        let flow = self
            .flows
            .get_mut(key)
            .ok_or_else(|| FlowError::UnknownFlow(format!("{key:?}")))?;

        let old = flow.weight;
        flow.weight = weight;
        if weight == 0.0 || old == 0.0 {
            // Paused flows carry no finish time; resuming starts from now.
            flow.next_finish = None;
        } else if rescale {
            if let Some(finish) = flow.next_finish {
                let remaining = finish.saturating_sub(virtual_time).as_secs_f64() * old / weight;
                let remaining = Duration::try_from_secs_f64(remaining).unwrap_or(Duration::MAX);
                flow.next_finish = Some(virtual_time.saturating_add(remaining.max(MIN_COST)));
            }
        }
        flow.schedule(virtual_time, policy);
        self.recount();
        Ok(())
    }

    pub fn weight(&self, key: &K) -> Option<f64> {
        self.flows.get(key).map(|f| f.weight)
    }

    /// Pending virtual finish time of a flow's head.
    pub fn next_finish(&self, key: &K) -> Option<Duration> {
        self.flows.get(key).and_then(|f| f.next_finish)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.flows.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.flows.keys()
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    /// Mean weight over registered flows, `None` when there are none.
    pub fn average_weight(&self) -> Option<f64> {
        if self.flows.is_empty() {
            return None;
        }
        let sum: f64 = self.flows.values().map(|f| f.weight).sum();
        Some(sum / self.flows.len() as f64)
    }

    pub fn virtual_time(&self) -> Duration {
        self.virtual_time
    }

    pub fn is_empty(&self) -> bool {
        self.flows.values().all(|f| f.queue.is_empty())
    }

    /// Messages queued across all flows.
    pub fn len(&self) -> usize {
        self.flows.values().map(|f| f.queue.len()).sum()
    }

    pub fn queued_bytes(&self) -> usize {
        self.flows.values().map(|f| f.queue.queued_bytes()).sum()
    }

    /// Edge-triggered wake-up for flows whose storage lives outside the fair
    /// queue: schedules the head if the flow just became non-empty.
    pub fn notify_nonempty(&mut self, key: &K) -> FlowResult<()> {
        let virtual_time = self.virtual_time;
        let policy = self.options.empty_queue;
        let flow = self
            .flows
            .get_mut(key)
            .ok_or_else(|| FlowError::UnknownFlow(format!("{key:?}")))?;
        if flow.schedule(virtual_time, policy) {
            self.recount();
        }
        Ok(())
    }

    /// Put a message back at the head of its flow, stamped from the current
    /// virtual time. Hands the message back if the flow is gone.
    pub fn restore(&mut self, key: &K, item: Q::Item) -> Result<(), Q::Item> {
        let virtual_time = self.virtual_time;
        let Some(flow) = self.flows.get_mut(key) else {
            return Err(item);
        };
        let size = item.size();
        flow.queue.restore(item);
        if flow.weight > 0.0 {
            flow.next_finish = Some(finish_time(virtual_time, size, flow.weight));
        }
        self.recount();
        Ok(())
    }

    /// Head size of the flow that would be served next, ignoring budget and
    /// phantom slots.
    pub fn next_head_size(&mut self) -> Option<usize> {
        self.sync_heads();
        self.flows
            .values()
            .filter(|f| f.weight > 0.0)
            .filter_map(|f| Some((f.next_finish?, f.queue.head_size()?)))
            .fold(None, |best: Option<(Duration, usize)>, (finish, size)| match best {
                Some((b, _)) if b <= finish => best,
                _ => Some((finish, size)),
            })
            .map(|(_, size)| size)
    }

    /// Serve the earliest-finishing flow if its head fits in `budget`,
    /// handing the message to `deliver`. If `deliver` gives the message
    /// back it returns to the head of its flow and neither the budget nor
    /// virtual time move.
    pub fn pop_with<F>(&mut self, budget: &mut usize, deliver: F) -> PopOutcome<K>
    where
        F: FnOnce(&K, Q::Item) -> Result<(), Q::Item>,
    {
        self.pop_with_excluding(budget, &BTreeSet::new(), deliver)
    }

    /// `pop_with` that passes over the flows in `excluded` as if they were
    /// empty. A service pass puts a key here once its next stage refused,
    /// so the other keys keep draining.
    pub fn pop_with_excluding<F>(
        &mut self,
        budget: &mut usize,
        excluded: &BTreeSet<K>,
        deliver: F,
    ) -> PopOutcome<K>
    where
        F: FnOnce(&K, Q::Item) -> Result<(), Q::Item>,
    {
        self.sync_heads();
        if !self.has_backlog(excluded) {
            return PopOutcome::Empty;
        }

        let policy = self.options.empty_queue;
        let mut deliver = Some(deliver);
        loop {
            let Some((key, finish)) = self.min_finish(excluded) else {
                return PopOutcome::Empty;
            };
            let Some(flow) = self.flows.get_mut(&key) else {
                return PopOutcome::Empty;
            };

            let Some(size) = flow.queue.head_size() else {
                let EmptyQueuePolicy::Reserve { message_bytes } = policy else {
                    // Storage drained behind our back (torn down upstream).
                    flow.next_finish = None;
                    self.recount();
                    continue;
                };
                // Idle flow wins its reserved slot: spend it and look again.
                if message_bytes > *budget {
                    return PopOutcome::Blocked {
                        key,
                        needed: message_bytes,
                    };
                }
                *budget -= message_bytes;
                flow.next_finish = Some(finish_time(finish, message_bytes, flow.weight));
                self.virtual_time = self.virtual_time.max(finish);
                continue;
            };

            if size > *budget {
                return PopOutcome::Blocked { key, needed: size };
            }
            let Some(item) = flow.queue.pop() else {
                flow.next_finish = None;
                continue;
            };
            // Shared storage can change between the size check and the pop.
            // Charge what was actually taken.
            let size = item.size();
            if size > *budget {
                flow.queue.restore(item);
                return PopOutcome::Blocked { key, needed: size };
            }
            let result = match deliver.take() {
                Some(deliver) => deliver(&key, item),
                None => Err(item),
            };
            if let Err(item) = result {
                flow.queue.restore(item);
                return PopOutcome::Refused { key };
            }

            *budget -= size;
            let weight = flow.weight;
            flow.next_finish = match (flow.queue.head_size(), policy) {
                (Some(next), _) => Some(finish_time(finish, next, weight)),
                (None, EmptyQueuePolicy::Reserve { message_bytes }) => {
                    Some(finish_time(finish, message_bytes, weight))
                }
                (None, EmptyQueuePolicy::Skip) => None,
            };
            let drained = flow.next_finish.is_none();
            self.virtual_time = self.virtual_time.max(finish);
            if drained {
                self.recount();
            }
            return PopOutcome::Delivered { key, size };
        }
    }

    /// Pop the next message if it fits in `budget`, charging its size.
    pub fn pop(&mut self, budget: &mut usize) -> Option<(K, Q::Item)> {
        let mut popped = None;
        self.pop_with(budget, |key, item| {
            popped = Some((key.clone(), item));
            Ok(())
        });
        popped
    }

    pub fn queue_info(&self) -> Vec<QueueInfo<K>> {
        self.flows
            .iter()
            .map(|(key, flow)| QueueInfo {
                key: key.clone(),
                capacity: flow.queue.capacity_bytes(),
                used: flow.queue.queued_bytes(),
                pending: flow.queue.len(),
                weight: flow.weight,
            })
            .collect()
    }

    /// Pick up flows whose external storage filled without a notification.
    fn sync_heads(&mut self) {
        let virtual_time = self.virtual_time;
        let policy = self.options.empty_queue;
        let mut changed = false;
        for flow in self.flows.values_mut() {
            changed |= flow.schedule(virtual_time, policy);
        }
        if changed {
            self.recount();
        }
    }

    fn has_backlog(&self, excluded: &BTreeSet<K>) -> bool {
        self.flows
            .iter()
            .any(|(k, f)| f.weight > 0.0 && !f.queue.is_empty() && !excluded.contains(k))
    }

    fn min_finish(&self, excluded: &BTreeSet<K>) -> Option<(K, Duration)> {
        let mut best: Option<(&K, Duration)> = None;
        for (key, flow) in &self.flows {
            if flow.weight <= 0.0 || excluded.contains(key) {
                continue;
            }
            let Some(finish) = flow.next_finish else {
                continue;
            };
            if best.map_or(true, |(_, b)| finish < b) {
                best = Some((key, finish));
            }
        }
        best.map(|(key, finish)| (key.clone(), finish))
    }

    /// Recompute the total weight from scratch so repeated add/remove pairs
    /// cannot accumulate floating point drift.
    fn recount(&mut self) {
        let policy = self.options.empty_queue;
        self.total_weight = self
            .flows
            .values()
            .filter(|f| f.is_active(policy))
            .map(|f| f.weight)
            .sum();
    }
}

impl<K, Q> FairQueue<K, Q>
where
    K: Ord + Clone + Debug,
    Q: PushQueue,
{
    /// Side-effect-free admission check; exactly predicts `push`.
    pub fn can_push(&self, key: &K, size: usize) -> bool {
        if self.options.max_message_bytes.is_some_and(|limit| size > limit) {
            return false;
        }
        self.flows
            .get(key)
            .is_some_and(|flow| flow.queue.can_push(size))
    }

    /// Append to a flow. An empty flow's head is stamped from the current
    /// virtual time.
    pub fn push(&mut self, key: &K, item: Q::Item) -> Result<(), PushError<Q::Item>> {
        let virtual_time = self.virtual_time;
        let Some(flow) = self.flows.get_mut(key) else {
            return Err(PushError::UnknownFlow(item));
        };
        let size = item.size();
        if let Some(limit) = self.options.max_message_bytes {
            if size > limit {
                return Err(PushError::Oversized {
                    message: item,
                    size,
                    limit,
                });
            }
        }

        let was_empty = flow.queue.is_empty();
        flow.queue.push(item).map_err(PushError::Full)?;
        if was_empty {
            if flow.weight > 0.0 {
                flow.next_finish = Some(finish_time(virtual_time, size, flow.weight));
            }
            self.recount();
        }
        Ok(())
    }
}
