//! Priority request queue for narrative calls.
//!
//! Three FIFO lanes feed a bounded pool of async workers. Nothing happens on
//! [`RequestQueue::enqueue`] except bookkeeping: dispatch, retries, timeouts
//! and result collection all run inside [`RequestQueue::poll_completed`],
//! which the scheduler calls once per tick. That keeps the order of every
//! queue decision tied to the tick number rather than to wall-clock timing.
//!
//! Deduplication is by payload hash. A request that matches one already
//! queued, in flight, or waiting to retry becomes a follower and receives
//! the leader's outcome. A request whose response is cached resolves on the
//! next poll without a call.

mod backoff;
mod worker;

pub use backoff::backoff_delay;
pub use worker::{WorkerMessage, WorkerPool};

use crate::cache::ResponseCache;
use crate::config::{EngineConfig, QueueConfig, SchedulerConfig};
use crate::error::FailureReason;
use crate::ids::{IdAllocator, RequestId};
use crate::narrative::{FallbackGenerator, NarrativePayload, Origin};
use crate::rng::{stream_seed, TickRng};
use crate::world::FlavorSource;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Request urgency. Ordering follows dispatch preference: `High < Medium < Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Player-facing text.
    High,
    /// World-event narration.
    Medium,
    /// Ambient flavor.
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    fn lane(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// A narrative request. Priority is fixed for its lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub priority: Priority,
    pub payload: NarrativePayload,
    pub created_tick: u64,
    /// Ticks the request may wait undispatched.
    pub timeout_ticks: u64,
    pub origin: Origin,
}

/// What [`RequestQueue::enqueue`] did with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    /// Placed in its lane. `evicted` is a Low request dropped to make room.
    Queued {
        id: RequestId,
        evicted: Option<RequestId>,
    },
    /// Attached to an equivalent request already pending.
    Deduplicated { id: RequestId, leader: RequestId },
    /// Will resolve from the cache on the next poll.
    CacheHit { id: RequestId },
    /// Lane or queue full; the request was dropped.
    Overflow { id: RequestId },
}

impl EnqueueOutcome {
    pub fn id(&self) -> RequestId {
        match self {
            EnqueueOutcome::Queued { id, .. }
            | EnqueueOutcome::Deduplicated { id, .. }
            | EnqueueOutcome::CacheHit { id }
            | EnqueueOutcome::Overflow { id } => *id,
        }
    }

    /// Whether a completion will eventually be produced for this request.
    pub fn is_accepted(&self) -> bool {
        !matches!(self, EnqueueOutcome::Overflow { .. })
    }
}

/// Final result of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success { text: String, source: FlavorSource },
    Failed { reason: FailureReason, fallback: String },
}

impl Outcome {
    /// Text to attach, whichever way the request resolved.
    pub fn text(&self) -> &str {
        match self {
            Outcome::Success { text, .. } => text,
            Outcome::Failed { fallback, .. } => fallback,
        }
    }

    pub fn source(&self) -> FlavorSource {
        match self {
            Outcome::Success { source, .. } => *source,
            Outcome::Failed { .. } => FlavorSource::Fallback,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }
}

/// The backoff draw made before one retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryDraw {
    /// Zero-based retry number.
    pub retry: u32,
    /// Seed of the jitter stream for this retry.
    pub seed: u64,
    pub draws: u64,
    pub delay_ms: u64,
}

/// A resolved request, as returned by [`RequestQueue::poll_completed`].
#[derive(Debug, Clone, PartialEq)]
pub struct Completed {
    pub id: RequestId,
    pub priority: Priority,
    pub origin: Origin,
    pub payload: NarrativePayload,
    pub outcome: Outcome,
    /// Tick of the first dispatch, if the request was ever dispatched.
    pub dispatched_tick: Option<u64>,
    pub completed_tick: u64,
    /// Provider calls made for this request (0 for cache hits and timeouts).
    pub attempts: u32,
    /// Wall-clock duration of the final call.
    pub latency: Option<Duration>,
    pub retries: Vec<RetryDraw>,
}

/// Running counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub deduplicated: u64,
    pub cache_hits: u64,
    pub overflowed: u64,
    pub evicted: u64,
    pub timed_out: u64,
    pub retried: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Queued,
    InFlight,
    /// Waiting for its backoff to elapse.
    Retrying { ready_tick: u64 },
}

#[derive(Debug)]
struct Pending {
    request: Request,
    key: u64,
    stage: Stage,
    attempts: u32,
    dispatched_tick: Option<u64>,
    followers: Vec<Request>,
    /// The leader's own result is discarded; followers still get theirs.
    cancelled: bool,
    retries: Vec<RetryDraw>,
}

/// Whether a lane can take one more request.
enum Room {
    Free,
    Evicted(RequestId),
    Full,
}

/// The request queue. Owned by the scheduler; never shared across threads.
pub struct RequestQueue {
    config: QueueConfig,
    scheduler: SchedulerConfig,
    seed: u64,
    lanes: [VecDeque<RequestId>; 3],
    pending: BTreeMap<RequestId, Pending>,
    by_key: BTreeMap<u64, RequestId>,
    /// Cache hits waiting for the next poll.
    ready: Vec<Completed>,
    in_flight_main: usize,
    in_flight_low: usize,
    ids: IdAllocator,
    cache: ResponseCache<u64, String>,
    fallback: Arc<dyn FallbackGenerator>,
    workers: WorkerPool,
    stats: QueueStats,
}

impl RequestQueue {
    pub fn new(
        config: &EngineConfig,
        workers: WorkerPool,
        fallback: Arc<dyn FallbackGenerator>,
    ) -> Self {
        Self {
            config: config.queue.clone(),
            scheduler: config.scheduler.clone(),
            seed: config.seed,
            lanes: Default::default(),
            pending: BTreeMap::new(),
            by_key: BTreeMap::new(),
            ready: Vec::new(),
            in_flight_main: 0,
            in_flight_low: 0,
            ids: IdAllocator::default(),
            cache: ResponseCache::new(&config.cache),
            fallback,
            workers,
            stats: QueueStats::default(),
        }
    }

    /// Build a request with a fresh id and its lane's timeout.
    pub fn request(
        &mut self,
        priority: Priority,
        payload: NarrativePayload,
        origin: Origin,
        tick: u64,
    ) -> Request {
        Request {
            id: RequestId::new(self.ids.allocate()),
            priority,
            timeout_ticks: self.scheduler.ticks_for(self.config.lane_timeout(priority)),
            payload,
            created_tick: tick,
            origin,
        }
    }

    /// Build and enqueue in one step.
    pub fn submit(
        &mut self,
        priority: Priority,
        payload: NarrativePayload,
        origin: Origin,
        tick: u64,
    ) -> EnqueueOutcome {
        let request = self.request(priority, payload, origin, tick);
        self.enqueue(request)
    }

    /// Accept a request. Never blocks and never dispatches.
    pub fn enqueue(&mut self, request: Request) -> EnqueueOutcome {
        let id = request.id;
        let key = request.payload.dedup_key();
        self.stats.enqueued += 1;

        // Only attach to a leader at least as urgent, so a follower never
        // waits in a slower lane than its own.
        if let Some(leader_id) = self.by_key.get(&key).copied() {
            if let Some(leader) = self.pending.get_mut(&leader_id) {
                if leader.request.priority <= request.priority {
                    debug!(request = %id, leader = %leader_id, "deduplicated narrative request");
                    leader.followers.push(request);
                    self.stats.deduplicated += 1;
                    return EnqueueOutcome::Deduplicated { id, leader: leader_id };
                }
            }
        }

        let now = self.scheduler.sim_time(request.created_tick);
        if let Some(text) = self.cache.get(&key, now) {
            debug!(request = %id, "narrative cache hit");
            self.stats.cache_hits += 1;
            self.ready.push(Completed {
                id,
                priority: request.priority,
                // Stamped with the poll tick when handed out.
                completed_tick: request.created_tick,
                origin: request.origin,
                payload: request.payload,
                outcome: Outcome::Success {
                    text,
                    source: FlavorSource::Cache,
                },
                dispatched_tick: None,
                attempts: 0,
                latency: None,
                retries: Vec::new(),
            });
            return EnqueueOutcome::CacheHit { id };
        }

        let priority = request.priority;
        let evicted = match self.make_room(priority, 0) {
            Room::Free => None,
            Room::Evicted(victim) => Some(victim),
            Room::Full => return self.overflow(id, priority),
        };

        self.lanes[priority.lane()].push_back(id);
        self.by_key.entry(key).or_insert(id);
        self.pending.insert(
            id,
            Pending {
                request,
                key,
                stage: Stage::Queued,
                attempts: 0,
                dispatched_tick: None,
                followers: Vec::new(),
                cancelled: false,
                retries: Vec::new(),
            },
        );
        EnqueueOutcome::Queued { id, evicted }
    }

    fn overflow(&mut self, id: RequestId, priority: Priority) -> EnqueueOutcome {
        warn!(request = %id, %priority, "request queue full, dropping request");
        self.stats.overflowed += 1;
        EnqueueOutcome::Overflow { id }
    }

    /// Check the lane and total caps for one more `priority` request.
    ///
    /// High and Medium never displace each other; only Low work is evicted,
    /// oldest first, skipping the first `keep` entries of the Low lane.
    fn make_room(&mut self, priority: Priority, keep: usize) -> Room {
        let mut evicted = None;
        if self.lanes[priority.lane()].len() >= self.config.lane_cap(priority) {
            if priority != Priority::Low {
                return Room::Full;
            }
            evicted = self.evict_oldest_low(keep);
            if evicted.is_none() {
                return Room::Full;
            }
        }
        if evicted.is_none() && self.queued_len() >= self.config.total_cap {
            evicted = self.evict_oldest_low(keep);
        }
        match evicted {
            Some(victim) => Room::Evicted(victim),
            None if self.queued_len() >= self.config.total_cap => Room::Full,
            None => Room::Free,
        }
    }

    fn evict_oldest_low(&mut self, keep: usize) -> Option<RequestId> {
        let victim = self.lanes[Priority::Low.lane()].remove(keep)?;
        if let Some(pending) = self.pending.remove(&victim) {
            self.forget_key(pending.key, victim);
            self.stats.evicted += 1 + pending.followers.len() as u64;
        }
        debug!(request = %victim, "evicted oldest low-priority request");
        Some(victim)
    }

    fn forget_key(&mut self, key: u64, id: RequestId) {
        if self.by_key.get(&key) == Some(&id) {
            self.by_key.remove(&key);
        }
    }

    /// Cancel one request. An in-flight call runs to completion and its
    /// result is dropped. Returns whether anything was cancelled.
    pub fn cancel(&mut self, id: RequestId) -> bool {
        if let Some(pos) = self.ready.iter().position(|c| c.id == id) {
            self.ready.remove(pos);
            self.stats.cancelled += 1;
            return true;
        }

        if let Some(pending) = self.pending.get_mut(&id) {
            if pending.cancelled {
                return false;
            }
            self.stats.cancelled += 1;
            let removable = pending.followers.is_empty() && pending.stage != Stage::InFlight;
            if !removable {
                pending.cancelled = true;
                return true;
            }
            let priority = pending.request.priority;
            let key = pending.key;
            self.pending.remove(&id);
            self.lanes[priority.lane()].retain(|queued| *queued != id);
            self.forget_key(key, id);
            return true;
        }

        for pending in self.pending.values_mut() {
            if let Some(pos) = pending.followers.iter().position(|f| f.id == id) {
                pending.followers.remove(pos);
                self.stats.cancelled += 1;
                return true;
            }
        }
        false
    }

    /// Cancel everything, for session teardown.
    pub fn cancel_all(&mut self) -> usize {
        let mut cancelled = self.ready.len();
        self.ready.clear();
        for lane in &mut self.lanes {
            lane.clear();
        }
        self.by_key.clear();
        self.pending.retain(|_, pending| {
            if !pending.cancelled {
                cancelled += 1 + pending.followers.len();
            }
            pending.followers.clear();
            pending.cancelled = true;
            // In-flight calls keep their slot until they report back.
            pending.stage == Stage::InFlight
        });
        self.stats.cancelled += cancelled as u64;
        if cancelled > 0 {
            info!(cancelled, "cancelled all narrative requests");
        }
        cancelled
    }

    /// Pump the queue and return everything resolved since the last poll.
    ///
    /// Results come High, then Medium, then Low; within a lane in the order
    /// they resolved.
    pub fn poll_completed(&mut self, now_tick: u64) -> Vec<Completed> {
        let mut resolved = std::mem::take(&mut self.ready);

        for message in self.workers.drain() {
            self.handle_message(message, now_tick, &mut resolved);
        }
        for (id, attempt) in self.workers.take_lost() {
            warn!(request = %id, attempt, "narrative worker ended without reporting");
            if let Some(pending) = self.take_in_flight(id) {
                let reason = FailureReason::WorkerLost;
                self.resolve_failed(pending, reason, now_tick, None, &mut resolved);
            }
        }

        self.requeue_due_retries(now_tick);
        self.expire_queued(now_tick, &mut resolved);
        self.dispatch(now_tick);

        for completed in &mut resolved {
            completed.completed_tick = now_tick;
        }
        resolved.sort_by_key(|c| c.priority);
        resolved
    }

    fn take_in_flight(&mut self, id: RequestId) -> Option<Pending> {
        match self.pending.get(&id) {
            Some(p) if p.stage == Stage::InFlight => {}
            _ => return None,
        }
        let pending = self.pending.remove(&id)?;
        match pending.request.priority {
            Priority::Low => self.in_flight_low = self.in_flight_low.saturating_sub(1),
            _ => self.in_flight_main = self.in_flight_main.saturating_sub(1),
        }
        Some(pending)
    }

    fn handle_message(
        &mut self,
        message: WorkerMessage,
        now_tick: u64,
        resolved: &mut Vec<Completed>,
    ) {
        let Some(mut pending) = self.take_in_flight(message.id) else {
            debug!(request = %message.id, "dropping result for unknown request");
            return;
        };
        let latency = Some(message.elapsed);

        match message.result {
            Ok(text) => {
                let now = self.scheduler.sim_time(now_tick);
                self.cache.put(pending.key, text.clone(), now);
                self.forget_key(pending.key, pending.request.id);
                self.stats.succeeded += 1;
                let outcome = Outcome::Success {
                    text,
                    source: FlavorSource::Provider,
                };
                self.emit(pending, outcome, now_tick, latency, resolved);
            }
            Err(error) if error.is_transient() && pending.attempts <= self.config.max_retries => {
                // Retry n (zero-based) follows call n + 1.
                let retry = pending.attempts - 1;
                let seed = stream_seed(self.seed, pending.request.id.raw(), retry as u64);
                let mut rng = TickRng::from_seed_u64(seed);
                let delay = backoff_delay(
                    retry,
                    self.config.backoff_base(),
                    self.config.backoff_max(),
                    &mut rng,
                );
                let ready_tick = now_tick + self.scheduler.ticks_for(delay).max(1);
                warn!(
                    request = %pending.request.id,
                    attempt = pending.attempts,
                    %error,
                    ?delay,
                    ready_tick,
                    "narrative call failed, retrying"
                );
                pending.retries.push(RetryDraw {
                    retry,
                    seed,
                    draws: rng.draws(),
                    delay_ms: delay.as_millis() as u64,
                });
                self.stats.retried += 1;
                pending.stage = Stage::Retrying { ready_tick };
                self.pending.insert(pending.request.id, pending);
            }
            Err(error) => {
                let reason = if error.is_transient() {
                    FailureReason::TransientExhausted {
                        attempts: pending.attempts,
                        last: error,
                    }
                } else {
                    FailureReason::Permanent(error)
                };
                self.resolve_failed(pending, reason, now_tick, latency, resolved);
            }
        }
    }

    fn resolve_failed(
        &mut self,
        pending: Pending,
        reason: FailureReason,
        now_tick: u64,
        latency: Option<Duration>,
        resolved: &mut Vec<Completed>,
    ) {
        warn!(request = %pending.request.id, %reason, "narrative request failed, using fallback");
        self.forget_key(pending.key, pending.request.id);
        self.stats.failed += 1;
        let fallback = self.fallback.generate(&pending.request.payload);
        let outcome = Outcome::Failed { reason, fallback };
        self.emit(pending, outcome, now_tick, latency, resolved);
    }

    /// Produce completions for a leader and its followers.
    fn emit(
        &mut self,
        pending: Pending,
        outcome: Outcome,
        now_tick: u64,
        latency: Option<Duration>,
        resolved: &mut Vec<Completed>,
    ) {
        let Pending {
            request,
            followers,
            cancelled,
            attempts,
            dispatched_tick,
            retries,
            ..
        } = pending;

        let leader = (!cancelled).then_some(request);
        for request in leader.into_iter().chain(followers) {
            resolved.push(Completed {
                id: request.id,
                priority: request.priority,
                origin: request.origin,
                payload: request.payload,
                outcome: outcome.clone(),
                dispatched_tick,
                completed_tick: now_tick,
                attempts,
                latency,
                retries: retries.clone(),
            });
        }
    }

    /// Move retries whose backoff has elapsed back into their lanes.
    ///
    /// Retries go ahead of fresh requests, lowest id first, but obey the same
    /// caps as [`RequestQueue::enqueue`]. A retry that finds its lane full
    /// stays due and tries again on the next poll.
    fn requeue_due_retries(&mut self, now_tick: u64) {
        let due: Vec<(RequestId, Priority)> = self
            .pending
            .values()
            .filter(|p| matches!(p.stage, Stage::Retrying { ready_tick } if ready_tick <= now_tick))
            .map(|p| (p.request.id, p.request.priority))
            .collect();
        let mut readmitted = [0usize; 3];
        for (id, priority) in due {
            let keep = readmitted[Priority::Low.lane()];
            if let Room::Full = self.make_room(priority, keep) {
                debug!(request = %id, %priority, "lane full, retry deferred");
                continue;
            }
            if let Some(pending) = self.pending.get_mut(&id) {
                pending.stage = Stage::Queued;
            }
            let lane = priority.lane();
            self.lanes[lane].insert(readmitted[lane], id);
            readmitted[lane] += 1;
        }
    }

    fn expire_queued(&mut self, now_tick: u64, resolved: &mut Vec<Completed>) {
        for priority in Priority::ALL {
            let lane = priority.lane();
            let expired: Vec<RequestId> = self.lanes[lane]
                .iter()
                .copied()
                .filter(|id| {
                    self.pending.get(id).is_some_and(|p| {
                        let waited = now_tick.saturating_sub(p.request.created_tick);
                        p.attempts == 0 && waited > p.request.timeout_ticks
                    })
                })
                .collect();
            if expired.is_empty() {
                continue;
            }
            self.lanes[lane].retain(|id| !expired.contains(id));
            for id in expired {
                if let Some(pending) = self.pending.remove(&id) {
                    self.stats.timed_out += 1;
                    let reason = FailureReason::QueueTimeout;
                    self.resolve_failed(pending, reason, now_tick, None, resolved);
                }
            }
        }
    }

    fn dispatch(&mut self, now_tick: u64) {
        while self.in_flight_main < self.config.max_concurrent {
            let next = self.lanes[Priority::High.lane()]
                .pop_front()
                .or_else(|| self.lanes[Priority::Medium.lane()].pop_front());
            match next {
                Some(id) => {
                    self.start(id, now_tick);
                    self.in_flight_main += 1;
                }
                None => break,
            }
        }

        let main_lanes_empty = self.lanes[Priority::High.lane()].is_empty()
            && self.lanes[Priority::Medium.lane()].is_empty();
        if !main_lanes_empty {
            return;
        }
        while self.in_flight_low < self.config.max_concurrent_low {
            match self.lanes[Priority::Low.lane()].pop_front() {
                Some(id) => {
                    self.start(id, now_tick);
                    self.in_flight_low += 1;
                }
                None => break,
            }
        }
    }

    fn start(&mut self, id: RequestId, now_tick: u64) {
        let Some(pending) = self.pending.get_mut(&id) else {
            return;
        };
        let attempt = pending.attempts;
        pending.attempts += 1;
        pending.stage = Stage::InFlight;
        pending.dispatched_tick.get_or_insert(now_tick);
        let prompt = pending.request.payload.prompt();
        self.workers.spawn(id, attempt, prompt);
    }

    /// Requests waiting in `priority`'s lane.
    pub fn lane_depth(&self, priority: Priority) -> usize {
        self.lanes[priority.lane()].len()
    }

    /// Requests waiting in any lane.
    pub fn queued_len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight_main + self.in_flight_low
    }

    /// Requests waiting out a backoff.
    pub fn retrying(&self) -> usize {
        self.pending
            .values()
            .filter(|p| matches!(p.stage, Stage::Retrying { .. }))
            .count()
    }

    /// Nothing queued, running, retrying or waiting to be polled.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.ready.is_empty()
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    pub fn cache(&self) -> &ResponseCache<u64, String> {
        &self.cache
    }

    pub fn provider_name(&self) -> &str {
        self.workers.provider_name()
    }

    /// Abort running calls outright.
    pub fn abort_workers(&mut self) {
        self.workers.abort_all();
        self.pending.retain(|_, p| p.stage != Stage::InFlight);
        self.in_flight_main = 0;
        self.in_flight_low = 0;
    }
}

impl fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestQueue")
            .field("queued", &self.queued_len())
            .field("in_flight", &self.in_flight())
            .field("stats", &self.stats)
            .finish()
    }
}
