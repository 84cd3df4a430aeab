use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::Stream;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use loggoblin_types::{HealthEvent, OrderingKey, ScrollbackEntry, SourceHealth, SourceId};

use crate::error::ReadError;
use crate::filter::{RuleStore, evaluate};
use crate::normalizer::Normalizer;
use crate::source::SourceReader;

const HEALTH_CAPACITY: usize = 256;

/// What a pulling unit does when its look-ahead queue is full
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Suspend reading until the merge catches up
    #[default]
    Block,
    /// Discard the oldest buffered record of that source
    #[serde(alias = "drop-oldest")]
    DropOldest,
    /// Drop a fraction of non-error records, block for the rest
    Sample,
}

impl FromStr for BackpressurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "drop-oldest" | "drop_oldest" => Ok(Self::DropOldest),
            "sample" => Ok(Self::Sample),
            other => Err(format!(
                "unknown backpressure policy `{other}` (expected block, drop-oldest or sample)"
            )),
        }
    }
}

impl fmt::Display for BackpressurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Block => "block",
            Self::DropOldest => "drop-oldest",
            Self::Sample => "sample",
        })
    }
}

/// Multiplexer tuning
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    pub backpressure: BackpressurePolicy,

    /// Depth of each source's look-ahead queue
    pub lookahead: usize,

    /// How long the merge waits for a quiet source
    pub stall_grace_ms: u64,

    /// Share of non-error records `Sample` drops when a queue is full
    pub sample_drop_fraction: f64,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            backpressure: BackpressurePolicy::Block,
            lookahead: 64,
            stall_grace_ms: 250,
            sample_drop_fraction: 0.5,
        }
    }
}

impl MuxConfig {
    fn stall_grace(&self) -> Duration {
        Duration::from_millis(self.stall_grace_ms)
    }
}

// ============================================================================
// Per-source lanes
// ============================================================================

#[derive(Default)]
struct LaneQueue {
    items: VecDeque<ScrollbackEntry>,
    closed: bool,
    failure: Option<ReadError>,
    /// Position among finished sources, counted from 1
    finish_order: u64,
    /// Accumulated drop fraction under `Sample`
    sample_debt: f64,
}

/// Queue shared between one pulling unit and the merge
struct LaneShared {
    queue: Mutex<LaneQueue>,

    /// Signalled by the merge whenever it takes a record
    space: Notify,

    capacity: usize,
}

impl LaneShared {
    /// Queue a record according to the backpressure policy
    async fn push(
        &self,
        entry: ScrollbackEntry,
        config: &MuxConfig,
        close: &CancellationToken,
        dropped: &AtomicU64,
    ) {
        let mut sampled = false;
        loop {
            {
                let mut queue = self.queue.lock();
                if queue.items.len() < self.capacity {
                    queue.items.push_back(entry);
                    return;
                }

                match config.backpressure {
                    BackpressurePolicy::Block => {}
                    BackpressurePolicy::DropOldest => {
                        queue.items.pop_front();
                        queue.items.push_back(entry);
                        dropped.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    BackpressurePolicy::Sample => {
                        // Errors are never sampled away
                        if !sampled && !entry.record.severity.is_error_or_worse() {
                            sampled = true;
                            queue.sample_debt += config.sample_drop_fraction;
                            if queue.sample_debt >= 1.0 {
                                queue.sample_debt -= 1.0;
                                dropped.fetch_add(1, Ordering::Relaxed);
                                return;
                            }
                        }
                    }
                }
            }

            tokio::select! {
                _ = self.space.notified() => {}
                _ = close.cancelled() => {
                    // Already read, so hand it over instead of losing it
                    self.queue.lock().items.push_back(entry);
                    return;
                }
            }
        }
    }

    fn finish(&self, failure: Option<ReadError>, finished: &AtomicU64) {
        let mut queue = self.queue.lock();
        queue.closed = true;
        queue.failure = failure;
        queue.finish_order = finished.fetch_add(1, Ordering::Relaxed) + 1;
    }
}

/// Merge-side view of one source
struct Lane {
    id: SourceId,
    tag: Arc<str>,
    shared: Arc<LaneShared>,
    head: Option<ScrollbackEntry>,
    /// When the merge last took a record from this source
    last_seen: Instant,
}

/// Control-side view of one source
struct Unit {
    close: CancellationToken,
    task: JoinHandle<()>,
}

struct Shared {
    config: MuxConfig,
    normalizer: Arc<Normalizer>,
    rules: Arc<RuleStore>,
    lanes_tx: mpsc::UnboundedSender<Lane>,
    units: Mutex<HashMap<SourceId, Unit>>,
    wakeup: Arc<Notify>,
    health: broadcast::Sender<HealthEvent>,
    dropped: Arc<AtomicU64>,
    finished: Arc<AtomicU64>,
}

/// Everything a pulling unit needs
struct PullContext {
    config: MuxConfig,
    normalizer: Arc<Normalizer>,
    rules: Arc<RuleStore>,
    wakeup: Arc<Notify>,
    health: broadcast::Sender<HealthEvent>,
    dropped: Arc<AtomicU64>,
    finished: Arc<AtomicU64>,
}

/// Read, normalize and filter one source into its lane
async fn pull(mut reader: SourceReader, lane: Arc<LaneShared>, ctx: PullContext) {
    let id = reader.id();
    let tag = reader.shared_tag();
    let close = reader.close_handle();
    let send_health = |health| {
        let _ = ctx.health.send(HealthEvent {
            source: id,
            tag: Arc::clone(&tag),
            health,
        });
    };

    send_health(SourceHealth::Connected);

    let failure = loop {
        match reader.next_line().await {
            Ok(Some(line)) => {
                let record = Arc::new(ctx.normalizer.normalize(line));
                let rules = ctx.rules.snapshot();
                let verdict = evaluate(&record, &rules);
                let entry = ScrollbackEntry::new(record, verdict, rules.version());

                lane.push(entry, &ctx.config, &close, &ctx.dropped).await;
                ctx.wakeup.notify_one();
            }
            Ok(None) => break None,
            Err(e) => break Some(e),
        }
    };

    match &failure {
        Some(e) => {
            warn!(source = %tag, error = %e, "source failed");
            send_health(SourceHealth::Failed(e.to_string()));
        }
        None => {
            debug!(source = %tag, "source ended");
            send_health(SourceHealth::Ended);
        }
    }

    lane.finish(failure, &ctx.finished);
    ctx.wakeup.notify_one();
}

// ============================================================================
// Control side
// ============================================================================

/// Cloneable control side of a [`Multiplexer`]
///
/// Registers and unregisters sources while the merge is being driven
/// elsewhere.
#[derive(Clone)]
pub struct MuxHandle {
    shared: Arc<Shared>,
}

impl MuxHandle {
    /// Start pulling from a source
    pub fn register(&self, mut reader: SourceReader) -> SourceId {
        let shared = &self.shared;
        let id = reader.id();
        let tag = reader.shared_tag();
        let close = reader.close_handle();
        reader.attach_health(shared.health.clone());

        let lane = Arc::new(LaneShared {
            queue: Mutex::new(LaneQueue::default()),
            space: Notify::new(),
            capacity: shared.config.lookahead.max(1),
        });

        // The merge may already be gone; the unit still runs until closed
        let _ = shared.lanes_tx.send(Lane {
            id,
            tag: Arc::clone(&tag),
            shared: Arc::clone(&lane),
            head: None,
            last_seen: Instant::now(),
        });

        let ctx = PullContext {
            config: shared.config.clone(),
            normalizer: Arc::clone(&shared.normalizer),
            rules: Arc::clone(&shared.rules),
            wakeup: Arc::clone(&shared.wakeup),
            health: shared.health.clone(),
            dropped: Arc::clone(&shared.dropped),
            finished: Arc::clone(&shared.finished),
        };
        let task = tokio::spawn(pull(reader, lane, ctx));

        shared.units.lock().insert(id, Unit { close, task });
        shared.wakeup.notify_one();

        info!(source = %tag, %id, "registered source");
        id
    }

    /// Close a source and wait for its pulling unit to stop
    ///
    /// Records it already buffered are still delivered by the merge. Returns
    /// `false` for an unknown (or already removed) source.
    pub async fn unregister(&self, id: SourceId) -> bool {
        let Some(unit) = self.shared.units.lock().remove(&id) else {
            return false;
        };

        unit.close.cancel();
        if let Err(e) = unit.task.await {
            warn!(%id, error = %e, "pulling unit panicked");
        }
        debug!(%id, "unregistered source");
        true
    }

    /// Unregister every source
    pub async fn shutdown(&self) {
        let units: Vec<_> = self.shared.units.lock().drain().collect();
        for (_, unit) in &units {
            unit.close.cancel();
        }
        for (id, unit) in units {
            if let Err(e) = unit.task.await {
                warn!(%id, error = %e, "pulling unit panicked");
            }
        }
        info!("multiplexer shut down");
    }

    pub fn subscribe_health(&self) -> broadcast::Receiver<HealthEvent> {
        self.shared.health.subscribe()
    }

    /// Records discarded by backpressure so far
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Merge side
// ============================================================================

/// Merges any number of sources into one stream ordered by record time
///
/// Each source gets a pulling unit with a bounded look-ahead queue; the merge
/// always emits the smallest ordering key among the queue heads. A quiet
/// source holds the merge back for at most the stall grace, so a record that
/// shows up later with an earlier key is emitted tagged `late_arrival`.
pub struct Multiplexer {
    handle: MuxHandle,

    lanes_rx: mpsc::UnboundedReceiver<Lane>,

    lanes: Vec<Lane>,

    /// Largest key emitted so far
    high_water: Option<OrderingKey>,

    close_reason: Option<ReadError>,

    /// Finish position of the source `close_reason` belongs to
    last_finish: u64,
}

impl Multiplexer {
    pub fn new(config: MuxConfig, normalizer: Arc<Normalizer>, rules: Arc<RuleStore>) -> Self {
        let (lanes_tx, lanes_rx) = mpsc::unbounded_channel();
        let (health, _) = broadcast::channel(HEALTH_CAPACITY);

        let shared = Arc::new(Shared {
            config,
            normalizer,
            rules,
            lanes_tx,
            units: Mutex::new(HashMap::new()),
            wakeup: Arc::new(Notify::new()),
            health,
            dropped: Arc::new(AtomicU64::new(0)),
            finished: Arc::new(AtomicU64::new(0)),
        });

        Self {
            handle: MuxHandle { shared },
            lanes_rx,
            lanes: Vec::new(),
            high_water: None,
            close_reason: None,
            last_finish: 0,
        }
    }

    pub fn handle(&self) -> MuxHandle {
        self.handle.clone()
    }

    pub fn register(&self, reader: SourceReader) -> SourceId {
        self.handle.register(reader)
    }

    pub async fn unregister(&self, id: SourceId) -> bool {
        self.handle.unregister(id).await
    }

    pub fn subscribe_health(&self) -> broadcast::Receiver<HealthEvent> {
        self.handle.subscribe_health()
    }

    pub fn dropped_count(&self) -> u64 {
        self.handle.dropped_count()
    }

    /// Terminal error of the source that finished last, if it failed
    pub fn close_reason(&self) -> Option<&ReadError> {
        self.close_reason.as_ref()
    }

    /// Next record in merge order, `None` once no live source remains
    ///
    /// Cancel-safe: records stay in their lanes until returned.
    pub async fn next(&mut self) -> Option<ScrollbackEntry> {
        let grace = self.handle.shared.config.stall_grace();
        let wakeup = Arc::clone(&self.handle.shared.wakeup);

        loop {
            while let Ok(lane) = self.lanes_rx.try_recv() {
                self.lanes.push(lane);
            }
            self.refill();

            if self.lanes.is_empty() {
                return None;
            }

            // A live source without a buffered record may still produce an
            // earlier key; wait for the latest of their grace deadlines
            let deadline = self
                .lanes
                .iter()
                .filter(|lane| lane.head.is_none())
                .map(|lane| lane.last_seen + grace)
                .max();

            let has_head = self.lanes.iter().any(|lane| lane.head.is_some());
            let ready = match deadline {
                None => true,
                Some(deadline) => has_head && Instant::now() >= deadline,
            };

            if ready {
                if let Some(entry) = self.emit() {
                    return Some(entry);
                }
                continue;
            }

            match deadline {
                Some(deadline) if has_head => {
                    tokio::select! {
                        _ = wakeup.notified() => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                _ => wakeup.notified().await,
            }
        }
    }

    /// Turn the multiplexer into a `Stream` of entries
    pub fn into_stream(self) -> impl Stream<Item = ScrollbackEntry> {
        futures::stream::unfold(self, |mut mux| async move {
            mux.next().await.map(|entry| (entry, mux))
        })
    }

    /// Move queued records into empty heads and retire finished lanes
    fn refill(&mut self) {
        let mut finished = Vec::new();

        for (index, lane) in self.lanes.iter_mut().enumerate() {
            if lane.head.is_some() {
                continue;
            }

            let mut queue = lane.shared.queue.lock();
            if let Some(entry) = queue.items.pop_front() {
                drop(queue);
                lane.head = Some(entry);
                lane.last_seen = Instant::now();
                lane.shared.space.notify_one();
            } else if queue.closed {
                finished.push((index, queue.finish_order, queue.failure.take()));
            }
        }

        for (index, order, failure) in finished.into_iter().rev() {
            let lane = self.lanes.remove(index);
            self.handle.shared.units.lock().remove(&lane.id);
            debug!(source = %lane.tag, failed = failure.is_some(), order, "lane drained");

            // Drain order can differ from finish order
            if order > self.last_finish {
                self.last_finish = order;
                self.close_reason = failure;
            }
        }
    }

    /// Pop the smallest head
    fn emit(&mut self) -> Option<ScrollbackEntry> {
        let (_, index) = self
            .lanes
            .iter()
            .enumerate()
            .filter_map(|(i, lane)| lane.head.as_ref().map(|h| (h.record.ordering_key(), i)))
            .min()?;

        let mut entry = self.lanes[index].head.take()?;
        let key = entry.record.ordering_key();

        match self.high_water {
            Some(high) if key < high => entry.late_arrival = true,
            _ => self.high_water = Some(key),
        }
        Some(entry)
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        for unit in self.handle.shared.units.lock().values() {
            unit.close.cancel();
        }
    }
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("lanes", &self.lanes.len())
            .field("high_water", &self.high_water)
            .field("dropped", &self.dropped_count())
            .finish()
    }
}
