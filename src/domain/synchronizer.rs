//! Merges independent data producers into one ordered stream of time slices.
//!
//! Producers yield [`FeedEvent`]s in non-decreasing time order. The
//! [`Synchronizer`] k-merges them on a binary heap and folds every event that
//! shares the earliest timestamp into a single [`TimeSlice`], so no instant is
//! ever split across two slices. [`Synchronizer::stream_data`] runs the merge
//! on its own thread behind a bounded channel, [`Synchronizer::stream_live`]
//! does the same for live feeds against the wall clock, and
//! [`AlgorithmStream`] puts warm-up history in front of either.

use chrono::{DateTime, Duration, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::Arc;
use std::thread;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::algorithm::AlgorithmContext;
use super::error::EngineError;
use super::history::prepare_warmup_requests;
use super::market_data::MarketData;
use super::phase::Phase;
use super::resolution::round_down;
use super::status::{AlgorithmStatus, RunState};
use super::subscription::SubscriptionManager;
use super::time_limit::TimeProvider;
use super::time_slice::{DataFeedPacket, SecurityChanges, TimeSlice};
use super::time_slice_factory;
use crate::ports::history_port::HistoryIter;
use crate::ports::result_port::ResultPort;

#[derive(Debug, Clone)]
pub enum FeedPayload {
    Data(DataFeedPacket),
    Universe {
        name: String,
        changes: SecurityChanges,
        data: Vec<MarketData>,
    },
}

/// One unit of producer output, stamped with the instant it belongs to.
#[derive(Debug, Clone)]
pub struct FeedEvent {
    pub time: DateTime<Utc>,
    pub payload: FeedPayload,
}

impl FeedEvent {
    pub fn data(time: DateTime<Utc>, packet: DataFeedPacket) -> Self {
        FeedEvent {
            time,
            payload: FeedPayload::Data(packet),
        }
    }
}

pub type Producer = Box<dyn Iterator<Item = FeedEvent> + Send>;

struct HeapEntry {
    event: FeedEvent,
    producer: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // reversed: BinaryHeap is a max-heap, the earliest event must surface first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .event
            .time
            .cmp(&self.event.time)
            .then_with(|| other.producer.cmp(&self.producer))
    }
}

/// Single-pass merge of producers into time slices.
pub struct Synchronizer {
    producers: Vec<Producer>,
    heap: BinaryHeap<HeapEntry>,
    primed: bool,
    time_pulse: Option<Duration>,
    last_time: Option<DateTime<Utc>>,
    failed: bool,
}

impl Synchronizer {
    pub fn new(producers: Vec<Producer>) -> Self {
        Synchronizer {
            producers,
            heap: BinaryHeap::new(),
            primed: false,
            time_pulse: None,
            last_time: None,
            failed: false,
        }
    }

    /// Emits data-free pulses on `interval` boundaries across gaps in the data.
    pub fn with_time_pulse(mut self, interval: Duration) -> Self {
        if interval > Duration::zero() {
            self.time_pulse = Some(interval);
        }
        self
    }

    fn pull(&mut self, producer: usize) -> Option<HeapEntry> {
        self.producers[producer]
            .next()
            .map(|event| HeapEntry { event, producer })
    }

    fn prime(&mut self) {
        for producer in 0..self.producers.len() {
            if let Some(entry) = self.pull(producer) {
                self.heap.push(entry);
            }
        }
        self.primed = true;
    }

    fn next_pulse(&self, frontier: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let interval = self.time_pulse?;
        let last = self.last_time?;
        let pulse = round_down(last.naive_utc(), interval).and_utc() + interval;
        (pulse > last && pulse < frontier).then_some(pulse)
    }

    fn merge_frontier(&mut self, frontier: DateTime<Utc>) -> Result<TimeSlice, EngineError> {
        let mut payloads = Vec::new();
        while self.heap.peek().is_some_and(|e| e.event.time == frontier) {
            let Some(entry) = self.heap.pop() else {
                break;
            };
            if let Some(next) = self.pull(entry.producer) {
                if next.event.time < entry.event.time {
                    return Err(EngineError::Data {
                        reason: format!(
                            "producer {} went back in time from {} to {}",
                            entry.producer, entry.event.time, next.event.time
                        ),
                    });
                }
                self.heap.push(next);
            }
            payloads.push(entry.event.payload);
        }
        assemble(frontier, payloads)
    }

    /// Runs the merge on a background thread, handing slices over through a
    /// channel holding at most `buffer` of them.
    pub fn stream_data(
        self,
        buffer: usize,
        cancel: CancellationToken,
        state: Arc<RunState>,
    ) -> SliceStream {
        let (tx, rx) = bounded(buffer.max(1));
        let producer_cancel = cancel.clone();
        thread::spawn(move || {
            for item in self {
                if producer_cancel.is_cancelled() {
                    debug!("synchronizer cancelled");
                    break;
                }
                let failed = item.is_err();
                if tx.send(item).is_err() || failed {
                    break;
                }
            }
        });
        SliceStream {
            rx,
            cancel,
            state,
            done: false,
        }
    }
}

impl Synchronizer {
    /// Live counterpart of [`stream_data`](Self::stream_data).
    ///
    /// Every producer is drained on its own thread, so a feed blocked waiting
    /// for market data holds back neither the others nor the clock. Pulses
    /// follow `time_provider` while the feeds are quiet and keep coming after
    /// they close, until the stream is cancelled or dropped. `poll` bounds how
    /// long a quiet period goes unnoticed.
    pub fn stream_live(
        self,
        buffer: usize,
        cancel: CancellationToken,
        state: Arc<RunState>,
        time_provider: Arc<dyn TimeProvider>,
        poll: std::time::Duration,
    ) -> SliceStream {
        let (tx, rx) = bounded(buffer.max(1));
        let (event_tx, event_rx) = bounded::<(usize, Option<FeedEvent>)>(buffer.max(1));
        let count = self.producers.len();
        for (index, producer) in self.producers.into_iter().enumerate() {
            let event_tx = event_tx.clone();
            thread::spawn(move || {
                for event in producer {
                    if event_tx.send((index, Some(event))).is_err() {
                        return;
                    }
                }
                let _ = event_tx.send((index, None));
            });
        }
        drop(event_tx);

        let producer_cancel = cancel.clone();
        let mut merge = LiveMerge::new(count, time_provider.now(), self.time_pulse);
        thread::spawn(move || {
            while !producer_cancel.is_cancelled() {
                match event_rx.recv_timeout(poll) {
                    Ok((index, Some(event))) => merge.accept(index, event),
                    Ok((index, None)) => merge.close(index),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => thread::sleep(poll),
                }
                for item in merge.release(time_provider.now()) {
                    let failed = item.is_err();
                    if tx.send(item).is_err() || failed {
                        return;
                    }
                }
                if merge.is_finished() {
                    break;
                }
            }
            debug!("live synchronizer stopped");
        });
        SliceStream {
            rx,
            cancel,
            state,
            done: false,
        }
    }
}

impl Iterator for Synchronizer {
    type Item = Result<TimeSlice, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if !self.primed {
            self.prime();
        }
        let frontier = self.heap.peek()?.event.time;

        if let Some(pulse) = self.next_pulse(frontier) {
            self.last_time = Some(pulse);
            return Some(Ok(time_slice_factory::create_time_pulse(pulse)));
        }

        let result = self.merge_frontier(frontier);
        match &result {
            Ok(_) => self.last_time = Some(frontier),
            Err(_) => self.failed = true,
        }
        Some(result.map_err(|e| EngineError::SliceConstruction(Box::new(e))))
    }
}

/// Folds everything that belongs to one instant into a single time slice.
fn assemble(time: DateTime<Utc>, payloads: Vec<FeedPayload>) -> Result<TimeSlice, EngineError> {
    let mut packets = Vec::new();
    let mut changes: Option<SecurityChanges> = None;
    let mut universe_data: BTreeMap<String, Vec<MarketData>> = BTreeMap::new();
    for payload in payloads {
        match payload {
            FeedPayload::Data(packet) => packets.push(packet),
            FeedPayload::Universe {
                name,
                changes: delta,
                data,
            } => {
                changes.get_or_insert_with(SecurityChanges::default).merge(delta);
                universe_data.entry(name).or_default().extend(data);
            }
        }
    }
    time_slice_factory::create(time, packets, changes, universe_data)
}

/// Merge state of [`Synchronizer::stream_live`].
///
/// An instant is released once every open producer has delivered something
/// later, or once the wall clock has passed it. Events stamped at or before
/// the last released instant ride along with the next slice.
struct LiveMerge {
    pending: BTreeMap<DateTime<Utc>, Vec<FeedPayload>>,
    late: Vec<FeedPayload>,
    latest: Vec<Option<DateTime<Utc>>>,
    open: Vec<bool>,
    last_time: Option<DateTime<Utc>>,
    started: DateTime<Utc>,
    time_pulse: Option<Duration>,
}

impl LiveMerge {
    fn new(producers: usize, started: DateTime<Utc>, time_pulse: Option<Duration>) -> Self {
        LiveMerge {
            pending: BTreeMap::new(),
            late: Vec::new(),
            latest: vec![None; producers],
            open: vec![true; producers],
            last_time: None,
            started,
            time_pulse,
        }
    }

    fn accept(&mut self, producer: usize, event: FeedEvent) {
        self.latest[producer] = Some(event.time);
        if self.last_time.is_some_and(|last| event.time <= last) {
            debug!(producer, time = %event.time, "late live event");
            self.late.push(event.payload);
        } else {
            self.pending.entry(event.time).or_default().push(event.payload);
        }
    }

    fn close(&mut self, producer: usize) {
        self.open[producer] = false;
    }

    /// Nothing left to deliver and nothing left to pulse for.
    fn is_finished(&self) -> bool {
        self.time_pulse.is_none()
            && self.open.iter().all(|open| !open)
            && self.pending.is_empty()
            && self.late.is_empty()
    }

    fn releasable(&self, time: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now > time
            || self
                .open
                .iter()
                .zip(&self.latest)
                .all(|(open, latest)| !open || latest.is_some_and(|l| l > time))
    }

    fn next_pulse(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let interval = self.time_pulse?;
        let base = self.last_time.unwrap_or(self.started);
        let pulse = round_down(base.naive_utc(), interval).and_utc() + interval;
        (pulse <= now).then_some(pulse)
    }

    /// Every slice due by wall-clock `now`, in time order.
    fn release(&mut self, now: DateTime<Utc>) -> Vec<Result<TimeSlice, EngineError>> {
        let mut slices = Vec::new();
        loop {
            let data = self
                .pending
                .keys()
                .next()
                .copied()
                .filter(|t| self.releasable(*t, now));
            let pulse = self.next_pulse(now);
            let (time, mut payloads) = match (data, pulse) {
                (Some(t), Some(p)) if p < t => (p, Vec::new()),
                (Some(t), _) => (t, self.pending.remove(&t).unwrap_or_default()),
                (None, Some(p)) => (p, Vec::new()),
                (None, None) => {
                    if self.late.is_empty() || self.last_time.is_some_and(|last| now <= last) {
                        break;
                    }
                    (now, Vec::new())
                }
            };
            payloads.append(&mut self.late);
            self.last_time = Some(time);
            let slice = if payloads.is_empty() {
                Ok(time_slice_factory::create_time_pulse(time))
            } else {
                assemble(time, payloads).map_err(|e| EngineError::SliceConstruction(Box::new(e)))
            };
            let failed = slice.is_err();
            slices.push(slice);
            if failed {
                break;
            }
        }
        slices
    }
}

/// Consumer end of [`Synchronizer::stream_data`] and
/// [`Synchronizer::stream_live`].
///
/// Ends on producer exhaustion, on cancellation, or on the first slice
/// construction failure, which is logged and recorded as the run-time error.
pub struct SliceStream {
    rx: Receiver<Result<TimeSlice, EngineError>>,
    cancel: CancellationToken,
    state: Arc<RunState>,
    done: bool,
}

impl Iterator for SliceStream {
    type Item = TimeSlice;

    fn next(&mut self) -> Option<TimeSlice> {
        if self.done || self.cancel.is_cancelled() {
            self.done = true;
            return None;
        }
        match self.rx.recv() {
            Ok(Ok(slice)) => Some(slice),
            Ok(Err(e)) => {
                error!(phase = %Phase::SliceConstruction, error = %e, "data stream stopped");
                self.state.fail(e);
                self.done = true;
                None
            }
            Err(_) => {
                self.done = true;
                None
            }
        }
    }
}

/// The stream the loop consumes: warm-up history first, then live slices.
pub struct AlgorithmStream<L> {
    history: Option<HistoryIter>,
    had_history: bool,
    announced: bool,
    failed: bool,
    live: L,
    live_mode: bool,
    subscriptions: SubscriptionManager,
    state: Arc<RunState>,
    results: Arc<dyn ResultPort>,
    time_provider: Arc<dyn TimeProvider>,
    last_history_time: Option<DateTime<Utc>>,
    warmup_start: DateTime<Utc>,
    next_status_time: DateTime<Utc>,
    minimum_increment: Duration,
}

impl<L: Iterator<Item = TimeSlice>> AlgorithmStream<L> {
    pub fn new(ctx: &AlgorithmContext, live: L, time_provider: Arc<dyn TimeProvider>) -> Self {
        let now = time_provider.now();
        let mut requests = ctx.warmup_history_requests();
        prepare_warmup_requests(&mut requests, &ctx.securities, &ctx.subscriptions);

        let minimum_increment = ctx
            .subscriptions
            .subscriptions()
            .filter(|c| !c.is_internal_feed)
            .map(|c| c.increment)
            .filter(|i| *i > Duration::zero())
            .min()
            .unwrap_or_else(|| Duration::seconds(1));

        let warmup_start = requests.iter().map(|r| r.start).min().map_or(now, |s| s.min(now));

        let mut stream = AlgorithmStream {
            history: None,
            had_history: !requests.is_empty(),
            announced: false,
            failed: false,
            live,
            live_mode: ctx.live_mode(),
            subscriptions: ctx.subscriptions.clone(),
            state: Arc::clone(ctx.run_state()),
            results: Arc::clone(&ctx.ports().results),
            time_provider,
            last_history_time: None,
            warmup_start,
            next_status_time: now + Duration::seconds(1),
            minimum_increment,
        };

        if stream.had_history {
            match ctx.ports().history.get_history(&requests, ctx.time_zone()) {
                Ok(history) => stream.history = Some(history),
                Err(e) => {
                    error!(phase = %Phase::HistoryReplay, error = %e, "history request failed");
                    stream.state.fail(e);
                    stream.failed = true;
                }
            }
        } else {
            stream.finish_history();
        }
        stream
    }

    fn finish_history(&mut self) {
        if !self.live_mode || !self.had_history {
            self.state.set_finished_warming_up();
            if self.had_history {
                self.results.debug_message("Algorithm finished warming up.");
                info!("finished warm-up");
            }
        }
    }

    fn report_progress(&mut self, time: DateTime<Utc>) {
        let now = self.time_provider.now();
        if now <= self.next_status_time {
            return;
        }
        self.next_status_time = now + Duration::seconds(1);
        let total = (now - self.warmup_start).num_milliseconds();
        let done = (time - self.warmup_start).num_milliseconds();
        let percent = if total > 0 { 100 * done / total } else { 100 };
        self.results.send_status_update(
            AlgorithmStatus::History,
            Some(&format!("Catching up to realtime {percent}%...")),
        );
    }

    fn next_history(&mut self) -> Option<Option<TimeSlice>> {
        let history = self.history.as_mut()?;
        let Some(slice) = history.next() else {
            self.history = None;
            self.finish_history();
            return None;
        };
        let built = time_slice_factory::pair_history_slice(&self.subscriptions, &slice)
            .and_then(|packets| {
                time_slice_factory::create(slice.time, packets, None, BTreeMap::new())
            });
        match built {
            Ok(time_slice) => {
                if !self.announced {
                    self.announced = true;
                    self.results.debug_message("Algorithm warming up...");
                }
                self.report_progress(time_slice.time);
                self.last_history_time = Some(time_slice.time);
                Some(Some(time_slice))
            }
            Err(e) => {
                error!(phase = %Phase::HistoryReplay, error = %e, "warm-up history rejected");
                self.state.fail(e);
                self.history = None;
                self.failed = true;
                Some(None)
            }
        }
    }

    /// True when the live slice only repeats what history already delivered.
    fn covered_by_history(slice: &TimeSlice, last_history: DateTime<Utc>) -> bool {
        let ticks = slice.slice.ticks.values().flatten().map(|t| t.time);
        let trades = slice.slice.trade_bars.values().map(|b| b.end_time());
        let quotes = slice.slice.quote_bars.values().map(|b| b.end_time());
        ticks.chain(trades).chain(quotes).any(|end| end <= last_history)
    }
}

impl<L: Iterator<Item = TimeSlice>> Iterator for AlgorithmStream<L> {
    type Item = TimeSlice;

    fn next(&mut self) -> Option<TimeSlice> {
        if self.failed {
            return None;
        }
        match self.next_history() {
            Some(Some(slice)) => return Some(slice),
            Some(None) => return None,
            None => {}
        }

        loop {
            let slice = self.live.next()?;
            if self.live_mode && self.state.is_warming_up() {
                if slice.is_time_pulse {
                    continue;
                }
                if let Some(last) = self.last_history_time {
                    if Self::covered_by_history(&slice, last) {
                        continue;
                    }
                    self.last_history_time = None;
                }
                let now = self.time_provider.now();
                if slice.time > now - self.minimum_increment {
                    self.state.set_finished_warming_up();
                    self.results.debug_message("Algorithm finished warming up.");
                    info!("finished warm-up");
                } else {
                    self.report_progress(slice.time);
                }
            }
            return Some(slice);
        }
    }
}
