//! Per-iteration wall-clock budget and the additional-time token bucket.
//!
//! Every loop iteration gets `time_loop_maximum` of wall-clock time. Long
//! running work (scheduled events, model training) may extend the budget a
//! minute at a time by drawing tokens from a [`TokenBucket`]. Once the bucket
//! is dry the extension is refused and the iteration will trip the limit.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::EngineError;

/// Source of "now". Swappable so tests can drive the clock.
pub trait TimeProvider: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RealTimeProvider;

impl TimeProvider for RealTimeProvider {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock. Time never moves backwards.
#[derive(Debug)]
pub struct ManualTimeProvider {
    now: Mutex<DateTime<Utc>>,
}

impl ManualTimeProvider {
    pub fn new(start: DateTime<Utc>) -> Self {
        ManualTimeProvider {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        if by > Duration::zero() {
            *self.now.lock() += by;
        }
    }

}

impl TimeProvider for ManualTimeProvider {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

pub trait TokenBucket: Send + Sync {
    fn capacity(&self) -> u64;

    fn available_tokens(&self) -> u64;

    /// Takes `tokens` if that many are available, otherwise takes nothing.
    fn try_consume(&self, tokens: u64) -> bool;
}

#[derive(Debug)]
struct BucketState {
    available: u64,
    last_refill: DateTime<Utc>,
}

/// Bucket refilled by `refill_amount` tokens per elapsed `refill_interval`,
/// up to `capacity`. Refill is computed lazily on each access.
pub struct LeakyBucket {
    capacity: u64,
    refill_amount: u64,
    refill_interval: Duration,
    time_provider: Arc<dyn TimeProvider>,
    state: Mutex<BucketState>,
}

impl LeakyBucket {
    pub fn new(
        capacity: u64,
        refill_amount: u64,
        refill_interval: Duration,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        let now = time_provider.now();
        LeakyBucket {
            capacity,
            refill_amount,
            refill_interval,
            time_provider,
            state: Mutex::new(BucketState {
                available: capacity,
                last_refill: now,
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        if self.refill_interval <= Duration::zero() {
            return;
        }
        let now = self.time_provider.now();
        let elapsed = now - state.last_refill;
        let intervals = elapsed.num_milliseconds() / self.refill_interval.num_milliseconds().max(1);
        if intervals <= 0 {
            return;
        }
        let added = self.refill_amount.saturating_mul(intervals as u64);
        state.available = state.available.saturating_add(added).min(self.capacity);
        state.last_refill += self.refill_interval * intervals as i32;
    }
}

impl TokenBucket for LeakyBucket {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn available_tokens(&self) -> u64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.available
    }

    fn try_consume(&self, tokens: u64) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if tokens > state.available {
            return false;
        }
        state.available -= tokens;
        true
    }
}

/// Bucket that never runs dry.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTokenBucket;

impl TokenBucket for NullTokenBucket {
    fn capacity(&self) -> u64 {
        u64::MAX
    }

    fn available_tokens(&self) -> u64 {
        u64::MAX
    }

    fn try_consume(&self, _tokens: u64) -> bool {
        true
    }
}

/// Outcome of a limit check. An empty message means within limits.
#[derive(Debug, Clone, PartialEq)]
pub struct IsolatorLimitResult {
    pub current_time_step_elapsed: Duration,
    pub error_message: String,
}

impl IsolatorLimitResult {
    pub fn ok(elapsed: Duration) -> Self {
        IsolatorLimitResult {
            current_time_step_elapsed: elapsed,
            error_message: String::new(),
        }
    }

    pub fn is_within_custom_limits(&self) -> bool {
        self.error_message.is_empty()
    }
}

/// Capability queried by long-running consumers.
pub trait IsolatorLimitResultProvider: Send + Sync {
    fn is_within_limit(&self) -> IsolatorLimitResult;

    fn request_additional_time(&self, minutes: u32) -> Result<(), EngineError>;

    fn try_request_additional_time(&self, minutes: u32) -> bool;
}

/// Always within limits, every request granted.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullIsolatorLimitResultProvider;

impl IsolatorLimitResultProvider for NullIsolatorLimitResultProvider {
    fn is_within_limit(&self) -> IsolatorLimitResult {
        IsolatorLimitResult::ok(Duration::zero())
    }

    fn request_additional_time(&self, _minutes: u32) -> Result<(), EngineError> {
        Ok(())
    }

    fn try_request_additional_time(&self, _minutes: u32) -> bool {
        true
    }
}

/// Watchdog for the per-iteration budget.
///
/// Only the loop thread calls [`start_new_time_step`](Self::start_new_time_step)
/// and [`stop_enforcing_time_limit`](Self::stop_enforcing_time_limit); the
/// elapsed time may be read from any thread.
pub struct AlgorithmTimeLimitManager {
    bucket: Arc<dyn TokenBucket>,
    time_loop_maximum: Duration,
    time_provider: Arc<dyn TimeProvider>,
    /// Start of the current step in epoch milliseconds, `i64::MIN` before the first.
    current_time_step_start: AtomicI64,
    additional_minutes: AtomicI64,
    stopped: AtomicBool,
}

impl AlgorithmTimeLimitManager {
    pub fn new(
        bucket: Arc<dyn TokenBucket>,
        time_loop_maximum: Duration,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        AlgorithmTimeLimitManager {
            bucket,
            time_loop_maximum,
            time_provider,
            current_time_step_start: AtomicI64::new(i64::MIN),
            additional_minutes: AtomicI64::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn time_loop_maximum(&self) -> Duration {
        self.time_loop_maximum
    }

    pub fn additional_time_bucket(&self) -> &Arc<dyn TokenBucket> {
        &self.bucket
    }

    pub fn start_new_time_step(&self) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        let now = self.time_provider.now().timestamp_millis();
        self.current_time_step_start.store(now, Ordering::Release);
        self.additional_minutes.store(0, Ordering::Release);
    }

    pub fn current_time_step_elapsed(&self) -> Duration {
        let start = self.current_time_step_start.load(Ordering::Acquire);
        if start == i64::MIN || self.stopped.load(Ordering::Acquire) {
            return Duration::zero();
        }
        Duration::milliseconds(self.time_provider.now().timestamp_millis() - start)
    }

    pub fn stop_enforcing_time_limit(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

fn minutes_text(duration: Duration) -> String {
    let minutes = duration.num_milliseconds() as f64 / 60_000.0;
    let rounded = (minutes * 100.0).round() / 100.0;
    format!("{rounded}")
}

impl IsolatorLimitResultProvider for AlgorithmTimeLimitManager {
    fn is_within_limit(&self) -> IsolatorLimitResult {
        let elapsed = self.current_time_step_elapsed();
        let additional = Duration::minutes(self.additional_minutes.load(Ordering::Acquire));
        let limit = self.time_loop_maximum.checked_add(&additional).unwrap_or(Duration::MAX);
        if elapsed <= limit {
            return IsolatorLimitResult::ok(elapsed);
        }
        IsolatorLimitResult {
            current_time_step_elapsed: elapsed,
            error_message: format!(
                "Algorithm took longer than {} minutes on a single time loop. \
                 CurrentTimeStepElapsed: {} minutes",
                minutes_text(self.time_loop_maximum),
                minutes_text(elapsed)
            ),
        }
    }

    fn request_additional_time(&self, minutes: u32) -> Result<(), EngineError> {
        if self.try_request_additional_time(minutes) {
            Ok(())
        } else {
            Err(EngineError::InsufficientTime { requested: minutes })
        }
    }

    fn try_request_additional_time(&self, minutes: u32) -> bool {
        if self.bucket.try_consume(u64::from(minutes)) {
            self.additional_minutes
                .fetch_add(i64::from(minutes), Ordering::AcqRel);
            return true;
        }
        false
    }
}

/// A unit of monitored work.
struct TimeConsumer {
    provider: Arc<dyn IsolatorLimitResultProvider>,
    time_provider: Arc<dyn TimeProvider>,
    next_time_request: Mutex<Option<DateTime<Utc>>>,
    finished: AtomicBool,
}

/// Draws one additional minute from the provider for every minute a consumer
/// keeps running. Runs on its own thread unless created with
/// [`TimeMonitor::manual`], in which case [`process_consumers`](Self::process_consumers)
/// is driven by the caller.
pub struct TimeMonitor {
    consumers: Arc<Mutex<Vec<Arc<TimeConsumer>>>>,
    cancel: CancellationToken,
}

impl TimeMonitor {
    pub fn spawn(interval: std::time::Duration) -> Self {
        let monitor = TimeMonitor::manual();
        let consumers = Arc::clone(&monitor.consumers);
        let cancel = monitor.cancel.clone();
        thread::spawn(move || {
            while !cancel.is_cancelled() {
                thread::sleep(interval);
                process(&consumers);
            }
            debug!("time monitor stopped");
        });
        monitor
    }

    pub fn manual() -> Self {
        TimeMonitor {
            consumers: Arc::new(Mutex::new(Vec::new())),
            cancel: CancellationToken::new(),
        }
    }

    pub fn process_consumers(&self) {
        process(&self.consumers);
    }

    pub fn active_consumers(&self) -> usize {
        self.consumers
            .lock()
            .iter()
            .filter(|c| !c.finished.load(Ordering::Acquire))
            .count()
    }
}

impl Drop for TimeMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn process(consumers: &Mutex<Vec<Arc<TimeConsumer>>>) {
    let mut consumers = consumers.lock();
    consumers.retain(|c| !c.finished.load(Ordering::Acquire));
    for consumer in consumers.iter() {
        let now = consumer.time_provider.now();
        let mut next = consumer.next_time_request.lock();
        match *next {
            None => *next = Some(now + Duration::minutes(1)),
            Some(due) if now >= due => {
                if let Err(e) = consumer.provider.request_additional_time(1) {
                    warn!(error = %e, "time consumer ran out of additional time");
                    consumer.finished.store(true, Ordering::Release);
                }
                *next = Some(now + Duration::minutes(1));
            }
            Some(_) => {}
        }
    }
}

/// Runs `code` as a monitored consumer: while it runs, the monitor draws
/// additional time from `provider` each minute.
pub fn consume<R>(
    provider: Arc<dyn IsolatorLimitResultProvider>,
    time_provider: Arc<dyn TimeProvider>,
    monitor: &TimeMonitor,
    code: impl FnOnce() -> R,
) -> R {
    let consumer = Arc::new(TimeConsumer {
        provider,
        time_provider,
        next_time_request: Mutex::new(None),
        finished: AtomicBool::new(false),
    });
    monitor.consumers.lock().push(Arc::clone(&consumer));
    let result = code();
    consumer.finished.store(true, Ordering::Release);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn clock() -> Arc<ManualTimeProvider> {
        Arc::new(ManualTimeProvider::new(
            Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap(),
        ))
    }

    #[test]
    fn bucket_never_exceeds_capacity() {
        let time = clock();
        let bucket = LeakyBucket::new(10, 5, Duration::minutes(1), time.clone());
        time.advance(Duration::minutes(10));
        assert_eq!(bucket.available_tokens(), 10);
    }

    #[test]
    fn bucket_refills_whole_intervals_only() {
        let time = clock();
        let bucket = LeakyBucket::new(10, 5, Duration::minutes(1), time.clone());
        assert!(bucket.try_consume(10));
        time.advance(Duration::seconds(90));
        assert_eq!(bucket.available_tokens(), 5);
        time.advance(Duration::seconds(30));
        assert_eq!(bucket.available_tokens(), 10);
    }

    #[test]
    fn oversized_request_takes_nothing() {
        let bucket = LeakyBucket::new(10, 5, Duration::minutes(1), clock());
        assert!(!bucket.try_consume(11));
        assert_eq!(bucket.available_tokens(), 10);
    }

    #[test]
    fn limit_message_after_maximum() {
        let time = clock();
        let manager = AlgorithmTimeLimitManager::new(
            Arc::new(NullTokenBucket),
            Duration::minutes(20),
            time.clone(),
        );
        manager.start_new_time_step();
        time.advance(Duration::minutes(21));
        let result = manager.is_within_limit();
        assert!(!result.is_within_custom_limits());
        assert_eq!(
            result.error_message,
            "Algorithm took longer than 20 minutes on a single time loop. \
             CurrentTimeStepElapsed: 21 minutes"
        );
    }

    #[test]
    fn additional_time_extends_the_limit() {
        let time = clock();
        let bucket = Arc::new(LeakyBucket::new(5, 1, Duration::minutes(5), time.clone()));
        let manager = AlgorithmTimeLimitManager::new(bucket, Duration::minutes(20), time.clone());
        manager.start_new_time_step();
        assert!(manager.try_request_additional_time(2));
        // three tokens left until the next refill
        assert!(matches!(
            manager.request_additional_time(4),
            Err(EngineError::InsufficientTime { requested: 4 })
        ));
        time.advance(Duration::minutes(21));
        assert!(manager.is_within_limit().is_within_custom_limits());
        time.advance(Duration::minutes(2));
        assert!(!manager.is_within_limit().is_within_custom_limits());
    }

    #[test]
    fn new_time_step_resets_elapsed_and_extension() {
        let time = clock();
        let manager = AlgorithmTimeLimitManager::new(
            Arc::new(NullTokenBucket),
            Duration::minutes(1),
            time.clone(),
        );
        manager.start_new_time_step();
        assert!(manager.try_request_additional_time(10));
        time.advance(Duration::minutes(5));
        manager.start_new_time_step();
        assert_eq!(manager.current_time_step_elapsed(), Duration::zero());
        time.advance(Duration::minutes(2));
        assert!(!manager.is_within_limit().is_within_custom_limits());
    }

    #[test]
    fn stopped_manager_reports_no_elapsed_time() {
        let time = clock();
        let manager = AlgorithmTimeLimitManager::new(
            Arc::new(NullTokenBucket),
            Duration::minutes(1),
            time.clone(),
        );
        manager.start_new_time_step();
        manager.stop_enforcing_time_limit();
        time.advance(Duration::hours(1));
        assert!(manager.is_within_limit().is_within_custom_limits());
    }

    #[test]
    fn null_provider_always_grants() {
        let provider = NullIsolatorLimitResultProvider;
        assert!(provider.try_request_additional_time(u32::MAX));
        assert!(provider.request_additional_time(1).is_ok());
        assert!(provider.is_within_limit().is_within_custom_limits());
    }

    #[test]
    fn monitor_draws_a_minute_per_minute_of_work() {
        let time = clock();
        let bucket = Arc::new(LeakyBucket::new(2, 0, Duration::minutes(5), time.clone()));
        let manager = Arc::new(AlgorithmTimeLimitManager::new(
            bucket.clone(),
            Duration::minutes(20),
            time.clone(),
        ));
        let monitor = TimeMonitor::manual();
        consume(manager.clone(), time.clone(), &monitor, || {
            monitor.process_consumers();
            time.advance(Duration::minutes(1));
            monitor.process_consumers();
            time.advance(Duration::minutes(1));
            monitor.process_consumers();
        });
        assert_eq!(bucket.available_tokens(), 0);
        monitor.process_consumers();
        assert_eq!(monitor.active_consumers(), 0);
    }
}
