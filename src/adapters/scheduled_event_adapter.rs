//! Scheduled-event realtime handler.
//!
//! Events fire when the engine clock reaches their due time. Each callback
//! runs as a monitored time consumer so long running events draw additional
//! minutes from the time-limit budget.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::domain::symbol::Symbol;
use crate::domain::time_limit::{consume, IsolatorLimitResultProvider, TimeMonitor, TimeProvider};
use crate::domain::time_slice::SecurityChanges;
use crate::ports::realtime_port::RealTimePort;

pub type EventCallback = Box<dyn FnMut(DateTime<Utc>) -> anyhow::Result<()> + Send>;

pub struct ScheduledEvent {
    name: String,
    next_time: DateTime<Utc>,
    period: Option<Duration>,
    callback: EventCallback,
}

impl ScheduledEvent {
    pub fn once(name: impl Into<String>, at: DateTime<Utc>, callback: EventCallback) -> Self {
        ScheduledEvent {
            name: name.into(),
            next_time: at,
            period: None,
            callback,
        }
    }

    /// Fires at `first` and then every `period`.
    pub fn every(
        name: impl Into<String>,
        first: DateTime<Utc>,
        period: Duration,
        callback: EventCallback,
    ) -> Self {
        ScheduledEvent {
            name: name.into(),
            next_time: first,
            period: (period > Duration::zero()).then_some(period),
            callback,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn next_time(&self) -> DateTime<Utc> {
        self.next_time
    }
}

pub struct ScheduledEventAdapter {
    events: Mutex<Vec<ScheduledEvent>>,
    symbols: Mutex<BTreeSet<Symbol>>,
    limits: Arc<dyn IsolatorLimitResultProvider>,
    time_provider: Arc<dyn TimeProvider>,
    monitor: TimeMonitor,
}

impl ScheduledEventAdapter {
    pub fn new(
        limits: Arc<dyn IsolatorLimitResultProvider>,
        time_provider: Arc<dyn TimeProvider>,
        monitor: TimeMonitor,
    ) -> Self {
        ScheduledEventAdapter {
            events: Mutex::new(Vec::new()),
            symbols: Mutex::new(BTreeSet::new()),
            limits,
            time_provider,
            monitor,
        }
    }

    pub fn add(&self, event: ScheduledEvent) {
        debug!(event = %event.name, next = %event.next_time, "scheduled event added");
        self.events.lock().push(event);
    }

    pub fn pending_events(&self) -> usize {
        self.events.lock().len()
    }

    /// Symbols currently part of any universe.
    pub fn tracked_symbols(&self) -> Vec<Symbol> {
        self.symbols.lock().iter().cloned().collect()
    }

    /// Fires every event whose due time satisfies `due`, catching each one
    /// up through all of its missed periods.
    fn fire(&self, time: DateTime<Utc>, due: impl Fn(DateTime<Utc>) -> bool) -> anyhow::Result<()> {
        let mut events = self.events.lock();
        for event in events.iter_mut() {
            while due(event.next_time) {
                let at = event.next_time;
                trace!(event = %event.name, %at, %time, "firing scheduled event");
                let callback = &mut event.callback;
                consume(
                    Arc::clone(&self.limits),
                    Arc::clone(&self.time_provider),
                    &self.monitor,
                    || callback(at),
                )
                .map_err(|e| e.context(format!("scheduled event '{}' failed", event.name)))?;
                match event.period {
                    Some(period) => event.next_time = at + period,
                    None => {
                        event.next_time = DateTime::<Utc>::MAX_UTC;
                        break;
                    }
                }
            }
        }
        events.retain(|e| e.next_time != DateTime::<Utc>::MAX_UTC);
        Ok(())
    }
}

impl RealTimePort for ScheduledEventAdapter {
    fn set_time(&self, time: DateTime<Utc>) -> anyhow::Result<()> {
        self.fire(time, |next| next <= time)
    }

    fn scan_past_events(&self, time: DateTime<Utc>) -> anyhow::Result<()> {
        self.fire(time, |next| next < time)
    }

    fn on_securities_changed(&self, changes: &SecurityChanges) {
        let mut symbols = self.symbols.lock();
        for symbol in changes.added_symbols() {
            symbols.insert(symbol.clone());
        }
        for symbol in changes.removed_symbols() {
            symbols.remove(symbol);
        }
    }
}
