//! Reporting sink: a bounded, never-blocking event queue per execution.
//!
//! Events are delivered to observers in FIFO order by a dedicated thread.
//! When the queue reaches its high watermark, the oldest code-line status
//! events are dropped until it is back at the low watermark. Tips, lifecycle
//! and pause events are never dropped.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::transport::Transport;

/// Severity of a report event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportLevel {
    /// Diagnostic detail.
    Debug,
    /// Normal progress.
    Info,
    /// Recoverable problem (retry, skip).
    Warn,
    /// Failure.
    Error,
}

impl ReportLevel {
    /// Level for a `report.<method>(...)` call in generated code.
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            "debug" => Some(ReportLevel::Debug),
            "info" => Some(ReportLevel::Info),
            "warn" | "warning" => Some(ReportLevel::Warn),
            "error" => Some(ReportLevel::Error),
            _ => None,
        }
    }
}

/// What an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Execution started.
    TaskStart,
    /// Execution finished successfully.
    TaskEnd,
    /// Execution was force-stopped.
    TaskCancelled,
    /// Execution failed.
    TaskError,
    /// Execution paused on a breakpoint or step.
    Paused,
    /// Execution resumed after a pause.
    Resumed,
    /// User-facing notice (dependency downloads and the like).
    Tip,
    /// Status of one code line: start, retry, skip, result, print.
    Code,
}

impl EventKind {
    /// Whether the sink may drop the event under pressure.
    pub fn is_droppable(self) -> bool {
        matches!(self, EventKind::Code)
    }
}

/// One serialised event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportEvent {
    /// Monotonic sequence number within the execution.
    pub seq: u64,
    /// Execution the event belongs to.
    pub execution_id: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Severity.
    pub level: ReportLevel,
    /// Event kind.
    pub kind: EventKind,
    /// Structured payload.
    pub data: JsonValue,
}

/// Receives delivered events.
pub trait ReportObserver: Send + Sync {
    /// Called on the delivery thread for every event, in order.
    fn on_event(&self, event: &ReportEvent);
}

/// Logs events through `tracing`.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl ReportObserver for TracingObserver {
    fn on_event(&self, event: &ReportEvent) {
        let kind = format!("{:?}", event.kind);
        match event.level {
            ReportLevel::Debug => {
                tracing::debug!(execution = %event.execution_id, seq = event.seq, %kind, data = %event.data)
            }
            ReportLevel::Info => {
                tracing::info!(execution = %event.execution_id, seq = event.seq, %kind, data = %event.data)
            }
            ReportLevel::Warn => {
                tracing::warn!(execution = %event.execution_id, seq = event.seq, %kind, data = %event.data)
            }
            ReportLevel::Error => {
                tracing::error!(execution = %event.execution_id, seq = event.seq, %kind, data = %event.data)
            }
        }
    }
}

/// Records every event in memory.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    events: Mutex<Vec<ReportEvent>>,
}

impl CollectingObserver {
    /// Empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the events seen so far.
    pub fn events(&self) -> Vec<ReportEvent> {
        self.events.lock().clone()
    }

    /// Events of one kind.
    pub fn of_kind(&self, kind: EventKind) -> Vec<ReportEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }
}

impl ReportObserver for CollectingObserver {
    fn on_event(&self, event: &ReportEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Forwards events to the remote side as `report` notifications.
pub struct TransportObserver {
    transport: Transport,
}

impl TransportObserver {
    /// Observer writing to `transport`.
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }
}

impl ReportObserver for TransportObserver {
    fn on_event(&self, event: &ReportEvent) {
        let payload = match serde_json::to_value(event) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode report event");
                return;
            }
        };
        let key = serde_json::to_value(event.kind)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        if let Err(err) = self.transport.notify("report", &key, payload) {
            tracing::debug!(error = %err, "dropping report event, transport closed");
        }
    }
}

/// Bounded FIFO with the watermark drop policy.
#[derive(Debug)]
pub struct ReportQueue {
    events: VecDeque<ReportEvent>,
    capacity: usize,
    dropped: u64,
}

impl ReportQueue {
    /// Queue holding up to `capacity` droppable events.
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    fn high_watermark(&self) -> usize {
        (self.capacity * 4 / 5).max(1)
    }

    fn low_watermark(&self) -> usize {
        self.capacity / 5
    }

    /// Enqueue `event`, shedding low-priority events if needed.
    pub fn push(&mut self, event: ReportEvent) {
        if self.events.len() >= self.high_watermark() {
            let low = self.low_watermark();
            let mut index = 0;
            while self.events.len() > low && index < self.events.len() {
                if self.events[index].kind.is_droppable() {
                    self.events.remove(index);
                    self.dropped += 1;
                } else {
                    index += 1;
                }
            }
        }
        if event.kind.is_droppable() && self.events.len() >= self.capacity {
            self.dropped += 1;
            return;
        }
        self.events.push_back(event);
    }

    /// Oldest event.
    pub fn pop(&mut self) -> Option<ReportEvent> {
        self.events.pop_front()
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

struct SinkState {
    queue: ReportQueue,
    next_seq: u64,
    in_flight: bool,
    closed: bool,
}

struct SinkShared {
    state: Mutex<SinkState>,
    ready: Condvar,
    idle: Condvar,
    observers: Vec<Arc<dyn ReportObserver>>,
}

/// Per-execution reporting sink with its delivery thread.
pub struct ReportSink {
    execution_id: String,
    shared: Arc<SinkShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ReportSink {
    /// Start a sink for `execution_id` delivering to `observers`.
    pub fn new(
        execution_id: impl Into<String>,
        capacity: usize,
        observers: Vec<Arc<dyn ReportObserver>>,
    ) -> Self {
        let shared = Arc::new(SinkShared {
            state: Mutex::new(SinkState {
                queue: ReportQueue::new(capacity),
                next_seq: 0,
                in_flight: false,
                closed: false,
            }),
            ready: Condvar::new(),
            idle: Condvar::new(),
            observers,
        });
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("weft-report".to_string())
            .spawn(move || deliver(worker_shared))
            .map_err(|err| tracing::error!(error = %err, "failed to start report delivery thread"))
            .ok();
        Self {
            execution_id: execution_id.into(),
            shared,
            worker: Mutex::new(worker),
        }
    }

    /// Execution this sink reports for.
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Queue an event; never blocks on delivery. Returns its sequence number.
    pub fn emit(&self, level: ReportLevel, kind: EventKind, data: JsonValue) -> u64 {
        let mut state = self.shared.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        if state.closed {
            tracing::debug!(seq, ?kind, "report sink closed, discarding event");
            return seq;
        }
        state.queue.push(ReportEvent {
            seq,
            execution_id: self.execution_id.clone(),
            timestamp: Utc::now(),
            level,
            kind,
            data,
        });
        self.shared.ready.notify_one();
        seq
    }

    /// Events dropped by the watermark policy.
    pub fn dropped(&self) -> u64 {
        self.shared.state.lock().queue.dropped()
    }

    /// Wait until every queued event is delivered. Returns `false` on timeout.
    pub fn flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while !state.queue.is_empty() || state.in_flight {
            if self.shared.idle.wait_until(&mut state, deadline).timed_out() {
                return state.queue.is_empty() && !state.in_flight;
            }
        }
        true
    }

    /// Deliver what is queued, then stop the delivery thread.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock();
            state.closed = true;
            self.shared.ready.notify_all();
        }
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                tracing::error!("report delivery thread panicked");
            }
        }
    }
}

impl Drop for ReportSink {
    fn drop(&mut self) {
        self.close();
    }
}

fn deliver(shared: Arc<SinkShared>) {
    loop {
        let event = {
            let mut state = shared.state.lock();
            loop {
                if let Some(event) = state.queue.pop() {
                    state.in_flight = true;
                    break Some(event);
                }
                if state.closed {
                    break None;
                }
                shared.ready.wait(&mut state);
            }
        };
        let Some(event) = event else {
            shared.idle.notify_all();
            return;
        };
        for observer in &shared.observers {
            observer.on_event(&event);
        }
        let mut state = shared.state.lock();
        state.in_flight = false;
        if state.queue.is_empty() {
            shared.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(seq: u64, kind: EventKind) -> ReportEvent {
        ReportEvent {
            seq,
            execution_id: "x".into(),
            timestamp: Utc::now(),
            level: ReportLevel::Info,
            kind,
            data: json!({}),
        }
    }

    #[test]
    fn high_watermark_sheds_down_to_low() {
        let mut queue = ReportQueue::new(10);
        for seq in 0..8 {
            queue.push(event(seq, EventKind::Code));
        }
        assert_eq!(queue.len(), 8);
        queue.push(event(8, EventKind::Code));
        // 8 >= high(8): drop oldest down to low(2), then append.
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 6);
        assert_eq!(queue.pop().map(|e| e.seq), Some(6));
    }

    #[test]
    fn protected_events_survive_pressure() {
        let mut queue = ReportQueue::new(5);
        queue.push(event(0, EventKind::TaskStart));
        queue.push(event(1, EventKind::Tip));
        for seq in 2..12 {
            queue.push(event(seq, EventKind::Code));
        }
        queue.push(event(12, EventKind::Paused));
        let kinds: Vec<EventKind> = std::iter::from_fn(|| queue.pop()).map(|e| e.kind).collect();
        assert_eq!(kinds[0], EventKind::TaskStart);
        assert_eq!(kinds[1], EventKind::Tip);
        assert_eq!(kinds.last(), Some(&EventKind::Paused));
    }

    #[test]
    fn sink_delivers_in_order() {
        let collector = Arc::new(CollectingObserver::new());
        let sink = ReportSink::new("exec", 64, vec![collector.clone() as Arc<dyn ReportObserver>]);
        for i in 0..10 {
            sink.emit(ReportLevel::Info, EventKind::Code, json!({ "i": i }));
        }
        assert!(sink.flush(Duration::from_secs(5)));
        let seqs: Vec<u64> = collector.events().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (0..10).collect::<Vec<_>>());
        sink.close();
    }

    #[test]
    fn report_methods_map_to_levels() {
        assert_eq!(ReportLevel::from_method("warning"), Some(ReportLevel::Warn));
        assert_eq!(ReportLevel::from_method("shout"), None);
    }
}
