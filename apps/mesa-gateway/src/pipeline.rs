use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use mesa_proto::{channels, Event};

use crate::breaker::CircuitBreaker;

/// An event while it sits in the ingest queue. `attempts` tracks routing
/// retries; a timed-out event is re-enqueued exactly once.
#[derive(Debug)]
pub struct QueuedEvent {
    pub event: Event,
    pub attempts: u8,
}

impl QueuedEvent {
    fn new(event: Event) -> Self {
        Self { event, attempts: 0 }
    }
}

/// Bounded ingest queue with a drop-oldest policy: under pressure the
/// pipeline stays responsive to current state instead of backlogging on
/// stale events.
pub struct EventQueue {
    inner: Mutex<VecDeque<QueuedEvent>>,
    capacity: usize,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity: capacity.max(1),
        }
    }

    /// Enqueues an event, returning the displaced oldest event when the
    /// queue was already full.
    pub fn push(&self, event: QueuedEvent) -> Option<QueuedEvent> {
        let mut inner = self.inner.lock();
        let displaced = if inner.len() >= self.capacity {
            inner.pop_front()
        } else {
            None
        };
        inner.push_back(event);
        gauge!("mesa_gateway_queue_depth", inner.len() as f64);
        displaced
    }

    /// Removes up to `max` events from the front, preserving FIFO order.
    pub fn drain(&self, max: usize) -> Vec<QueuedEvent> {
        let mut inner = self.inner.lock();
        let take = max.min(inner.len());
        let drained = inner.drain(..take).collect();
        gauge!("mesa_gateway_queue_depth", inner.len() as f64);
        drained
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

struct TrackerInner {
    samples: VecDeque<(Instant, bool)>,
    last_alert: Option<Instant>,
}

/// Rolling-window drop-ratio tracker. Crossing the threshold logs one
/// alert, then stays quiet for the cooldown so a sustained overload does
/// not become a log storm.
pub struct DropRateTracker {
    inner: Mutex<TrackerInner>,
    window: Duration,
    threshold: f64,
    cooldown: Duration,
}

impl DropRateTracker {
    pub fn new(window: Duration, threshold: f64, cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                samples: VecDeque::new(),
                last_alert: None,
            }),
            window,
            threshold,
            cooldown,
        }
    }

    pub fn record(&self, dropped: bool) {
        self.record_at(dropped, Instant::now());
    }

    pub fn record_at(&self, dropped: bool, now: Instant) {
        let mut inner = self.inner.lock();
        inner.samples.push_back((now, dropped));
        while let Some((at, _)) = inner.samples.front() {
            if now.duration_since(*at) > self.window {
                inner.samples.pop_front();
            } else {
                break;
            }
        }

        if !dropped {
            return;
        }

        let ratio = ratio_of(&inner.samples);
        if ratio < self.threshold {
            return;
        }
        let suppressed = inner
            .last_alert
            .map(|at| now.duration_since(at) < self.cooldown)
            .unwrap_or(false);
        if suppressed {
            return;
        }
        inner.last_alert = Some(now);
        error!(
            drop_ratio = format!("{:.1}%", ratio * 100.0),
            window_secs = self.window.as_secs(),
            "event drop rate over threshold"
        );
        counter!("mesa_gateway_drop_alerts_total", 1);
    }

    pub fn ratio(&self) -> f64 {
        ratio_of(&self.inner.lock().samples)
    }

    /// True when an alert fired within the cooldown (used by tests and the
    /// detailed health view).
    pub fn alerting(&self) -> bool {
        let inner = self.inner.lock();
        inner
            .last_alert
            .map(|at| at.elapsed() < self.cooldown)
            .unwrap_or(false)
    }
}

fn ratio_of(samples: &VecDeque<(Instant, bool)>) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let dropped = samples.iter().filter(|(_, d)| *d).count();
    dropped as f64 / samples.len() as f64
}

/// Everything the ingest tasks share.
pub struct IngestPipeline {
    pub queue: Arc<EventQueue>,
    pub drops: Arc<DropRateTracker>,
    pub breaker: Arc<CircuitBreaker>,
}

impl IngestPipeline {
    /// Validates one raw broker payload and queues it. Invalid payloads are
    /// logged, counted, and never reach the queue; a displaced oldest event
    /// counts against the drop tracker.
    pub fn ingest_payload(&self, raw: &str) {
        let event = match Event::from_json(raw) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "dropping invalid broker payload");
                counter!("mesa_gateway_events_dropped_total", 1, "reason" => err.metric_label());
                return;
            }
        };

        counter!("mesa_gateway_events_ingested_total", 1, "type" => event.event_type.clone());
        if let Some(displaced) = self.queue.push(QueuedEvent::new(event)) {
            debug!(
                event_type = displaced.event.event_type,
                "queue full, dropped oldest event"
            );
            counter!("mesa_gateway_events_dropped_total", 1, "reason" => "backpressure");
            self.drops.record(true);
        } else {
            self.drops.record(false);
        }
    }
}

/// Long-lived subscriber task: holds the broker psubscription and feeds the
/// pipeline. Broker errors trip the breaker and back the loop off; they
/// never terminate the task.
pub fn spawn_subscriber(
    redis_url: String,
    pipeline: Arc<IngestPipeline>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while !*shutdown.borrow() {
            if pipeline.breaker.try_acquire().is_err() {
                if wait_or_shutdown(&mut shutdown, Duration::from_secs(1)).await {
                    break;
                }
                continue;
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                result = run_subscription(&redis_url, &pipeline) => match result {
                    Ok(()) => {
                        // Stream ended cleanly (broker closed the connection).
                        warn!("broker subscription ended, resubscribing");
                        pipeline.breaker.record_failure();
                    }
                    Err(err) => {
                        warn!(error = %err, "broker subscription failed");
                        pipeline.breaker.record_failure();
                    }
                },
            }
            if wait_or_shutdown(&mut shutdown, Duration::from_secs(1)).await {
                break;
            }
        }
    })
}

/// Sleeps for `period` unless the shutdown signal fires first. Returns true
/// when the caller should stop.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, period: Duration) -> bool {
    tokio::select! {
        _ = shutdown.changed() => true,
        _ = tokio::time::sleep(period) => *shutdown.borrow(),
    }
}

async fn run_subscription(
    redis_url: &str,
    pipeline: &IngestPipeline,
) -> Result<(), redis::RedisError> {
    use futures_util::StreamExt;

    let client = redis::Client::open(redis_url)?;
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.psubscribe(channels::CHANNEL_PATTERN).await?;
    pipeline.breaker.record_success();
    info!(pattern = channels::CHANNEL_PATTERN, "subscribed to broker channels");

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        match msg.get_payload::<String>() {
            Ok(raw) => pipeline.ingest_payload(&raw),
            Err(err) => {
                warn!(error = %err, "non-utf8 broker payload dropped");
                counter!("mesa_gateway_events_dropped_total", 1, "reason" => "malformed");
            }
        }
    }
    Ok(())
}

/// Destination for routed events. The batch processor only needs delivery,
/// not the full router surface.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event: &Event);
}

/// Drains the queue in batches and routes each event with a deadline. A
/// timed-out event is re-enqueued once; a second timeout drops it. On
/// shutdown the remaining queue is routed before the task exits.
pub fn spawn_batch_processor(
    pipeline: Arc<IngestPipeline>,
    sink: Arc<dyn EventSink>,
    batch_size: usize,
    routing_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(50));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    drain_remaining(&pipeline, sink.as_ref(), batch_size, routing_timeout).await;
                    break;
                }
            }
            let batch = pipeline.queue.drain(batch_size);
            for queued in batch {
                process_one(&pipeline, sink.as_ref(), queued, routing_timeout).await;
            }
        }
    })
}

/// Shutdown drain. Terminates because a timed-out event is retried at most
/// once before it is dropped.
async fn drain_remaining(
    pipeline: &IngestPipeline,
    sink: &dyn EventSink,
    batch_size: usize,
    routing_timeout: Duration,
) {
    loop {
        let batch = pipeline.queue.drain(batch_size);
        if batch.is_empty() {
            break;
        }
        for queued in batch {
            process_one(pipeline, sink, queued, routing_timeout).await;
        }
    }
}

async fn process_one(
    pipeline: &IngestPipeline,
    sink: &dyn EventSink,
    mut queued: QueuedEvent,
    routing_timeout: Duration,
) {
    match timeout(routing_timeout, sink.deliver(&queued.event)).await {
        Ok(()) => {}
        Err(_) => {
            if queued.attempts == 0 {
                warn!(
                    event_type = queued.event.event_type,
                    "routing timed out, re-enqueueing once"
                );
                queued.attempts = 1;
                if pipeline.queue.push(queued).is_some() {
                    counter!("mesa_gateway_events_dropped_total", 1, "reason" => "backpressure");
                    pipeline.drops.record(true);
                }
            } else {
                warn!(
                    event_type = queued.event.event_type,
                    "routing timed out twice, dropping event"
                );
                counter!("mesa_gateway_events_dropped_total", 1, "reason" => "routing_timeout");
            }
        }
    }
}
