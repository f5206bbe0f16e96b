//! ---
//! wm_section: "01-core-functionality"
//! wm_subsection: "module"
//! wm_type: "source"
//! wm_scope: "code"
//! wm_description: "Absolute-deadline tick source with non-reentrant delivery."
//! wm_version: "v0.1.0"
//! wm_owner: "tbd"
//! ---
//! Periodic tick delivery.
//!
//! Deadlines are computed as `start + n * period`, so lateness on one tick
//! never pushes later deadlines back. A handler sees at most one tick at a
//! time; ticks that come due while it is still busy are coalesced.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use wattmeter_common::{ScheduleConfig, TickStrategy};

/// One firing of the tick source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// Deadline index, starting at 1. Gaps mean ticks were coalesced.
    pub seq: u64,
    pub deadline: Instant,
    pub fired: Instant,
}

impl Tick {
    pub fn lateness(&self) -> Duration {
        self.fired.saturating_duration_since(self.deadline)
    }
}

#[async_trait]
pub trait TickHandler: Send + 'static {
    async fn on_tick(&mut self, tick: Tick);
}

#[derive(Debug, Error)]
pub enum TickError {
    #[error("tick period must be greater than zero")]
    ZeroPeriod,
    #[error("initial deadline overflows the monotonic clock")]
    DeadlineOverflow,
    #[error("tick source requires a running tokio runtime")]
    NoRuntime(#[source] tokio::runtime::TryCurrentError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickSchedule {
    pub period: Duration,
    pub initial_delay: Duration,
    pub strategy: TickStrategy,
}

impl TickSchedule {
    pub fn new(period: Duration, initial_delay: Duration, strategy: TickStrategy) -> Self {
        Self {
            period,
            initial_delay,
            strategy,
        }
    }

    pub fn from_config(config: &ScheduleConfig) -> Self {
        Self::new(config.period_ms, config.initial_delay_ms, config.strategy)
    }

    fn validate(&self) -> Result<Instant, TickError> {
        if self.period.is_zero() {
            return Err(TickError::ZeroPeriod);
        }
        Instant::now()
            .checked_add(self.initial_delay)
            .filter(|start| start.checked_add(self.period).is_some())
            .ok_or(TickError::DeadlineOverflow)
    }
}

#[derive(Debug, Default)]
struct TickStats {
    fired: AtomicU64,
    delivered: AtomicU64,
    coalesced: AtomicU64,
}

impl TickStats {
    fn snapshot(&self) -> TickStatsSnapshot {
        TickStatsSnapshot {
            fired: self.fired.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStatsSnapshot {
    /// Deadlines that were observed by the timer.
    pub fired: u64,
    /// Ticks whose handler invocation completed.
    pub delivered: u64,
    /// Deadlines dropped because the handler was still busy.
    pub coalesced: u64,
}

/// Result of [`TickSource::stop_within`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOutcome {
    pub stats: TickStatsSnapshot,
    /// The in-flight handler overran the limit and was cancelled.
    pub cancelled: bool,
}

/// Running tick source. Dropping it without [`TickSource::stop`] also halts
/// the tasks, but does not wait for an in-flight handler.
#[derive(Debug)]
pub struct TickSource {
    schedule: TickSchedule,
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    stats: Arc<TickStats>,
}

impl TickSource {
    /// Arms the timer on the current runtime. The first tick fires after
    /// `initial_delay`.
    pub fn start<H: TickHandler>(schedule: TickSchedule, handler: H) -> Result<Self, TickError> {
        let start = schedule.validate()?;
        let runtime = Handle::try_current().map_err(TickError::NoRuntime)?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let stats = Arc::new(TickStats::default());

        let tasks = match schedule.strategy {
            TickStrategy::Deadline => {
                // One slot. A tick parked behind a busy handler is dropped
                // by the worker once it is a full period old.
                let (tick_tx, tick_rx) = mpsc::channel(1);
                vec![
                    runtime.spawn(run_timer(
                        start,
                        schedule.period,
                        tick_tx,
                        stop_rx.clone(),
                        stats.clone(),
                    )),
                    runtime.spawn(run_worker(
                        handler,
                        schedule.period,
                        tick_rx,
                        stop_rx,
                        stats.clone(),
                    )),
                ]
            }
            TickStrategy::Cooperative => vec![runtime.spawn(run_cooperative(
                handler,
                start,
                schedule.period,
                stop_rx,
                stats.clone(),
            ))],
        };

        info!(
            period_ms = schedule.period.as_millis() as u64,
            initial_delay_ms = schedule.initial_delay.as_millis() as u64,
            strategy = ?schedule.strategy,
            "tick source armed"
        );
        Ok(Self {
            schedule,
            stop_tx,
            tasks,
            stats,
        })
    }

    pub fn schedule(&self) -> &TickSchedule {
        &self.schedule
    }

    pub fn stats(&self) -> TickStatsSnapshot {
        self.stats.snapshot()
    }

    /// Disarms the timer and waits for any in-flight handler to finish.
    /// No tick is delivered once this returns.
    pub async fn stop(self) -> TickStatsSnapshot {
        let _ = self.stop_tx.send(true);
        let mut tasks = self.tasks;
        join_tasks(&mut tasks).await;
        log_stopped(self.stats.snapshot(), false)
    }

    /// Like [`TickSource::stop`], but a handler still running after `limit`
    /// is cancelled at its next await point. Either way no tick is delivered
    /// and no handler is running once this returns.
    pub async fn stop_within(self, limit: Duration) -> StopOutcome {
        let _ = self.stop_tx.send(true);
        let mut tasks = self.tasks;
        let cancelled = tokio::time::timeout(limit, join_tasks(&mut tasks))
            .await
            .is_err();
        if cancelled {
            warn!(
                limit_ms = limit.as_millis() as u64,
                "tick handler overran the stop limit; cancelling"
            );
            for task in &tasks {
                task.abort();
            }
            for task in tasks {
                match task.await {
                    Err(err) if !err.is_cancelled() => {
                        error!(error = %err, "tick task join failure");
                    }
                    _ => {}
                }
            }
        }
        StopOutcome {
            stats: log_stopped(self.stats.snapshot(), cancelled),
            cancelled,
        }
    }
}

/// Joins from the back so a handle is only dropped once it has completed;
/// whatever is left after a timeout can still be aborted and awaited.
async fn join_tasks(tasks: &mut Vec<JoinHandle<()>>) {
    while let Some(task) = tasks.last_mut() {
        if let Err(err) = task.await {
            error!(error = %err, "tick task join failure");
        }
        tasks.pop();
    }
}

fn log_stopped(snapshot: TickStatsSnapshot, cancelled: bool) -> TickStatsSnapshot {
    info!(
        fired = snapshot.fired,
        delivered = snapshot.delivered,
        coalesced = snapshot.coalesced,
        cancelled,
        "tick source stopped"
    );
    snapshot
}

fn deadline_index(start: Instant, deadline: Instant, period: Duration) -> u64 {
    let elapsed = deadline.saturating_duration_since(start).as_nanos();
    let period = period.as_nanos();
    ((elapsed + period / 2) / period) as u64 + 1
}

fn multiple_of(period: Duration, count: u64) -> Duration {
    let nanos = period.as_nanos().saturating_mul(u128::from(count));
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

async fn run_timer(
    start: Instant,
    period: Duration,
    tick_tx: mpsc::Sender<Tick>,
    mut stop_rx: watch::Receiver<bool>,
    stats: Arc<TickStats>,
) {
    let mut interval = tokio::time::interval_at(start.into(), period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            scheduled = interval.tick() => {
                let deadline = scheduled.into_std();
                let tick = Tick {
                    seq: deadline_index(start, deadline, period),
                    deadline,
                    fired: Instant::now(),
                };
                stats.fired.fetch_add(1, Ordering::Relaxed);
                match tick_tx.try_send(tick) {
                    Ok(()) => {}
                    Err(TrySendError::Full(tick)) => {
                        stats.coalesced.fetch_add(1, Ordering::Relaxed);
                        warn!(seq = tick.seq, "tick coalesced; handler still busy");
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
        }
    }
    debug!("tick timer disarmed");
}

async fn run_worker<H: TickHandler>(
    mut handler: H,
    period: Duration,
    mut tick_rx: mpsc::Receiver<Tick>,
    mut stop_rx: watch::Receiver<bool>,
    stats: Arc<TickStats>,
) {
    loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            received = tick_rx.recv() => match received {
                Some(tick) => {
                    let age = Instant::now().saturating_duration_since(tick.deadline);
                    if age >= period {
                        stats.coalesced.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            seq = tick.seq,
                            age_ms = age.as_millis() as u64,
                            "stale tick dropped; handler overran"
                        );
                        continue;
                    }
                    handler.on_tick(tick).await;
                    stats.delivered.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            },
        }
    }
    debug!("tick worker exited");
}

async fn run_cooperative<H: TickHandler>(
    mut handler: H,
    start: Instant,
    period: Duration,
    mut stop_rx: watch::Receiver<bool>,
    stats: Arc<TickStats>,
) {
    let mut seq = 1u64;
    let mut deadline = start;
    loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            _ = tokio::time::sleep_until(deadline.into()) => {}
        }
        let tick = Tick {
            seq,
            deadline,
            fired: Instant::now(),
        };
        stats.fired.fetch_add(1, Ordering::Relaxed);
        handler.on_tick(tick).await;
        stats.delivered.fetch_add(1, Ordering::Relaxed);

        seq += 1;
        deadline += period;
        let now = Instant::now();
        if deadline <= now {
            let missed = (now.duration_since(deadline).as_nanos() / period.as_nanos()) as u64 + 1;
            seq += missed;
            deadline += multiple_of(period, missed);
            stats.fired.fetch_add(missed, Ordering::Relaxed);
            stats.coalesced.fetch_add(missed, Ordering::Relaxed);
            warn!(missed, next_seq = seq, "handler overran its period; ticks coalesced");
        }
    }
    debug!("cooperative tick loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_index_counts_from_one() {
        let start = Instant::now();
        let period = Duration::from_millis(250);
        assert_eq!(deadline_index(start, start, period), 1);
        assert_eq!(deadline_index(start, start + period, period), 2);
        assert_eq!(deadline_index(start, start + period * 7, period), 8);
    }

    #[test]
    fn lateness_saturates_for_early_fire() {
        let now = Instant::now();
        let tick = Tick {
            seq: 1,
            deadline: now + Duration::from_millis(5),
            fired: now,
        };
        assert_eq!(tick.lateness(), Duration::ZERO);
    }

    #[test]
    fn start_without_runtime_is_rejected() {
        struct Noop;
        #[async_trait]
        impl TickHandler for Noop {
            async fn on_tick(&mut self, _tick: Tick) {}
        }
        let schedule =
            TickSchedule::new(Duration::from_millis(10), Duration::ZERO, TickStrategy::Deadline);
        let err = TickSource::start(schedule, Noop).unwrap_err();
        assert!(matches!(err, TickError::NoRuntime(_)));
    }
}
