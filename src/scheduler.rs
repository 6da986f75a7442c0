//! Agenda scheduler: drives the reconciliation and display loops.
//!
//! The two loops run as separate tasks and only meet in the cache. The display
//! loop claims due entries and hands each display to its own task, so a long
//! display never holds up the next scan. Stopping halts new iterations; a
//! reconciliation already running and every display on screen finish first.

use crate::reconcile::Reconciler;
use crate::trigger::DisplayTrigger;
use chrono::{Local, NaiveDateTime};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Source of local wall-clock time.
pub type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

pub fn local_clock() -> Clock {
    Arc::new(|| Local::now().naive_local())
}

pub struct Scheduler {
    reconciler: Arc<Reconciler>,
    trigger: Arc<DisplayTrigger>,
    reconcile_every: Duration,
    display_every: Duration,
    clock: Clock,
}

impl Scheduler {
    pub fn new(
        reconciler: Arc<Reconciler>,
        trigger: Arc<DisplayTrigger>,
        reconcile_every: Duration,
        display_every: Duration,
    ) -> Self {
        Self {
            reconciler,
            trigger,
            reconcile_every,
            display_every,
            clock: local_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Spawn both loops. Each fires immediately, then on its fixed interval.
    pub fn start(self) -> SchedulerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);

        let reconciler = self.reconciler;
        let clock = self.clock.clone();
        let reconcile = tokio::spawn(run_every(
            "reconcile",
            self.reconcile_every,
            stop_rx.clone(),
            move || {
                let reconciler = reconciler.clone();
                let today = clock().date();
                async move {
                    if let Err(err) = reconciler.run_cycle(today).await {
                        error!(?err, "reconciliation cycle aborted");
                    }
                }
            },
        ));

        let trigger = self.trigger;
        let clock = self.clock;
        let displays: Arc<Mutex<JoinSet<()>>> = Arc::default();
        let in_flight = displays.clone();
        let display = tokio::spawn(run_every(
            "display",
            self.display_every,
            stop_rx,
            move || {
                let trigger = trigger.clone();
                let in_flight = in_flight.clone();
                let now = clock();
                async move {
                    let claimed = match trigger.claim_due(now).await {
                        Ok(claimed) => claimed,
                        Err(err) => {
                            error!(?err, "display pass failed");
                            return;
                        }
                    };
                    let mut set = in_flight.lock().await;
                    while let Some(done) = set.try_join_next() {
                        if let Err(err) = done {
                            warn!(?err, "display task ended abnormally");
                        }
                    }
                    for message in claimed {
                        let trigger = trigger.clone();
                        set.spawn(async move {
                            trigger.dispatch(message).await;
                        });
                    }
                }
            },
        ));

        info!(
            reconcile_secs = self.reconcile_every.as_secs_f64(),
            display_secs = self.display_every.as_secs_f64(),
            "scheduler started"
        );
        SchedulerHandle {
            stop: stop_tx,
            tasks: vec![reconcile, display],
            displays,
        }
    }
}

pub struct SchedulerHandle {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    displays: Arc<Mutex<JoinSet<()>>>,
}

impl SchedulerHandle {
    /// Signal both loops, then wait for the in-flight iteration of each loop
    /// and for every display still on screen.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(?err, "scheduler loop ended abnormally");
            }
        }
        let mut displays = self.displays.lock().await;
        while let Some(done) = displays.join_next().await {
            if let Err(err) = done {
                warn!(?err, "display task ended abnormally");
            }
        }
        info!("scheduler stopped");
    }
}

async fn run_every<F, Fut>(name: &'static str, every: Duration, mut stop: watch::Receiver<bool>, mut work: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        if *stop.borrow() {
            break;
        }
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = ticker.tick() => {}
        }
        work().await;
    }
    info!(loop_name = name, "loop stopped");
}
