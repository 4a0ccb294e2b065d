use std::sync::mpsc::{TrySendError, sync_channel};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::api::WikiWriteApi;
use crate::store::MirrorStore;
use crate::task::{Action, AfcStatistics, RunOutcome};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Sync,
    Save,
}

impl Tick {
    fn action(self) -> Action {
        match self {
            Self::Sync => Action::Sync {
                ignore_replag: false,
            },
            Self::Save => Action::Save {
                from_operator: false,
                dry_run: false,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleOptions {
    pub sync_interval: Duration,
    pub save_interval: Duration,
    pub queue_capacity: usize,
    pub max_ticks: Option<usize>,
}

impl ScheduleOptions {
    pub fn from_config(task: &AfcStatistics, max_ticks: Option<usize>) -> Self {
        let afc = &task.config().afc;
        Self {
            sync_interval: afc.sync_interval(),
            save_interval: afc.save_interval(),
            queue_capacity: 2,
            max_ticks,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScheduleReport {
    pub ticks: usize,
    pub enqueued: usize,
    pub dropped: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Due offsets for the two periodic actions. Sync is due immediately, save
/// one interval in; a tie goes to sync so the save sees fresh rows.
#[derive(Debug, Clone)]
pub struct Ticker {
    sync_every: Duration,
    save_every: Duration,
    next_sync: Duration,
    next_save: Duration,
}

impl Ticker {
    pub fn new(sync_every: Duration, save_every: Duration) -> Self {
        let sync_every = sync_every.max(MIN_INTERVAL);
        let save_every = save_every.max(MIN_INTERVAL);
        Self {
            sync_every,
            save_every,
            next_sync: Duration::ZERO,
            next_save: save_every,
        }
    }

    pub fn next_tick(&mut self) -> (Duration, Tick) {
        if self.next_sync <= self.next_save {
            let due = self.next_sync;
            self.next_sync += self.sync_every;
            (due, Tick::Sync)
        } else {
            let due = self.next_save;
            self.next_save += self.save_every;
            (due, Tick::Save)
        }
    }
}

/// Run the periodic schedule. One worker thread owns the API client and the
/// store and drains a bounded queue; a tick that finds the queue full is
/// dropped rather than piling up behind a slow run.
pub fn run_schedule<A: WikiWriteApi + Send + ?Sized>(
    task: &AfcStatistics,
    api: &mut A,
    store: &mut MirrorStore,
    options: &ScheduleOptions,
) -> Result<ScheduleReport> {
    let (sender, receiver) = sync_channel::<Tick>(options.queue_capacity.max(1));
    let mut ticker = Ticker::new(options.sync_interval, options.save_interval);
    let mut report = ScheduleReport::default();

    info!(
        sync_every_secs = options.sync_interval.as_secs(),
        save_every_secs = options.save_interval.as_secs(),
        "starting schedule"
    );

    let worker_report = thread::scope(|scope| {
        let worker = scope.spawn(move || {
            let mut counts = ScheduleReport::default();
            for tick in receiver {
                debug!(?tick, "running scheduled action");
                match task.run(tick.action(), api, store) {
                    Ok(RunOutcome::Skipped) => counts.skipped += 1,
                    Ok(_) => counts.completed += 1,
                    Err(err) => {
                        error!(?tick, error = %format!("{err:#}"), "scheduled action failed");
                        counts.failed += 1;
                    }
                }
            }
            counts
        });

        let started = Instant::now();
        while options.max_ticks.is_none_or(|max| report.ticks < max) {
            let (due, tick) = ticker.next_tick();
            if let Some(wait) = (started + due).checked_duration_since(Instant::now()) {
                thread::sleep(wait);
            }
            report.ticks += 1;
            match sender.try_send(tick) {
                Ok(()) => report.enqueued += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(?tick, "work queue full; dropping tick");
                    report.dropped += 1;
                }
                Err(TrySendError::Disconnected(_)) => {
                    warn!("schedule worker stopped");
                    break;
                }
            }
        }
        drop(sender);

        worker
            .join()
            .map_err(|_| anyhow!("schedule worker panicked"))
    })?;

    report.completed = worker_report.completed;
    report.skipped = worker_report.skipped;
    report.failed = worker_report.failed;
    info!(
        ticks = report.ticks,
        dropped = report.dropped,
        failed = report.failed,
        "schedule finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{ScheduleOptions, Tick, Ticker, run_schedule};
    use crate::config::StatisticsConfig;
    use crate::task::AfcStatistics;
    use crate::test_support::{MockWiki, temp_store};

    #[test]
    fn ticker_interleaves_sync_and_save() {
        let mut ticker = Ticker::new(Duration::from_secs(240), Duration::from_secs(3600));
        let ticks = (0..17).map(|_| ticker.next_tick()).collect::<Vec<_>>();

        assert_eq!(ticks[0], (Duration::ZERO, Tick::Sync));
        assert_eq!(ticks[1], (Duration::from_secs(240), Tick::Sync));
        assert_eq!(ticks[15], (Duration::from_secs(3600), Tick::Sync));
        assert_eq!(ticks[16], (Duration::from_secs(3600), Tick::Save));
        assert_eq!(
            ticks.iter().filter(|(_, tick)| *tick == Tick::Save).count(),
            1
        );
    }

    #[test]
    fn zero_intervals_still_advance() {
        let mut ticker = Ticker::new(Duration::ZERO, Duration::ZERO);
        let first = ticker.next_tick();
        let second = ticker.next_tick();
        let third = ticker.next_tick();
        assert_eq!(first.1, Tick::Sync);
        assert!(second.0 >= first.0);
        assert!(third.0 > first.0);
    }

    #[test]
    fn bounded_schedule_accounts_for_every_tick() {
        let (_temp, mut store) = temp_store();
        let mut wiki = MockWiki::default();
        wiki.texts.insert(
            "Template:AFC statistics".to_string(),
            "<!-- stat begin -->\n<!-- stat end -->".to_string(),
        );
        let mut config = StatisticsConfig::default();
        config.afc.retry_delay_ms = 0;
        let task = AfcStatistics::new(config);
        let options = ScheduleOptions {
            sync_interval: Duration::from_millis(2),
            save_interval: Duration::from_millis(5),
            queue_capacity: 1,
            max_ticks: Some(6),
        };

        let report = run_schedule(&task, &mut wiki, &mut store, &options).expect("schedule");
        assert_eq!(report.ticks, 6);
        assert_eq!(report.enqueued + report.dropped, 6);
        assert_eq!(
            report.completed + report.skipped + report.failed,
            report.enqueued
        );
        assert_eq!(report.failed, 0);
        assert!(wiki.edits.len() <= 1, "the chart is only saved when it changes");
    }
}
