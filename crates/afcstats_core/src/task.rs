use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::api::{WikiReadApi, WikiWriteApi};
use crate::chart::{compile_charts, splice_statistics, statistics_diff, statistics_region};
use crate::config::StatisticsConfig;
use crate::reconcile::{PageOutcome, Reconciler, SyncOptions, SyncReport};
use crate::store::MirrorStore;

const SHUTOFF_RUN_VALUE: &str = "run";
const OPERATOR_SUMMARY_SUFFIX: &str = " (operator request)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Sync { ignore_replag: bool },
    Save { from_operator: bool, dry_run: bool },
    Update { title: String },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sync { .. } => "sync",
            Self::Save { .. } => "save",
            Self::Update { .. } => "update",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveStatus {
    Saved,
    Unchanged,
    ShutoffEngaged,
    DryRun,
}

impl SaveStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Saved => "saved",
            Self::Unchanged => "unchanged",
            Self::ShutoffEngaged => "shutoff_engaged",
            Self::DryRun => "dry_run",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SaveReport {
    pub page: String,
    pub status: SaveStatus,
    pub statistics_bytes: usize,
    pub diff: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Another run held the database lock.
    Skipped,
    Synced(SyncReport),
    Saved(SaveReport),
    Updated { title: String, page: PageOutcome },
}

/// Emergency stop for unattended work.
///
/// Engaged either in-process or by the shutoff wiki page reading anything
/// other than `run`. A missing page does not stop anything.
#[derive(Debug, Default)]
pub struct Shutoff {
    engaged: AtomicBool,
    page: Option<String>,
}

impl Shutoff {
    pub fn new(page: Option<String>) -> Self {
        Self {
            engaged: AtomicBool::new(false),
            page,
        }
    }

    pub fn engage(&self) {
        self.engaged.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.engaged.store(false, Ordering::SeqCst);
    }

    pub fn is_engaged<A: WikiReadApi + ?Sized>(&self, api: &mut A) -> bool {
        if self.engaged.load(Ordering::SeqCst) {
            return true;
        }
        let Some(page) = self.page.as_deref() else {
            return false;
        };
        match api.get_page_text(page) {
            Ok(Some(text)) if text.trim() != SHUTOFF_RUN_VALUE => {
                warn!(page, "emergency task shutoff engaged");
                true
            }
            Ok(_) => false,
            Err(error) => {
                warn!(page, error = %format!("{error:#}"), "failed to read shutoff page");
                false
            }
        }
    }
}

/// The statistics task: owns configuration, the shutoff switch and the
/// database access lock shared by every action.
pub struct AfcStatistics {
    config: StatisticsConfig,
    shutoff: Shutoff,
    db_lock: Mutex<()>,
}

impl AfcStatistics {
    pub fn new(config: StatisticsConfig) -> Self {
        let shutoff = Shutoff::new(config.afc.shutoff_page.clone());
        Self {
            config,
            shutoff,
            db_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &StatisticsConfig {
        &self.config
    }

    pub fn shutoff(&self) -> &Shutoff {
        &self.shutoff
    }

    pub fn run<A: WikiWriteApi + ?Sized>(
        &self,
        action: Action,
        api: &mut A,
        store: &mut MirrorStore,
    ) -> Result<RunOutcome> {
        self.run_at(action, api, store, Utc::now())
    }

    /// Sync never queues behind another holder of the lock; save and update wait.
    pub fn run_at<A: WikiWriteApi + ?Sized>(
        &self,
        action: Action,
        api: &mut A,
        store: &mut MirrorStore,
        now: DateTime<Utc>,
    ) -> Result<RunOutcome> {
        let Some(_guard) = self.acquire(&action) else {
            return Ok(RunOutcome::Skipped);
        };

        match action {
            Action::Sync { ignore_replag } => {
                let report = Reconciler::new(api, store, &self.config, &self.shutoff, now)
                    .sync(SyncOptions { ignore_replag })?;
                Ok(RunOutcome::Synced(report))
            }
            Action::Save {
                from_operator,
                dry_run,
            } => Ok(RunOutcome::Saved(
                self.save(api, store, from_operator, dry_run)?,
            )),
            Action::Update { title } => {
                let page = Reconciler::new(api, store, &self.config, &self.shutoff, now)
                    .update_by_title(&title)?;
                Ok(RunOutcome::Updated { title, page })
            }
        }
    }

    fn acquire(&self, action: &Action) -> Option<MutexGuard<'_, ()>> {
        match self.db_lock.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => {
                if matches!(action, Action::Sync { .. }) {
                    info!("a sync is already ongoing; aborting");
                    return None;
                }
                info!(action = action.name(), "waiting for database access lock");
                Some(
                    self.db_lock
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner),
                )
            }
        }
    }

    /// Compile the charts and write them to the statistics page when they
    /// differ from what is already there.
    fn save<A: WikiWriteApi + ?Sized>(
        &self,
        api: &mut A,
        store: &MirrorStore,
        from_operator: bool,
        dry_run: bool,
    ) -> Result<SaveReport> {
        info!("saving chart");
        let page = self.config.afc.page.clone();
        let summary = if from_operator {
            format!("{}{OPERATOR_SUMMARY_SUFFIX}", self.config.afc.summary)
        } else {
            if self.shutoff.is_engaged(api) {
                return Ok(SaveReport {
                    page,
                    status: SaveStatus::ShutoffEngaged,
                    statistics_bytes: 0,
                    diff: None,
                });
            }
            self.config.afc.summary.clone()
        };

        let statistics = compile_charts(
            store,
            &self.config.afc.templates,
            self.config.afc.chart_row_limit,
        )?;
        let Some(text) = api.get_page_text(&page)? else {
            bail!("statistics page [[{page}]] does not exist");
        };

        let Some(new_text) = splice_statistics(&text, &statistics) else {
            info!(page = %page, "chart unchanged; not saving");
            return Ok(SaveReport {
                page,
                status: SaveStatus::Unchanged,
                statistics_bytes: statistics.len(),
                diff: None,
            });
        };

        if dry_run {
            let current = statistics_region(&text).unwrap_or_default();
            return Ok(SaveReport {
                page,
                status: SaveStatus::DryRun,
                statistics_bytes: statistics.len(),
                diff: Some(statistics_diff(current, &statistics)),
            });
        }

        api.edit_page(&page, &new_text, &summary, true)?;
        info!(page = %page, "chart saved");
        Ok(SaveReport {
            page,
            status: SaveStatus::Saved,
            statistics_bytes: statistics.len(),
            diff: None,
        })
    }
}
