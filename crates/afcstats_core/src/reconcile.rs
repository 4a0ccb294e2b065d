use std::collections::BTreeSet;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::api::{RevisionMeta, WikiReadApi, index_by_page_id};
use crate::classify::{CHART_PEND, SubmissionStatus, classify};
use crate::config::StatisticsConfig;
use crate::fetch::{ContentFetcher, LatestContent};
use crate::history::resolve_special;
use crate::notes::{NoteInput, NoteSet, derive_notes};
use crate::store::{MirrorStore, PageChange, PageRecord, changed_pages};
use crate::task::Shutoff;

/// Pages processed between shutoff checks.
const SHUTOFF_POLL_INTERVAL: usize = 10;
const CONTENT_RETRIES: usize = 1;

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    pub ignore_replag: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub replag_secs: i64,
    pub skipped_for_replag: bool,
    pub interrupted: bool,
    pub updated: usize,
    pub unchanged: usize,
    pub added: usize,
    pub untracked: usize,
    pub stale_refreshed: usize,
    pub deleted: usize,
    pub errors: Vec<String>,
    pub request_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageOutcome {
    Inserted,
    Updated,
    Unchanged,
    Untracked,
    Skipped,
}

impl PageOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inserted => "inserted",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
            Self::Untracked => "untracked",
            Self::Skipped => "skipped",
        }
    }

    fn tally(self, report: &mut SyncReport) {
        match self {
            Self::Inserted => report.added += 1,
            Self::Updated => report.updated += 1,
            Self::Unchanged => report.unchanged += 1,
            Self::Untracked => report.untracked += 1,
            Self::Skipped => {}
        }
    }
}

/// One reconciliation run of the mirror against the live wiki.
///
/// `now` is fixed for the whole run, so re-deriving a page twice within a run
/// produces identical rows. The revision cache lives and dies with the value.
pub struct Reconciler<'a, A: WikiReadApi + ?Sized> {
    api: &'a mut A,
    store: &'a mut MirrorStore,
    config: &'a StatisticsConfig,
    shutoff: &'a Shutoff,
    fetcher: ContentFetcher,
    domain: Option<String>,
    now: DateTime<Utc>,
    processed: usize,
}

impl<'a, A: WikiReadApi + ?Sized> Reconciler<'a, A> {
    pub fn new(
        api: &'a mut A,
        store: &'a mut MirrorStore,
        config: &'a StatisticsConfig,
        shutoff: &'a Shutoff,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            api,
            store,
            config,
            shutoff,
            fetcher: ContentFetcher::new(config.afc.retry_delay(), CONTENT_RETRIES),
            domain: config.domain(),
            now,
            processed: 0,
        }
    }

    pub fn sync(&mut self, options: SyncOptions) -> Result<SyncReport> {
        info!("starting sync");
        let mut report = SyncReport::default();

        let replag = self
            .api
            .get_replication_lag()
            .context("failed to read replication lag")?;
        report.replag_secs = replag;
        debug!(replag, "server replication lag");
        if replag > self.config.afc.max_replag_secs && !options.ignore_replag {
            warn!(
                replag,
                max = self.config.afc.max_replag_secs,
                "sync canceled: replication lag too high"
            );
            report.skipped_for_replag = true;
            report.request_count = self.api.request_count();
            return Ok(report);
        }

        self.update_tracked(&mut report)?;
        if !report.interrupted {
            self.add_untracked(&mut report)?;
        }
        if !report.interrupted {
            self.update_stale(&mut report)?;
        }
        if report.interrupted {
            warn!("sync interrupted by shutoff");
            report.request_count = self.api.request_count();
            return Ok(report);
        }
        self.delete_old(&mut report)?;

        report.request_count = self.api.request_count();
        info!(
            updated = report.updated,
            added = report.added,
            untracked = report.untracked,
            deleted = report.deleted,
            errors = report.errors.len(),
            "sync completed"
        );
        Ok(report)
    }

    /// Re-derive every tracked page whose latest revision moved.
    pub fn update_tracked(&mut self, report: &mut SyncReport) -> Result<()> {
        debug!("updating tracked submissions");
        let tracked = self.store.tracked_pages()?;
        let ids = tracked.iter().map(|page| page.page_id).collect::<Vec<_>>();
        let live = index_by_page_id(
            self.api
                .get_page_info(&ids)
                .context("failed to load live page info")?,
        );

        for change in changed_pages(&tracked, &live) {
            if self.shutoff_requested() {
                report.interrupted = true;
                return Ok(());
            }
            match change {
                PageChange::Missing { page_id } => {
                    debug!(page_id, "page no longer exists");
                    match self.store.untrack_page(page_id) {
                        Ok(_) => report.untracked += 1,
                        Err(err) => record_failure(report, page_id, "untracking", &err),
                    }
                }
                PageChange::Changed { page_id, live } => {
                    debug!(page_id, title = %live.title, oldid = live.latest.revision_id, "updating page");
                    match self.update_page(page_id) {
                        Ok(outcome) => outcome.tally(report),
                        Err(err) => record_failure(report, page_id, "updating", &err),
                    }
                }
            }
        }
        Ok(())
    }

    /// Track pending-category members the mirror doesn't know about yet.
    pub fn add_untracked(&mut self, report: &mut SyncReport) -> Result<()> {
        debug!("adding untracked pending submissions");
        let tracked = self
            .store
            .tracked_pages()?
            .into_iter()
            .map(|page| page.page_id)
            .collect::<BTreeSet<_>>();
        let members = self
            .api
            .get_category_members(&self.config.afc.pending_category)
            .context("failed to list pending submissions")?;

        for member in members {
            if tracked.contains(&member.page_id) || self.config.afc.is_ignored(&member.title) {
                continue;
            }
            if self.shutoff_requested() {
                report.interrupted = true;
                return Ok(());
            }
            debug!(page_id = member.page_id, title = %member.title, "tracking page");
            match self.track_page(member.page_id) {
                Ok(outcome) => outcome.tally(report),
                Err(err) => record_failure(report, member.page_id, "tracking", &err),
            }
        }
        Ok(())
    }

    /// Re-derive the least recently reconciled pages past the staleness bound.
    pub fn update_stale(&mut self, report: &mut SyncReport) -> Result<()> {
        let cutoff = self.now - self.config.afc.stale_after();
        let stale = self
            .store
            .stalest_pages(cutoff, self.config.afc.stale_batch)?;
        debug!(count = stale.len(), "updating stale submissions");

        for page_id in stale {
            if self.shutoff_requested() {
                report.interrupted = true;
                return Ok(());
            }
            match self.update_page(page_id) {
                Ok(outcome) => {
                    outcome.tally(report);
                    report.stale_refreshed += 1;
                }
                Err(err) => {
                    record_failure(report, page_id, "refreshing", &err);
                    // Move to the back of the sweep.
                    if let Err(err) = self.store.touch(page_id, self.now) {
                        record_failure(report, page_id, "rotating", &err);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn delete_old(&mut self, report: &mut SyncReport) -> Result<()> {
        debug!("removing old submissions from chart");
        let deleted = self
            .store
            .delete_old(self.now, self.config.afc.retention())?;
        report.deleted += deleted.len();
        Ok(())
    }

    /// Add a page that is not yet in the mirror.
    pub fn track_page(&mut self, page_id: i64) -> Result<PageOutcome> {
        let Some(latest) = self.fetcher.get_latest_content(self.api, page_id)? else {
            error!(page_id, "could not get page content");
            return Ok(PageOutcome::Skipped);
        };
        let Some(status) = classify(&latest.content, latest.info.namespace) else {
            warn!(page_id, title = %latest.info.title, "could not find a status");
            return Ok(PageOutcome::Skipped);
        };

        let special = self.resolve(page_id, status);
        let record = self.derive_record(&latest, status, special)?;
        self.store.insert_page(&record, self.now)?;
        info!(page_id, title = %record.title, status = %status, chart = record.chart(), "tracked page");
        Ok(PageOutcome::Inserted)
    }

    /// Re-derive a tracked page. Writes only when something besides the
    /// ledger timestamp changed.
    pub fn update_page(&mut self, page_id: i64) -> Result<PageOutcome> {
        let Some(stored) = self.store.load_page(page_id)? else {
            bail!("page {page_id} is not tracked");
        };
        let Some(latest) = self.fetcher.get_latest_content(self.api, page_id)? else {
            self.store.untrack_page(page_id)?;
            debug!(page_id, "untracked missing page");
            return Ok(PageOutcome::Untracked);
        };
        let Some(status) = classify(&latest.content, latest.info.namespace) else {
            self.store.untrack_page(page_id)?;
            debug!(page_id, title = %latest.info.title, "untracked page without a status");
            return Ok(PageOutcome::Untracked);
        };

        let previous = &stored.record;
        let special = if status != previous.status || previous.special.is_none() {
            self.resolve(page_id, status)
        } else {
            previous.special.clone()
        };
        let record = self.derive_record(&latest, status, special)?;

        if record == *previous {
            self.store.touch(page_id, self.now)?;
            return Ok(PageOutcome::Unchanged);
        }

        log_field_changes(previous, &record);
        self.store.apply_update(&record, self.now)?;
        Ok(PageOutcome::Updated)
    }

    /// Force a refresh of a tracked page given its title.
    pub fn update_by_title(&mut self, title: &str) -> Result<PageOutcome> {
        let title = title.replace('_', " ");
        let Some(stored) = self.store.find_by_title(title.trim())? else {
            bail!("page [[{}]] not found in database", title.trim());
        };
        info!(
            page_id = stored.record.page_id,
            title = %stored.record.title,
            oldid = stored.record.modify.revision_id,
            "updating page"
        );
        self.update_page(stored.record.page_id)
    }

    pub fn cached_revisions(&self) -> usize {
        self.fetcher.cached_revisions()
    }

    fn resolve(
        &mut self,
        page_id: i64,
        status: SubmissionStatus,
    ) -> Option<RevisionMeta> {
        let special = resolve_special(
            self.api,
            &mut self.fetcher,
            page_id,
            status,
            self.config.afc.history_limit,
        );
        if special.is_none() {
            warn!(page_id, status = %status, "special edit unresolved");
        }
        special
    }

    fn derive_record(
        &mut self,
        latest: &LatestContent,
        status: SubmissionStatus,
        special: Option<RevisionMeta>,
    ) -> Result<PageRecord> {
        let chart = status.chart();
        let submitter_blocked = match (&special, chart == CHART_PEND) {
            (Some(special), true) if !special.user.is_empty() => {
                match self.api.is_user_blocked(&special.user) {
                    Ok(blocked) => blocked,
                    Err(err) => {
                        warn!(user = %special.user, error = %format!("{err:#}"), "failed to read block state");
                        false
                    }
                }
            }
            _ => false,
        };
        let notes: NoteSet = derive_notes(&NoteInput {
            chart,
            content: &latest.content,
            modified: latest.info.latest.timestamp,
            now: self.now,
            submitter_blocked,
            domain: self.domain.as_deref(),
            copyvio_template: &self.config.afc.copyvio_template,
        });
        let size = i64::try_from(latest.content.len()).context("page size does not fit into i64")?;

        Ok(PageRecord {
            page_id: latest.info.page_id,
            title: latest.info.title.clone(),
            status,
            size,
            notes,
            modify: latest.info.latest.clone(),
            special,
        })
    }

    fn shutoff_requested(&mut self) -> bool {
        let due = self.processed % SHUTOFF_POLL_INTERVAL == 0;
        self.processed += 1;
        due && self.shutoff.is_engaged(self.api)
    }
}

fn record_failure(report: &mut SyncReport, page_id: i64, action: &str, err: &anyhow::Error) {
    error!(page_id, error = %format!("{err:#}"), "error {action} page");
    report
        .errors
        .push(format!("page {page_id}: {action} failed: {err:#}"));
}

fn log_field_changes(previous: &PageRecord, next: &PageRecord) {
    let page_id = next.page_id;
    if previous.title != next.title {
        debug!(page_id, from = %previous.title, to = %next.title, "title changed");
    }
    if previous.modify != next.modify {
        debug!(
            page_id,
            from = previous.modify.revision_id,
            to = next.modify.revision_id,
            "modify changed"
        );
    }
    if previous.status != next.status {
        debug!(page_id, from = %previous.status, to = %next.status, "status changed");
    }
    if previous.special != next.special {
        debug!(
            page_id,
            from = ?previous.special.as_ref().map(|special| special.revision_id),
            to = ?next.special.as_ref().map(|special| special.revision_id),
            "special changed"
        );
    }
    if previous.notes != next.notes {
        debug!(page_id, from = %previous.notes, to = %next.notes, "notes changed");
    }
}
