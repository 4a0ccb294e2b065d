use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use tracing::debug;

use crate::api::{PageInfo, RevisionMeta};
use crate::classify::{CHART_ACCEPT, CHART_DECLINE, ChartId, SubmissionStatus};
use crate::migrate::open_ready_connection;
use crate::notes::NoteSet;
use crate::runtime::ResolvedPaths;

const PAGE_COLUMNS: &str = "page_id, page_status, page_title, page_size, page_notes,
    page_modify_user, page_modify_time, page_modify_oldid,
    page_special_user, page_special_time, page_special_oldid,
    row_chart, update_time";

/// Derived state of one tracked submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRecord {
    pub page_id: i64,
    pub title: String,
    pub status: SubmissionStatus,
    pub size: i64,
    pub notes: NoteSet,
    pub modify: RevisionMeta,
    pub special: Option<RevisionMeta>,
}

impl PageRecord {
    pub fn chart(&self) -> ChartId {
        self.status.chart()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPage {
    pub record: PageRecord,
    pub chart: ChartId,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Stored latest revision of a tracked page, for joining against live data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedRevision {
    pub page_id: i64,
    pub title: String,
    pub modify_oldid: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageChange {
    Changed { page_id: i64, live: PageInfo },
    Missing { page_id: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChartDefinition {
    pub chart_id: ChartId,
    pub title: String,
    pub special_title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChartCount {
    pub chart_id: ChartId,
    pub title: String,
    pub pages: usize,
}

/// Local mirror of tracked submissions.
///
/// Every mutation touching more than one table runs inside a single
/// transaction so a page never exists without its chart row and ledger entry.
pub struct MirrorStore {
    connection: Connection,
}

impl MirrorStore {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    pub fn open(paths: &ResolvedPaths) -> Result<Self> {
        Ok(Self::new(open_ready_connection(paths)?))
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn insert_page(&mut self, record: &PageRecord, now: DateTime<Utc>) -> Result<()> {
        let transaction = self
            .connection
            .transaction()
            .context("failed to start page insert transaction")?;
        transaction
            .execute(
                "INSERT INTO page (
                    page_id, page_status, page_title, page_size, page_notes,
                    page_modify_user, page_modify_time, page_modify_oldid,
                    page_special_user, page_special_time, page_special_oldid
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    record.page_id,
                    record.status.code(),
                    record.title,
                    record.size,
                    record.notes.to_storage(),
                    record.modify.user,
                    record.modify.timestamp.timestamp(),
                    record.modify.revision_id,
                    record.special.as_ref().map(|special| special.user.as_str()),
                    record.special.as_ref().map(|special| special.timestamp.timestamp()),
                    record.special.as_ref().map(|special| special.revision_id),
                ],
            )
            .with_context(|| format!("failed to insert page {}", record.page_id))?;
        transaction
            .execute(
                "INSERT INTO chart_row (row_id, row_chart) VALUES (?1, ?2)",
                params![record.page_id, record.chart()],
            )
            .with_context(|| format!("failed to insert chart row for page {}", record.page_id))?;
        transaction
            .execute(
                "INSERT OR REPLACE INTO updatelog (update_id, update_time) VALUES (?1, ?2)",
                params![record.page_id, now.timestamp()],
            )
            .with_context(|| format!("failed to record update for page {}", record.page_id))?;
        transaction
            .commit()
            .context("failed to commit page insert transaction")
    }

    /// Rewrite a tracked page's derived state, chart and ledger entry.
    pub fn apply_update(&mut self, record: &PageRecord, now: DateTime<Utc>) -> Result<()> {
        let transaction = self
            .connection
            .transaction()
            .context("failed to start page update transaction")?;
        let updated = transaction
            .execute(
                "UPDATE page SET
                    page_status = ?2, page_title = ?3, page_size = ?4, page_notes = ?5,
                    page_modify_user = ?6, page_modify_time = ?7, page_modify_oldid = ?8,
                    page_special_user = ?9, page_special_time = ?10, page_special_oldid = ?11
                 WHERE page_id = ?1",
                params![
                    record.page_id,
                    record.status.code(),
                    record.title,
                    record.size,
                    record.notes.to_storage(),
                    record.modify.user,
                    record.modify.timestamp.timestamp(),
                    record.modify.revision_id,
                    record.special.as_ref().map(|special| special.user.as_str()),
                    record.special.as_ref().map(|special| special.timestamp.timestamp()),
                    record.special.as_ref().map(|special| special.revision_id),
                ],
            )
            .with_context(|| format!("failed to update page {}", record.page_id))?;
        if updated == 0 {
            bail!("page {} is not tracked", record.page_id);
        }
        transaction
            .execute(
                "INSERT OR REPLACE INTO chart_row (row_id, row_chart) VALUES (?1, ?2)",
                params![record.page_id, record.chart()],
            )
            .with_context(|| format!("failed to update chart row for page {}", record.page_id))?;
        transaction
            .execute(
                "INSERT OR REPLACE INTO updatelog (update_id, update_time) VALUES (?1, ?2)",
                params![record.page_id, now.timestamp()],
            )
            .with_context(|| format!("failed to record update for page {}", record.page_id))?;
        transaction
            .commit()
            .context("failed to commit page update transaction")
    }

    /// Remove a page from every table. Returns whether it was tracked.
    pub fn untrack_page(&mut self, page_id: i64) -> Result<bool> {
        let transaction = self
            .connection
            .transaction()
            .context("failed to start untrack transaction")?;
        transaction
            .execute("DELETE FROM updatelog WHERE update_id = ?1", params![page_id])
            .context("failed to delete ledger entry")?;
        transaction
            .execute("DELETE FROM chart_row WHERE row_id = ?1", params![page_id])
            .context("failed to delete chart row")?;
        let removed = transaction
            .execute("DELETE FROM page WHERE page_id = ?1", params![page_id])
            .context("failed to delete page")?;
        transaction
            .commit()
            .context("failed to commit untrack transaction")?;
        Ok(removed > 0)
    }

    /// Refresh only the ledger timestamp.
    pub fn touch(&mut self, page_id: i64, now: DateTime<Utc>) -> Result<()> {
        self.connection
            .execute(
                "UPDATE updatelog SET update_time = ?2 WHERE update_id = ?1",
                params![page_id, now.timestamp()],
            )
            .with_context(|| format!("failed to touch ledger for page {page_id}"))?;
        Ok(())
    }

    /// Purge accepted/declined pages whose transition edit is older than
    /// `retention`. Pages with an unresolved transition age by their last edit.
    pub fn delete_old(&mut self, now: DateTime<Utc>, retention: Duration) -> Result<Vec<i64>> {
        let cutoff = (now - retention).timestamp();
        let transaction = self
            .connection
            .transaction()
            .context("failed to start delete_old transaction")?;
        let expired = {
            let mut statement = transaction
                .prepare(
                    "SELECT page_id FROM page
                     JOIN chart_row ON page_id = row_id
                     WHERE row_chart IN (?1, ?2)
                     AND COALESCE(page_special_time, page_modify_time) < ?3
                     ORDER BY page_id",
                )
                .context("failed to prepare expired page query")?;
            let rows = statement
                .query_map(params![CHART_ACCEPT, CHART_DECLINE, cutoff], |row| {
                    row.get::<_, i64>(0)
                })
                .context("failed to query expired pages")?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("failed to read expired pages")?
        };
        for page_id in &expired {
            transaction
                .execute("DELETE FROM updatelog WHERE update_id = ?1", params![page_id])
                .context("failed to delete ledger entry")?;
            transaction
                .execute("DELETE FROM chart_row WHERE row_id = ?1", params![page_id])
                .context("failed to delete chart row")?;
            transaction
                .execute("DELETE FROM page WHERE page_id = ?1", params![page_id])
                .context("failed to delete page")?;
        }
        transaction
            .commit()
            .context("failed to commit delete_old transaction")?;
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired terminal pages");
        }
        Ok(expired)
    }

    pub fn tracked_pages(&self) -> Result<Vec<TrackedRevision>> {
        let mut statement = self
            .connection
            .prepare("SELECT page_id, page_title, page_modify_oldid FROM page ORDER BY page_id")
            .context("failed to prepare tracked page query")?;
        let rows = statement
            .query_map([], |row| {
                Ok(TrackedRevision {
                    page_id: row.get(0)?,
                    title: row.get(1)?,
                    modify_oldid: row.get(2)?,
                })
            })
            .context("failed to query tracked pages")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read tracked pages")
    }

    pub fn load_page(&self, page_id: i64) -> Result<Option<StoredPage>> {
        let sql = format!(
            "SELECT {PAGE_COLUMNS} FROM page
             JOIN chart_row ON page_id = row_id
             LEFT JOIN updatelog ON page_id = update_id
             WHERE page_id = ?1"
        );
        let raw = self
            .connection
            .query_row(&sql, params![page_id], RawPage::from_row)
            .optional()
            .with_context(|| format!("failed to load page {page_id}"))?;
        raw.map(RawPage::into_stored).transpose()
    }

    pub fn find_by_title(&self, title: &str) -> Result<Option<StoredPage>> {
        let sql = format!(
            "SELECT {PAGE_COLUMNS} FROM page
             JOIN chart_row ON page_id = row_id
             LEFT JOIN updatelog ON page_id = update_id
             WHERE page_title = ?1
             ORDER BY page_id LIMIT 1"
        );
        let raw = self
            .connection
            .query_row(&sql, params![title], RawPage::from_row)
            .optional()
            .with_context(|| format!("failed to look up page {title}"))?;
        raw.map(RawPage::into_stored).transpose()
    }

    /// Ids of the `limit` pages least recently reconciled before `older_than`.
    pub fn stalest_pages(&self, older_than: DateTime<Utc>, limit: usize) -> Result<Vec<i64>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT update_id FROM updatelog
                 WHERE update_time < ?1
                 ORDER BY update_time ASC, update_id ASC
                 LIMIT ?2",
            )
            .context("failed to prepare stale page query")?;
        let limit = i64::try_from(limit).context("stale batch does not fit into i64")?;
        let rows = statement
            .query_map(params![older_than.timestamp(), limit], |row| row.get(0))
            .context("failed to query stale pages")?;
        rows.collect::<rusqlite::Result<Vec<i64>>>()
            .context("failed to read stale pages")
    }

    pub fn chart_definitions(&self) -> Result<Vec<ChartDefinition>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT chart_id, chart_title, chart_special_title FROM chart ORDER BY chart_id",
            )
            .context("failed to prepare chart query")?;
        let rows = statement
            .query_map([], |row| {
                Ok(ChartDefinition {
                    chart_id: row.get(0)?,
                    title: row.get(1)?,
                    special_title: row.get(2)?,
                })
            })
            .context("failed to query charts")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read charts")
    }

    /// Pages on one chart, ordered by transition time (unresolved last), then id.
    pub fn chart_pages(&self, chart_id: ChartId) -> Result<Vec<StoredPage>> {
        let sql = format!(
            "SELECT {PAGE_COLUMNS} FROM page
             JOIN chart_row ON page_id = row_id
             LEFT JOIN updatelog ON page_id = update_id
             WHERE row_chart = ?1
             ORDER BY page_special_time IS NULL, page_special_time, page_id"
        );
        let mut statement = self
            .connection
            .prepare(&sql)
            .context("failed to prepare chart page query")?;
        let rows = statement
            .query_map(params![chart_id], RawPage::from_row)
            .with_context(|| format!("failed to query pages of chart {chart_id}"))?;
        let raw = rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("failed to read pages of chart {chart_id}"))?;
        raw.into_iter().map(RawPage::into_stored).collect()
    }

    pub fn chart_counts(&self) -> Result<Vec<ChartCount>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT chart_id, chart_title, COUNT(row_id) FROM chart
                 LEFT JOIN chart_row ON chart_id = row_chart
                 GROUP BY chart_id ORDER BY chart_id",
            )
            .context("failed to prepare chart count query")?;
        let rows = statement
            .query_map([], |row| {
                let pages: i64 = row.get(2)?;
                Ok(ChartCount {
                    chart_id: row.get(0)?,
                    title: row.get(1)?,
                    pages: usize::try_from(pages).unwrap_or(0),
                })
            })
            .context("failed to query chart counts")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read chart counts")
    }
}

/// Join the mirror against a live snapshot keyed by page id.
pub fn changed_pages(
    tracked: &[TrackedRevision],
    live: &BTreeMap<i64, PageInfo>,
) -> Vec<PageChange> {
    tracked
        .iter()
        .filter_map(|stored| match live.get(&stored.page_id) {
            None => Some(PageChange::Missing {
                page_id: stored.page_id,
            }),
            Some(info) if info.latest.revision_id != stored.modify_oldid => {
                Some(PageChange::Changed {
                    page_id: stored.page_id,
                    live: info.clone(),
                })
            }
            Some(_) => None,
        })
        .collect()
}

struct RawPage {
    page_id: i64,
    status: String,
    title: String,
    size: i64,
    notes: String,
    modify_user: String,
    modify_time: i64,
    modify_oldid: i64,
    special_user: Option<String>,
    special_time: Option<i64>,
    special_oldid: Option<i64>,
    chart: ChartId,
    update_time: Option<i64>,
}

impl RawPage {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            page_id: row.get(0)?,
            status: row.get(1)?,
            title: row.get(2)?,
            size: row.get(3)?,
            notes: row.get(4)?,
            modify_user: row.get(5)?,
            modify_time: row.get(6)?,
            modify_oldid: row.get(7)?,
            special_user: row.get(8)?,
            special_time: row.get(9)?,
            special_oldid: row.get(10)?,
            chart: row.get(11)?,
            update_time: row.get(12)?,
        })
    }

    fn into_stored(self) -> Result<StoredPage> {
        let status = SubmissionStatus::from_code(&self.status).ok_or_else(|| {
            anyhow::anyhow!(
                "page {} has unknown status code `{}`",
                self.page_id,
                self.status
            )
        })?;
        let special = match (self.special_user, self.special_time, self.special_oldid) {
            (Some(user), Some(time), Some(revision_id)) => Some(RevisionMeta {
                revision_id,
                user,
                timestamp: from_unix(time)?,
            }),
            _ => None,
        };
        Ok(StoredPage {
            record: PageRecord {
                page_id: self.page_id,
                title: self.title,
                status,
                size: self.size,
                notes: NoteSet::from_storage(&self.notes),
                modify: RevisionMeta {
                    revision_id: self.modify_oldid,
                    user: self.modify_user,
                    timestamp: from_unix(self.modify_time)?,
                },
                special,
            },
            chart: self.chart,
            updated_at: self.update_time.map(from_unix).transpose()?,
        })
    }
}

fn from_unix(seconds: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(seconds, 0)
        .ok_or_else(|| anyhow::anyhow!("stored timestamp out of range: {seconds}"))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Duration;

    use super::{PageChange, PageRecord, TrackedRevision, changed_pages};
    use crate::api::{PageInfo, RevisionMeta};
    use crate::classify::{CHART_ACCEPT, CHART_DECLINE, CHART_PEND, CHART_REVIEW, SubmissionStatus};
    use crate::notes::{Note, NoteSet};
    use crate::test_support::{base_time, hours_before, temp_store};

    fn revision(revision_id: i64, user: &str, hours_ago: i64) -> RevisionMeta {
        RevisionMeta {
            revision_id,
            user: user.to_string(),
            timestamp: hours_before(base_time(), hours_ago),
        }
    }

    fn record(page_id: i64, status: SubmissionStatus, special_hours_ago: Option<i64>) -> PageRecord {
        PageRecord {
            page_id,
            title: format!("Draft:Page {page_id}"),
            status,
            size: 1_234,
            notes: [Note::Short].into_iter().collect::<NoteSet>(),
            modify: revision(page_id * 10, "Editor", 1),
            special: special_hours_ago.map(|hours| revision(page_id * 10 - 1, "Special", hours)),
        }
    }

    #[test]
    fn insert_and_load_round_trip() {
        let (_temp, mut store) = temp_store();
        let page = record(1, SubmissionStatus::Pending, Some(3));
        store.insert_page(&page, base_time()).expect("insert");

        let stored = store.load_page(1).expect("load").expect("present");
        assert_eq!(stored.record, page);
        assert_eq!(stored.chart, CHART_PEND);
        assert_eq!(stored.updated_at, Some(base_time()));

        let by_title = store
            .find_by_title("Draft:Page 1")
            .expect("find")
            .expect("present");
        assert_eq!(by_title.record.page_id, 1);
        assert!(store.load_page(2).expect("load").is_none());
    }

    #[test]
    fn duplicate_insert_leaves_no_partial_rows() {
        let (_temp, mut store) = temp_store();
        let page = record(1, SubmissionStatus::Pending, None);
        store.insert_page(&page, base_time()).expect("insert");
        store
            .insert_page(&page, base_time())
            .expect_err("duplicate must fail");

        let rows: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM chart_row", [], |row| row.get(0))
            .expect("count");
        assert_eq!(rows, 1);
    }

    #[test]
    fn apply_update_moves_chart_and_touches_ledger() {
        let (_temp, mut store) = temp_store();
        store
            .insert_page(&record(1, SubmissionStatus::Pending, Some(3)), hours_before(base_time(), 5))
            .expect("insert");

        let reviewing = record(1, SubmissionStatus::Reviewing, Some(1));
        store.apply_update(&reviewing, base_time()).expect("update");
        let stored = store.load_page(1).expect("load").expect("present");
        assert_eq!(stored.chart, CHART_REVIEW);
        assert_eq!(stored.updated_at, Some(base_time()));
        assert_eq!(store.chart_pages(CHART_PEND).expect("chart").len(), 0);

        store
            .apply_update(&record(9, SubmissionStatus::Pending, None), base_time())
            .expect_err("untracked page cannot be updated");
    }

    #[test]
    fn untrack_removes_all_three_tables() {
        let (_temp, mut store) = temp_store();
        store
            .insert_page(&record(1, SubmissionStatus::Pending, None), base_time())
            .expect("insert");
        assert!(store.untrack_page(1).expect("untrack"));
        assert!(!store.untrack_page(1).expect("untrack again"));

        for table in ["page", "chart_row", "updatelog"] {
            let count: i64 = store
                .connection()
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .expect("count");
            assert_eq!(count, 0, "{table} must be empty");
        }
    }

    #[test]
    fn delete_old_honours_retention_window() {
        let (_temp, mut store) = temp_store();
        let now = base_time();
        store
            .insert_page(&record(1, SubmissionStatus::Declined, Some(37)), now)
            .expect("insert old");
        store
            .insert_page(&record(2, SubmissionStatus::Accepted, Some(35)), now)
            .expect("insert recent");
        store
            .insert_page(&record(3, SubmissionStatus::Pending, Some(100)), now)
            .expect("insert pending");

        let deleted = store.delete_old(now, Duration::hours(36)).expect("delete_old");
        assert_eq!(deleted, vec![1]);
        assert!(store.load_page(2).expect("load").is_some());
        assert!(store.load_page(3).expect("load").is_some());
        assert_eq!(store.chart_pages(CHART_DECLINE).expect("chart").len(), 0);
        assert_eq!(store.chart_pages(CHART_ACCEPT).expect("chart").len(), 1);
    }

    #[test]
    fn delete_old_falls_back_to_last_edit_when_unresolved() {
        let (_temp, mut store) = temp_store();
        let mut page = record(1, SubmissionStatus::Accepted, None);
        page.modify = revision(10, "Editor", 40);
        store.insert_page(&page, base_time()).expect("insert");

        let deleted = store
            .delete_old(base_time(), Duration::hours(36))
            .expect("delete_old");
        assert_eq!(deleted, vec![1]);
    }

    #[test]
    fn stalest_pages_orders_by_ledger_time() {
        let (_temp, mut store) = temp_store();
        let now = base_time();
        for (page_id, hours) in [(1, 50), (2, 70), (3, 10), (4, 60)] {
            store
                .insert_page(
                    &record(page_id, SubmissionStatus::Pending, None),
                    hours_before(now, hours),
                )
                .expect("insert");
        }

        let stale = store
            .stalest_pages(now - Duration::hours(48), 2)
            .expect("stale");
        assert_eq!(stale, vec![2, 4]);

        store.touch(2, now).expect("touch");
        let stale = store
            .stalest_pages(now - Duration::hours(48), 10)
            .expect("stale");
        assert_eq!(stale, vec![4, 1]);
    }

    #[test]
    fn chart_pages_order_by_transition_then_id() {
        let (_temp, mut store) = temp_store();
        store
            .insert_page(&record(3, SubmissionStatus::Pending, None), base_time())
            .expect("insert");
        store
            .insert_page(&record(2, SubmissionStatus::Pending, Some(2)), base_time())
            .expect("insert");
        store
            .insert_page(&record(1, SubmissionStatus::Pending, Some(5)), base_time())
            .expect("insert");

        let order = store
            .chart_pages(CHART_PEND)
            .expect("chart")
            .into_iter()
            .map(|page| page.record.page_id)
            .collect::<Vec<_>>();
        assert_eq!(order, vec![1, 2, 3]);

        let counts = store.chart_counts().expect("counts");
        assert_eq!(counts.len(), 5);
        assert_eq!(counts[0].pages, 3);
        assert_eq!(store.chart_definitions().expect("charts")[0].title, "Pending submissions");
    }

    #[test]
    fn changed_pages_reports_revision_drift_and_missing_pages() {
        let tracked = vec![
            TrackedRevision {
                page_id: 1,
                title: "Draft:A".to_string(),
                modify_oldid: 100,
            },
            TrackedRevision {
                page_id: 2,
                title: "Draft:B".to_string(),
                modify_oldid: 200,
            },
            TrackedRevision {
                page_id: 3,
                title: "Draft:C".to_string(),
                modify_oldid: 300,
            },
        ];
        let live = BTreeMap::from([
            (
                1,
                PageInfo {
                    page_id: 1,
                    title: "Draft:A".to_string(),
                    namespace: 118,
                    latest: revision(100, "Editor", 1),
                },
            ),
            (
                2,
                PageInfo {
                    page_id: 2,
                    title: "Draft:B".to_string(),
                    namespace: 118,
                    latest: revision(201, "Editor", 1),
                },
            ),
        ]);

        let changes = changed_pages(&tracked, &live);
        assert_eq!(changes.len(), 2);
        assert!(matches!(&changes[0], PageChange::Changed { page_id: 2, live } if live.latest.revision_id == 201));
        assert_eq!(changes[1], PageChange::Missing { page_id: 3 });
    }
}
