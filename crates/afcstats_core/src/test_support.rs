//! In-memory wiki shared by the unit tests.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Result, bail};
use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::api::{CategoryMember, PageInfo, RevisionMeta, WikiReadApi, WikiWriteApi};
use crate::migrate::{migrate_connection, open_connection};
use crate::store::MirrorStore;

/// Fully migrated store in a scratch directory. Keep the guard alive.
pub(crate) fn temp_store() -> (tempfile::TempDir, MirrorStore) {
    let temp = tempfile::tempdir().expect("tempdir");
    let connection = open_connection(&temp.path().join("afc_statistics.db")).expect("open");
    migrate_connection(&connection).expect("migrate");
    (temp, MirrorStore::new(connection))
}

pub(crate) fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 1, 10, 12, 0, 0).unwrap()
}

pub(crate) fn hours_before(now: DateTime<Utc>, hours: i64) -> DateTime<Utc> {
    now - Duration::hours(hours)
}

#[derive(Debug, Clone)]
pub(crate) struct MockRevision {
    pub meta: RevisionMeta,
    pub content: String,
}

#[derive(Debug, Clone)]
pub(crate) struct MockPage {
    pub title: String,
    pub namespace: i32,
    /// Oldest first.
    pub revisions: Vec<MockRevision>,
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedEdit {
    pub title: String,
    pub content: String,
    pub summary: String,
    pub minor: bool,
}

#[derive(Default)]
pub(crate) struct MockWiki {
    pub pages: BTreeMap<i64, MockPage>,
    pub categories: BTreeMap<String, Vec<i64>>,
    pub blocked_users: BTreeSet<String>,
    pub texts: BTreeMap<String, String>,
    pub replag: i64,
    /// Revision id -> number of content requests that fail before one succeeds.
    pub content_failures: BTreeMap<i64, usize>,
    pub hidden_revisions: BTreeSet<i64>,
    pub edits: Vec<RecordedEdit>,
    pub content_requests: usize,
    pub logged_in: bool,
    request_count: usize,
    next_revision_id: i64,
}

impl MockWiki {
    pub fn add_page(&mut self, page_id: i64, title: &str, namespace: i32) {
        self.pages.insert(
            page_id,
            MockPage {
                title: title.to_string(),
                namespace,
                revisions: Vec::new(),
            },
        );
    }

    /// Append a revision and return its id. Ids grow across the whole wiki.
    pub fn push_revision(
        &mut self,
        page_id: i64,
        user: &str,
        timestamp: DateTime<Utc>,
        content: &str,
    ) -> i64 {
        self.next_revision_id += 1;
        let revision_id = 1_000 + self.next_revision_id;
        let page = self.pages.get_mut(&page_id).expect("page must be added first");
        page.revisions.push(MockRevision {
            meta: RevisionMeta {
                revision_id,
                user: user.to_string(),
                timestamp,
            },
            content: content.to_string(),
        });
        revision_id
    }

    pub fn add_to_category(&mut self, category: &str, page_id: i64) {
        self.categories
            .entry(category.to_string())
            .or_default()
            .push(page_id);
    }

    pub fn remove_from_category(&mut self, category: &str, page_id: i64) {
        if let Some(members) = self.categories.get_mut(category) {
            members.retain(|id| *id != page_id);
        }
    }

    pub fn rename(&mut self, page_id: i64, title: &str, namespace: i32) {
        let page = self.pages.get_mut(&page_id).expect("page exists");
        page.title = title.to_string();
        page.namespace = namespace;
    }
}

impl WikiReadApi for MockWiki {
    fn get_replication_lag(&mut self) -> Result<i64> {
        self.request_count += 1;
        Ok(self.replag)
    }

    fn get_page_info(&mut self, page_ids: &[i64]) -> Result<Vec<PageInfo>> {
        self.request_count += 1;
        let mut output = Vec::new();
        for page_id in page_ids {
            let Some(page) = self.pages.get(page_id) else {
                continue;
            };
            let Some(latest) = page.revisions.last() else {
                continue;
            };
            output.push(PageInfo {
                page_id: *page_id,
                title: page.title.clone(),
                namespace: page.namespace,
                latest: latest.meta.clone(),
            });
        }
        Ok(output)
    }

    fn get_category_members(&mut self, category: &str) -> Result<Vec<CategoryMember>> {
        self.request_count += 1;
        let members = self.categories.get(category).cloned().unwrap_or_default();
        Ok(members
            .into_iter()
            .filter_map(|page_id| {
                self.pages.get(&page_id).map(|page| CategoryMember {
                    page_id,
                    title: page.title.clone(),
                    namespace: page.namespace,
                })
            })
            .collect())
    }

    fn get_revision_content(&mut self, revision_id: i64) -> Result<Option<String>> {
        self.request_count += 1;
        self.content_requests += 1;
        if let Some(remaining) = self.content_failures.get_mut(&revision_id) {
            if *remaining > 0 {
                *remaining -= 1;
                bail!("simulated transport failure for revision {revision_id}");
            }
        }
        if self.hidden_revisions.contains(&revision_id) {
            return Ok(None);
        }
        Ok(self
            .pages
            .values()
            .flat_map(|page| page.revisions.iter())
            .find(|revision| revision.meta.revision_id == revision_id)
            .map(|revision| revision.content.clone()))
    }

    fn get_revision_history(&mut self, page_id: i64, limit: usize) -> Result<Vec<RevisionMeta>> {
        self.request_count += 1;
        let Some(page) = self.pages.get(&page_id) else {
            return Ok(Vec::new());
        };
        Ok(page
            .revisions
            .iter()
            .rev()
            .take(limit)
            .map(|revision| revision.meta.clone())
            .collect())
    }

    fn get_first_revision(&mut self, page_id: i64) -> Result<Option<RevisionMeta>> {
        self.request_count += 1;
        Ok(self
            .pages
            .get(&page_id)
            .and_then(|page| page.revisions.first())
            .map(|revision| revision.meta.clone()))
    }

    fn is_user_blocked(&mut self, username: &str) -> Result<bool> {
        self.request_count += 1;
        Ok(self.blocked_users.contains(username))
    }

    fn get_page_text(&mut self, title: &str) -> Result<Option<String>> {
        self.request_count += 1;
        Ok(self.texts.get(title).cloned())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

impl WikiWriteApi for MockWiki {
    fn login(&mut self, _username: &str, _password: &str) -> Result<()> {
        self.request_count += 1;
        self.logged_in = true;
        Ok(())
    }

    fn edit_page(&mut self, title: &str, content: &str, summary: &str, minor: bool) -> Result<()> {
        self.request_count += 1;
        self.edits.push(RecordedEdit {
            title: title.to_string(),
            content: content.to_string(),
            summary: summary.to_string(),
            minor,
        });
        self.texts.insert(title.to_string(), content.to_string());
        Ok(())
    }
}
