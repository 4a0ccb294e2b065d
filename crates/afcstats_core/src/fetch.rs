use std::collections::HashMap;
use std::thread::sleep;
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tracing::{debug, warn};

use crate::api::{PageInfo, WikiReadApi};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("revision {revision_id} has no retrievable content")]
    Missing { revision_id: i64 },
    #[error("failed to fetch revision {revision_id}: {message}")]
    Transport { revision_id: i64, message: String },
}

impl FetchError {
    pub fn revision_id(&self) -> i64 {
        match self {
            Self::Missing { revision_id } | Self::Transport { revision_id, .. } => *revision_id,
        }
    }
}

/// Latest revision of a page together with its text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatestContent {
    pub info: PageInfo,
    pub content: String,
}

/// Revision-content reader with a cache that lives for one run.
///
/// Revision text is immutable, so a cached entry never goes stale; dropping
/// the fetcher at the end of a run bounds memory.
#[derive(Debug)]
pub struct ContentFetcher {
    cache: HashMap<i64, String>,
    retry_delay: Duration,
    retries: usize,
}

impl ContentFetcher {
    pub fn new(retry_delay: Duration, retries: usize) -> Self {
        Self {
            cache: HashMap::new(),
            retry_delay,
            retries,
        }
    }

    pub fn cached_revisions(&self) -> usize {
        self.cache.len()
    }

    pub fn get_latest_content<A: WikiReadApi + ?Sized>(
        &mut self,
        api: &mut A,
        page_id: i64,
    ) -> Result<Option<LatestContent>> {
        let Some(info) = api.get_page_info(&[page_id])?.into_iter().next() else {
            return Ok(None);
        };
        let content = self.get_revision_content(api, info.latest.revision_id)?;
        Ok(Some(LatestContent { info, content }))
    }

    pub fn get_revision_content<A: WikiReadApi + ?Sized>(
        &mut self,
        api: &mut A,
        revision_id: i64,
    ) -> Result<String, FetchError> {
        if let Some(content) = self.cache.get(&revision_id) {
            return Ok(content.clone());
        }

        let mut attempt = 0usize;
        loop {
            let outcome = match api.get_revision_content(revision_id) {
                Ok(Some(content)) => {
                    self.cache.insert(revision_id, content.clone());
                    return Ok(content);
                }
                Ok(None) => FetchError::Missing { revision_id },
                Err(error) => FetchError::Transport {
                    revision_id,
                    message: format!("{error:#}"),
                },
            };

            if attempt >= self.retries {
                warn!(revision_id, error = %outcome, "giving up on revision content");
                return Err(outcome);
            }
            attempt += 1;
            debug!(revision_id, attempt, error = %outcome, "retrying revision content fetch");
            sleep(self.retry_delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{ContentFetcher, FetchError};
    use crate::api::{NS_DRAFT, WikiReadApi};
    use crate::test_support::{MockWiki, base_time};

    fn wiki_with_page() -> (MockWiki, i64) {
        let mut wiki = MockWiki::default();
        wiki.add_page(7, "Draft:Alpha", NS_DRAFT);
        let revision = wiki.push_revision(7, "Author", base_time(), "{{AfC submission}} Alpha");
        (wiki, revision)
    }

    #[test]
    fn cache_hit_skips_remote_call() {
        let (mut wiki, revision) = wiki_with_page();
        let mut fetcher = ContentFetcher::new(Duration::ZERO, 1);

        let first = fetcher.get_revision_content(&mut wiki, revision).expect("fetch");
        let second = fetcher.get_revision_content(&mut wiki, revision).expect("fetch again");
        assert_eq!(first, second);
        assert_eq!(wiki.content_requests, 1);
        assert_eq!(fetcher.cached_revisions(), 1);
    }

    #[test]
    fn transient_failure_is_retried_once() {
        let (mut wiki, revision) = wiki_with_page();
        wiki.content_failures.insert(revision, 1);
        let mut fetcher = ContentFetcher::new(Duration::ZERO, 1);

        let content = fetcher.get_revision_content(&mut wiki, revision).expect("retry succeeds");
        assert!(content.contains("Alpha"));
        assert_eq!(wiki.content_requests, 2);
    }

    #[test]
    fn persistent_failure_surfaces_fetch_error() {
        let (mut wiki, revision) = wiki_with_page();
        wiki.content_failures.insert(revision, 5);
        let mut fetcher = ContentFetcher::new(Duration::ZERO, 1);

        let error = fetcher
            .get_revision_content(&mut wiki, revision)
            .expect_err("must fail");
        assert!(matches!(error, FetchError::Transport { .. }));
        assert_eq!(error.revision_id(), revision);
        assert_eq!(wiki.content_requests, 2);
        assert_eq!(fetcher.cached_revisions(), 0);
    }

    #[test]
    fn hidden_revision_reports_missing() {
        let (mut wiki, revision) = wiki_with_page();
        wiki.hidden_revisions.insert(revision);
        let mut fetcher = ContentFetcher::new(Duration::ZERO, 0);

        let error = fetcher
            .get_revision_content(&mut wiki, revision)
            .expect_err("must fail");
        assert!(matches!(error, FetchError::Missing { .. }));
    }

    #[test]
    fn latest_content_returns_none_for_missing_page() {
        let (mut wiki, _) = wiki_with_page();
        let mut fetcher = ContentFetcher::new(Duration::ZERO, 1);

        assert!(
            fetcher
                .get_latest_content(&mut wiki, 404)
                .expect("lookup")
                .is_none()
        );
        let latest = fetcher
            .get_latest_content(&mut wiki, 7)
            .expect("lookup")
            .expect("page exists");
        assert_eq!(latest.info.title, "Draft:Alpha");
        assert_eq!(latest.info.latest.user, "Author");
        assert!(wiki.request_count() >= 2);
    }
}
