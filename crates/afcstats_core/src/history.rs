use tracing::{error, warn};

use crate::api::{RevisionMeta, WikiReadApi};
use crate::classify::{SpecialSearch, SubmissionStatus, special_search, submission_statuses};
use crate::fetch::ContentFetcher;

/// Walk history newest to oldest and return the oldest revision of the
/// unbroken run that satisfies `search`.
///
/// Gives up (returns `None`) once more than `limit` revisions would need
/// their content inspected, or when any revision's content can't be read.
pub fn find_transition<A: WikiReadApi + ?Sized>(
    api: &mut A,
    fetcher: &mut ContentFetcher,
    page_id: i64,
    search: SpecialSearch,
    limit: usize,
) -> Option<RevisionMeta> {
    if let SpecialSearch::Creation = search {
        return find_creation(api, page_id);
    }

    let history = match api.get_revision_history(page_id, limit.saturating_add(1)) {
        Ok(history) => history,
        Err(error) => {
            error!(page_id, error = %format!("{error:#}"), "failed to list revision history");
            return None;
        }
    };

    let mut last = None;
    for (index, revision) in history.into_iter().enumerate() {
        if index >= limit {
            warn!(
                page_id,
                limit, "exceeded content lookups while searching history"
            );
            return None;
        }
        let content = match fetcher.get_revision_content(api, revision.revision_id) {
            Ok(content) => content,
            Err(error) => {
                error!(page_id, error = %error, "content fetch interrupted history search");
                return None;
            }
        };
        if !search.matches(&submission_statuses(&content)) {
            return last;
        }
        last = Some(revision);
    }
    last
}

pub fn find_creation<A: WikiReadApi + ?Sized>(api: &mut A, page_id: i64) -> Option<RevisionMeta> {
    match api.get_first_revision(page_id) {
        Ok(revision) => revision,
        Err(error) => {
            error!(page_id, error = %format!("{error:#}"), "failed to read creation edit");
            None
        }
    }
}

/// Locate the edit that put the page into `status`.
pub fn resolve_special<A: WikiReadApi + ?Sized>(
    api: &mut A,
    fetcher: &mut ContentFetcher,
    page_id: i64,
    status: SubmissionStatus,
    limit: usize,
) -> Option<RevisionMeta> {
    find_transition(api, fetcher, page_id, special_search(status), limit)
}
