use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::Serialize;

use crate::classify::{
    CHART_MISPLACE, CHART_PEND, CHART_REVIEW, ChartId, TemplateStatus, parse_templates,
    submission_marks,
};

const SHORT_BYTES: usize = 1_000;
const STALE_AFTER_DAYS: i64 = 4;
const REJECT_REASON: &str = "reject";

static REF_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<ref\s*(.*?)>(.*?)</ref>").expect("valid ref regex")
});
static BARE_PROTOCOL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)https?:").expect("valid protocol regex"));
static PROTOCOL_RELATIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[//([^ \]\t\n\r\x0C\x0B]+)").expect("valid protocol-relative regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Note {
    CopyvioSuspected,
    Unsourced,
    NoInlineCitation,
    Short,
    Resubmitted,
    Stale,
    Rejected,
    SubmitterBlocked,
}

impl Note {
    pub const ALL: [Note; 8] = [
        Note::CopyvioSuspected,
        Note::Unsourced,
        Note::NoInlineCitation,
        Note::Short,
        Note::Resubmitted,
        Note::Stale,
        Note::Rejected,
        Note::SubmitterBlocked,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Self::CopyvioSuspected => "nc",
            Self::Unsourced => "nu",
            Self::NoInlineCitation => "ni",
            Self::Short => "ns",
            Self::Resubmitted => "nr",
            Self::Stale => "no",
            Self::Rejected => "nj",
            Self::SubmitterBlocked => "nb",
        }
    }

    pub fn from_code(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|note| note.code() == value)
    }
}

/// Ordered set of notes attached to one chart row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NoteSet(BTreeSet<Note>);

impl NoteSet {
    pub fn insert(&mut self, note: Note) {
        self.0.insert(note);
    }

    pub fn contains(&self, note: Note) -> bool {
        self.0.contains(&note)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Note> + '_ {
        self.0.iter().copied()
    }

    /// Space-separated codes, the stored form.
    pub fn to_storage(&self) -> String {
        self.iter().map(Note::code).collect::<Vec<_>>().join(" ")
    }

    /// Unknown codes are dropped.
    pub fn from_storage(value: &str) -> Self {
        Self(value.split_whitespace().filter_map(Note::from_code).collect())
    }

    /// Chart-row parameters, e.g. `|nc=1|ns=1`.
    pub fn render(&self) -> String {
        self.iter().map(|note| format!("|{}=1", note.code())).collect()
    }
}

impl fmt::Display for NoteSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_storage())
    }
}

impl FromIterator<Note> for NoteSet {
    fn from_iter<I: IntoIterator<Item = Note>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone)]
pub struct NoteInput<'a> {
    pub chart: ChartId,
    pub content: &'a str,
    pub modified: DateTime<Utc>,
    pub now: DateTime<Utc>,
    /// Only meaningful on the pending chart; the caller looks it up.
    pub submitter_blocked: bool,
    /// The wiki's own host; protocol-relative links to it are not sources.
    pub domain: Option<&'a str>,
    pub copyvio_template: &'a str,
}

pub fn derive_notes(input: &NoteInput<'_>) -> NoteSet {
    let mut notes = NoteSet::default();
    if !matches!(input.chart, CHART_PEND | CHART_REVIEW | CHART_MISPLACE) {
        return notes;
    }

    if invokes_template(input.content, input.copyvio_template) {
        notes.insert(Note::CopyvioSuspected);
    }

    if !REF_TAG.is_match(input.content) {
        if has_external_link(input.content, input.domain) {
            notes.insert(Note::NoInlineCitation);
        } else {
            notes.insert(Note::Unsourced);
        }
    }

    if input.content.len() < SHORT_BYTES {
        notes.insert(Note::Short);
    }

    let marks = submission_marks(input.content);
    if input.chart != CHART_MISPLACE
        && marks
            .iter()
            .any(|mark| mark.status == TemplateStatus::Declined)
    {
        notes.insert(Note::Resubmitted);
    }
    if marks.iter().any(|mark| {
        mark.status == TemplateStatus::Declined
            && mark
                .decline_reason
                .as_deref()
                .is_some_and(|reason| reason.eq_ignore_ascii_case(REJECT_REASON))
    }) {
        notes.insert(Note::Rejected);
    }

    if input.now - input.modified > Duration::days(STALE_AFTER_DAYS) {
        notes.insert(Note::Stale);
    }

    if input.chart == CHART_PEND && input.submitter_blocked {
        notes.insert(Note::SubmitterBlocked);
    }

    notes
}

fn invokes_template(content: &str, template: &str) -> bool {
    let wanted = template.trim().replace('_', " ").to_lowercase();
    if wanted.is_empty() {
        return false;
    }
    parse_templates(content)
        .iter()
        .any(|invocation| invocation.normalized_name() == wanted)
}

fn has_external_link(content: &str, domain: Option<&str>) -> bool {
    if BARE_PROTOCOL.is_match(content) {
        return true;
    }
    PROTOCOL_RELATIVE.captures_iter(content).any(|captures| {
        let target = captures.get(1).map_or("", |host| host.as_str());
        match domain {
            Some(domain) if !domain.is_empty() => !target
                .to_ascii_lowercase()
                .starts_with(&domain.to_ascii_lowercase()),
            _ => true,
        }
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{Note, NoteInput, NoteSet, derive_notes};
    use crate::classify::{CHART_ACCEPT, CHART_DECLINE, CHART_MISPLACE, CHART_PEND, CHART_REVIEW};

    fn input(chart: i64, content: &str) -> NoteInput<'_> {
        let now = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
        NoteInput {
            chart,
            content,
            modified: now - Duration::hours(1),
            now,
            submitter_blocked: false,
            domain: Some("en.wikipedia.org"),
            copyvio_template: "AfC suspected copyvio",
        }
    }

    fn long_body() -> String {
        "Lorem ipsum dolor sit amet. ".repeat(50)
    }

    #[test]
    fn accepted_and_declined_rows_carry_no_notes() {
        for chart in [CHART_ACCEPT, CHART_DECLINE, 0] {
            assert!(derive_notes(&input(chart, "short")).is_empty());
        }
    }

    #[test]
    fn short_unsourced_pending_submission() {
        let notes = derive_notes(&input(CHART_PEND, "{{AfC submission}} tiny"));
        assert_eq!(notes.to_storage(), "nu ns");
        assert_eq!(notes.render(), "|nu=1|ns=1");
    }

    #[test]
    fn external_link_without_ref_is_no_inline_citation() {
        let content = format!("{}\n* [https://example.com Source]", long_body());
        let notes = derive_notes(&input(CHART_REVIEW, &content));
        assert!(notes.contains(Note::NoInlineCitation));
        assert!(!notes.contains(Note::Unsourced));
        assert!(!notes.contains(Note::Short));
    }

    #[test]
    fn protocol_relative_link_to_own_wiki_is_not_a_source() {
        let own = format!("{} [//en.wikipedia.org/wiki/Foo Foo]", long_body());
        assert!(derive_notes(&input(CHART_PEND, &own)).contains(Note::Unsourced));

        let foreign = format!("{} [//news.example.org/story Story]", long_body());
        assert!(derive_notes(&input(CHART_PEND, &foreign)).contains(Note::NoInlineCitation));
    }

    #[test]
    fn inline_ref_suppresses_source_notes() {
        let content = format!("{}<ref name=\"a\">Book, p. 4</ref>", long_body());
        let notes = derive_notes(&input(CHART_PEND, &content));
        assert!(notes.is_empty(), "unexpected notes: {notes}");
    }

    #[test]
    fn resubmission_and_rejection_follow_declined_markers() {
        let content = format!(
            "{{{{AfC submission}}}}{{{{AfC submission|d|reject}}}}{}<ref>x</ref>",
            long_body()
        );
        let pending = derive_notes(&input(CHART_PEND, &content));
        assert!(pending.contains(Note::Resubmitted));
        assert!(pending.contains(Note::Rejected));

        let misplaced = derive_notes(&input(CHART_MISPLACE, &content));
        assert!(!misplaced.contains(Note::Resubmitted));
    }

    #[test]
    fn copyvio_stale_and_blocked_notes() {
        let content = format!("{{{{AfC suspected copyvio|url}}}}{}<ref>x</ref>", long_body());
        let mut pending = input(CHART_PEND, &content);
        pending.modified = pending.now - Duration::days(5);
        pending.submitter_blocked = true;
        let notes = derive_notes(&pending);
        assert_eq!(notes.to_storage(), "nc no nb");

        let mut reviewing = input(CHART_REVIEW, &content);
        reviewing.submitter_blocked = true;
        assert!(!derive_notes(&reviewing).contains(Note::SubmitterBlocked));
    }

    #[test]
    fn storage_form_round_trips_and_drops_unknown_codes() {
        let parsed = NoteSet::from_storage("ns zz nc");
        assert_eq!(parsed.to_storage(), "nc ns");
        assert!(NoteSet::from_storage("").is_empty());
    }
}
