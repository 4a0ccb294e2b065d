use std::borrow::Cow;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::api::NS_MAIN;

pub type ChartId = i64;

pub const CHART_NONE: ChartId = 0;
pub const CHART_PEND: ChartId = 1;
pub const CHART_REVIEW: ChartId = 3;
pub const CHART_ACCEPT: ChartId = 4;
pub const CHART_DECLINE: ChartId = 5;
pub const CHART_MISPLACE: ChartId = 6;

const SUBMISSION_TEMPLATE: &str = "afc submission";

/// Comments (an unclosed one runs to the end of the page) and `<nowiki>` or
/// `<pre>` bodies. Markup inside them is never expanded.
static INERT_MARKUP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<!--.*?(?:-->|\z)|<nowiki\s*>.*?</nowiki\s*>|<pre(?:\s[^>]*)?>.*?</pre\s*>")
        .expect("valid inert markup regex")
});

const SUBMISSION_ALIASES: &[(&str, TemplateStatus)] = &[
    ("submit", TemplateStatus::Pending),
    ("afc submission/submit", TemplateStatus::Pending),
    ("afc submission/reviewing", TemplateStatus::Reviewing),
    ("afc submission/pending", TemplateStatus::Pending),
    ("afc submission/draft", TemplateStatus::Draft),
    ("afc submission/declined", TemplateStatus::Declined),
];

/// Status priority for pages outside the main namespace. The first status
/// present on the page decides; a draft marker leaves the page untracked even
/// when an older decline is still on it.
const STATUS_PRIORITY: &[(TemplateStatus, Option<SubmissionStatus>)] = &[
    (TemplateStatus::Reviewing, Some(SubmissionStatus::Reviewing)),
    (TemplateStatus::Pending, Some(SubmissionStatus::Pending)),
    (TemplateStatus::Draft, None),
    (TemplateStatus::Declined, Some(SubmissionStatus::Declined)),
];

/// Status carried by a single submission template invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum TemplateStatus {
    Pending,
    Reviewing,
    Draft,
    Declined,
}

impl TemplateStatus {
    pub const ALL: [TemplateStatus; 4] = [
        TemplateStatus::Pending,
        TemplateStatus::Reviewing,
        TemplateStatus::Draft,
        TemplateStatus::Declined,
    ];

    pub fn code(self) -> char {
        match self {
            Self::Pending => 'P',
            Self::Reviewing => 'R',
            Self::Draft => 'T',
            Self::Declined => 'D',
        }
    }

    pub fn from_code(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "P" => Some(Self::Pending),
            "R" => Some(Self::Reviewing),
            "T" => Some(Self::Draft),
            "D" => Some(Self::Declined),
            _ => None,
        }
    }
}

/// Lifecycle state of a tracked submission page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Pending,
    Reviewing,
    Accepted,
    Declined,
    Misplaced,
}

impl SubmissionStatus {
    pub fn code(self) -> &'static str {
        match self {
            Self::Pending => "p",
            Self::Reviewing => "r",
            Self::Accepted => "a",
            Self::Declined => "d",
            Self::Misplaced => "m",
        }
    }

    pub fn from_code(value: &str) -> Option<Self> {
        match value {
            "p" => Some(Self::Pending),
            "r" => Some(Self::Reviewing),
            "a" => Some(Self::Accepted),
            "d" => Some(Self::Declined),
            "m" => Some(Self::Misplaced),
            _ => None,
        }
    }

    pub fn chart(self) -> ChartId {
        match self {
            Self::Pending => CHART_PEND,
            Self::Reviewing => CHART_REVIEW,
            Self::Accepted => CHART_ACCEPT,
            Self::Declined => CHART_DECLINE,
            Self::Misplaced => CHART_MISPLACE,
        }
    }

    /// Accepted and declined pages are only kept for the retention window.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Accepted | Self::Declined)
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Reviewing => "reviewing",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
            Self::Misplaced => "misplaced",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateParam {
    pub key: String,
    pub value: String,
}

/// A parsed `{{name|...}}` invocation. Positional parameters are keyed
/// `"1"`, `"2"`, ... in source order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub name: String,
    pub params: Vec<TemplateParam>,
}

impl Template {
    /// Case-folded name with `Template:` and underscores normalized away.
    pub fn normalized_name(&self) -> String {
        let spaced = normalize_spaces(&self.name.replace('_', " "));
        let stripped = match spaced.split_once(':') {
            Some((prefix, rest)) if prefix.trim().eq_ignore_ascii_case("template") => {
                rest.trim().to_string()
            }
            _ => spaced,
        };
        stripped.to_lowercase()
    }

    /// Trimmed value of the parameter; a later duplicate wins.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .rev()
            .find(|param| param.key == key)
            .map(|param| param.value.trim())
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
}

/// One lifecycle marker found on a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionMark {
    pub status: TemplateStatus,
    pub decline_reason: Option<String>,
}

pub fn parse_templates(text: &str) -> Vec<Template> {
    let mut out = Vec::new();
    collect_templates(&mask_inert_markup(text), &mut out);
    out
}

/// Blank inert spans with spaces, keeping byte offsets intact.
fn mask_inert_markup(text: &str) -> Cow<'_, str> {
    if !INERT_MARKUP.is_match(text) {
        return Cow::Borrowed(text);
    }
    let mut masked = String::with_capacity(text.len());
    let mut last = 0usize;
    for span in INERT_MARKUP.find_iter(text) {
        masked.push_str(&text[last..span.start()]);
        masked.push_str(&" ".repeat(span.len()));
        last = span.end();
    }
    masked.push_str(&text[last..]);
    Cow::Owned(masked)
}

fn collect_templates(text: &str, out: &mut Vec<Template>) {
    let bytes = text.as_bytes();
    let mut cursor = 0usize;

    while cursor + 1 < bytes.len() {
        if bytes[cursor] == b'{' && bytes[cursor + 1] == b'{' {
            // An unclosed `{{` is plain text.
            let Some(end) = find_closing_braces(bytes, cursor + 2) else {
                cursor += 2;
                continue;
            };
            let inner = &text[cursor + 2..end];
            if let Some(template) = parse_invocation(inner) {
                out.push(template);
            }
            collect_templates(inner, out);
            cursor = end + 2;
            continue;
        }
        cursor += 1;
    }
}

fn find_closing_braces(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 1usize;
    let mut index = start;
    while index + 1 < bytes.len() {
        if bytes[index] == b'{' && bytes[index + 1] == b'{' {
            depth += 1;
            index += 2;
        } else if bytes[index] == b'}' && bytes[index + 1] == b'}' {
            depth -= 1;
            if depth == 0 {
                return Some(index);
            }
            index += 2;
        } else {
            index += 1;
        }
    }
    None
}

fn parse_invocation(inner: &str) -> Option<Template> {
    let mut segments = split_top_level(inner, b'|').into_iter();
    let name = segments.next()?.trim();
    if name.is_empty() || name.starts_with('{') || name.starts_with('#') {
        return None;
    }

    let mut params = Vec::new();
    let mut position = 0usize;
    for segment in segments {
        match top_level_index(segment, b'=') {
            Some(split) => params.push(TemplateParam {
                key: segment[..split].trim().to_string(),
                value: segment[split + 1..].to_string(),
            }),
            None => {
                position += 1;
                params.push(TemplateParam {
                    key: position.to_string(),
                    value: segment.to_string(),
                });
            }
        }
    }

    Some(Template {
        name: name.to_string(),
        params,
    })
}

fn split_top_level(text: &str, separator: u8) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut index = 0usize;

    while index < bytes.len() {
        if index + 1 < bytes.len() && is_opener(bytes[index], bytes[index + 1]) {
            depth += 1;
            index += 2;
            continue;
        }
        if index + 1 < bytes.len() && is_closer(bytes[index], bytes[index + 1]) {
            depth = depth.saturating_sub(1);
            index += 2;
            continue;
        }
        if depth == 0 && bytes[index] == separator {
            parts.push(&text[start..index]);
            start = index + 1;
        }
        index += 1;
    }
    parts.push(&text[start..]);
    parts
}

fn top_level_index(text: &str, needle: u8) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut index = 0usize;
    while index < bytes.len() {
        if index + 1 < bytes.len() && is_opener(bytes[index], bytes[index + 1]) {
            depth += 1;
            index += 2;
            continue;
        }
        if index + 1 < bytes.len() && is_closer(bytes[index], bytes[index + 1]) {
            depth = depth.saturating_sub(1);
            index += 2;
            continue;
        }
        if depth == 0 && bytes[index] == needle {
            return Some(index);
        }
        index += 1;
    }
    None
}

fn is_opener(first: u8, second: u8) -> bool {
    (first == b'{' && second == b'{') || (first == b'[' && second == b'[')
}

fn is_closer(first: u8, second: u8) -> bool {
    (first == b'}' && second == b'}') || (first == b']' && second == b']')
}

fn normalize_spaces(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Every submission lifecycle marker on the page, in source order.
pub fn submission_marks(text: &str) -> Vec<SubmissionMark> {
    let mut marks = Vec::new();
    for template in parse_templates(text) {
        let name = template.normalized_name();
        if name == SUBMISSION_TEMPLATE {
            // Unknown or missing status codes count as a plain submission.
            let status = template
                .get("1")
                .and_then(TemplateStatus::from_code)
                .unwrap_or(TemplateStatus::Pending);
            let decline_reason = template
                .get("2")
                .filter(|reason| !reason.is_empty())
                .map(str::to_string);
            marks.push(SubmissionMark {
                status,
                decline_reason,
            });
        } else if let Some((_, status)) = SUBMISSION_ALIASES
            .iter()
            .find(|(alias, _)| *alias == name.as_str())
        {
            marks.push(SubmissionMark {
                status: *status,
                decline_reason: None,
            });
        }
    }
    marks
}

pub fn submission_statuses(text: &str) -> Vec<TemplateStatus> {
    submission_marks(text)
        .into_iter()
        .map(|mark| mark.status)
        .collect()
}

/// Derive the lifecycle status of a page, or `None` when it is not trackable.
pub fn classify(text: &str, namespace: i32) -> Option<SubmissionStatus> {
    classify_statuses(&submission_statuses(text), namespace)
}

pub fn classify_statuses(statuses: &[TemplateStatus], namespace: i32) -> Option<SubmissionStatus> {
    if namespace == NS_MAIN {
        if statuses.is_empty() {
            return Some(SubmissionStatus::Accepted);
        }
        return Some(SubmissionStatus::Misplaced);
    }

    STATUS_PRIORITY
        .iter()
        .find(|(status, _)| statuses.contains(status))
        .and_then(|(_, outcome)| *outcome)
}

/// How the edit that produced a status is located in page history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialSearch {
    /// Oldest revision of the newest unbroken run where `with` is empty or
    /// intersects the page statuses and `without` does not.
    Transition {
        with: &'static [TemplateStatus],
        without: &'static [TemplateStatus],
    },
    /// The page creation edit.
    Creation,
}

impl SpecialSearch {
    pub fn matches(&self, statuses: &[TemplateStatus]) -> bool {
        match self {
            Self::Transition { with, without } => {
                (with.is_empty() || with.iter().any(|status| statuses.contains(status)))
                    && !without.iter().any(|status| statuses.contains(status))
            }
            Self::Creation => true,
        }
    }
}

pub fn special_search(status: SubmissionStatus) -> SpecialSearch {
    use TemplateStatus::{Declined, Draft, Pending, Reviewing};
    match status {
        SubmissionStatus::Pending => SpecialSearch::Transition {
            with: &[Pending],
            without: &[],
        },
        SubmissionStatus::Reviewing => SpecialSearch::Transition {
            with: &[Reviewing],
            without: &[],
        },
        SubmissionStatus::Declined => SpecialSearch::Transition {
            with: &[Declined],
            without: &[Reviewing, Pending, Draft],
        },
        SubmissionStatus::Accepted => SpecialSearch::Transition {
            with: &[],
            without: &[Reviewing, Pending, Draft, Declined],
        },
        SubmissionStatus::Misplaced => SpecialSearch::Creation,
    }
}
