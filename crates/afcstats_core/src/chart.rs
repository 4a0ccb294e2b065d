use std::sync::LazyLock;

use anyhow::Result;
use chrono::{DateTime, Utc};
use regex::{NoExpand, Regex};
use similar::TextDiff;

use crate::config::ChartTemplates;
use crate::store::{ChartDefinition, MirrorStore, StoredPage};

const STAT_BEGIN: &str = "<!-- stat begin -->";
const STAT_END: &str = "<!-- stat end -->";
const SIGNATURE: &str = "<!-- sig begin -->~~~ at ~~~~~<!-- sig end -->";
const TIME_FORMAT: &str = "%H:%M, %d %b %Y";

static STAT_REGION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<!-- stat begin -->(.*?)<!-- stat end -->").expect("valid stat regex")
});
static SIG_REGION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<!-- sig begin -->(.*?)<!-- sig end -->").expect("valid sig regex")
});

/// Render every chart in id order, separated by newlines.
pub fn compile_charts(
    store: &MirrorStore,
    templates: &ChartTemplates,
    row_limit: Option<usize>,
) -> Result<String> {
    let mut charts = Vec::new();
    for chart in store.chart_definitions()? {
        let pages = store.chart_pages(chart.chart_id)?;
        charts.push(compile_chart(&chart, &pages, templates, row_limit));
    }
    Ok(charts.join("\n"))
}

pub fn compile_chart(
    chart: &ChartDefinition,
    pages: &[StoredPage],
    templates: &ChartTemplates,
    row_limit: Option<usize>,
) -> String {
    let mut lines = Vec::with_capacity(pages.len() + 3);
    let mut header = format!("{{{{{}|{}", templates.header, chart.title);
    if !chart.special_title.is_empty() {
        header.push('|');
        header.push_str(&chart.special_title);
    }
    header.push_str("}}");
    lines.push(header);

    let shown = row_limit.unwrap_or(pages.len()).min(pages.len());
    for page in &pages[..shown] {
        lines.push(compile_chart_row(page, &templates.row));
    }
    if shown < pages.len() {
        lines.push(format!("{{{{{}|{}}}}}", templates.more, pages.len() - shown));
    }

    lines.push(format!("{{{{{}}}}}", templates.footer));
    lines.join("\n")
}

pub fn compile_chart_row(page: &StoredPage, row_template: &str) -> String {
    let record = &page.record;
    let mut row = format!(
        "{{{{{row_template}|s={}|t={}|z={}|",
        record.status.code(),
        record.title,
        record.size
    );
    if let Some(special) = &record.special {
        row.push_str(&format!(
            "sr={}|sd={}|si={}|",
            special.user,
            format_time(special.timestamp),
            special.revision_id
        ));
    }
    row.push_str(&format!(
        "mr={}|md={}|mi={}",
        record.modify.user,
        format_time(record.modify.timestamp),
        record.modify.revision_id
    ));
    if !record.notes.is_empty() {
        row.push_str("|n=1");
        row.push_str(&record.notes.render());
    }
    row.push_str("}}");
    row
}

pub fn format_time(time: DateTime<Utc>) -> String {
    time.format(TIME_FORMAT).to_string()
}

/// Replace the statistics region of `page_text`. Returns `None` when the
/// region is absent or already holds `statistics`; otherwise the signature
/// region is restamped as well.
pub fn splice_statistics(page_text: &str, statistics: &str) -> Option<String> {
    let replacement = format!("{STAT_BEGIN}\n{statistics}\n{STAT_END}");
    let spliced = STAT_REGION.replace_all(page_text, NoExpand(&replacement));
    if spliced == page_text {
        return None;
    }
    Some(
        SIG_REGION
            .replace_all(&spliced, NoExpand(SIGNATURE))
            .into_owned(),
    )
}

/// Current contents of the statistics region, without the markers.
pub fn statistics_region(page_text: &str) -> Option<&str> {
    STAT_REGION
        .captures(page_text)
        .and_then(|captures| captures.get(1))
        .map(|region| region.as_str().trim_matches('\n'))
}

/// Unified diff between the saved and freshly compiled statistics.
pub fn statistics_diff(current: &str, compiled: &str) -> String {
    TextDiff::from_lines(current, compiled)
        .unified_diff()
        .context_radius(2)
        .header("saved", "compiled")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::{compile_chart, compile_charts, splice_statistics, statistics_diff, statistics_region};
    use crate::api::RevisionMeta;
    use crate::classify::SubmissionStatus;
    use crate::config::ChartTemplates;
    use crate::notes::{Note, NoteSet};
    use crate::store::{ChartDefinition, PageRecord, StoredPage};
    use crate::test_support::{base_time, hours_before, temp_store};

    fn record(page_id: i64, special: bool) -> PageRecord {
        PageRecord {
            page_id,
            title: format!("Draft:Page {page_id}"),
            status: SubmissionStatus::Pending,
            size: 900,
            notes: NoteSet::default(),
            modify: RevisionMeta {
                revision_id: page_id * 10,
                user: "Editor".to_string(),
                timestamp: hours_before(base_time(), 1),
            },
            special: special.then(|| RevisionMeta {
                revision_id: page_id * 10 - 1,
                user: "Submitter".to_string(),
                timestamp: hours_before(base_time(), 2 + page_id),
            }),
        }
    }

    fn stored(record: PageRecord) -> StoredPage {
        StoredPage {
            chart: record.chart(),
            record,
            updated_at: None,
        }
    }

    fn pending_chart() -> ChartDefinition {
        ChartDefinition {
            chart_id: 1,
            title: "Pending submissions".to_string(),
            special_title: "Submitted".to_string(),
        }
    }

    #[test]
    fn rows_render_special_modify_and_notes() {
        let mut with_notes = record(1, true);
        with_notes.notes = [Note::Short, Note::CopyvioSuspected].into_iter().collect();
        let chart = compile_chart(
            &pending_chart(),
            &[stored(with_notes), stored(record(2, false))],
            &ChartTemplates::default(),
            None,
        );

        let lines = chart.lines().collect::<Vec<_>>();
        assert_eq!(lines[0], "{{AFC statistics/header|Pending submissions|Submitted}}");
        assert_eq!(
            lines[1],
            "{{#invoke:AfC|row|s=p|t=Draft:Page 1|z=900|sr=Submitter|sd=09:00, 10 Jan 2023|si=9|mr=Editor|md=11:00, 10 Jan 2023|mi=10|n=1|nc=1|ns=1}}"
        );
        assert_eq!(
            lines[2],
            "{{#invoke:AfC|row|s=p|t=Draft:Page 2|z=900|mr=Editor|md=11:00, 10 Jan 2023|mi=20}}"
        );
        assert_eq!(lines[3], "{{AFC statistics/footer}}");
    }

    #[test]
    fn row_limit_adds_more_placeholder() {
        let pages = (1..=5).map(|id| stored(record(id, true))).collect::<Vec<_>>();
        let chart = compile_chart(&pending_chart(), &pages, &ChartTemplates::default(), Some(2));
        let lines = chart.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[3], "{{AFC statistics/more|3}}");
    }

    #[test]
    fn compile_charts_is_deterministic() {
        let (_temp, mut store) = temp_store();
        for page_id in [3, 1, 2] {
            store
                .insert_page(&record(page_id, true), base_time())
                .expect("insert");
        }
        let templates = ChartTemplates::default();
        let first = compile_charts(&store, &templates, None).expect("compile");
        let second = compile_charts(&store, &templates, None).expect("compile");
        assert_eq!(first, second);
        assert_eq!(first.matches("{{AFC statistics/header|").count(), 5);
        assert_eq!(first.matches("{{AFC statistics/footer}}").count(), 5);
        let page3 = first.find("Draft:Page 3").expect("row 3");
        let page1 = first.find("Draft:Page 1").expect("row 1");
        assert!(page3 < page1, "older transitions come first");
    }

    #[test]
    fn splice_replaces_region_and_stamps_signature() {
        let text = "Intro\n<!-- stat begin -->\nold\n<!-- stat end -->\n<!-- sig begin -->Bot at 1 Jan<!-- sig end -->";
        let spliced = splice_statistics(text, "new $1 stats").expect("changed");
        assert!(spliced.contains("<!-- stat begin -->\nnew $1 stats\n<!-- stat end -->"));
        assert!(spliced.contains("<!-- sig begin -->~~~ at ~~~~~<!-- sig end -->"));
        assert_eq!(statistics_region(&spliced), Some("new $1 stats"));
    }

    #[test]
    fn splice_is_noop_when_unchanged_or_unmarked() {
        let text = "<!-- stat begin -->\nsame\n<!-- stat end --><!-- sig begin -->x<!-- sig end -->";
        assert!(splice_statistics(text, "same").is_none());
        assert!(splice_statistics("no markers here", "stats").is_none());
    }

    #[test]
    fn diff_shows_changed_lines() {
        let diff = statistics_diff("a\nb\n", "a\nc\n");
        assert!(diff.contains("-b"));
        assert!(diff.contains("+c"));
    }
}
