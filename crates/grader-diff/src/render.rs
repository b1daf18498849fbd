//! HTML rendering of diff models and verdict reports.
//!
//! Rendering is a pure function of a [`DiffModel`] and [`RenderOptions`].
//! Rendered fragments are memoized in a [`RenderCache`] owned by the caller
//! and keyed by test case id.
//!
//! Markup contract consumed by the front end's navigation script:
//!
//! - CSS classes `diff_add`, `diff_chg`, `diff_sub`, `diff_header`, `diff_next`
//! - table anchor `diff_chg_<prefix>_top`, change anchors `diff_chg_<prefix>_<n>`
//! - unchanged rows `diff_same_<prefix>_<block>_<k>` toggled by `showHideRows`

use std::collections::HashMap;
use std::fmt::Write;

use grader_common::TestCaseId;

use crate::diff::{DiffLine, DiffModel, DiffRow, Segment, SegmentKind, TAB_FILL};
use crate::score::ScorePolicy;
use crate::verdict::Verdict;

pub const FROM_DESC: &str = "Correct Output";
pub const TO_DESC: &str = "Your Output";
pub const TRUNCATED_MARKER: &str = "<<OUTPUT TRUNCATED>>";

const LEGEND: &str = r#"
    <table class="diff" summary="Legends">
        <tr> <th colspan="2"> Legends </th> </tr>
        <tr> <td> <table border="" summary="Colors">
                      <tr><th> Colors </th> </tr>
                      <tr><td class="diff_add">Extra</td></tr>
                      <tr><td class="diff_chg">Different</td> </tr>
                      <tr><td class="diff_sub">Missing</td> </tr>
                  </table></td>
             <td> <table border="" summary="Links">
                      <tr><th colspan="2"> Links </th> </tr>
                      <tr><td>(f)irst change</td> </tr>
                      <tr><td>(n)ext change</td> </tr>
                      <tr><td>(t)op</td> </tr>
                      <tr><td>(h)ide/show same region</td> </tr>
                  </table></td> </tr>
    </table>"#;

/// Knobs of the table renderer
#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// Unchanged runs longer than this get a show/hide toggle (at least 4)
    pub collapse_threshold: usize,
    /// Change regions shown before the rest is cut off; `None` shows all
    pub reveal_cap: Option<usize>,
    /// Long lines are split into continuation rows at this width
    pub wrap_column: Option<usize>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            collapse_threshold: 5,
            reveal_cap: Some(3),
            wrap_column: Some(50),
        }
    }
}

/// Mutable state of one table rendering pass
#[derive(Debug, Default)]
struct TableState {
    /// Some unchanged run got a show/hide toggle
    collapsed: bool,
}

/// Escape text for embedding in HTML
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Escape and keep every space visible
fn escape_visible(text: &str) -> String {
    escape(text).replace([' ', TAB_FILL], "&nbsp;")
}

/// One displayed side of a row
struct Cell {
    label: String,
    anchor: Option<String>,
    segments: Vec<Segment>,
}

impl Cell {
    fn render(&self, side: Side) -> String {
        let id = self
            .anchor
            .as_ref()
            .map(|a| format!(" id=\"{a}\""))
            .unwrap_or_default();
        let marked = self.segments.iter().any(|s| s.kind != SegmentKind::Same);
        let color = if marked {
            match side {
                Side::Left => ";background-color:#ffe6e6",
                Side::Right => ";background-color:#e3ffe3",
            }
        } else {
            ""
        };
        let mut text = String::new();
        for segment in &self.segments {
            let escaped = escape_visible(&segment.text);
            let class = match segment.kind {
                SegmentKind::Same => {
                    text.push_str(&escaped);
                    continue;
                }
                SegmentKind::Added => "diff_add",
                SegmentKind::Changed => "diff_chg",
                SegmentKind::Removed => "diff_sub",
            };
            let _ = write!(text, "<span class=\"{class}\">{escaped}</span>");
        }
        format!(
            "<td class=\"diff_header\"{id}>{}</td><td style=\"white-space:nowrap{color}\">{text}</td>",
            self.label
        )
    }
}

#[derive(Clone, Copy)]
enum Side {
    Left,
    Right,
}

struct Line {
    left: Cell,
    right: Cell,
    changed: bool,
}

/// Rows up to the first change region past the cap, and whether any were cut.
fn limit_reveals(rows: &[DiffRow], cap: Option<usize>) -> (&[DiffRow], bool) {
    let Some(cap) = cap else {
        return (rows, false);
    };
    let mut regions = 0;
    let mut in_change = false;
    for (i, row) in rows.iter().enumerate() {
        if row.changed && !in_change {
            regions += 1;
            if regions > cap {
                return (&rows[..i], true);
            }
        }
        in_change = row.changed;
    }
    (rows, false)
}

/// Split a line's segments into chunks of at most `width` characters.
fn wrap_segments(segments: &[Segment], width: Option<usize>) -> Vec<Vec<Segment>> {
    let Some(width) = width.filter(|w| *w > 0) else {
        return vec![segments.to_vec()];
    };
    let mut chunks = Vec::new();
    let mut chunk: Vec<Segment> = Vec::new();
    let mut used = 0;
    for segment in segments {
        let mut current = String::new();
        for ch in segment.text.chars() {
            if used == width {
                if !current.is_empty() {
                    chunk.push(Segment {
                        kind: segment.kind,
                        text: std::mem::take(&mut current),
                    });
                }
                chunks.push(std::mem::take(&mut chunk));
                used = 0;
            }
            current.push(ch);
            used += 1;
        }
        if !current.is_empty() {
            chunk.push(Segment {
                kind: segment.kind,
                text: current,
            });
        }
    }
    chunks.push(chunk);
    chunks
}

fn side_cells(line: &DiffLine, anchor_prefix: &str, width: Option<usize>) -> Vec<Cell> {
    wrap_segments(&line.segments, width)
        .into_iter()
        .enumerate()
        .map(|(i, segments)| match (line.number, i) {
            (Some(n), 0) => Cell {
                label: n.to_string(),
                anchor: Some(format!("{anchor_prefix}{n}")),
                segments,
            },
            (Some(_), _) => Cell {
                label: ">".to_string(),
                anchor: None,
                segments,
            },
            (None, _) => Cell {
                label: String::new(),
                anchor: None,
                segments,
            },
        })
        .collect()
}

fn empty_cell() -> Cell {
    Cell {
        label: String::new(),
        anchor: None,
        segments: Vec::new(),
    }
}

fn layout(rows: &[DiffRow], prefix: &str, width: Option<usize>) -> Vec<Line> {
    let from_prefix = format!("diff_from_{prefix}_");
    let to_prefix = format!("diff_to_{prefix}_");
    let mut lines = Vec::with_capacity(rows.len());
    for row in rows {
        let mut left = side_cells(&row.left, &from_prefix, width).into_iter();
        let mut right = side_cells(&row.right, &to_prefix, width).into_iter();
        loop {
            match (left.next(), right.next()) {
                (None, None) => break,
                (l, r) => lines.push(Line {
                    left: l.unwrap_or_else(empty_cell),
                    right: r.unwrap_or_else(empty_cell),
                    changed: row.changed,
                }),
            }
        }
    }
    lines
}

/// Row indices where change runs and unchanged runs begin
fn run_starts(lines: &[Line]) -> (Vec<usize>, Vec<usize>) {
    let mut changes = Vec::new();
    let mut sames = Vec::new();
    let mut in_change = false;
    if lines.first().is_some_and(|l| !l.changed) {
        sames.push(0);
    }
    for (i, line) in lines.iter().enumerate() {
        if line.changed && !in_change {
            changes.push(i);
            in_change = true;
        } else if !line.changed && in_change {
            sames.push(i);
            in_change = false;
        }
    }
    (changes, sames)
}

/// Render one side-by-side table for a diff model.
pub fn render_table(model: &DiffModel, prefix: &str, options: &RenderOptions) -> String {
    let mut state = TableState::default();
    let table = build_table(model, prefix, options, &mut state);
    if state.collapsed {
        let controls = format!(
            "\n<p><a href=\"#\" onclick=\"showAll('diff_chg_{prefix}_top'); return false;\">Show All</a>\n    \
             <a href=\"#\" onclick=\"hideAll('diff_chg_{prefix}_top'); return false;\">Hide All</a></p>"
        );
        format!("{controls}{table}{controls}")
    } else {
        table
    }
}

fn build_table(
    model: &DiffModel,
    prefix: &str,
    options: &RenderOptions,
    state: &mut TableState,
) -> String {
    let (rows, truncated) = limit_reveals(model.rows(), options.reveal_cap);
    let lines = layout(rows, prefix, options.wrap_column);

    let mut next_id = vec![String::new(); lines.len()];
    let mut next_href = vec![String::new(); lines.len()];
    let (changes, sames) = run_starts(&lines);

    for (n, &pos) in changes.iter().enumerate() {
        next_id[pos] = format!(" id=\"diff_chg_{prefix}_{n}\"");
        next_href[pos] = if n + 1 < changes.len() {
            format!("<a href=\"#diff_chg_{prefix}_{}\">n</a>", n + 1)
        } else {
            format!("<a href=\"#diff_chg_{prefix}_top\">t</a>")
        };
    }

    let changes_set: std::collections::HashSet<usize> = changes.iter().copied().collect();
    let threshold = options.collapse_threshold.max(4);
    for (block, &start) in sames.iter().enumerate() {
        let mut pos = start;
        while pos < lines.len() && !changes_set.contains(&pos) {
            next_id[pos] = format!(" id=\"diff_same_{prefix}_{block}_{}\"", pos - start + 1);
            pos += 1;
        }
        if pos - start > threshold {
            next_href[start + 2] =
                "<a href=\"#\" onclick=\"showHideRows(this); return false;\">h</a>".to_string();
            state.collapsed = true;
        }
    }

    if let Some(&first) = changes.first() {
        if first > 0 && next_href[0].is_empty() {
            next_href[0] = format!("<a href=\"#diff_chg_{prefix}_0\">f</a>");
        }
    }

    let mut body = String::new();
    if lines.is_empty() && !truncated {
        body.push_str(
            "            <tr><td class=\"diff_next\"></td><td></td><td>&nbsp;Empty File&nbsp;</td>\
             <td class=\"diff_next\"></td><td></td><td>&nbsp;Empty File&nbsp;</td></tr>\n",
        );
    }
    for (i, line) in lines.iter().enumerate() {
        let _ = writeln!(
            body,
            "            <tr><td class=\"diff_next\"{}>{}</td>{}<td class=\"diff_next\">{}</td>{}</tr>",
            next_id[i],
            next_href[i],
            line.left.render(Side::Left),
            next_href[i],
            line.right.render(Side::Right),
        );
    }
    if truncated {
        let marker = escape(TRUNCATED_MARKER);
        let _ = writeln!(
            body,
            "            <tr class=\"diff_truncated\"><td class=\"diff_next\"></td>\
             <td class=\"diff_header\">...</td><td>{marker}</td>\
             <td class=\"diff_next\"></td><td class=\"diff_header\">...</td><td>{marker}</td></tr>"
        );
    }

    format!(
        r#"
    <table class="diff" id="diff_chg_{prefix}_top"
           cellspacing="0" cellpadding="0" rules="groups">
        <colgroup></colgroup> <colgroup></colgroup> <colgroup></colgroup>
        <colgroup></colgroup> <colgroup></colgroup> <colgroup></colgroup>
        <thead><tr><th class="diff_next"><br /></th><th colspan="2" class="diff_header">{FROM_DESC}</th><th class="diff_next"><br /></th><th colspan="2" class="diff_header">{TO_DESC}</th></tr></thead>
        <tbody>
{body}        </tbody>
    </table>
"#
    )
}

/// Anchor of a test case's block in the report
fn block_id(verdict: &Verdict) -> String {
    format!("tc_{}", verdict.test_case_id)
}

/// Render the block for one failing test case; `None` when it passed.
pub fn render_verdict(verdict: &Verdict, options: &RenderOptions) -> Option<String> {
    if verdict.is_correct() {
        return None;
    }
    let mut inner = String::new();
    if verdict.show_table {
        if let Some(model) = &verdict.diff {
            let prefix = format!("tc{}", verdict.test_case_id);
            inner.push_str(&render_table(model, &prefix, options));
        }
    }
    inner.push_str("<ul>");
    for thing in &verdict.wrong_things {
        let _ = write!(inner, "<li>{}</li>\n", escape(thing));
    }
    inner.push_str("</ul>");
    Some(format!(
        "<h3 id=\"{}\" style=\"color:red\">{}</h3>\n{inner}",
        block_id(verdict),
        escape(&verdict.name)
    ))
}

/// Rendered blocks keyed by test case id; owned by whoever drives rendering.
#[derive(Debug, Default)]
pub struct RenderCache {
    blocks: HashMap<TestCaseId, Option<String>>,
}

impl RenderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rendered block for a verdict, rendering it on first use
    pub fn block(&mut self, verdict: &Verdict, options: &RenderOptions) -> Option<&str> {
        self.blocks
            .entry(verdict.test_case_id)
            .or_insert_with(|| render_verdict(verdict, options))
            .as_deref()
    }

    /// Drop a cached block, e.g. after the test case was re-run
    pub fn invalidate(&mut self, id: TestCaseId) {
        self.blocks.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

fn summary_table(header: &str, verdicts: &[&Verdict]) -> String {
    if verdicts.is_empty() {
        return String::new();
    }
    let mut html = format!(
        "{header}<table border=\"1\">\n  <tr><th>Test Number</th><th>Test Name</th><th>Value</th></tr>"
    );
    for verdict in verdicts {
        let name = if verdict.is_correct() {
            format!("<pre style=\"color:green\">{}</pre>", escape(&verdict.name))
        } else {
            format!(
                "<a href=\"#{}\" style=\"color:red\">{}</a>",
                block_id(verdict),
                escape(&verdict.name)
            )
        };
        let _ = write!(
            html,
            "<tr><td>{}</td><td>{name}</td><td>{}</td></tr>",
            verdict.test_case_id, verdict.points
        );
    }
    html.push_str("</table>");
    html
}

/// Render the full report: summaries, score, legend and failing blocks.
pub fn render_report(
    verdicts: &[Verdict],
    policy: &dyn ScorePolicy,
    options: &RenderOptions,
    cache: &mut RenderCache,
) -> String {
    let mut ordered: Vec<&Verdict> = verdicts.iter().collect();
    ordered.sort_by_key(|v| v.test_case_id);

    let (passed, failed): (Vec<&Verdict>, Vec<&Verdict>) =
        ordered.iter().copied().partition(|v| v.is_correct());

    let score = policy.summarize(verdicts);
    let mut summary = summary_table("<h3 style=\"color:red\">Failed Tests</h3>", &failed);
    summary.push_str(&summary_table(
        "<h3 style=\"color:green\">Passed Tests</h3>",
        &passed,
    ));
    let _ = writeln!(
        summary,
        "<ul><li>Tentative total score: {} / {}</li><li>Tentative percentage score: {:.2}</li></ul>",
        score.achieved, score.available, score.percentage
    );

    let legend = if verdicts.iter().any(|v| v.show_table) {
        format!("<hr>{LEGEND}<hr>")
    } else {
        "<hr>".to_string()
    };

    let blocks: Vec<String> = failed
        .iter()
        .filter_map(|v| cache.block(v, options).map(str::to_string))
        .collect();

    format!(
        "\n<div id=\"diff_table_div\">\n{summary}\n{legend}\n{}\n</div>\n\
         <script type=\"text/javascript\">\n  pageLoaded('diff_table_div');\n</script>",
        blocks.join("<hr>\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::compute;
    use crate::score::BasicScore;

    fn no_wrap() -> RenderOptions {
        RenderOptions {
            wrap_column: None,
            ..RenderOptions::default()
        }
    }

    fn verdict(id: u64, model: Option<DiffModel>, wrong: &[&str]) -> Verdict {
        Verdict {
            test_case_id: id,
            name: format!("case <{id}>"),
            points: 2,
            wrong_things: wrong.iter().map(|s| s.to_string()).collect(),
            show_table: model.is_some(),
            diff: model,
        }
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape(r#"<a href="x">&'"#), "&lt;a href=&quot;x&quot;&gt;&amp;&#39;");
    }

    #[test]
    fn test_spaces_and_tabs_render_as_nbsp() {
        let model = compute("a b\n", "a\tb\n").unwrap();
        let html = render_table(&model, "t", &no_wrap());
        assert!(html.contains("a<span class=\"diff_chg\">&nbsp;</span>b"));
        assert!(html.contains(&format!("<span class=\"diff_chg\">{}</span>", "&nbsp;".repeat(7))));
        assert!(!html.contains('\t'));
    }

    #[test]
    fn test_change_markup_classes() {
        let model = compute("x = 1\nkeep\ngone\n", "x = 2\nkeep\nextra\nmore\n").unwrap();
        let html = render_table(&model, "t", &no_wrap());
        assert!(html.contains("<span class=\"diff_chg\">1</span>"));
        assert!(html.contains("<span class=\"diff_chg\">2</span>"));
        assert!(html.contains("id=\"diff_chg_t_top\""));
        assert!(html.contains(FROM_DESC));
        assert!(html.contains(TO_DESC));
        assert!(html.contains("id=\"diff_from_t_1\""));
    }

    #[test]
    fn test_navigation_links() {
        let expected = "1\n2\n3\n4\n5\n";
        let actual = "1\nX\n3\nY\n5\n";
        let model = compute(expected, actual).unwrap();
        let html = render_table(&model, "t", &no_wrap());
        assert!(html.contains("<a href=\"#diff_chg_t_0\">f</a>"));
        assert!(html.contains("id=\"diff_chg_t_0\""));
        assert!(html.contains("<a href=\"#diff_chg_t_1\">n</a>"));
        assert!(html.contains("id=\"diff_chg_t_1\""));
        assert!(html.contains("<a href=\"#diff_chg_t_top\">t</a>"));
    }

    #[test]
    fn test_reveal_cap_truncates() {
        let expected: String = (0..40).map(|i| format!("{i}\n")).collect();
        let actual: String = (0..40)
            .map(|i| if i % 8 == 4 { "changed\n".to_string() } else { format!("{i}\n") })
            .collect();
        let model = compute(&expected, &actual).unwrap();
        assert_eq!(model.change_regions(), 5);

        let html = render_table(&model, "t", &no_wrap());
        let anchors = (0..10)
            .filter(|n| html.contains(&format!("id=\"diff_chg_t_{n}\"")))
            .count();
        assert_eq!(anchors, 3);
        assert_eq!(html.matches("OUTPUT TRUNCATED").count(), 2);
        assert_eq!(html.matches("diff_truncated").count(), 1);
    }

    #[test]
    fn test_no_truncation_under_cap() {
        let model = compute("a\nb\n", "a\nc\n").unwrap();
        let html = render_table(&model, "t", &no_wrap());
        assert!(!html.contains("OUTPUT TRUNCATED"));

        let options = RenderOptions {
            reveal_cap: None,
            ..no_wrap()
        };
        let expected: String = (0..40).map(|i| format!("{i}\n")).collect();
        let actual = expected.replace("4\n", "four\n");
        let model = compute(&expected, &actual).unwrap();
        assert!(!render_table(&model, "t", &options).contains("OUTPUT TRUNCATED"));
    }

    #[test]
    fn test_long_same_run_collapses() {
        let expected: String = (0..12).map(|i| format!("{i}\n")).collect();
        let actual = expected.replacen("11\n", "eleven\n", 1);
        let model = compute(&expected, &actual).unwrap();
        let html = render_table(&model, "t", &no_wrap());
        assert!(html.contains("showHideRows(this)"));
        assert!(html.contains("id=\"diff_same_t_0_1\""));
        assert_eq!(html.matches("Show All").count(), 2);

        let short = compute("a\nb\n", "a\nc\n").unwrap();
        assert!(!render_table(&short, "t", &no_wrap()).contains("showHideRows"));
    }

    #[test]
    fn test_wrapping_adds_continuation_rows() {
        let long = "x".repeat(120);
        let model = compute(&format!("{long}\n"), "short\n").unwrap();
        let options = RenderOptions::default();
        let html = render_table(&model, "t", &options);
        assert_eq!(html.matches("<td class=\"diff_header\">&gt;</td>").count(), 0);
        assert_eq!(html.matches("<td class=\"diff_header\">></td>").count(), 2);
    }

    #[test]
    fn test_wrap_segments_keeps_kinds() {
        let segments = vec![
            Segment { kind: SegmentKind::Same, text: "abc".to_string() },
            Segment { kind: SegmentKind::Changed, text: "def".to_string() },
        ];
        let chunks = wrap_segments(&segments, Some(4));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 2);
        assert_eq!(chunks[0][1].text, "d");
        assert_eq!(chunks[1][0].kind, SegmentKind::Changed);
        assert_eq!(chunks[1][0].text, "ef");
    }

    #[test]
    fn test_cache_is_keyed_by_test_case() {
        let mut cache = RenderCache::new();
        let options = no_wrap();
        let failing = verdict(1, compute("a\n", "b\n"), &["Your output did not match the expected output"]);
        let passing = verdict(2, None, &[]);

        let first = cache.block(&failing, &options).map(str::to_string);
        assert!(first.as_deref().is_some_and(|b| b.contains("id=\"tc_1\"")));
        assert!(cache.block(&passing, &options).is_none());
        assert_eq!(cache.len(), 2);

        // A structurally different verdict under the same id reuses the entry.
        let other = verdict(1, None, &["Your program timed out"]);
        assert_eq!(cache.block(&other, &options).map(str::to_string), first);

        cache.invalidate(1);
        let fresh = cache.block(&other, &options).unwrap();
        assert!(fresh.contains("timed out"));
    }

    #[test]
    fn test_report() {
        let verdicts = vec![
            verdict(2, compute("a\n", "b\n"), &["Your output did not match the expected output"]),
            verdict(1, None, &[]),
        ];
        let mut cache = RenderCache::new();
        let html = render_report(&verdicts, &BasicScore, &RenderOptions::default(), &mut cache);
        assert!(html.contains("Failed Tests"));
        assert!(html.contains("Passed Tests"));
        assert!(html.contains("Tentative total score: 2 / 4"));
        assert!(html.contains("Tentative percentage score: 50.00"));
        assert!(html.contains("Legends"));
        assert!(html.contains("case &lt;2&gt;"));
        assert!(html.contains("<a href=\"#tc_2\""));
    }

    #[test]
    fn test_report_without_tables_skips_legend() {
        let verdicts = vec![verdict(1, None, &["Your program timed out"])];
        let mut cache = RenderCache::new();
        let html = render_report(&verdicts, &BasicScore, &RenderOptions::default(), &mut cache);
        assert!(!html.contains("Legends"));
        assert!(html.contains("Your program timed out"));
        assert!(html.contains("Tentative percentage score: 0.00"));
    }
}
