//! Line diff engine.
//!
//! Aligns expected and actual output line by line (Myers shortest edit
//! script), then marks the changed character spans inside replaced line
//! pairs. The resulting [`DiffModel`] carries no markup of any output format;
//! see [`crate::render`] for the HTML view.

use std::ops::Range;

use serde::{Deserialize, Serialize};

/// Tab stops used when expanding tabs
pub const TAB_SIZE: usize = 8;

/// Stand-in for a space that came from tab expansion.
///
/// Keeping it distinct from a literal space lets the alignment see a
/// tabs-vs-spaces difference. Renderers show both as whitespace.
pub const TAB_FILL: char = '\t';

/// Edit distance beyond which the line alignment gives up and reports the
/// remaining middle section as one replaced block.
const MAX_LINE_EDITS: usize = 2_000;

/// Same ceiling for the character alignment inside one line pair.
const MAX_CHAR_EDITS: usize = 500;

/// Kind of a marked-up span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    /// Identical on both sides
    Same,
    /// Present only in the actual output
    Added,
    /// Present on both sides with different content
    Changed,
    /// Present only in the expected output
    Removed,
}

/// A run of text sharing one [`SegmentKind`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub kind: SegmentKind,
    pub text: String,
}

/// One side of an aligned row
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffLine {
    /// 1-based line number, `None` for padding
    pub number: Option<usize>,
    pub segments: Vec<Segment>,
}

impl DiffLine {
    /// Padding opposite an added or removed line
    pub fn blank() -> Self {
        Self::default()
    }

    fn whole(number: usize, kind: SegmentKind, text: &str) -> Self {
        let mut line = DiffLine {
            number: Some(number),
            segments: Vec::new(),
        };
        line.push(kind, text);
        line
    }

    fn push(&mut self, kind: SegmentKind, text: &str) {
        if text.is_empty() {
            return;
        }
        match self.segments.last_mut() {
            Some(last) if last.kind == kind => last.text.push_str(text),
            _ => self.segments.push(Segment {
                kind,
                text: text.to_string(),
            }),
        }
    }

    /// Plain text of the line, markup dropped
    pub fn text(&self) -> String {
        self.segments.iter().map(|s| s.text.as_str()).collect()
    }

    /// Whether any span on this side is marked
    pub fn has_markup(&self) -> bool {
        self.segments.iter().any(|s| s.kind != SegmentKind::Same)
    }
}

/// One aligned pair of lines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffRow {
    pub left: DiffLine,
    pub right: DiffLine,
    pub changed: bool,
}

/// Line-level alignment of expected (left) against actual (right) output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffModel {
    rows: Vec<DiffRow>,
}

impl DiffModel {
    pub fn rows(&self) -> &[DiffRow] {
        &self.rows
    }

    /// Whether at least one row differs
    pub fn has_changes(&self) -> bool {
        self.rows.iter().any(|r| r.changed)
    }

    /// Number of maximal runs of changed rows
    pub fn change_regions(&self) -> usize {
        let mut regions = 0;
        let mut in_change = false;
        for row in &self.rows {
            if row.changed && !in_change {
                regions += 1;
            }
            in_change = row.changed;
        }
        regions
    }
}

/// Compare two texts; `None` when they are identical.
pub fn compute(expected: &str, actual: &str) -> Option<DiffModel> {
    if expected == actual {
        return None;
    }

    let left = split_lines(expected);
    let right = split_lines(actual);

    let mut rows = Vec::with_capacity(left.len().max(right.len()));
    for op in opcodes(&left, &right, MAX_LINE_EDITS) {
        match op.tag {
            Tag::Equal => {
                for (i, j) in op.a.zip(op.b) {
                    rows.push(DiffRow {
                        left: DiffLine::whole(i + 1, SegmentKind::Same, &left[i]),
                        right: DiffLine::whole(j + 1, SegmentKind::Same, &right[j]),
                        changed: false,
                    });
                }
            }
            Tag::Delete => push_removed(&mut rows, &left, op.a),
            Tag::Insert => push_added(&mut rows, &right, op.b),
            Tag::Replace => {
                let paired = op.a.len().min(op.b.len());
                for (i, j) in op.a.clone().zip(op.b.clone()).take(paired) {
                    let (l, r) = intraline(&left[i], &right[j]);
                    rows.push(DiffRow {
                        left: DiffLine {
                            number: Some(i + 1),
                            segments: l.segments,
                        },
                        right: DiffLine {
                            number: Some(j + 1),
                            segments: r.segments,
                        },
                        changed: true,
                    });
                }
                push_removed(&mut rows, &left, op.a.start + paired..op.a.end);
                push_added(&mut rows, &right, op.b.start + paired..op.b.end);
            }
        }
    }

    Some(DiffModel { rows })
}

/// Byte-level entry point for captured output.
///
/// Identity is decided on the raw bytes; invalid UTF-8 is replaced before
/// alignment.
pub fn compute_bytes(expected: &[u8], actual: &[u8]) -> Option<DiffModel> {
    if expected == actual {
        return None;
    }
    let expected = String::from_utf8_lossy(expected);
    let actual = String::from_utf8_lossy(actual);
    match compute(&expected, &actual) {
        Some(model) => Some(model),
        // Distinct bytes that decode to the same replacement text.
        None => Some(DiffModel {
            rows: vec![DiffRow {
                left: DiffLine::whole(1, SegmentKind::Changed, &expected),
                right: DiffLine::whole(1, SegmentKind::Changed, &actual),
                changed: true,
            }],
        }),
    }
}

fn push_removed(rows: &mut Vec<DiffRow>, lines: &[String], range: Range<usize>) {
    for i in range {
        rows.push(DiffRow {
            left: DiffLine::whole(i + 1, SegmentKind::Removed, &lines[i]),
            right: DiffLine::blank(),
            changed: true,
        });
    }
}

fn push_added(rows: &mut Vec<DiffRow>, lines: &[String], range: Range<usize>) {
    for j in range {
        rows.push(DiffRow {
            left: DiffLine::blank(),
            right: DiffLine::whole(j + 1, SegmentKind::Added, &lines[j]),
            changed: true,
        });
    }
}

/// Mark changed spans within one replaced line pair.
fn intraline(left: &str, right: &str) -> (DiffLine, DiffLine) {
    let a: Vec<char> = left.chars().collect();
    let b: Vec<char> = right.chars().collect();
    let mut l = DiffLine::default();
    let mut r = DiffLine::default();

    for op in opcodes(&a, &b, MAX_CHAR_EDITS) {
        let a_text: String = a[op.a.clone()].iter().collect();
        let b_text: String = b[op.b.clone()].iter().collect();
        match op.tag {
            Tag::Equal => {
                l.push(SegmentKind::Same, &a_text);
                r.push(SegmentKind::Same, &b_text);
            }
            Tag::Replace => {
                l.push(SegmentKind::Changed, &a_text);
                r.push(SegmentKind::Changed, &b_text);
            }
            Tag::Delete => l.push(SegmentKind::Removed, &a_text),
            Tag::Insert => r.push(SegmentKind::Added, &b_text),
        }
    }
    (l, r)
}

/// Split into lines without their terminating newline, tabs expanded.
fn split_lines(text: &str) -> Vec<String> {
    text.split_inclusive('\n')
        .map(|line| expand_tabs(line.strip_suffix('\n').unwrap_or(line)))
        .collect()
}

/// Expand tabs to [`TAB_SIZE`] columns using [`TAB_FILL`] as filler.
pub fn expand_tabs(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut column = 0;
    for ch in line.chars() {
        match ch {
            '\t' => {
                let width = TAB_SIZE - column % TAB_SIZE;
                out.extend(std::iter::repeat_n(TAB_FILL, width));
                column += width;
            }
            '\r' => {
                out.push(ch);
                column = 0;
            }
            _ => {
                out.push(ch);
                column += 1;
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Equal,
    Delete,
    Insert,
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct OpCode {
    tag: Tag,
    a: Range<usize>,
    b: Range<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edit {
    Equal,
    Delete,
    Insert,
}

/// Group a shortest edit script into equal/delete/insert/replace blocks.
fn opcodes<T: PartialEq>(a: &[T], b: &[T], max_edits: usize) -> Vec<OpCode> {
    let prefix = a.iter().zip(b).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();

    let a_mid = &a[prefix..a.len() - suffix];
    let b_mid = &b[prefix..b.len() - suffix];

    let mut edits = vec![Edit::Equal; prefix];
    match shortest_edit(a_mid, b_mid, max_edits) {
        Some(script) => edits.extend(script),
        None => {
            edits.extend(std::iter::repeat_n(Edit::Delete, a_mid.len()));
            edits.extend(std::iter::repeat_n(Edit::Insert, b_mid.len()));
        }
    }
    edits.extend(std::iter::repeat_n(Edit::Equal, suffix));

    let mut ops = Vec::new();
    let (mut i, mut j) = (0, 0);
    let mut pos = 0;
    while pos < edits.len() {
        if edits[pos] == Edit::Equal {
            let start = pos;
            while pos < edits.len() && edits[pos] == Edit::Equal {
                pos += 1;
            }
            let len = pos - start;
            ops.push(OpCode {
                tag: Tag::Equal,
                a: i..i + len,
                b: j..j + len,
            });
            i += len;
            j += len;
        } else {
            let (mut dels, mut ins) = (0, 0);
            while pos < edits.len() && edits[pos] != Edit::Equal {
                match edits[pos] {
                    Edit::Delete => dels += 1,
                    _ => ins += 1,
                }
                pos += 1;
            }
            let tag = match (dels, ins) {
                (0, _) => Tag::Insert,
                (_, 0) => Tag::Delete,
                _ => Tag::Replace,
            };
            ops.push(OpCode {
                tag,
                a: i..i + dels,
                b: j..j + ins,
            });
            i += dels;
            j += ins;
        }
    }
    ops
}

/// Myers' O(ND) greedy algorithm. Returns `None` when more than `max_edits`
/// edits would be needed.
fn shortest_edit<T: PartialEq>(a: &[T], b: &[T], max_edits: usize) -> Option<Vec<Edit>> {
    let n = a.len() as isize;
    let m = b.len() as isize;
    let max = a.len() + b.len();
    let offset = max as isize + 1;
    let idx = |k: isize| (k + offset) as usize;

    let mut v = vec![0isize; 2 * max + 3];
    // snapshots[d] holds v[-d..=d] as it stood after round d
    let mut snapshots: Vec<Vec<isize>> = Vec::new();

    for d in 0..=max.min(max_edits) as isize {
        for k in (-d..=d).step_by(2) {
            let down = k == -d || (k != d && v[idx(k - 1)] < v[idx(k + 1)]);
            let mut x = if down { v[idx(k + 1)] } else { v[idx(k - 1)] + 1 };
            let mut y = x - k;
            while x < n && y < m && a[x as usize] == b[y as usize] {
                x += 1;
                y += 1;
            }
            v[idx(k)] = x;
            if x >= n && y >= m {
                return Some(backtrack(&snapshots, d, n, m));
            }
        }
        snapshots.push(v[idx(-d)..=idx(d)].to_vec());
    }
    None
}

fn backtrack(snapshots: &[Vec<isize>], edits: isize, n: isize, m: isize) -> Vec<Edit> {
    let at = |d: isize, k: isize| snapshots[d as usize][(k + d) as usize];

    let mut script = Vec::with_capacity((n + m) as usize);
    let (mut x, mut y) = (n, m);
    for d in (1..=edits).rev() {
        let k = x - y;
        let prev = d - 1;
        let down = k == -d || (k != d && at(prev, k - 1) < at(prev, k + 1));
        let prev_k = if down { k + 1 } else { k - 1 };
        let prev_x = at(prev, prev_k);
        let prev_y = prev_x - prev_k;
        let (start_x, start_y) = if down {
            (prev_x, prev_y + 1)
        } else {
            (prev_x + 1, prev_y)
        };
        while x > start_x && y > start_y {
            script.push(Edit::Equal);
            x -= 1;
            y -= 1;
        }
        script.push(if down { Edit::Insert } else { Edit::Delete });
        x = prev_x;
        y = prev_y;
    }
    while x > 0 && y > 0 {
        script.push(Edit::Equal);
        x -= 1;
        y -= 1;
    }
    script.reverse();
    script
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(line: &DiffLine) -> Vec<(SegmentKind, &str)> {
        line.segments
            .iter()
            .map(|s| (s.kind, s.text.as_str()))
            .collect()
    }

    #[test]
    fn test_identical_texts_have_no_diff() {
        assert!(compute("a\nb\n", "a\nb\n").is_none());
        assert!(compute("", "").is_none());
        assert!(compute_bytes(b"\xff\n", b"\xff\n").is_none());
    }

    #[test]
    fn test_inserted_line() {
        let model = compute("a\nc\n", "a\nb\nc\n").unwrap();
        let rows = model.rows();
        assert_eq!(rows.len(), 3);
        assert!(!rows[0].changed);
        assert!(rows[1].changed);
        assert_eq!(rows[1].left.number, None);
        assert_eq!(rows[1].right.number, Some(2));
        assert_eq!(texts(&rows[1].right), vec![(SegmentKind::Added, "b")]);
        assert_eq!(rows[2].left.number, Some(2));
        assert_eq!(rows[2].right.number, Some(3));
        assert_eq!(model.change_regions(), 1);
    }

    #[test]
    fn test_removed_line() {
        let model = compute("a\nb\nc\n", "a\nc\n").unwrap();
        let rows = model.rows();
        assert_eq!(rows.len(), 3);
        assert_eq!(texts(&rows[1].left), vec![(SegmentKind::Removed, "b")]);
        assert_eq!(rows[1].right, DiffLine::blank());
    }

    #[test]
    fn test_replaced_line_marks_changed_span() {
        let model = compute("total: 42\n", "total: 43\n").unwrap();
        let row = &model.rows()[0];
        assert!(row.changed);
        assert_eq!(
            texts(&row.left),
            vec![(SegmentKind::Same, "total: 4"), (SegmentKind::Changed, "2")]
        );
        assert_eq!(
            texts(&row.right),
            vec![(SegmentKind::Same, "total: 4"), (SegmentKind::Changed, "3")]
        );
    }

    #[test]
    fn test_intraline_insertion() {
        let model = compute("helo\n", "hello\n").unwrap();
        let row = &model.rows()[0];
        assert_eq!(row.left.text(), "helo");
        assert!(!row.left.has_markup());
        assert_eq!(row.right.text(), "hello");
        assert!(row.right.segments.iter().any(|s| s.kind == SegmentKind::Added));
    }

    #[test]
    fn test_unbalanced_replace_pads_with_blanks() {
        let model = compute("x\ny\n", "1\n2\n3\n").unwrap();
        let rows = model.rows();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.changed));
        assert_eq!(rows[2].left.number, None);
        assert_eq!(rows[2].right.number, Some(3));
        assert_eq!(model.change_regions(), 1);
    }

    #[test]
    fn test_tabs_differ_from_spaces() {
        let model = compute("a\tb\n", "a       b\n").unwrap();
        assert!(model.has_changes());
        let row = &model.rows()[0];
        assert_eq!(row.left.text(), format!("a{}b", TAB_FILL.to_string().repeat(7)));
        assert_eq!(row.right.text(), "a       b");
    }

    #[test]
    fn test_expand_tabs_columns() {
        assert_eq!(expand_tabs("ab\tc"), "ab\t\t\t\t\t\tc");
        assert_eq!(expand_tabs("\t"), "\t".repeat(8));
        assert_eq!(expand_tabs("12345678\tx"), format!("12345678{}x", "\t".repeat(8)));
    }

    #[test]
    fn test_missing_trailing_newline_has_no_changed_rows() {
        let model = compute("a\nb\n", "a\nb").unwrap();
        assert!(!model.has_changes());
        assert_eq!(model.rows().len(), 2);
    }

    #[test]
    fn test_empty_expected() {
        let model = compute("", "x\n").unwrap();
        assert_eq!(model.rows().len(), 1);
        assert_eq!(model.rows()[0].left.number, None);
    }

    #[test]
    fn test_separate_change_regions() {
        let expected = "1\n2\n3\n4\n5\n6\n7\n";
        let actual = "1\nX\n3\n4\nY\n6\nZ\n";
        let model = compute(expected, actual).unwrap();
        assert_eq!(model.change_regions(), 3);
        assert_eq!(model.rows().len(), 7);
    }

    #[test]
    fn test_shortest_edit_is_minimal() {
        let a: Vec<char> = "ABCABBA".chars().collect();
        let b: Vec<char> = "CBABAC".chars().collect();
        let script = shortest_edit(&a, &b, 100).unwrap();
        let edits = script.iter().filter(|e| **e != Edit::Equal).count();
        assert_eq!(edits, 5);
    }

    #[test]
    fn test_edit_ceiling_falls_back_to_replace() {
        let ops = opcodes(&[1, 2, 3, 9], &[4, 5, 6, 9], 1);
        assert_eq!(
            ops,
            vec![
                OpCode {
                    tag: Tag::Replace,
                    a: 0..3,
                    b: 0..3
                },
                OpCode {
                    tag: Tag::Equal,
                    a: 3..4,
                    b: 3..4
                },
            ]
        );
    }
}
