//! Line-oriented diff codec
//!
//! Produces unified-diff style patches between two text states and replays
//! them. Lines keep their terminators, so content without a trailing newline
//! survives the round trip:
//!
//! ```text
//! fvault-patch 1 <base line count> <revised line count>
//! @@ -<start>,<len> +<start>,<len> @@
//!  context
//! -removed
//! +added
//! \ No newline at end of file
//! ```
//!
//! Applying a patch checks every context and removed line against the base;
//! on any mismatch the whole application fails.

/// Patch format version written in the header
pub const PATCH_FORMAT_VERSION: u32 = 1;

const HEADER_MAGIC: &str = "fvault-patch";
const NO_NEWLINE_MARKER: &[u8] = b"\\ No newline at end of file\n";

/// Context lines kept around each change
const CONTEXT_LINES: usize = 3;

/// Edit distance beyond which the codec stops searching for a minimal script
/// and emits a full replacement of the changed region instead.
const MAX_EDIT_DISTANCE: isize = 2048;

/// Errors raised while parsing or applying a patch
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    #[error("malformed patch: {0}")]
    Malformed(String),

    #[error("unsupported patch format version {0}")]
    UnsupportedVersion(u32),

    #[error("base has {actual} lines, patch expects {expected}")]
    BaseLength { expected: usize, actual: usize },

    #[error("context mismatch in hunk {hunk} at base line {line}")]
    ContextMismatch { hunk: usize, line: usize },
}

/// A single line inside a hunk, terminator included
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchLine {
    Context(Vec<u8>),
    Remove(Vec<u8>),
    Add(Vec<u8>),
}

/// A contiguous region of change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    /// Zero-based first base line covered by the hunk
    pub old_start: usize,
    pub old_len: usize,
    /// Zero-based first revised line covered by the hunk
    pub new_start: usize,
    pub new_len: usize,
    pub lines: Vec<PatchLine>,
}

/// Parsed patch between a base and a revised state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchData {
    pub base_lines: usize,
    pub revised_lines: usize,
    pub hunks: Vec<Hunk>,
}

/// Line counts touched by a patch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PatchStats {
    pub added: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edit {
    Equal { old: usize, new: usize },
    Delete { old: usize },
    Insert { new: usize },
}

impl Edit {
    fn is_change(&self) -> bool {
        !matches!(self, Edit::Equal { .. })
    }
}

fn split_lines(data: &[u8]) -> Vec<&[u8]> {
    if data.is_empty() {
        return Vec::new();
    }
    data.split_inclusive(|&b| b == b'\n').collect()
}

/// Compute a patch transforming `base` into `revised`
pub fn compute_diff(base: &[u8], revised: &[u8]) -> PatchData {
    let a = split_lines(base);
    let b = split_lines(revised);
    let edits = edit_script(&a, &b);
    let hunks = build_hunks(&edits, &a, &b);

    PatchData {
        base_lines: a.len(),
        revised_lines: b.len(),
        hunks,
    }
}

/// Replay `patch` on top of `base`
pub fn apply_diff(base: &[u8], patch: &PatchData) -> Result<Vec<u8>, PatchError> {
    let lines = split_lines(base);
    if lines.len() != patch.base_lines {
        return Err(PatchError::BaseLength {
            expected: patch.base_lines,
            actual: lines.len(),
        });
    }

    let mut out = Vec::with_capacity(base.len());
    let mut cursor = 0usize;
    let mut produced = 0usize;

    for (hunk_no, hunk) in patch.hunks.iter().enumerate() {
        let in_base = hunk
            .old_start
            .checked_add(hunk.old_len)
            .is_some_and(|end| end <= lines.len());
        if hunk.old_start < cursor || !in_base {
            return Err(PatchError::Malformed(format!(
                "hunk {} covers lines outside the base",
                hunk_no + 1
            )));
        }
        for line in &lines[cursor..hunk.old_start] {
            out.extend_from_slice(line);
            produced += 1;
        }
        let mut pos = hunk.old_start;
        for line in &hunk.lines {
            match line {
                PatchLine::Context(expected) | PatchLine::Remove(expected) => {
                    let actual = lines.get(pos).copied();
                    if actual != Some(expected.as_slice()) {
                        return Err(PatchError::ContextMismatch {
                            hunk: hunk_no + 1,
                            line: pos + 1,
                        });
                    }
                    if matches!(line, PatchLine::Context(_)) {
                        out.extend_from_slice(expected);
                        produced += 1;
                    }
                    pos += 1;
                }
                PatchLine::Add(content) => {
                    out.extend_from_slice(content);
                    produced += 1;
                }
            }
        }
        cursor = pos;
    }

    for line in &lines[cursor..] {
        out.extend_from_slice(line);
        produced += 1;
    }

    if produced != patch.revised_lines {
        return Err(PatchError::Malformed(format!(
            "produced {} lines, patch declares {}",
            produced, patch.revised_lines
        )));
    }
    Ok(out)
}

impl PatchData {
    /// True when base and revised are identical
    pub fn is_empty(&self) -> bool {
        self.hunks.is_empty()
    }

    pub fn stats(&self) -> PatchStats {
        let mut stats = PatchStats::default();
        for line in self.hunks.iter().flat_map(|h| &h.lines) {
            match line {
                PatchLine::Add(_) => stats.added += 1,
                PatchLine::Remove(_) => stats.removed += 1,
                PatchLine::Context(_) => {}
            }
        }
        stats
    }

    /// Serialize to the text patch format
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!(
            "{} {} {} {}\n",
            HEADER_MAGIC, PATCH_FORMAT_VERSION, self.base_lines, self.revised_lines
        )
        .into_bytes();

        for hunk in &self.hunks {
            out.extend_from_slice(
                format!(
                    "@@ -{},{} +{},{} @@\n",
                    hunk.old_start + 1,
                    hunk.old_len,
                    hunk.new_start + 1,
                    hunk.new_len
                )
                .as_bytes(),
            );
            for line in &hunk.lines {
                let (prefix, content) = match line {
                    PatchLine::Context(c) => (b' ', c),
                    PatchLine::Remove(c) => (b'-', c),
                    PatchLine::Add(c) => (b'+', c),
                };
                out.push(prefix);
                out.extend_from_slice(content);
                if !content.ends_with(b"\n") {
                    out.push(b'\n');
                    out.extend_from_slice(NO_NEWLINE_MARKER);
                }
            }
        }
        out
    }

    /// Parse the text patch format
    pub fn parse(data: &[u8]) -> Result<Self, PatchError> {
        let mut lines = split_lines(data).into_iter();

        let header = lines
            .next()
            .ok_or_else(|| PatchError::Malformed("empty patch".to_string()))?;
        let header = std::str::from_utf8(header)
            .map_err(|_| PatchError::Malformed("header is not UTF-8".to_string()))?;
        let fields: Vec<&str> = header.split_whitespace().collect();
        if fields.len() != 4 || fields[0] != HEADER_MAGIC {
            return Err(PatchError::Malformed(format!("bad header: {:?}", header.trim_end())));
        }
        let version: u32 = parse_number(fields[1])?;
        if version != PATCH_FORMAT_VERSION {
            return Err(PatchError::UnsupportedVersion(version));
        }
        let base_lines = parse_number(fields[2])?;
        let revised_lines = parse_number(fields[3])?;

        let mut hunks: Vec<Hunk> = Vec::new();
        for line in lines {
            if line.starts_with(b"@@ ") {
                hunks.push(parse_hunk_header(line)?);
                continue;
            }
            let hunk = hunks
                .last_mut()
                .ok_or_else(|| PatchError::Malformed("line outside of a hunk".to_string()))?;
            if line == NO_NEWLINE_MARKER {
                let content = match hunk.lines.last_mut() {
                    Some(PatchLine::Context(c) | PatchLine::Remove(c) | PatchLine::Add(c)) => c,
                    None => {
                        return Err(PatchError::Malformed(
                            "newline marker without a preceding line".to_string(),
                        ));
                    }
                };
                if content.pop() != Some(b'\n') {
                    return Err(PatchError::Malformed("repeated newline marker".to_string()));
                }
                continue;
            }
            if !line.ends_with(b"\n") {
                return Err(PatchError::Malformed("truncated patch line".to_string()));
            }
            let content = line[1..].to_vec();
            match line[0] {
                b' ' => hunk.lines.push(PatchLine::Context(content)),
                b'-' => hunk.lines.push(PatchLine::Remove(content)),
                b'+' => hunk.lines.push(PatchLine::Add(content)),
                other => {
                    return Err(PatchError::Malformed(format!(
                        "unexpected line prefix {:?}",
                        other as char
                    )));
                }
            }
        }

        let patch = PatchData {
            base_lines,
            revised_lines,
            hunks,
        };
        patch.validate()?;
        Ok(patch)
    }

    /// Check that hunk headers agree with their bodies and are ordered
    fn validate(&self) -> Result<(), PatchError> {
        let mut last_end = 0usize;
        for (i, hunk) in self.hunks.iter().enumerate() {
            let old = hunk
                .lines
                .iter()
                .filter(|l| !matches!(l, PatchLine::Add(_)))
                .count();
            let new = hunk
                .lines
                .iter()
                .filter(|l| !matches!(l, PatchLine::Remove(_)))
                .count();
            if old != hunk.old_len || new != hunk.new_len {
                return Err(PatchError::Malformed(format!(
                    "hunk {} header does not match its body",
                    i + 1
                )));
            }
            if hunk.old_start < last_end {
                return Err(PatchError::Malformed(format!("hunk {} overlaps its predecessor", i + 1)));
            }
            last_end = hunk.old_start.checked_add(hunk.old_len).ok_or_else(|| {
                PatchError::Malformed(format!("hunk {} range overflows", i + 1))
            })?;
        }
        if last_end > self.base_lines {
            return Err(PatchError::Malformed("hunks extend past the base".to_string()));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(s: &str) -> Result<T, PatchError> {
    s.parse()
        .map_err(|_| PatchError::Malformed(format!("invalid number {:?}", s)))
}

fn parse_range(s: &str, sign: char) -> Result<(usize, usize), PatchError> {
    let body = s
        .strip_prefix(sign)
        .ok_or_else(|| PatchError::Malformed(format!("bad hunk range {:?}", s)))?;
    let (start, len) = body
        .split_once(',')
        .ok_or_else(|| PatchError::Malformed(format!("bad hunk range {:?}", s)))?;
    let start: usize = parse_number(start)?;
    if start == 0 {
        return Err(PatchError::Malformed("hunk ranges are one-based".to_string()));
    }
    Ok((start - 1, parse_number(len)?))
}

fn parse_hunk_header(line: &[u8]) -> Result<Hunk, PatchError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| PatchError::Malformed("hunk header is not UTF-8".to_string()))?;
    let fields: Vec<&str> = text.split_whitespace().collect();
    if fields.len() != 4 || fields[0] != "@@" || fields[3] != "@@" {
        return Err(PatchError::Malformed(format!("bad hunk header: {:?}", text.trim_end())));
    }
    let (old_start, old_len) = parse_range(fields[1], '-')?;
    let (new_start, new_len) = parse_range(fields[2], '+')?;
    Ok(Hunk {
        old_start,
        old_len,
        new_start,
        new_len,
        lines: Vec::new(),
    })
}

/// Edit script over whole line lists, with common prefix and suffix trimmed
/// before the search.
fn edit_script(a: &[&[u8]], b: &[&[u8]]) -> Vec<Edit> {
    let prefix = a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();

    let mid_a = &a[prefix..a.len() - suffix];
    let mid_b = &b[prefix..b.len() - suffix];

    let mut edits: Vec<Edit> = (0..prefix).map(|i| Edit::Equal { old: i, new: i }).collect();

    let middle = myers(mid_a, mid_b).unwrap_or_else(|| {
        (0..mid_a.len())
            .map(|old| Edit::Delete { old })
            .chain((0..mid_b.len()).map(|new| Edit::Insert { new }))
            .collect()
    });
    edits.extend(middle.into_iter().map(|e| match e {
        Edit::Equal { old, new } => Edit::Equal {
            old: old + prefix,
            new: new + prefix,
        },
        Edit::Delete { old } => Edit::Delete { old: old + prefix },
        Edit::Insert { new } => Edit::Insert { new: new + prefix },
    }));

    let a_tail = a.len() - suffix;
    let b_tail = b.len() - suffix;
    edits.extend((0..suffix).map(|i| Edit::Equal {
        old: a_tail + i,
        new: b_tail + i,
    }));
    edits
}

/// Myers' O(ND) shortest edit script. Returns `None` when the edit distance
/// exceeds [`MAX_EDIT_DISTANCE`].
fn myers(a: &[&[u8]], b: &[&[u8]]) -> Option<Vec<Edit>> {
    let n = a.len() as isize;
    let m = b.len() as isize;
    let max = n + m;
    let offset = max + 1;
    let mut v = vec![0isize; (2 * max + 3) as usize];
    // trace[d] holds v[-d..=d] as it was before step d
    let mut trace: Vec<Vec<isize>> = Vec::new();

    for d in 0..=max.min(MAX_EDIT_DISTANCE) {
        trace.push(v[(offset - d) as usize..=(offset + d) as usize].to_vec());
        let mut k = -d;
        while k <= d {
            let idx = (k + offset) as usize;
            let mut x = if k == -d || (k != d && v[idx - 1] < v[idx + 1]) {
                v[idx + 1]
            } else {
                v[idx - 1] + 1
            };
            let mut y = x - k;
            while x < n && y < m && a[x as usize] == b[y as usize] {
                x += 1;
                y += 1;
            }
            v[idx] = x;
            if x >= n && y >= m {
                return Some(backtrack(&trace, n, m));
            }
            k += 2;
        }
    }
    None
}

fn backtrack(trace: &[Vec<isize>], n: isize, m: isize) -> Vec<Edit> {
    let mut edits = Vec::new();
    let (mut x, mut y) = (n, m);

    for d in (0..trace.len() as isize).rev() {
        if d == 0 {
            while x > 0 && y > 0 {
                edits.push(Edit::Equal {
                    old: (x - 1) as usize,
                    new: (y - 1) as usize,
                });
                x -= 1;
                y -= 1;
            }
            break;
        }

        let v = &trace[d as usize];
        let get = |k: isize| v[(k + d) as usize];
        let k = x - y;
        let prev_k = if k == -d || (k != d && get(k - 1) < get(k + 1)) {
            k + 1
        } else {
            k - 1
        };
        let prev_x = get(prev_k);
        let prev_y = prev_x - prev_k;

        while x > prev_x && y > prev_y {
            edits.push(Edit::Equal {
                old: (x - 1) as usize,
                new: (y - 1) as usize,
            });
            x -= 1;
            y -= 1;
        }
        if x == prev_x {
            edits.push(Edit::Insert { new: (y - 1) as usize });
        } else {
            edits.push(Edit::Delete { old: (x - 1) as usize });
        }
        x = prev_x;
        y = prev_y;
    }

    edits.reverse();
    edits
}

fn build_hunks(edits: &[Edit], a: &[&[u8]], b: &[&[u8]]) -> Vec<Hunk> {
    let changes: Vec<usize> = edits
        .iter()
        .enumerate()
        .filter(|(_, e)| e.is_change())
        .map(|(i, _)| i)
        .collect();
    if changes.is_empty() {
        return Vec::new();
    }

    // Group changes whose gap fits inside shared context
    let mut groups: Vec<(usize, usize)> = Vec::new();
    for &pos in &changes {
        match groups.last_mut() {
            Some((_, last)) if pos - *last - 1 <= 2 * CONTEXT_LINES => *last = pos,
            _ => groups.push((pos, pos)),
        }
    }

    // Base/revised line positions before each edit
    let mut positions = Vec::with_capacity(edits.len());
    let (mut old_pos, mut new_pos) = (0usize, 0usize);
    for edit in edits {
        positions.push((old_pos, new_pos));
        match edit {
            Edit::Equal { .. } => {
                old_pos += 1;
                new_pos += 1;
            }
            Edit::Delete { .. } => old_pos += 1,
            Edit::Insert { .. } => new_pos += 1,
        }
    }

    groups
        .into_iter()
        .map(|(first, last)| {
            let start = first.saturating_sub(CONTEXT_LINES);
            let end = (last + CONTEXT_LINES + 1).min(edits.len());
            let (old_start, new_start) = positions[start];
            let mut hunk = Hunk {
                old_start,
                old_len: 0,
                new_start,
                new_len: 0,
                lines: Vec::with_capacity(end - start),
            };
            for edit in &edits[start..end] {
                match *edit {
                    Edit::Equal { old, .. } => {
                        hunk.old_len += 1;
                        hunk.new_len += 1;
                        hunk.lines.push(PatchLine::Context(a[old].to_vec()));
                    }
                    Edit::Delete { old } => {
                        hunk.old_len += 1;
                        hunk.lines.push(PatchLine::Remove(a[old].to_vec()));
                    }
                    Edit::Insert { new } => {
                        hunk.new_len += 1;
                        hunk.lines.push(PatchLine::Add(b[new].to_vec()));
                    }
                }
            }
            hunk
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(a: &[u8], b: &[u8]) -> Vec<u8> {
        let patch = compute_diff(a, b);
        let parsed = PatchData::parse(&patch.to_bytes()).unwrap();
        assert_eq!(parsed, patch);
        apply_diff(a, &parsed).unwrap()
    }

    #[test]
    fn test_append_line() {
        let a = b"line1\nline2\n";
        let b = b"line1\nline2\nline3\n";
        let patch = compute_diff(a, b);
        assert_eq!(patch.hunks.len(), 1);
        assert_eq!(patch.stats(), PatchStats { added: 1, removed: 0 });
        assert_eq!(roundtrip(a, b), b.to_vec());
    }

    #[test]
    fn test_identical_content_has_no_hunks() {
        let a = b"same\ncontent\n";
        let patch = compute_diff(a, a);
        assert!(patch.is_empty());
        assert_eq!(apply_diff(a, &patch).unwrap(), a.to_vec());
    }

    #[test]
    fn test_missing_trailing_newline() {
        let a = b"alpha\nbeta";
        let b = b"alpha\nbeta\ngamma";
        let bytes = compute_diff(a, b).to_bytes();
        assert!(bytes.windows(NO_NEWLINE_MARKER.len()).any(|w| w == NO_NEWLINE_MARKER));
        assert_eq!(roundtrip(a, b), b.to_vec());
        assert_eq!(roundtrip(b, a), a.to_vec());
    }

    #[test]
    fn test_empty_sides() {
        assert_eq!(roundtrip(b"", b"new\nfile\n"), b"new\nfile\n".to_vec());
        assert_eq!(roundtrip(b"old\nfile\n", b""), Vec::<u8>::new());
    }

    #[test]
    fn test_distant_changes_make_separate_hunks() {
        let a: Vec<u8> = (0..40).flat_map(|i| format!("line {}\n", i).into_bytes()).collect();
        let b = String::from_utf8(a.clone())
            .unwrap()
            .replace("line 2\n", "LINE 2\n")
            .replace("line 35\n", "LINE 35\n");
        let patch = compute_diff(&a, b.as_bytes());
        assert_eq!(patch.hunks.len(), 2);
        assert_eq!(patch.stats(), PatchStats { added: 2, removed: 2 });
        assert_eq!(roundtrip(&a, b.as_bytes()), b.into_bytes());
    }

    #[test]
    fn test_context_mismatch_is_rejected() {
        let patch = compute_diff(b"a\nb\nc\n", b"a\nB\nc\n");
        let err = apply_diff(b"a\nx\nc\n", &patch).unwrap_err();
        assert!(matches!(err, PatchError::ContextMismatch { .. }));
    }

    #[test]
    fn test_wrong_base_length_is_rejected() {
        let patch = compute_diff(b"a\nb\n", b"a\nb\nc\n");
        let err = apply_diff(b"a\nb\nzzz\n", &patch).unwrap_err();
        assert_eq!(err, PatchError::BaseLength { expected: 2, actual: 3 });
    }

    #[test]
    fn test_parse_rejects_unknown_version() {
        let err = PatchData::parse(b"fvault-patch 9 0 0\n").unwrap_err();
        assert_eq!(err, PatchError::UnsupportedVersion(9));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(PatchData::parse(b"").is_err());
        assert!(PatchData::parse(b"diff --git a b\n").is_err());
        assert!(PatchData::parse(b"fvault-patch 1 1 1\n+orphan\n").is_err());
        assert!(PatchData::parse(b"fvault-patch 1 1 1\n@@ -1,1 +1,1 @@\n-a\n").is_err());
        assert!(PatchData::parse(b"fvault-patch 1 1 1\n@@ -1,1 +1,1 @@\n-a\n*b\n").is_err());
    }

    #[test]
    fn test_overflowing_hunk_range_is_malformed() {
        let err = PatchData::parse(b"fvault-patch 1 1 1\n@@ -18446744073709551615,2 +1,2 @@\n a\n a\n")
            .unwrap_err();
        assert!(matches!(err, PatchError::Malformed(_)));

        let patch = PatchData {
            base_lines: 1,
            revised_lines: 1,
            hunks: vec![Hunk {
                old_start: usize::MAX,
                old_len: 2,
                new_start: 0,
                new_len: 2,
                lines: vec![PatchLine::Context(b"a\n".to_vec()), PatchLine::Context(b"a\n".to_vec())],
            }],
        };
        assert!(matches!(apply_diff(b"a\n", &patch), Err(PatchError::Malformed(_))));
    }

    #[test]
    fn test_large_rewrite_falls_back_to_replacement() {
        let a: Vec<u8> = (0..3000).flat_map(|i| format!("a{}\n", i).into_bytes()).collect();
        let b: Vec<u8> = (0..3000).flat_map(|i| format!("b{}\n", i).into_bytes()).collect();
        assert_eq!(roundtrip(&a, &b), b);
    }

    fn text_strategy() -> impl Strategy<Value = Vec<u8>> {
        // small alphabet so the two sides share lines
        prop::collection::vec(prop::sample::select(vec!["a", "b", "c", "dd", "", "e f"]), 0..40)
            .prop_flat_map(|lines| {
                let joined = lines.join("\n");
                prop::bool::ANY.prop_map(move |trailing| {
                    let mut s = joined.clone();
                    if trailing {
                        s.push('\n');
                    }
                    s.into_bytes()
                })
            })
    }

    proptest! {
        #[test]
        fn prop_apply_inverts_compute(a in text_strategy(), b in text_strategy()) {
            let patch = compute_diff(&a, &b);
            prop_assert_eq!(apply_diff(&a, &patch).unwrap(), b.clone());
            let parsed = PatchData::parse(&patch.to_bytes()).unwrap();
            prop_assert_eq!(apply_diff(&a, &parsed).unwrap(), b);
        }
    }
}
