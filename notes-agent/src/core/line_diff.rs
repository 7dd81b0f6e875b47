//! Line-level diff and unified patch rendering for notes text.

/// One edit script entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOp<'a> {
    Equal(&'a str),
    Delete(&'a str),
    Insert(&'a str),
}

/// Above this many LCS cells the middle section is treated as a full replacement.
const MAX_LCS_CELLS: usize = 4_000_000;

/// Edit script between two texts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineDiff<'a> {
    ops: Vec<DiffOp<'a>>,
}

impl<'a> LineDiff<'a> {
    pub fn added(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, DiffOp::Insert(_)))
            .count()
    }

    pub fn removed(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, DiffOp::Delete(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.iter().all(|op| matches!(op, DiffOp::Equal(_)))
    }

    /// Render unified diff hunks with `context` lines around each change.
    pub fn unified(&self, old_label: &str, new_label: &str, context: usize) -> String {
        if self.is_empty() {
            return String::new();
        }
        let mut out = format!("--- {old_label}\n+++ {new_label}\n");
        for (start, end) in self.hunk_ranges(context) {
            let (old_before, new_before) = self.line_counts(0, start);
            let (old_len, new_len) = self.line_counts(start, end);
            let old_start = old_before + usize::from(old_len > 0);
            let new_start = new_before + usize::from(new_len > 0);
            out.push_str(&format!("@@ -{old_start},{old_len} +{new_start},{new_len} @@\n"));
            for op in &self.ops[start..end] {
                let (prefix, line) = match op {
                    DiffOp::Equal(line) => (' ', line),
                    DiffOp::Delete(line) => ('-', line),
                    DiffOp::Insert(line) => ('+', line),
                };
                out.push(prefix);
                out.push_str(line);
                out.push('\n');
            }
        }
        out
    }

    fn hunk_ranges(&self, context: usize) -> Vec<(usize, usize)> {
        let changes: Vec<usize> = self
            .ops
            .iter()
            .enumerate()
            .filter(|(_, op)| !matches!(op, DiffOp::Equal(_)))
            .map(|(idx, _)| idx)
            .collect();
        let mut ranges: Vec<(usize, usize)> = Vec::new();
        for idx in changes {
            let start = idx.saturating_sub(context);
            let end = (idx + 1 + context).min(self.ops.len());
            match ranges.last_mut() {
                Some(last) if start <= last.1 => last.1 = end,
                _ => ranges.push((start, end)),
            }
        }
        ranges
    }

    fn line_counts(&self, start: usize, end: usize) -> (usize, usize) {
        self.ops[start..end]
            .iter()
            .fold((0, 0), |(old, new), op| match op {
                DiffOp::Equal(_) => (old + 1, new + 1),
                DiffOp::Delete(_) => (old + 1, new),
                DiffOp::Insert(_) => (old, new + 1),
            })
    }
}

/// Diff two texts line by line (longest common subsequence).
pub fn diff_lines<'a>(old: &'a str, new: &'a str) -> LineDiff<'a> {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();

    let prefix = old_lines
        .iter()
        .zip(&new_lines)
        .take_while(|(a, b)| a == b)
        .count();
    let suffix = old_lines[prefix..]
        .iter()
        .rev()
        .zip(new_lines[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    let old_mid = &old_lines[prefix..old_lines.len() - suffix];
    let new_mid = &new_lines[prefix..new_lines.len() - suffix];

    let mut ops: Vec<DiffOp<'a>> = old_lines[..prefix].iter().copied().map(DiffOp::Equal).collect();
    if old_mid.len().saturating_mul(new_mid.len()) > MAX_LCS_CELLS {
        ops.extend(old_mid.iter().copied().map(DiffOp::Delete));
        ops.extend(new_mid.iter().copied().map(DiffOp::Insert));
    } else {
        ops.extend(lcs_ops(old_mid, new_mid));
    }
    ops.extend(
        old_lines[old_lines.len() - suffix..]
            .iter()
            .copied()
            .map(DiffOp::Equal),
    );
    LineDiff { ops }
}

fn lcs_ops<'a>(old: &[&'a str], new: &[&'a str]) -> Vec<DiffOp<'a>> {
    let (n, m) = (old.len(), new.len());
    let width = m + 1;
    // table[i * width + j] = LCS length of old[i..] and new[j..]
    let mut table = vec![0u32; (n + 1) * width];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i * width + j] = if old[i] == new[j] {
                table[(i + 1) * width + j + 1] + 1
            } else {
                table[(i + 1) * width + j].max(table[i * width + j + 1])
            };
        }
    }

    let mut ops = Vec::with_capacity(n + m);
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i] == new[j] {
            ops.push(DiffOp::Equal(old[i]));
            i += 1;
            j += 1;
        } else if table[(i + 1) * width + j] >= table[i * width + j + 1] {
            ops.push(DiffOp::Delete(old[i]));
            i += 1;
        } else {
            ops.push(DiffOp::Insert(new[j]));
            j += 1;
        }
    }
    ops.extend(old[i..].iter().copied().map(DiffOp::Delete));
    ops.extend(new[j..].iter().copied().map(DiffOp::Insert));
    ops
}
