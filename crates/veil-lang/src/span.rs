//! Byte ranges into policy source text.

use std::ops::Range;

/// Half-open byte range `[start, end)` in a policy body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Span running from the start of `self` to the end of `other`,
    /// whichever order they appear in.
    pub fn to(self, other: Span) -> Span {
        Span::new(self.start.min(other.start), self.end.max(other.end))
    }

    /// Zero-width span where this one stops. Used to point past the last
    /// token when input runs out.
    pub fn end_point(self) -> Span {
        Span::new(self.end, self.end)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }
}

impl From<Range<usize>> for Span {
    fn from(range: Range<usize>) -> Self {
        Span::new(range.start, range.end)
    }
}

/// A parsed piece of source together with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned<T> {
    pub value: T,
    pub span: Span,
}

impl<T> Spanned<T> {
    pub fn new(value: T, span: Span) -> Self {
        Self { value, span }
    }
}

/// 1-based line and column (in characters) of a byte offset. Offsets past
/// the end clamp to the end of the text.
pub fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let mut cut = offset.min(source.len());
    while !source.is_char_boundary(cut) {
        cut -= 1;
    }
    let before = &source[..cut];
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map_or(0, |i| i + 1);
    (line, before[line_start..].chars().count() + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_to() {
        let joined = Span::new(8, 15).to(Span::new(5, 10));
        assert_eq!(joined, Span::new(5, 15));
        assert_eq!(joined.range(), 5..15);
        assert!(joined.end_point().is_empty());
    }

    #[test]
    fn test_line_col() {
        let source = "CASE\n  WHEN x\nEND";
        assert_eq!(line_col(source, 0), (1, 1));
        assert_eq!(line_col(source, 4), (1, 5));
        assert_eq!(line_col(source, 5), (2, 1));
        assert_eq!(line_col(source, 14), (3, 1));
        assert_eq!(line_col(source, 999), (3, 4));
    }

    #[test]
    fn test_line_col_counts_characters() {
        assert_eq!(line_col("'é' x", 5), (1, 5));
    }
}
