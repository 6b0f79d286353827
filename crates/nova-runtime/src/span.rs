//! Source location tracking and span utilities

use serde::{Deserialize, Serialize};

/// A half-open region of source text, in character offsets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    /// Starting offset
    pub start: usize,
    /// Ending offset (exclusive)
    pub end: usize,
}

impl Span {
    /// Create a new span
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Create a zero-width span for synthesized tokens
    pub fn dummy() -> Self {
        Self { start: 0, end: 0 }
    }

    /// Number of characters covered
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    /// Whether the span covers no characters
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Combine two spans into one encompassing span
    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_len() {
        assert_eq!(Span::new(2, 7).len(), 5);
        assert!(Span::dummy().is_empty());
    }

    #[test]
    fn test_span_merge() {
        let merged = Span::new(0, 5).merge(Span::new(3, 10));
        assert_eq!(merged, Span::new(0, 10));
    }
}
