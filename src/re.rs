use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};
use std::sync::Arc;

use crate::charset::{PropertyOracle, StdPropertyOracle};
use crate::error::Error;
use crate::literals::Prefixes;
use crate::matcher::{Match, Matcher};
use crate::node::Graph;
use crate::parse;

/// Match flags, combinable with `|`. The bit values are stable, so a mask
/// produced elsewhere round-trips through [`Flags::from_bits`].
///
/// Flags may also be set inline in the pattern with `(?idmsuxU)` or scoped
/// with `(?flags:...)`; inline flags override this mask from their position
/// onward.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Flags(u32);

impl Flags {
    /// `\n` is the only line terminator for `.`, `^` and `$`.
    pub const UNIX_LINES: Flags = Flags(0x01);
    /// Case-insensitive matching (ASCII unless [`Flags::UNICODE_CASE`]).
    pub const CASE_INSENSITIVE: Flags = Flags(0x02);
    /// Whitespace and `#` comments in the pattern are ignored.
    pub const COMMENTS: Flags = Flags(0x04);
    /// `^` and `$` match at line boundaries.
    pub const MULTILINE: Flags = Flags(0x08);
    /// The whole pattern is one literal string.
    pub const LITERAL: Flags = Flags(0x10);
    /// `.` matches line terminators too.
    pub const DOTALL: Flags = Flags(0x20);
    /// Unicode simple case folding instead of ASCII folding.
    pub const UNICODE_CASE: Flags = Flags(0x40);
    /// Canonical equivalence. Recognized in the mask but unsupported:
    /// compiling with it set fails.
    pub const CANON_EQ: Flags = Flags(0x80);
    /// `\d`, `\s`, `\w` and POSIX classes use Unicode definitions. Implies
    /// [`Flags::UNICODE_CASE`].
    pub const UNICODE_CLASS: Flags = Flags(0x100);

    /// No flags set.
    pub fn empty() -> Flags {
        Flags(0)
    }

    /// The raw bit mask.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Rebuild a mask from raw bits; unknown bits are ignored.
    pub fn from_bits(bits: u32) -> Flags {
        Flags(bits & 0x1FF)
    }

    /// Whether every flag in `other` is set in `self`.
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Flags;
    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Flags {
    type Output = Flags;
    fn bitand(self, rhs: Flags) -> Flags {
        Flags(self.0 & rhs.0)
    }
}

impl BitAndAssign for Flags {
    fn bitand_assign(&mut self, rhs: Flags) {
        self.0 &= rhs.0;
    }
}

impl Not for Flags {
    type Output = Flags;
    fn not(self) -> Flags {
        Flags(!self.0)
    }
}

/// A compiled pattern: the immutable match graph plus its group metadata
/// and literal prefix accelerator.
///
/// A `Pattern` may be shared freely across threads; all mutable match state
/// lives in the [`Matcher`] values it hands out.
#[derive(Clone, Debug)]
pub struct Pattern {
    pattern: String,
    flags: Flags,
    pub(crate) graph: Graph,
    pub(crate) prefixes: Prefixes,
}

impl Pattern {
    /// Compile `pattern` with no flags.
    pub fn new(pattern: &str) -> Result<Pattern, Error> {
        Pattern::with_flags(pattern, Flags::empty())
    }

    /// Compile `pattern` with the given flags.
    pub fn with_flags(pattern: &str, flags: Flags) -> Result<Pattern, Error> {
        PatternBuilder::new().flags(flags).build(pattern)
    }

    /// A builder for configuring flags and the property oracle.
    pub fn builder() -> PatternBuilder {
        PatternBuilder::new()
    }

    /// The pattern text this value was compiled from.
    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    /// The flags the pattern was compiled with.
    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// The number of capturing groups, not counting group 0.
    pub fn group_count(&self) -> usize {
        self.graph.group_count - 1
    }

    /// The index of a named capturing group.
    pub fn group_index(&self, name: &str) -> Option<usize> {
        self.graph.named_groups.get(name).copied()
    }

    /// Create a matcher over `text`. The matcher owns all per-call state,
    /// including the step counter and its budget.
    pub fn matcher<'p, 't>(&'p self, text: &'t str) -> Matcher<'p, 't> {
        Matcher::new(self, text)
    }

    /// Whether the whole of `text` matches this pattern.
    pub fn matches(&self, text: &str) -> bool {
        self.matcher(text).matches().unwrap_or(false)
    }

    /// Whether any substring of `text` matches.
    pub fn is_match(&self, text: &str) -> bool {
        self.find(text).is_some()
    }

    /// The first match in `text`.
    pub fn find<'t>(&self, text: &'t str) -> Option<Match<'t>> {
        self.matcher(text).find().unwrap_or(None)
    }

    /// An iterator over all non-overlapping matches in `text`.
    pub fn find_iter<'p, 't>(&'p self, text: &'t str) -> Matches<'p, 't> {
        Matches { matcher: self.matcher(text), done: false }
    }

    /// An iterator over the substrings of `text` between matches.
    pub fn split<'p, 't>(&'p self, text: &'t str) -> Split<'p, 't> {
        Split { matches: self.find_iter(text), text, last: 0, done: false }
    }

    /// Like [`Pattern::split`], but yields at most `limit` pieces; the last
    /// piece is the unsplit remainder.
    pub fn splitn<'p, 't>(&'p self, text: &'t str, limit: usize) -> SplitN<'p, 't> {
        SplitN { split: self.split(text), remaining: limit }
    }

    /// Replace the first match in `text` with `replacement` (taken
    /// literally).
    pub fn replace(&self, text: &str, replacement: &str) -> String {
        match self.find(text) {
            None => text.to_string(),
            Some(m) => {
                let mut out = String::with_capacity(text.len());
                out.push_str(&text[..m.start()]);
                out.push_str(replacement);
                out.push_str(&text[m.end()..]);
                out
            }
        }
    }

    /// Replace every match in `text` with `replacement` (taken literally).
    pub fn replace_all(&self, text: &str, replacement: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for m in self.find_iter(text) {
            out.push_str(&text[last..m.start()]);
            out.push_str(replacement);
            last = m.end();
        }
        out.push_str(&text[last..]);
        out
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.pattern)
    }
}

/// Configures and compiles patterns.
#[derive(Clone, Debug)]
pub struct PatternBuilder {
    flags: Flags,
    oracle: Arc<dyn PropertyOracle>,
}

impl PatternBuilder {
    pub fn new() -> PatternBuilder {
        PatternBuilder { flags: Flags::empty(), oracle: Arc::new(StdPropertyOracle) }
    }

    /// Set the whole flag mask.
    pub fn flags(mut self, flags: Flags) -> PatternBuilder {
        self.flags = flags;
        self
    }

    /// Supply the oracle that resolves `\p{...}` property names. The
    /// default knows POSIX class names and the categories expressible with
    /// `std` character classification.
    pub fn property_oracle(mut self, oracle: Arc<dyn PropertyOracle>) -> PatternBuilder {
        self.oracle = oracle;
        self
    }

    /// Compile `pattern` with this configuration.
    pub fn build(&self, pattern: &str) -> Result<Pattern, Error> {
        let mut flags = self.flags;
        if flags.contains(Flags::UNICODE_CLASS) {
            flags |= Flags::UNICODE_CASE;
        }
        let graph = parse::parse(pattern, flags, &*self.oracle)?;
        let prefixes = Prefixes::build(&graph);
        Ok(Pattern { pattern: pattern.to_string(), flags, graph, prefixes })
    }
}

impl Default for PatternBuilder {
    fn default() -> PatternBuilder {
        PatternBuilder::new()
    }
}

/// Iterator over non-overlapping matches.
#[derive(Debug)]
pub struct Matches<'p, 't> {
    matcher: Matcher<'p, 't>,
    done: bool,
}

impl<'p, 't> Iterator for Matches<'p, 't> {
    type Item = Match<'t>;

    fn next(&mut self) -> Option<Match<'t>> {
        if self.done {
            return None;
        }
        match self.matcher.find() {
            Ok(Some(m)) => Some(m),
            _ => {
                self.done = true;
                None
            }
        }
    }
}

/// Iterator over the substrings between matches.
#[derive(Debug)]
pub struct Split<'p, 't> {
    matches: Matches<'p, 't>,
    text: &'t str,
    last: usize,
    done: bool,
}

impl<'p, 't> Iterator for Split<'p, 't> {
    type Item = &'t str;

    fn next(&mut self) -> Option<&'t str> {
        if self.done {
            return None;
        }
        match self.matches.next() {
            None => {
                self.done = true;
                Some(&self.text[self.last..])
            }
            Some(m) => {
                let piece = &self.text[self.last..m.start()];
                self.last = m.end();
                Some(piece)
            }
        }
    }
}

/// Iterator over at most `limit` split pieces.
#[derive(Debug)]
pub struct SplitN<'p, 't> {
    split: Split<'p, 't>,
    remaining: usize,
}

impl<'p, 't> Iterator for SplitN<'p, 't> {
    type Item = &'t str;

    fn next(&mut self) -> Option<&'t str> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        if self.remaining == 0 {
            // Yield the unsplit remainder.
            if self.split.done {
                return None;
            }
            let rest = &self.split.text[self.split.last..];
            self.split.done = true;
            return Some(rest);
        }
        self.split.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_mask_round_trips() {
        let mask = Flags::CASE_INSENSITIVE | Flags::MULTILINE;
        assert_eq!(Flags::from_bits(mask.bits()), mask);
        assert!(mask.contains(Flags::MULTILINE));
        assert!(!mask.contains(Flags::DOTALL));
    }

    #[test]
    fn split_round_trips_with_matches() {
        let re = Pattern::new(r"[0-9]+").unwrap();
        let text = "cauchy123plato456tyler789binx";
        let pieces: Vec<&str> = re.split(text).collect();
        assert_eq!(pieces, vec!["cauchy", "plato", "tyler", "binx"]);

        let seps: Vec<&str> = re.find_iter(text).map(|m| m.as_str()).collect();
        let mut rebuilt = String::new();
        for (i, piece) in pieces.iter().enumerate() {
            rebuilt.push_str(piece);
            if let Some(sep) = seps.get(i) {
                rebuilt.push_str(sep);
            }
        }
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn splitn_keeps_remainder() {
        let re = Pattern::new(r"[0-9]+").unwrap();
        let text = "cauchy123plato456tyler789binx";
        let pieces: Vec<&str> = re.splitn(text, 2).collect();
        assert_eq!(pieces, vec!["cauchy", "plato456tyler789binx"]);
    }

    #[test]
    fn replace_first_and_all() {
        let re = Pattern::new("cat").unwrap();
        assert_eq!(re.replace("cat cat", "dog"), "dog cat");
        assert_eq!(re.replace_all("cat cat", "dog"), "dog dog");
        assert_eq!(re.replace_all("bird", "dog"), "bird");
    }

    #[test]
    fn empty_pattern_empty_input() {
        let re = Pattern::new("").unwrap();
        let ms: Vec<_> = re.find_iter("").map(|m| (m.start(), m.end())).collect();
        assert_eq!(ms, vec![(0, 0)]);
    }

    #[test]
    fn named_group_lookup() {
        let re = Pattern::new("(?<word>[a-z]+)").unwrap();
        assert_eq!(re.group_index("word"), Some(1));
        assert_eq!(re.group_index("nope"), None);
        let mut m = re.matcher("hello");
        assert!(m.find().unwrap().is_some());
        assert_eq!(m.named_group("word"), Some((0, 5)));
    }

    #[test]
    fn matches_requires_whole_input() {
        let re = Pattern::new("a+").unwrap();
        assert!(re.matches("aaa"));
        assert!(!re.matches("aaab"));
        assert!(re.is_match("aaab"));
    }
}
