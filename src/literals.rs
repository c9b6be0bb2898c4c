use aho_corasick::{AhoCorasick, MatchKind};
use memchr::memchr;

use crate::node::{Graph, NodeId, NodeKind, Quant};

// Extraction of literal prefix information from the match graph, used by the
// unanchored starter to skip positions that cannot begin a match. The
// searcher is byte oriented and therefore only consulted on ASCII haystacks,
// where byte offsets and code point offsets coincide; the extraction
// correspondingly collects the set of ASCII characters a match can start
// with, under that same assumption about the input.
//
// Completeness is what makes skipping sound: the collected set must be a
// superset of the true start set. Whenever a node makes that questionable (a
// back-reference, a huge class, a non-ASCII literal) the builder gives up
// and the starter falls back to trying every position.

const MAX_START_CHARS: usize = 32;

/// Where the starter may continue scanning.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Candidate {
    /// No position at or after the requested one can begin a match.
    None,
    /// The next plausible starting position.
    At(usize),
    /// No usable prefix information; the caller scans linearly.
    Unknown,
}

/// The prefix searcher compiled for one pattern.
#[derive(Clone, Debug)]
pub(crate) struct Prefixes {
    searcher: Searcher,
}

#[derive(Clone, Debug)]
enum Searcher {
    /// No usable prefix set was extracted.
    Unknown,
    /// The pattern cannot match any ASCII character at all.
    Impossible,
    /// A single possible start byte.
    Byte(u8),
    /// Several possible start bytes.
    Multi(AhoCorasick),
}

impl Prefixes {
    pub(crate) fn build(graph: &Graph) -> Prefixes {
        let searcher = match BuildPrefixes::new(graph).start_chars() {
            None => Searcher::Unknown,
            Some(chars) if chars.is_empty() => Searcher::Impossible,
            Some(chars) if chars.len() == 1 => Searcher::Byte(chars[0] as u8),
            Some(chars) => {
                let patterns: Vec<[u8; 1]> = chars.iter().map(|&c| [c as u8]).collect();
                match AhoCorasick::builder()
                    .match_kind(MatchKind::LeftmostFirst)
                    .build(&patterns)
                {
                    Ok(ac) => Searcher::Multi(ac),
                    Err(_) => Searcher::Unknown,
                }
            }
        };
        log::debug!("prefix searcher: {}", searcher_kind(&searcher));
        Prefixes { searcher }
    }

    /// The next position at or after `at` where a match could begin.
    pub(crate) fn find_candidate(&self, haystack: &[u8], at: usize) -> Candidate {
        let tail = match haystack.get(at..) {
            Some(tail) => tail,
            None => return Candidate::None,
        };
        match self.searcher {
            Searcher::Unknown => Candidate::Unknown,
            Searcher::Impossible => Candidate::None,
            Searcher::Byte(b) => match memchr(b, tail) {
                Some(off) => Candidate::At(at + off),
                None => Candidate::None,
            },
            Searcher::Multi(ref ac) => match ac.find(tail) {
                Some(m) => Candidate::At(at + m.start()),
                None => Candidate::None,
            },
        }
    }
}

fn searcher_kind(s: &Searcher) -> &'static str {
    match s {
        Searcher::Unknown => "unknown",
        Searcher::Impossible => "impossible",
        Searcher::Byte(_) => "byte",
        Searcher::Multi(_) => "multi",
    }
}

/// Walks the graph from the match root collecting possible starting
/// characters. `None` means the walk hit something it cannot see through.
struct BuildPrefixes<'g> {
    graph: &'g Graph,
    visited: Vec<bool>,
}

impl<'g> BuildPrefixes<'g> {
    fn new(graph: &'g Graph) -> BuildPrefixes<'g> {
        BuildPrefixes { graph, visited: vec![false; graph.nodes.len()] }
    }

    fn start_chars(mut self) -> Option<Vec<char>> {
        let mut chars = Vec::new();
        if !self.collect(self.graph.match_root, &mut chars) {
            return None;
        }
        chars.sort_unstable();
        chars.dedup();
        if chars.len() > MAX_START_CHARS {
            return None;
        }
        Some(chars)
    }

    /// Accumulate the ASCII start characters of the sub-graph at `id` into
    /// `chars`. Returns false to give up entirely.
    fn collect(&mut self, id: NodeId, chars: &mut Vec<char>) -> bool {
        if self.visited[id] {
            return true;
        }
        self.visited[id] = true;
        let g = self.graph;
        match *g.kind(id) {
            // Matching can stop here, so any position is a candidate.
            NodeKind::Accept | NodeKind::LastAccept => false,
            NodeKind::BehindEnd | NodeKind::BranchConn => true,
            NodeKind::Char { ch } => {
                if ch.is_ascii() {
                    chars.push(ch);
                }
                true
            }
            NodeKind::CharI { lo, up } => {
                if lo.is_ascii() {
                    chars.push(lo);
                }
                if up.is_ascii() {
                    chars.push(up);
                }
                true
            }
            NodeKind::CharU { folded } => {
                // On an ASCII haystack only the ASCII pre-images matter.
                if folded.is_ascii() {
                    chars.push(folded);
                    chars.push(folded.to_ascii_uppercase());
                }
                true
            }
            NodeKind::Slice { ref buf, fold } => {
                let first = match buf.first() {
                    Some(&c) => c,
                    None => return self.collect(g.next(id), chars),
                };
                if first.is_ascii() {
                    chars.push(first);
                    if fold != crate::node::Fold::None {
                        chars.push(first.to_ascii_uppercase());
                    }
                }
                true
            }
            NodeKind::BoyerMoore { ref buf, .. } => {
                if let Some(&c) = buf.first() {
                    if c.is_ascii() {
                        chars.push(c);
                    }
                }
                true
            }
            NodeKind::Class(ref cls) => {
                let mut count = 0;
                for cp in 0u32..0x80 {
                    let ch = char::from_u32(cp).unwrap();
                    if cls.contains(ch) {
                        chars.push(ch);
                        count += 1;
                        if count > MAX_START_CHARS {
                            return false;
                        }
                    }
                }
                true
            }
            NodeKind::LineEnding => {
                chars.extend(['\n', '\x0B', '\x0C', '\r']);
                true
            }
            // Zero-width nodes are skipped; the set stays a superset.
            NodeKind::Begin
            | NodeKind::End
            | NodeKind::Caret
            | NodeKind::UnixCaret
            | NodeKind::Dollar { .. }
            | NodeKind::UnixDollar { .. }
            | NodeKind::LastMatch
            | NodeKind::Bound { .. }
            | NodeKind::Pos { .. }
            | NodeKind::Neg { .. }
            | NodeKind::Behind { .. }
            | NodeKind::GroupHead { .. }
            | NodeKind::GroupTail { .. } => self.collect(g.next(id), chars),
            NodeKind::Start { .. } => self.collect(g.next(id), chars),
            // The referenced text is unknown at build time.
            NodeKind::BackRef { .. } | NodeKind::GroupRef { .. } => false,
            NodeKind::Ques { atom, mode } => {
                if !self.collect(atom, chars) {
                    return false;
                }
                if mode == Quant::Independent {
                    return true;
                }
                self.collect(g.next(id), chars)
            }
            NodeKind::Curly { atom, min, .. } => {
                if !self.collect(atom, chars) {
                    return false;
                }
                if min == 0 {
                    return self.collect(g.next(id), chars);
                }
                true
            }
            NodeKind::GroupCurly { atom, min, .. } => {
                if !self.collect(atom, chars) {
                    return false;
                }
                if min == 0 {
                    return self.collect(g.next(id), chars);
                }
                true
            }
            NodeKind::Prolog { loop_id } => self.collect(loop_id, chars),
            NodeKind::Loop { body, min, .. } => {
                if !self.collect(body, chars) {
                    return false;
                }
                if min == 0 {
                    return self.collect(g.next(id), chars);
                }
                true
            }
            NodeKind::Branch { ref atoms, conn } => {
                for atom in atoms.clone() {
                    let ok = match atom {
                        Some(a) => self.collect(a, chars),
                        None => self.collect(g.next(conn), chars),
                    };
                    if !ok {
                        return false;
                    }
                }
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::charset::StdPropertyOracle;
    use crate::parse::parse;
    use crate::re::Flags;

    fn prefixes(pattern: &str) -> Prefixes {
        let graph = parse(pattern, Flags::empty(), &StdPropertyOracle).unwrap();
        Prefixes::build(&graph)
    }

    #[test]
    fn single_byte_prefix() {
        let p = prefixes("xyz+");
        assert_eq!(p.find_candidate(b"aaaxyzzz", 0), Candidate::At(3));
        assert_eq!(p.find_candidate(b"aaaa", 0), Candidate::None);
    }

    #[test]
    fn alternation_prefix() {
        let p = prefixes("foo|bar");
        assert_eq!(p.find_candidate(b"zzbark", 0), Candidate::At(2));
        assert_eq!(p.find_candidate(b"zzfoo", 0), Candidate::At(2));
        assert_eq!(p.find_candidate(b"zzz", 0), Candidate::None);
    }

    #[test]
    fn optional_head_includes_continuation() {
        let p = prefixes("a?b");
        assert_eq!(p.find_candidate(b"zzzb", 0), Candidate::At(3));
        assert_eq!(p.find_candidate(b"zzab", 0), Candidate::At(2));
    }

    #[test]
    fn reachable_backref_gives_up() {
        let p = prefixes(r"(x)?\1y");
        assert_eq!(p.find_candidate(b"anything", 0), Candidate::Unknown);
    }

    #[test]
    fn guarded_backref_keeps_group_prefix() {
        // The backref is always preceded by the group, so the start set is
        // just the group's.
        let p = prefixes(r"(x)\1");
        assert_eq!(p.find_candidate(b"aaxx", 0), Candidate::At(2));
    }

    #[test]
    fn wide_class_gives_up() {
        let p = prefixes("[^x]y");
        assert_eq!(p.find_candidate(b"anything", 0), Candidate::Unknown);
    }

    #[test]
    fn offset_search() {
        let p = prefixes("ab");
        assert_eq!(p.find_candidate(b"ab ab", 1), Candidate::At(3));
        assert_eq!(p.find_candidate(b"ab", 5), Candidate::None);
    }
}
