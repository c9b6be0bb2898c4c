use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::charset::{full_alphabet, CharPredicate, CharSet};

/// NodeId is the index of a node in a graph's arena.
///
/// Cycles (a repetition body's tail pointing back at its loop controller)
/// are plain indices, so the graph drops as one unit and no reference
/// counting is involved.
pub(crate) type NodeId = usize;

/// Slot 0 of every graph: the sub-expression accept sentinel.
pub(crate) const ACCEPT: NodeId = 0;
/// Slot 1: the whole-match accept sentinel, end-anchor aware.
pub(crate) const LAST_ACCEPT: NodeId = 1;
/// Slot 2: the position marker terminating look-behind sub-graphs.
pub(crate) const BEHIND_END: NodeId = 2;

/// Quantifier mode. `Independent` is the mode of `(?>...)` groups, which
/// behave like possessive `{1,1}`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Quant {
    Greedy,
    Lazy,
    Possessive,
    Independent,
}

/// Case-folding mode for literal runs and back-references.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Fold {
    None,
    Ascii,
    Unicode,
}

/// Word-boundary mode bits: `\b` is `BOTH`, `\B` is `NONE`.
pub(crate) mod bound {
    pub(crate) const LEFT: u8 = 0x1;
    pub(crate) const RIGHT: u8 = 0x2;
    pub(crate) const BOTH: u8 = 0x3;
    pub(crate) const NONE: u8 = 0x4;
}

/// One node of the match graph.
#[derive(Clone, Debug)]
pub(crate) struct Node {
    pub(crate) kind: NodeKind,
    /// The successor attempted after this node accepts. Defaults to the
    /// `ACCEPT` sentinel.
    pub(crate) next: NodeId,
    /// The span of the pattern (in code points, after quote expansion) that
    /// produced this node.
    pub(crate) span: (usize, usize),
}

#[derive(Clone, Debug)]
pub(crate) enum NodeKind {
    /// Accepts a sub-expression and records where it ended.
    Accept,
    /// Accepts the whole match; in anchored mode only at the region end.
    LastAccept,
    /// Matches exactly at the position a look-behind started from.
    BehindEnd,
    /// Unanchored starter: tries `next` at every position up to
    /// `to - min_length`.
    Start { min_length: usize },
    /// `\A`, or `^` outside multiline mode.
    Begin,
    /// `\z`.
    End,
    /// Multiline `^`.
    Caret,
    /// Multiline `^` under `UNIX_LINES`.
    UnixCaret,
    /// `$` and `\Z`.
    Dollar { multiline: bool },
    /// `$` and `\Z` under `UNIX_LINES`.
    UnixDollar { multiline: bool },
    /// `\G`.
    LastMatch,
    /// `\b` and `\B`, with the mode bits above.
    Bound { kind: u8, unicode: bool },
    /// `\R`: any Unicode line ending, treating `\r\n` as one.
    LineEnding,
    /// A single code point.
    Char { ch: char },
    /// A single code point, ASCII case-insensitive.
    CharI { lo: char, up: char },
    /// A single code point under Unicode simple folding.
    CharU { folded: char },
    /// A character class; see [`ClassNode`].
    Class(Box<ClassNode>),
    /// A literal run compared in one shot. Case-insensitive runs store
    /// their buffer pre-folded.
    Slice { buf: Box<[char]>, fold: Fold },
    /// A literal run searched with Boyer-Moore shift tables. Only ever the
    /// leading node of an unanchored pattern.
    BoyerMoore { buf: Box<[char]>, last_occ: Box<[i32]>, good_suffix: Box<[i32]> },
    /// Saves the group entry position in a local slot.
    GroupHead { local: usize },
    /// Commits a capture on the way out of a group.
    GroupTail { local: usize, group: usize },
    /// Recursive re-entry into a group's sub-graph (used by `GroupCurly`
    /// deoptimization of recursive constructs).
    GroupRef { head: NodeId },
    /// `\N` and `\k<name>`.
    BackRef { group: usize, fold: Fold },
    /// `X?` over a single atom.
    Ques { atom: NodeId, mode: Quant },
    /// Bounded repetition over a deterministic, non-capturing atom.
    Curly { atom: NodeId, min: u32, max: u32, mode: Quant },
    /// Bounded repetition over a deterministic capturing group body.
    GroupCurly {
        atom: NodeId,
        min: u32,
        max: u32,
        mode: Quant,
        local: usize,
        group: usize,
        capture: bool,
    },
    /// Seeds the counter of a non-deterministic loop.
    Prolog { loop_id: NodeId },
    /// Controller of a non-deterministic repetition; the body's tail points
    /// back here.
    Loop {
        body: NodeId,
        count_local: usize,
        begin_local: usize,
        min: u32,
        max: u32,
        lazy: bool,
    },
    /// Alternation. `None` atoms stand for an empty branch.
    Branch { atoms: Vec<Option<NodeId>>, conn: NodeId },
    /// Guard at the tail of each branch atom, so studying an atom stops
    /// before the common continuation.
    BranchConn,
    /// `(?=...)`.
    Pos { cond: NodeId },
    /// `(?!...)`.
    Neg { cond: NodeId },
    /// `(?<=...)` and `(?<!...)`, with statically bounded scan range.
    Behind { cond: NodeId, rmin: usize, rmax: usize, negate: bool },
}

/// A character class node: a membership expression for matching plus an
/// eagerly materialized member set for the analyzer.
#[derive(Clone, Debug)]
pub(crate) struct ClassNode {
    pub(crate) expr: ClassExpr,
    /// Members visible to the analyzer: exact for explicit sets, bounded by
    /// the fixed alphabet for categorical ones. Computed once at compile
    /// time so the graph stays immutable afterwards.
    pub(crate) set: CharSet,
}

impl ClassNode {
    pub(crate) fn new(expr: ClassExpr) -> ClassNode {
        let set = expr.enumerate();
        ClassNode { expr, set }
    }

    #[inline]
    pub(crate) fn contains(&self, ch: char) -> bool {
        self.expr.contains(ch)
    }
}

/// A class membership expression. Set operations never mutate their
/// operands; the parser combines sub-expressions bottom-up and collapses
/// explicit sets eagerly.
#[derive(Clone)]
pub(crate) enum ClassExpr {
    /// An explicit set of code points.
    Set(CharSet),
    /// A case-insensitive range: folding is applied to the probe, not the
    /// range, so wide ranges stay cheap.
    FoldRange { lo: char, hi: char, unicode: bool },
    /// A named categorical predicate from the property oracle.
    Prop { name: Box<str>, pred: Arc<dyn CharPredicate> },
    /// `.` outside dotall mode.
    Dot,
    /// `.` under `UNIX_LINES`.
    UnixDot,
    /// `.` in dotall mode, and `\p{all}`.
    All,
    Union(Box<ClassExpr>, Box<ClassExpr>),
    Intersect(Box<ClassExpr>, Box<ClassExpr>),
    /// Members of the left operand not in the right; class negation inside
    /// `[...]` builds on this.
    Difference(Box<ClassExpr>, Box<ClassExpr>),
    Complement(Box<ClassExpr>),
}

impl fmt::Debug for ClassExpr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ClassExpr::Set(ref set) => f.debug_tuple("Set").field(&set.len()).finish(),
            ClassExpr::FoldRange { lo, hi, unicode } => f
                .debug_struct("FoldRange")
                .field("lo", &lo)
                .field("hi", &hi)
                .field("unicode", &unicode)
                .finish(),
            ClassExpr::Prop { ref name, .. } => {
                f.debug_struct("Prop").field("name", name).finish()
            }
            ClassExpr::Dot => write!(f, "Dot"),
            ClassExpr::UnixDot => write!(f, "UnixDot"),
            ClassExpr::All => write!(f, "All"),
            ClassExpr::Union(ref a, ref b) => f.debug_tuple("Union").field(a).field(b).finish(),
            ClassExpr::Intersect(ref a, ref b) => {
                f.debug_tuple("Intersect").field(a).field(b).finish()
            }
            ClassExpr::Difference(ref a, ref b) => {
                f.debug_tuple("Difference").field(a).field(b).finish()
            }
            ClassExpr::Complement(ref a) => f.debug_tuple("Complement").field(a).finish(),
        }
    }
}

impl ClassExpr {
    pub(crate) fn contains(&self, ch: char) -> bool {
        match *self {
            ClassExpr::Set(ref set) => set.contains(ch),
            ClassExpr::FoldRange { lo, hi, unicode } => {
                let in_range = |c: char| lo <= c && c <= hi;
                if in_range(ch) {
                    return true;
                }
                if unicode {
                    let up = crate::charset::simple_upper(ch);
                    in_range(up) || in_range(crate::charset::simple_fold(ch))
                } else {
                    ch.is_ascii()
                        && (in_range(ch.to_ascii_uppercase())
                            || in_range(ch.to_ascii_lowercase()))
                }
            }
            ClassExpr::Prop { ref pred, .. } => pred.contains(ch),
            ClassExpr::Dot => {
                ch != '\n' && ch != '\r' && (ch as u32 | 1) != 0x2029 && ch != '\u{85}'
            }
            ClassExpr::UnixDot => ch != '\n',
            ClassExpr::All => true,
            ClassExpr::Union(ref a, ref b) => a.contains(ch) || b.contains(ch),
            ClassExpr::Intersect(ref a, ref b) => a.contains(ch) && b.contains(ch),
            ClassExpr::Difference(ref a, ref b) => a.contains(ch) && !b.contains(ch),
            ClassExpr::Complement(ref a) => !a.contains(ch),
        }
    }

    /// Materialize the members this expression can match, exactly for
    /// explicit sets and bounded by the fixed alphabet otherwise.
    pub(crate) fn enumerate(&self) -> CharSet {
        match *self {
            ClassExpr::Set(ref set) => set.clone(),
            ClassExpr::FoldRange { lo, hi, .. } => {
                let mut set = filter_alphabet(|ch| self.contains(ch));
                if set.is_empty() {
                    // The range lives outside the fixed alphabet; enumerate
                    // it directly when that is tractable.
                    if u32::from(hi) - u32::from(lo) <= 0x100 {
                        for cp in u32::from(lo)..=u32::from(hi) {
                            if let Some(ch) = char::from_u32(cp) {
                                set.add(ch);
                            }
                        }
                    } else {
                        set.set_complemented(true);
                        set.set_default_char(lo);
                    }
                }
                set
            }
            ClassExpr::Prop { ref pred, .. } => pred.enumerate(full_alphabet()),
            ClassExpr::Dot | ClassExpr::UnixDot | ClassExpr::All => {
                let mut set = filter_alphabet(|ch| self.contains(ch));
                set.set_default_char('0');
                set
            }
            ClassExpr::Union(ref a, ref b) => a.enumerate().union(&b.enumerate()),
            ClassExpr::Intersect(ref a, ref b) => a.enumerate().intersect(&b.enumerate()),
            ClassExpr::Difference(ref a, ref b) => a.enumerate().difference(&b.enumerate()),
            ClassExpr::Complement(ref a) => {
                let mut set = full_alphabet().difference(&a.enumerate());
                if set.is_empty() {
                    set.set_complemented(true);
                    set.set_default_char('0');
                }
                set
            }
        }
    }
}

fn filter_alphabet<F: Fn(char) -> bool>(f: F) -> CharSet {
    let mut set = CharSet::empty();
    for ch in full_alphabet().iter() {
        if f(ch) {
            set.add(ch);
        }
    }
    set
}

/// Analyzer wiring for one node: a second linking of the graph following
/// the control path an attacker traverses, built by a single post-parse
/// pass. `direct_next` runs along concatenations, `sub_next` descends into
/// repetition and lookaround bodies.
#[derive(Clone, Debug, Default)]
pub(crate) struct Wire {
    pub(crate) direct_next: Option<NodeId>,
    pub(crate) sub_next: Option<NodeId>,
    pub(crate) direct_prev: Option<NodeId>,
    pub(crate) direct_parent: Option<NodeId>,
    wired: bool,
}

impl Wire {
    /// Whether the wiring pass reached this node from the match root.
    pub(crate) fn wired(&self) -> bool {
        self.wired
    }
}

/// The compiled match graph: an arena of nodes plus group metadata and the
/// analyzer wiring. Immutable once built.
#[derive(Clone)]
pub(crate) struct Graph {
    pub(crate) nodes: Vec<Node>,
    /// Entry node for unanchored searching.
    pub(crate) root: NodeId,
    /// Entry node for anchored matching, also where the direct chain
    /// starts.
    pub(crate) match_root: NodeId,
    /// Number of capturing groups, counting group 0 (the whole match).
    pub(crate) group_count: usize,
    /// Number of local scratch slots the matcher must allocate.
    pub(crate) local_count: usize,
    pub(crate) named_groups: HashMap<String, usize>,
    pub(crate) wiring: Vec<Wire>,
}

impl Graph {
    pub(crate) fn new() -> Graph {
        let mut graph = Graph {
            nodes: Vec::new(),
            root: ACCEPT,
            match_root: ACCEPT,
            group_count: 1,
            local_count: 0,
            named_groups: HashMap::new(),
            wiring: Vec::new(),
        };
        graph.add(NodeKind::Accept, (0, 0));
        graph.add(NodeKind::LastAccept, (0, 0));
        graph.add(NodeKind::BehindEnd, (0, 0));
        graph
    }

    pub(crate) fn add(&mut self, kind: NodeKind, span: (usize, usize)) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node { kind, next: ACCEPT, span });
        id
    }

    pub(crate) fn set_next(&mut self, id: NodeId, next: NodeId) {
        self.nodes[id].next = next;
    }

    #[inline]
    pub(crate) fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id].kind
    }

    #[inline]
    pub(crate) fn next(&self, id: NodeId) -> NodeId {
        self.nodes[id].next
    }

    pub(crate) fn span(&self, id: NodeId) -> (usize, usize) {
        self.nodes[id].span
    }

    pub(crate) fn wire_of(&self, id: NodeId) -> &Wire {
        &self.wiring[id]
    }

    /// Run the study pass from `id`, accumulating lengths and determinism
    /// into `info`. Mirrors the recursion structure of matching: repetition
    /// bodies are studied in isolation and loop controllers terminate the
    /// walk so cycles cost nothing.
    pub(crate) fn study(&self, id: NodeId, info: &mut TreeInfo) -> bool {
        match self.nodes[id].kind {
            NodeKind::Accept | NodeKind::LastAccept | NodeKind::BehindEnd => info.deterministic,
            NodeKind::BranchConn => info.deterministic,
            NodeKind::Start { .. } => {
                self.study(self.next(id), info);
                info.max_valid = false;
                info.deterministic = false;
                false
            }
            NodeKind::Begin
            | NodeKind::End
            | NodeKind::Caret
            | NodeKind::UnixCaret
            | NodeKind::LastMatch
            | NodeKind::Bound { .. }
            | NodeKind::GroupHead { .. }
            | NodeKind::GroupTail { .. }
            | NodeKind::Pos { .. }
            | NodeKind::Neg { .. }
            | NodeKind::Behind { .. } => self.study(self.next(id), info),
            NodeKind::Dollar { .. } | NodeKind::UnixDollar { .. } => {
                self.study(self.next(id), info);
                info.deterministic
            }
            NodeKind::LineEnding => {
                info.min_length += 1;
                info.max_length += 2;
                self.study(self.next(id), info)
            }
            NodeKind::Char { .. }
            | NodeKind::CharI { .. }
            | NodeKind::CharU { .. }
            | NodeKind::Class(_) => {
                info.min_length += 1;
                info.max_length += 1;
                self.study(self.next(id), info)
            }
            NodeKind::Slice { ref buf, .. } => {
                info.min_length += buf.len();
                info.max_length += buf.len();
                self.study(self.next(id), info)
            }
            NodeKind::BoyerMoore { ref buf, .. } => {
                info.min_length += buf.len();
                info.max_valid = false;
                self.study(self.next(id), info)
            }
            NodeKind::GroupRef { .. } => {
                info.max_valid = false;
                info.deterministic = false;
                self.study(self.next(id), info)
            }
            NodeKind::BackRef { .. } => {
                info.max_valid = false;
                self.study(self.next(id), info)
            }
            NodeKind::Ques { atom, mode } => {
                if mode == Quant::Independent {
                    self.study(atom, info);
                } else {
                    let min = info.min_length;
                    self.study(atom, info);
                    info.min_length = min;
                    info.deterministic = false;
                }
                self.study(self.next(id), info)
            }
            NodeKind::Curly { atom, min, max, .. }
            | NodeKind::GroupCurly { atom, min, max, .. } => {
                let saved = info.clone();
                info.reset();
                self.study(atom, info);

                let min_total = info
                    .min_length
                    .saturating_mul(min as usize)
                    .saturating_add(saved.min_length);
                info.min_length = min_total.min(0xFFF_FFFF);

                if saved.max_valid && info.max_valid {
                    match info
                        .max_length
                        .checked_mul(max as usize)
                        .and_then(|n| n.checked_add(saved.max_length))
                    {
                        Some(n) if n < 0xFFF_FFFF => info.max_length = n,
                        _ => info.max_valid = false,
                    }
                } else {
                    info.max_valid = false;
                }

                if info.deterministic && min == max {
                    info.deterministic = saved.deterministic;
                } else {
                    info.deterministic = false;
                }
                self.study(self.next(id), info)
            }
            NodeKind::Prolog { loop_id } => self.study(loop_id, info),
            NodeKind::Loop { .. } => {
                info.max_valid = false;
                info.deterministic = false;
                false
            }
            NodeKind::Branch { ref atoms, conn } => {
                let min0 = info.min_length;
                let max0 = info.max_length;
                let mut max_valid = info.max_valid;

                let mut branch_min = usize::MAX;
                let mut branch_max = 0usize;
                for atom in atoms.iter() {
                    info.reset();
                    if let Some(atom) = *atom {
                        self.study(atom, info);
                    }
                    branch_min = branch_min.min(info.min_length);
                    branch_max = branch_max.max(info.max_length);
                    max_valid = max_valid && info.max_valid;
                }

                info.reset();
                self.study(self.next(conn), info);
                info.min_length = info.min_length.saturating_add(min0.saturating_add(branch_min));
                info.max_length = info.max_length.saturating_add(max0.saturating_add(branch_max));
                info.max_valid = info.max_valid && max_valid;
                info.deterministic = false;
                false
            }
        }
    }

    /// The post-parse wiring pass: set `direct_next`, `sub_next`,
    /// `direct_prev` and `direct_parent` on every node so the analyzer can
    /// walk the pattern the way the attacker experiences it.
    pub(crate) fn wire(&mut self) {
        self.wiring = vec![Wire::default(); self.nodes.len()];
        let root = self.match_root;
        self.wire_chain(root, None);
        log::debug!("wired {} nodes", self.nodes.len());
    }

    fn wire_chain(&mut self, start: NodeId, parent: Option<NodeId>) {
        let mut prev: Option<NodeId> = None;
        let mut cur = start;
        loop {
            // A Prolog stands in front of its loop; the loop controller is
            // the node the analyzer wants in the chain.
            if let NodeKind::Prolog { loop_id } = self.nodes[cur].kind {
                self.wiring[cur].wired = true;
                self.wiring[cur].direct_parent = parent;
                cur = loop_id;
            }
            match self.nodes[cur].kind {
                NodeKind::Accept | NodeKind::LastAccept | NodeKind::BehindEnd
                | NodeKind::BranchConn => break,
                _ => {}
            }
            if self.wiring[cur].wired {
                // Reached a loop controller from its own body tail.
                break;
            }
            self.wiring[cur].wired = true;
            self.wiring[cur].direct_parent = parent;
            if let Some(p) = prev {
                self.wiring[p].direct_next = Some(cur);
                self.wiring[cur].direct_prev = Some(p);
            }

            match self.nodes[cur].kind.clone() {
                NodeKind::Ques { atom, .. }
                | NodeKind::Curly { atom, .. }
                | NodeKind::GroupCurly { atom, .. } => {
                    self.wiring[cur].sub_next = Some(atom);
                    self.wire_chain(atom, Some(cur));
                }
                NodeKind::Loop { body, .. } => {
                    self.wiring[cur].sub_next = Some(body);
                    self.wire_chain(body, Some(cur));
                }
                NodeKind::Branch { ref atoms, .. } => {
                    for atom in atoms.iter().flatten() {
                        self.wire_chain(*atom, Some(cur));
                    }
                }
                NodeKind::Pos { cond } | NodeKind::Neg { cond } | NodeKind::Behind { cond, .. } => {
                    self.wiring[cur].sub_next = Some(cond);
                    self.wire_chain(cond, Some(cur));
                }
                _ => {}
            }

            prev = Some(cur);
            cur = match self.nodes[cur].kind {
                NodeKind::Branch { conn, .. } => self.next(conn),
                _ => self.next(cur),
            };
        }
    }

    /// The branch atoms of an alternation, for first-set unions.
    pub(crate) fn branch_atoms(&self, id: NodeId) -> Option<&[Option<NodeId>]> {
        match self.nodes[id].kind {
            NodeKind::Branch { ref atoms, .. } => Some(atoms),
            _ => None,
        }
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "--------------------------------")?;
        for (id, node) in self.nodes.iter().enumerate() {
            let next = if node.next == ACCEPT { String::new() } else {
                format!(" (next: {})", node.next)
            };
            writeln!(f, "{:04} {:?}{}", id, node.kind, next)?;
        }
        writeln!(f, "root: {}, match_root: {}", self.root, self.match_root)?;
        write!(f, "--------------------------------")
    }
}

/// Accumulator for the study pass.
#[derive(Clone, Debug)]
pub(crate) struct TreeInfo {
    pub(crate) min_length: usize,
    pub(crate) max_length: usize,
    /// False once any construct with no obvious maximum (a loop, a
    /// back-reference) was seen; look-behind compilation requires true.
    pub(crate) max_valid: bool,
    /// False once matching may have to choose between alternatives.
    pub(crate) deterministic: bool,
}

impl TreeInfo {
    pub(crate) fn new() -> TreeInfo {
        TreeInfo { min_length: 0, max_length: 0, max_valid: true, deterministic: true }
    }

    pub(crate) fn reset(&mut self) {
        *self = TreeInfo::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_expr_dot() {
        assert!(ClassExpr::Dot.contains('a'));
        assert!(!ClassExpr::Dot.contains('\n'));
        assert!(!ClassExpr::Dot.contains('\u{2028}'));
        assert!(ClassExpr::UnixDot.contains('\r'));
        assert!(!ClassExpr::UnixDot.contains('\n'));
    }

    #[test]
    fn class_expr_fold_range() {
        let expr = ClassExpr::FoldRange { lo: 'a', hi: 'f', unicode: false };
        assert!(expr.contains('c'));
        assert!(expr.contains('C'));
        assert!(!expr.contains('g'));
        assert!(!expr.contains('G'));
    }

    #[test]
    fn class_expr_difference() {
        let all = ClassExpr::Set(CharSet::from_ranges([('a', 'z')]).unwrap());
        let vowels = ClassExpr::Set(CharSet::from_ranges([('a', 'a'), ('e', 'e')]).unwrap());
        let consonants = ClassExpr::Difference(Box::new(all), Box::new(vowels));
        assert!(consonants.contains('b'));
        assert!(!consonants.contains('e'));
        let set = consonants.enumerate();
        assert_eq!(set.len(), 24);
    }

    #[test]
    fn complement_enumerates_against_alphabet() {
        let not_a = ClassExpr::Complement(Box::new(ClassExpr::Set(CharSet::single('a'))));
        let set = not_a.enumerate();
        assert!(!set.contains('a'));
        assert!(set.contains('b'));
        assert!(set.contains('!'));
    }
}
