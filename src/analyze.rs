use std::collections::HashSet;

use crate::charset::{alphabet_chars, CharSet};
use crate::node::{Graph, NodeId, NodeKind, Quant};
use crate::re::Pattern;

// The ReDoS analyzer. For every backtracking repetition in the graph it
// synthesizes candidate attack strings `prefix · pump^k · suffix` and
// confirms them empirically: a candidate counts only if the interpreter
// blows through the caller's step threshold on it. The analysis never
// reports an unconfirmed guess, and a budget abort during validation is
// exactly the evidence it is looking for.
//
// The graph walks here run on the analyzer wiring (`direct_next`,
// `sub_next`, `direct_parent`) rather than the execution edges, so the
// string pieces are assembled the way an attacker experiences the pattern.

const DEFAULT_PUMP_COUNT: usize = 7;
/// Bound on emitted copies of a `{n,}` minimum while building strings.
const MAX_REQUIRED_REPS: u32 = 4096;

/// A confirmed attack against one repetition of a pattern.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Vulnerability {
    /// Input that brings the matcher to the vulnerable repetition.
    pub prefix: String,
    /// The repeatable fragment whose count parameterizes the blowup.
    pub pump: String,
    /// Input that forces the overall match to fail after the pumps.
    pub suffix: String,
    /// The step count observed when validation tripped the threshold.
    pub steps: u64,
    /// The code point span of the offending repetition in the pattern.
    pub span: (usize, usize),
}

/// Analyzes a compiled pattern for catastrophic backtracking.
#[derive(Clone, Debug)]
pub struct Analyzer<'p> {
    pattern: &'p Pattern,
    pump_count: usize,
}

/// Convenience for [`Analyzer::run`] with the default pump count.
pub fn analyze(pattern: &Pattern, threshold: u64) -> Vec<Vulnerability> {
    Analyzer::new(pattern).run(threshold)
}

struct Candidate {
    pump: String,
    /// Cardinality of the first set the pump was derived from; smaller
    /// means a more deterministic attack.
    card: usize,
}

impl<'p> Analyzer<'p> {
    pub fn new(pattern: &'p Pattern) -> Analyzer<'p> {
        Analyzer { pattern, pump_count: DEFAULT_PUMP_COUNT }
    }

    /// Set how many copies of the pump validation uses.
    pub fn pump_count(mut self, k: usize) -> Analyzer<'p> {
        self.pump_count = k.max(1);
        self
    }

    /// Analyze the pattern against `threshold` interpreter steps. Returns
    /// one record per vulnerable repetition; an empty list means no
    /// candidate attack blew the threshold. A threshold of `0` can confirm
    /// nothing.
    pub fn run(&self, threshold: u64) -> Vec<Vulnerability> {
        let graph = self.graph();
        let mut findings: Vec<Vulnerability> = Vec::new();
        for id in 0..graph.nodes.len() {
            if !graph.wire_of(id).wired() {
                continue;
            }
            let body = match *graph.kind(id) {
                NodeKind::Curly { atom, max, mode, .. }
                    if mode != Quant::Possessive && max > 1 =>
                {
                    atom
                }
                NodeKind::GroupCurly { atom, max, mode, .. }
                    if mode != Quant::Possessive && max > 1 =>
                {
                    atom
                }
                NodeKind::Loop { body, max, .. } if max > 1 => body,
                _ => continue,
            };
            if let Some(v) = self.check_repetition(id, body, threshold) {
                // Nested repetitions often confirm with the very same
                // attack; report it once.
                let dup = findings.iter().any(|f| {
                    f.prefix == v.prefix && f.pump == v.pump && f.suffix == v.suffix
                });
                if !dup {
                    findings.push(v);
                }
            }
        }
        findings
    }

    fn graph(&self) -> &'p Graph {
        &self.pattern.graph
    }

    /// A Prolog stands in front of its loop controller; the controller is
    /// the node that carries the wiring.
    fn resolve(&self, id: NodeId) -> NodeId {
        match *self.graph().kind(id) {
            NodeKind::Prolog { loop_id } => loop_id,
            _ => id,
        }
    }

    fn check_repetition(
        &self,
        rep: NodeId,
        body: NodeId,
        threshold: u64,
    ) -> Option<Vulnerability> {
        let mut candidates = self.candidate_pumps(rep, body);
        candidates.retain(|c| !c.pump.is_empty());
        if candidates.is_empty() {
            return None;
        }
        // Prefer the shortest pump, then the most deterministic one.
        candidates.sort_by(|a, b| {
            a.pump.chars().count().cmp(&b.pump.chars().count()).then(a.card.cmp(&b.card))
        });
        candidates.dedup_by(|a, b| a.pump == b.pump);

        let prefix = self.build_prefix(rep);
        let suffix = self.build_suffix(rep, body);
        for cand in candidates {
            log::trace!(
                "repetition {:?}: trying pump {:?} with prefix {:?}, suffix {:?}",
                self.graph().span(rep),
                cand.pump,
                prefix,
                suffix,
            );
            if let Some(steps) = self.validate(&prefix, &cand.pump, &suffix, threshold) {
                log::debug!(
                    "confirmed attack on {:?}: pump {:?} at {} steps",
                    self.graph().span(rep),
                    cand.pump,
                    steps,
                );
                return Some(Vulnerability {
                    prefix,
                    pump: cand.pump,
                    suffix,
                    steps,
                    span: self.graph().span(rep),
                });
            }
        }
        None
    }

    /// Run the interpreter on the assembled attack; a budget abort confirms
    /// the candidate.
    fn validate(&self, prefix: &str, pump: &str, suffix: &str, threshold: u64) -> Option<u64> {
        let mut attack = String::with_capacity(
            prefix.len() + pump.len() * self.pump_count + suffix.len(),
        );
        attack.push_str(prefix);
        for _ in 0..self.pump_count {
            attack.push_str(pump);
        }
        attack.push_str(suffix);
        let mut m = self.pattern.matcher(&attack);
        m.set_budget(threshold);
        match m.find() {
            Err(budget) => Some(budget.steps()),
            Ok(_) => None,
        }
    }

    // ---- candidate pumps ----------------------------------------------------

    fn candidate_pumps(&self, rep: NodeId, body: NodeId) -> Vec<Candidate> {
        let mut out = Vec::new();
        // (a) Two alternation branches inside the body whose first sets
        // overlap: the single shared code point pumps the exponential
        // `(A|A)*` shape.
        for branch in self.branches_within(rep) {
            let atoms = match self.graph().branch_atoms(branch) {
                Some(atoms) => atoms.to_vec(),
                None => continue,
            };
            let firsts: Vec<Option<CharSet>> = atoms
                .iter()
                .map(|a| a.and_then(|a| self.first_set(a, &mut HashSet::new())))
                .collect();
            for i in 0..firsts.len() {
                for j in i + 1..firsts.len() {
                    let (fi, fj) = match (&firsts[i], &firsts[j]) {
                        (Some(fi), Some(fj)) => (fi, fj),
                        _ => continue,
                    };
                    let shared = fi.intersect(fj);
                    if let Some(ch) = shared.representative() {
                        out.push(Candidate { pump: ch.to_string(), card: shared.len() });
                    }
                }
            }
        }
        // (b) Strings the body itself matches, which keep the repetition
        // re-enterable: one skipping every optional atom, one taking the
        // single-width ones.
        let body_card = self
            .first_set(body, &mut HashSet::new())
            .map(|s| s.len())
            .unwrap_or(usize::MAX);
        if let Some(pump) = self.representative(body, rep, false) {
            out.push(Candidate { pump, card: body_card });
        }
        if let Some(pump) = self.representative(body, rep, true) {
            out.push(Candidate { pump, card: body_card });
        }
        out
    }

    /// Alternation nodes whose enclosing repetition is `rep`.
    fn branches_within(&self, rep: NodeId) -> Vec<NodeId> {
        let graph = self.graph();
        let mut out = Vec::new();
        for id in 0..graph.nodes.len() {
            if !matches!(*graph.kind(id), NodeKind::Branch { .. }) {
                continue;
            }
            let mut cur = graph.wire_of(id).direct_parent;
            while let Some(p) = cur {
                if p == rep {
                    out.push(id);
                    break;
                }
                cur = graph.wire_of(p).direct_parent;
            }
        }
        out
    }

    // ---- set computations ---------------------------------------------------

    /// The set of code points a consuming node can match, minus anything a
    /// negative look-ahead guarding its container rules out. `None` for
    /// non-consuming nodes.
    fn match_set(&self, id: NodeId) -> Option<CharSet> {
        let graph = self.graph();
        let base = match *graph.kind(id) {
            NodeKind::Char { ch } => CharSet::single(ch),
            NodeKind::CharI { lo, up } => {
                let mut set = CharSet::single(lo);
                set.add(up);
                set
            }
            NodeKind::CharU { folded } => {
                let mut set = CharSet::single(folded);
                set.add(crate::charset::simple_upper(folded));
                set
            }
            NodeKind::Slice { ref buf, .. } | NodeKind::BoyerMoore { ref buf, .. } => {
                CharSet::single(*buf.first()?)
            }
            NodeKind::Class(ref cls) => cls.set.clone(),
            NodeKind::LineEnding => {
                let mut set = CharSet::empty();
                set.add_range('\n', '\r').unwrap();
                set.add('\u{85}');
                set.add('\u{2028}');
                set.add('\u{2029}');
                set
            }
            _ => return None,
        };
        // Honor a negative look-ahead immediately in front of the
        // enclosing construct.
        let anchor = graph.wire_of(id).direct_parent.unwrap_or(id);
        if let Some(prev) = graph.wire_of(anchor).direct_prev {
            if let NodeKind::Neg { cond } = *graph.kind(prev) {
                if let Some(neg) = self.first_set(cond, &mut HashSet::new()) {
                    return Some(base.difference(&neg));
                }
            }
        }
        Some(base)
    }

    /// The set of code points that can begin the sub-graph at `id`: follow
    /// `sub_next` into bodies and union across alternation branches until a
    /// character-producing node is reached.
    fn first_set(&self, id: NodeId, seen: &mut HashSet<NodeId>) -> Option<CharSet> {
        let id = self.resolve(id);
        if !seen.insert(id) {
            return None;
        }
        let graph = self.graph();
        if let Some(set) = self.match_set(id) {
            return Some(set);
        }
        if let Some(sub) = graph.wire_of(id).sub_next {
            return self.first_set(sub, seen);
        }
        if let Some(atoms) = graph.branch_atoms(id) {
            let mut out = CharSet::empty();
            for atom in atoms.to_vec().into_iter().flatten() {
                if let Some(set) = self.first_set(atom, seen) {
                    out = out.union(&set);
                }
            }
            return Some(out);
        }
        if let Some(next) = graph.wire_of(id).direct_next {
            return self.first_set(next, seen);
        }
        None
    }

    /// Union of the first sets reachable along the continuation chain from
    /// `start`, stopping at the first required consumer. Deliberately a
    /// superset: a too-large follow set only narrows the suffix choice.
    fn follow_first(&self, start: NodeId) -> CharSet {
        let graph = self.graph();
        let mut out = CharSet::empty();
        let mut seen = HashSet::new();
        let mut cur = Some(start);
        while let Some(id) = cur {
            let id = self.resolve(id);
            if !seen.insert(id) {
                break;
            }
            if let Some(set) = self.match_set(id) {
                out = out.union(&set);
                break;
            }
            match *graph.kind(id) {
                NodeKind::Ques { atom, .. } => {
                    if let Some(set) = self.first_set(atom, &mut HashSet::new()) {
                        out = out.union(&set);
                    }
                }
                NodeKind::Curly { atom, min, .. } | NodeKind::GroupCurly { atom, min, .. } => {
                    if let Some(set) = self.first_set(atom, &mut HashSet::new()) {
                        out = out.union(&set);
                    }
                    if min > 0 {
                        break;
                    }
                }
                NodeKind::Loop { body, min, .. } => {
                    if let Some(set) = self.first_set(body, &mut HashSet::new()) {
                        out = out.union(&set);
                    }
                    if min > 0 {
                        break;
                    }
                }
                NodeKind::Branch { .. } => {
                    if let Some(set) = self.first_set(id, &mut HashSet::new()) {
                        out = out.union(&set);
                    }
                }
                _ => {}
            }
            cur = graph.wire_of(id).direct_next;
        }
        out
    }

    // ---- attack string assembly ---------------------------------------------

    /// Walk the direct chain from the pattern start to the repetition,
    /// emitting one representative for every required consuming node and
    /// descending into whatever contains the repetition.
    fn build_prefix(&self, rep: NodeId) -> String {
        let graph = self.graph();
        let mut ancestors = HashSet::new();
        let mut cur = Some(rep);
        while let Some(id) = cur {
            ancestors.insert(id);
            cur = graph.wire_of(id).direct_parent;
        }

        let mut out = String::new();
        let mut seen = HashSet::new();
        let mut cur = Some(graph.match_root);
        while let Some(id) = cur {
            let id = self.resolve(id);
            if id == rep {
                return out;
            }
            if !seen.insert(id) {
                break;
            }
            if ancestors.contains(&id) {
                cur = match *graph.kind(id) {
                    NodeKind::Branch { ref atoms, .. } => atoms
                        .iter()
                        .flatten()
                        .copied()
                        .find(|&a| self.chain_reaches(a, &ancestors)),
                    _ => graph.wire_of(id).sub_next,
                };
                continue;
            }
            match *graph.kind(id) {
                NodeKind::Curly { atom, min, .. }
                | NodeKind::GroupCurly { atom, min, .. } => {
                    if min > 0 {
                        if let Some(one) = self.representative(atom, id, false) {
                            for _ in 0..min.min(MAX_REQUIRED_REPS) {
                                out.push_str(&one);
                            }
                        }
                    }
                }
                NodeKind::Loop { body, min, .. } => {
                    if min > 0 {
                        if let Some(one) = self.representative(body, id, false) {
                            for _ in 0..min.min(MAX_REQUIRED_REPS) {
                                out.push_str(&one);
                            }
                        }
                    }
                }
                NodeKind::Branch { .. } => {
                    if let Some(piece) = self.branch_text(id, false) {
                        out.push_str(&piece);
                    }
                }
                _ => {
                    if let Some(piece) = self.node_text(id) {
                        out.push_str(&piece);
                    }
                }
            }
            cur = graph.wire_of(id).direct_next;
        }
        out
    }

    /// The shortest string matched by one alternative of a branch; an empty
    /// alternative contributes the empty string.
    fn branch_text(&self, id: NodeId, take_optionals: bool) -> Option<String> {
        let atoms = self.graph().branch_atoms(id)?.to_vec();
        let mut best: Option<String> = None;
        for atom in atoms {
            let piece = match atom {
                None => Some(String::new()),
                Some(a) => self.representative(a, id, take_optionals),
            };
            if let Some(piece) = piece {
                let better = match best {
                    None => true,
                    Some(ref b) => piece.chars().count() < b.chars().count(),
                };
                if better {
                    best = Some(piece);
                }
            }
        }
        best
    }

    fn chain_reaches(&self, start: NodeId, targets: &HashSet<NodeId>) -> bool {
        let graph = self.graph();
        let mut seen = HashSet::new();
        let mut cur = Some(start);
        while let Some(id) = cur {
            let id = self.resolve(id);
            if targets.contains(&id) {
                return true;
            }
            if !seen.insert(id) {
                break;
            }
            cur = graph.wire_of(id).direct_next;
        }
        false
    }

    /// A character that cannot legally continue the match after the last
    /// pump: neither re-entering the repetition body nor satisfying the
    /// continuation. Falls back to a line-break-and-backspace tail that no
    /// sensible continuation accepts when the whole alphabet is taken.
    fn build_suffix(&self, rep: NodeId, body: NodeId) -> String {
        let graph = self.graph();
        let mut follow = CharSet::empty();
        if let Some(set) = self.first_set(body, &mut HashSet::new()) {
            follow = follow.union(&set);
        }
        if let Some(next) = graph.wire_of(rep).direct_next {
            follow = follow.union(&self.follow_first(next));
        }
        for &ch in alphabet_chars() {
            if !follow.contains(ch) {
                return ch.to_string();
            }
        }
        "\n\u{8}\n".to_string()
    }

    /// The literal text of one consuming node: the full run for slices, the
    /// representative member for everything else. `None` for non-consuming
    /// nodes.
    fn node_text(&self, id: NodeId) -> Option<String> {
        let graph = self.graph();
        match *graph.kind(id) {
            NodeKind::Slice { ref buf, .. } | NodeKind::BoyerMoore { ref buf, .. } => {
                Some(buf.iter().collect())
            }
            NodeKind::Char { ch } => Some(ch.to_string()),
            NodeKind::CharI { lo, .. } => Some(lo.to_string()),
            NodeKind::CharU { folded } => Some(folded.to_string()),
            NodeKind::Class(ref cls) => cls.set.representative().map(|c| c.to_string()),
            NodeKind::LineEnding => Some("\n".to_string()),
            _ => None,
        }
    }

    /// A string matched by the chain starting at `start` (a repetition body
    /// or a branch), stopping at `stop`. With `take_optionals` set,
    /// optional atoms whose own representative is a single code point are
    /// included, which finds pumps like `" /a"` hiding behind an optional
    /// leading character.
    fn representative(
        &self,
        start: NodeId,
        stop: NodeId,
        take_optionals: bool,
    ) -> Option<String> {
        let graph = self.graph();
        let mut out = String::new();
        let mut seen = HashSet::new();
        let mut cur = Some(start);
        while let Some(id) = cur {
            let id = self.resolve(id);
            if id == stop && id != start {
                break;
            }
            if !seen.insert(id) {
                break;
            }
            match *graph.kind(id) {
                NodeKind::Accept | NodeKind::LastAccept | NodeKind::BehindEnd => break,
                NodeKind::Ques { atom, .. } => {
                    if take_optionals {
                        if let Some(s) = self.representative(atom, id, false) {
                            if s.chars().count() == 1 {
                                out.push_str(&s);
                            }
                        }
                    }
                }
                NodeKind::Curly { atom, min, .. }
                | NodeKind::GroupCurly { atom, min, .. } => {
                    if min > 0 {
                        let one = self.representative(atom, id, take_optionals)?;
                        for _ in 0..min.min(MAX_REQUIRED_REPS) {
                            out.push_str(&one);
                        }
                    } else if take_optionals {
                        if let Some(s) = self.representative(atom, id, false) {
                            if s.chars().count() == 1 {
                                out.push_str(&s);
                            }
                        }
                    }
                }
                NodeKind::Loop { body, min, .. } => {
                    if min > 0 {
                        let one = self.representative(body, id, take_optionals)?;
                        for _ in 0..min.min(MAX_REQUIRED_REPS) {
                            out.push_str(&one);
                        }
                    }
                }
                NodeKind::Branch { .. } => {
                    out.push_str(&self.branch_text(id, take_optionals)?);
                }
                _ => {
                    if let Some(piece) = self.node_text(id) {
                        out.push_str(&piece);
                    }
                }
            }
            cur = graph.wire_of(id).direct_next;
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::re::Pattern;

    const THRESHOLD: u64 = 50_000;

    fn findings(pattern: &str) -> Vec<Vulnerability> {
        let p = Pattern::new(pattern).unwrap();
        Analyzer::new(&p).pump_count(16).run(THRESHOLD)
    }

    #[test]
    fn nested_plus_is_vulnerable() {
        let found = findings("^(a+)+$");
        assert_eq!(found.len(), 1, "got {:?}", found);
        let v = &found[0];
        assert_eq!(v.pump, "a");
        assert!(v.prefix.is_empty());
        assert!(!v.suffix.contains('a'));
        assert!(v.steps >= THRESHOLD);
    }

    #[test]
    fn overlapping_alternation_is_vulnerable() {
        let found = findings("^(a|a)+$");
        assert_eq!(found.len(), 1, "got {:?}", found);
        assert_eq!(found[0].pump, "a");
        assert!(!found[0].suffix.contains('a'));
    }

    #[test]
    fn linear_patterns_are_clean() {
        for p in ["a+", "a*b", "a{3,5}c", "(?>a*)b", "a*+b", "ab?c"] {
            assert!(findings(p).is_empty(), "false positive on {}", p);
        }
    }

    #[test]
    fn atomic_wrapper_is_clean() {
        assert!(findings("(?>a+)+").is_empty());
    }

    #[test]
    fn nested_star_is_vulnerable() {
        let found = findings("^(a*)+$");
        assert!(!found.is_empty());
        assert_eq!(found[0].pump, "a");
    }

    #[test]
    fn finding_span_points_at_repetition() {
        let pattern = "^(a+)+$";
        let found = findings(pattern);
        let (b, e) = found[0].span;
        assert!(b < e);
        assert!(e <= pattern.chars().count());
    }

    #[test]
    fn batch_for_loop_pattern_is_vulnerable() {
        // A real-world Windows batch highlighting pattern; the pump is a
        // flag-like fragment of the nested optional group.
        let pattern = r#"((?:^|[&(])[ \t]*)for(?: ?/[a-z?](?:[ :](?:"[^"]*"|\S+))?)* \S+ in \([^)]+\) do"#;
        let found = findings(pattern);
        assert!(!found.is_empty());
        assert!(found.iter().any(|v| v.pump.contains('/')), "got {:?}", found);
    }

    #[test]
    fn possessive_variants_are_clean() {
        for p in ["^(a++)+$", "^(?:a+)++$", "^a*+b$"] {
            let p = Pattern::new(p).unwrap();
            let found = Analyzer::new(&p).pump_count(16).run(THRESHOLD);
            assert!(found.is_empty(), "false positive on {}", p.as_str());
        }
    }

    #[test]
    fn pump_count_is_configurable() {
        let p = Pattern::new("^(a+)+$").unwrap();
        let a = Analyzer::new(&p);
        assert_eq!(a.pump_count, DEFAULT_PUMP_COUNT);
        let a = a.pump_count(3);
        assert_eq!(a.pump_count, 3);
    }

    #[test]
    fn zero_threshold_confirms_nothing() {
        let p = Pattern::new("^(a+)+$").unwrap();
        assert!(Analyzer::new(&p).run(0).is_empty());
    }
}
