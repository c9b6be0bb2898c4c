use crate::charset::{simple_fold, simple_upper};
use crate::error::BudgetExceeded;
use crate::node::{bound, Fold, NodeId, NodeKind, Quant};
use crate::re::Pattern;

// The recursive backtracking interpreter. Each node kind matches itself at a
// position and, on success, recurses into its successor; failure unwinds any
// state the node changed. The one mutation that survives a failed attempt is
// the step counter: every node match is logged against the budget, and
// exhausting the budget aborts the whole call tree with `BudgetExceeded`.
//
// All positions are code point indices into the decoded input. A sub-graph
// reports where it stopped through `last`, the way a return value would.

/// How the terminal accept node treats the region end.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum AcceptMode {
    NoAnchor,
    EndAnchor,
}

/// A matcher bound to one pattern and one input.
///
/// The matcher owns all per-call scratch state: region bounds, group slots,
/// loop counters, the step counter and its budget. It is deliberately not
/// shared; concurrent matches each build their own.
#[derive(Clone, Debug)]
pub struct Matcher<'p, 't> {
    pattern: &'p Pattern,
    text: &'t str,
    /// The input decoded to code points, indexed directly.
    chars: Vec<char>,
    /// Byte offset of each code point, plus the final length, for mapping
    /// match positions back into `text`.
    byte_pos: Vec<usize>,
    ascii: bool,

    from: usize,
    to: usize,
    first: isize,
    last: isize,
    old_last: isize,
    /// Group slots: `[start, end]` per group, `-1` when unset.
    groups: Vec<isize>,
    /// Scratch for loop counters and group entry positions.
    locals: Vec<isize>,
    hit_end: bool,
    require_end: bool,
    lookbehind_to: usize,
    accept_mode: AcceptMode,

    steps: u64,
    budget: u64,
    trace: Option<Vec<(NodeId, usize)>>,
}

/// A successful match: byte offsets into the haystack.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Match<'t> {
    haystack: &'t str,
    start: usize,
    end: usize,
}

impl<'t> Match<'t> {
    /// The starting byte offset of the match.
    pub fn start(&self) -> usize {
        self.start
    }

    /// The ending byte offset of the match (exclusive).
    pub fn end(&self) -> usize {
        self.end
    }

    /// The matched text.
    pub fn as_str(&self) -> &'t str {
        &self.haystack[self.start..self.end]
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl<'p, 't> Matcher<'p, 't> {
    pub(crate) fn new(pattern: &'p Pattern, text: &'t str) -> Matcher<'p, 't> {
        let chars: Vec<char> = text.chars().collect();
        let mut byte_pos = Vec::with_capacity(chars.len() + 1);
        for (off, _) in text.char_indices() {
            byte_pos.push(off);
        }
        byte_pos.push(text.len());
        let to = chars.len();
        let graph = &pattern.graph;
        Matcher {
            pattern,
            text,
            ascii: text.is_ascii(),
            chars,
            byte_pos,
            from: 0,
            to,
            first: -1,
            last: -1,
            old_last: -1,
            groups: vec![-1; graph.group_count.max(10) * 2],
            locals: vec![-1; graph.local_count.max(1)],
            hit_end: false,
            require_end: false,
            lookbehind_to: 0,
            accept_mode: AcceptMode::NoAnchor,
            steps: 0,
            budget: 0,
            trace: None,
        }
    }

    /// Set the step budget. `0` means unlimited.
    pub fn set_budget(&mut self, steps: u64) {
        self.budget = steps;
    }

    /// The number of interpreter steps taken so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// True if the search hit the end of input; more input might change the
    /// result.
    pub fn hit_end(&self) -> bool {
        self.hit_end
    }

    /// True if more input could turn this match into a non-match.
    pub fn require_end(&self) -> bool {
        self.require_end
    }

    /// Record `(node id, position)` pairs for every interpreter step. The
    /// node ids index the compiled graph and are mainly useful for
    /// eyeballing where a pathological match spends its time.
    pub fn enable_trace(&mut self) {
        self.trace = Some(Vec::new());
    }

    /// Take the trace recorded since [`Matcher::enable_trace`], leaving
    /// tracing off.
    pub fn take_trace(&mut self) -> Vec<(usize, usize)> {
        self.trace.take().unwrap_or_default()
    }

    /// Reset all match state, keeping the budget configuration.
    pub fn reset(&mut self) {
        self.first = -1;
        self.last = -1;
        self.old_last = -1;
        self.groups.fill(-1);
        self.locals.fill(-1);
        self.hit_end = false;
        self.require_end = false;
        self.steps = 0;
    }

    /// Anchored match: succeeds only if the whole input is consumed.
    pub fn matches(&mut self) -> Result<bool, BudgetExceeded> {
        self.enter(AcceptMode::EndAnchor);
        let root = self.pattern.graph.match_root;
        let from = self.from;
        self.first = from as isize;
        let ok = self.run(root, from)?;
        if ok {
            self.old_last = self.last;
        } else {
            self.first = -1;
        }
        Ok(ok)
    }

    /// Find the next match at or after the end of the previous one.
    pub fn find(&mut self) -> Result<Option<Match<'t>>, BudgetExceeded> {
        let mut next_at = if self.last < 0 { 0 } else { self.last as usize };
        // A zero-length previous match must advance or find would loop.
        if self.last >= 0 && self.first == self.last {
            next_at += 1;
        }
        if next_at > self.to {
            self.first = -1;
            return Ok(None);
        }
        self.find_at(next_at)
    }

    /// Find the first match at or after `at` (a code point index).
    pub(crate) fn find_at(&mut self, at: usize) -> Result<Option<Match<'t>>, BudgetExceeded> {
        self.enter(AcceptMode::NoAnchor);
        if self.old_last < 0 {
            self.old_last = at as isize;
        }
        let root = self.pattern.graph.root;
        let ok = self.run(root, at)?;
        if !ok {
            self.first = -1;
            return Ok(None);
        }
        self.old_last = self.last;
        Ok(Some(Match {
            haystack: self.text,
            start: self.byte_pos[self.first as usize],
            end: self.byte_pos[self.last as usize],
        }))
    }

    /// The span of capture group `group` from the last match, as byte
    /// offsets.
    pub fn group(&self, group: usize) -> Option<(usize, usize)> {
        if self.first < 0 || 2 * group + 1 >= self.groups.len() {
            return None;
        }
        let (s, e) = (self.groups[2 * group], self.groups[2 * group + 1]);
        if s < 0 || e < 0 {
            return None;
        }
        Some((self.byte_pos[s as usize], self.byte_pos[e as usize]))
    }

    /// The text of capture group `group` from the last match.
    pub fn group_str(&self, group: usize) -> Option<&'t str> {
        self.group(group).map(|(s, e)| &self.text[s..e])
    }

    /// Look up a capture group by name.
    pub fn named_group(&self, name: &str) -> Option<(usize, usize)> {
        let idx = *self.pattern.graph.named_groups.get(name)?;
        self.group(idx)
    }

    fn enter(&mut self, mode: AcceptMode) {
        let old_last = self.old_last;
        self.reset_for_attempt();
        self.old_last = old_last;
        self.accept_mode = mode;
    }

    fn reset_for_attempt(&mut self) {
        self.groups.fill(-1);
        self.locals.fill(-1);
        self.hit_end = false;
        self.require_end = false;
        self.first = -1;
        self.last = -1;
    }

    // ---- the interpreter ----------------------------------------------------

    #[inline]
    fn log(&mut self, id: NodeId, i: usize) -> Result<(), BudgetExceeded> {
        self.steps += 1;
        if let Some(ref mut trace) = self.trace {
            trace.push((id, i));
        }
        if self.budget != 0 && self.steps > self.budget {
            return Err(BudgetExceeded::new(self.steps));
        }
        Ok(())
    }

    fn run(&mut self, id: NodeId, i: usize) -> Result<bool, BudgetExceeded> {
        self.log(id, i)?;
        let pat: &'p Pattern = self.pattern;
        let g = &pat.graph;
        let next = g.next(id);
        match g.kind(id) {
            NodeKind::Accept => {
                self.last = i as isize;
                self.groups[0] = self.first;
                self.groups[1] = self.last;
                Ok(true)
            }
            NodeKind::LastAccept => {
                if self.accept_mode == AcceptMode::EndAnchor && i != self.to {
                    return Ok(false);
                }
                self.last = i as isize;
                self.groups[0] = self.first;
                self.groups[1] = self.last;
                Ok(true)
            }
            NodeKind::BehindEnd => Ok(i == self.lookbehind_to),
            NodeKind::Start { min_length } => {
                let min_length = *min_length;
                if i + min_length > self.to {
                    self.hit_end = true;
                    return Ok(false);
                }
                let guard = self.to - min_length;
                let mut at = i;
                loop {
                    at = match self.candidate_at(at, guard) {
                        Some(at) => at,
                        None => {
                            self.hit_end = true;
                            return Ok(false);
                        }
                    };
                    if self.run(next, at)? {
                        self.first = at as isize;
                        self.groups[0] = self.first;
                        self.groups[1] = self.last;
                        return Ok(true);
                    }
                    if at >= guard {
                        self.hit_end = true;
                        return Ok(false);
                    }
                    at += 1;
                }
            }
            NodeKind::Begin => {
                if i == self.from && self.run(next, i)? {
                    self.first = i as isize;
                    self.groups[0] = self.first;
                    self.groups[1] = self.last;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            NodeKind::End => {
                if i == self.to {
                    self.hit_end = true;
                    return self.run(next, i);
                }
                Ok(false)
            }
            NodeKind::Caret => {
                if i == self.to {
                    self.hit_end = true;
                    return Ok(false);
                }
                if i > self.from {
                    let ch = self.chars[i - 1];
                    if ch != '\n' && ch != '\r' && (ch as u32 | 1) != 0x2029 && ch != '\u{85}' {
                        return Ok(false);
                    }
                    // \r\n is one line terminator.
                    if ch == '\r' && self.chars[i] == '\n' {
                        return Ok(false);
                    }
                }
                self.run(next, i)
            }
            NodeKind::UnixCaret => {
                if i == self.to {
                    self.hit_end = true;
                    return Ok(false);
                }
                if i > self.from && self.chars[i - 1] != '\n' {
                    return Ok(false);
                }
                self.run(next, i)
            }
            NodeKind::Dollar { multiline } => {
                let multiline = *multiline;
                let end = self.to;
                if !multiline {
                    if i + 2 < end {
                        return Ok(false);
                    }
                    if i + 2 == end
                        && (self.chars[i] != '\r' || self.chars[i + 1] != '\n')
                    {
                        return Ok(false);
                    }
                }
                if i < end {
                    let ch = self.chars[i];
                    if ch == '\n' {
                        if i > 0 && self.chars[i - 1] == '\r' {
                            return Ok(false);
                        }
                        if multiline {
                            return self.run(next, i);
                        }
                    } else if ch == '\r' || ch == '\u{85}' || (ch as u32 | 1) == 0x2029 {
                        if multiline {
                            return self.run(next, i);
                        }
                    } else {
                        return Ok(false);
                    }
                }
                self.hit_end = true;
                self.require_end = true;
                self.run(next, i)
            }
            NodeKind::UnixDollar { multiline } => {
                let multiline = *multiline;
                let end = self.to;
                if i < end {
                    let ch = self.chars[i];
                    if ch == '\n' {
                        if !multiline && i != end - 1 {
                            return Ok(false);
                        }
                        if multiline {
                            return self.run(next, i);
                        }
                    } else {
                        return Ok(false);
                    }
                }
                self.hit_end = true;
                self.require_end = true;
                self.run(next, i)
            }
            NodeKind::LastMatch => {
                if i as isize != self.old_last {
                    return Ok(false);
                }
                self.run(next, i)
            }
            NodeKind::Bound { kind, .. } => {
                let kind = *kind;
                // Both the classic and the property-based word definitions
                // come down to letter-or-digit-or-underscore with std
                // classification.
                let is_word = |ch: char| ch == '_' || ch.is_alphanumeric();
                let mut left = false;
                if i > self.from {
                    left = is_word(self.chars[i - 1]);
                }
                let mut right = false;
                if i < self.to {
                    right = is_word(self.chars[i]);
                } else {
                    self.hit_end = true;
                    self.require_end = true;
                }
                let got = if left ^ right {
                    if right {
                        bound::LEFT
                    } else {
                        bound::RIGHT
                    }
                } else {
                    bound::NONE
                };
                if got & kind != 0 {
                    self.run(next, i)
                } else {
                    Ok(false)
                }
            }
            NodeKind::LineEnding => {
                if i < self.to {
                    let ch = self.chars[i] as u32;
                    if ch == 0x0A || ch == 0x0B || ch == 0x0C || ch == 0x85 || ch == 0x2028
                        || ch == 0x2029
                    {
                        return self.run(next, i + 1);
                    }
                    if ch == 0x0D {
                        let mut at = i + 1;
                        if at < self.to && self.chars[at] == '\n' {
                            at += 1;
                        }
                        return self.run(next, at);
                    }
                } else {
                    self.hit_end = true;
                }
                Ok(false)
            }
            NodeKind::Char { ch } => {
                let ch = *ch;
                if i < self.to {
                    if self.chars[i] == ch {
                        return self.run(next, i + 1);
                    }
                    return Ok(false);
                }
                self.hit_end = true;
                Ok(false)
            }
            NodeKind::CharI { lo, up } => {
                let (lo, up) = (*lo, *up);
                if i < self.to {
                    let c = self.chars[i];
                    if c == lo || c == up {
                        return self.run(next, i + 1);
                    }
                    return Ok(false);
                }
                self.hit_end = true;
                Ok(false)
            }
            NodeKind::CharU { folded } => {
                let folded = *folded;
                if i < self.to {
                    let c = self.chars[i];
                    if c == folded || simple_fold(c) == folded {
                        return self.run(next, i + 1);
                    }
                    return Ok(false);
                }
                self.hit_end = true;
                Ok(false)
            }
            NodeKind::Class(cls) => {
                if i < self.to {
                    if cls.contains(self.chars[i]) {
                        return self.run(next, i + 1);
                    }
                    return Ok(false);
                }
                self.hit_end = true;
                Ok(false)
            }
            NodeKind::Slice { buf, fold } => {
                let fold = *fold;
                for (j, &pc) in buf.iter().enumerate() {
                    if i + j >= self.to {
                        self.hit_end = true;
                        return Ok(false);
                    }
                    let c = self.chars[i + j];
                    let ok = match fold {
                        Fold::None => pc == c,
                        Fold::Ascii => pc == c || pc == c.to_ascii_lowercase(),
                        Fold::Unicode => pc == c || pc == simple_fold(c),
                    };
                    if !ok {
                        return Ok(false);
                    }
                }
                let len = buf.len();
                self.run(next, i + len)
            }
            NodeKind::BoyerMoore { buf, last_occ, good_suffix } => {
                let n = buf.len();
                if self.to < n + i {
                    self.hit_end = true;
                    return Ok(false);
                }
                let last = self.to - n;
                let mut at = i;
                'search: while at <= last {
                    let mut j = n;
                    while j > 0 {
                        j -= 1;
                        let ch = self.chars[at + j];
                        if ch != buf[j] {
                            let bad = j as i32 + 1 - last_occ[(ch as u32 & 0x7F) as usize];
                            at += bad.max(good_suffix[j]) as usize;
                            continue 'search;
                        }
                    }
                    self.first = at as isize;
                    if self.run(next, at + n)? {
                        self.first = at as isize;
                        self.groups[0] = self.first;
                        self.groups[1] = self.last;
                        return Ok(true);
                    }
                    at += 1;
                }
                // The leading literal searches to the end itself, so a miss
                // means the end was hit.
                self.hit_end = true;
                Ok(false)
            }
            NodeKind::GroupHead { local } => {
                let local = *local;
                let save = self.locals[local];
                self.locals[local] = i as isize;
                let ret = self.run(next, i)?;
                self.locals[local] = save;
                Ok(ret)
            }
            NodeKind::GroupTail { local, group } => {
                let (local, group) = (*local, *group);
                let tmp = self.locals[local];
                if tmp >= 0 {
                    // The normal group case: commit the capture, undo it if
                    // the continuation backs off.
                    let gs = self.groups[2 * group];
                    let ge = self.groups[2 * group + 1];
                    self.groups[2 * group] = tmp;
                    self.groups[2 * group + 1] = i as isize;
                    if self.run(next, i)? {
                        return Ok(true);
                    }
                    self.groups[2 * group] = gs;
                    self.groups[2 * group + 1] = ge;
                    Ok(false)
                } else {
                    // Inside GroupCurly: just report where the body ended.
                    self.last = i as isize;
                    Ok(true)
                }
            }
            NodeKind::GroupRef { head } => {
                let head = *head;
                let local = match *g.kind(head) {
                    NodeKind::GroupHead { local } => local,
                    _ => return Ok(false),
                };
                let save = self.locals[local];
                // A negative marker tells the tail not to commit the group.
                self.locals[local] = !(i as isize);
                let ret = self.run(g.next(head), i)?;
                self.locals[local] = save;
                if !ret {
                    return Ok(false);
                }
                let at = self.last as usize;
                self.run(next, at)
            }
            NodeKind::BackRef { group, fold } => {
                let (group, fold) = (*group, *fold);
                let j = self.groups[2 * group];
                let k = self.groups[2 * group + 1];
                // If the referenced group has not matched, neither can this.
                if j < 0 {
                    return Ok(false);
                }
                let len = (k - j) as usize;
                if i + len > self.to {
                    self.hit_end = true;
                    return Ok(false);
                }
                let j = j as usize;
                for idx in 0..len {
                    let (a, b) = (self.chars[i + idx], self.chars[j + idx]);
                    let ok = match fold {
                        Fold::None => a == b,
                        Fold::Ascii => a.eq_ignore_ascii_case(&b),
                        Fold::Unicode => {
                            a == b
                                || simple_upper(a) == simple_upper(b)
                                || simple_fold(a) == simple_fold(b)
                        }
                    };
                    if !ok {
                        return Ok(false);
                    }
                }
                self.run(next, i + len)
            }
            NodeKind::Ques { atom, mode } => {
                let (atom, mode) = (*atom, *mode);
                match mode {
                    Quant::Greedy => {
                        if self.run(atom, i)? {
                            let at = self.last as usize;
                            if self.run(next, at)? {
                                return Ok(true);
                            }
                        }
                        self.run(next, i)
                    }
                    Quant::Lazy => {
                        if self.run(next, i)? {
                            return Ok(true);
                        }
                        if self.run(atom, i)? {
                            let at = self.last as usize;
                            return self.run(next, at);
                        }
                        Ok(false)
                    }
                    Quant::Possessive => {
                        let at = if self.run(atom, i)? { self.last as usize } else { i };
                        self.run(next, at)
                    }
                    Quant::Independent => {
                        if self.run(atom, i)? {
                            let at = self.last as usize;
                            return self.run(next, at);
                        }
                        Ok(false)
                    }
                }
            }
            NodeKind::Curly { atom, min, max, mode } => {
                let (atom, min, max, mode) = (*atom, *min, *max, *mode);
                let mut at = i;
                let mut j = 0u32;
                while j < min {
                    if self.run(atom, at)? {
                        at = self.last as usize;
                        j += 1;
                        continue;
                    }
                    return Ok(false);
                }
                match mode {
                    Quant::Greedy => self.curly_greedy(atom, next, max, at, j),
                    Quant::Lazy => self.curly_lazy(atom, next, max, at, j),
                    _ => self.curly_possessive(atom, next, max, at, j),
                }
            }
            NodeKind::GroupCurly { atom, min, max, mode, local, group, capture } => {
                let args = GroupCurlyArgs {
                    atom: *atom,
                    next,
                    min: *min,
                    max: *max,
                    mode: *mode,
                    local: *local,
                    group: *group,
                    capture: *capture,
                };
                self.group_curly(args, i)
            }
            NodeKind::Prolog { loop_id } => self.loop_init(*loop_id, i),
            NodeKind::Loop { body, count_local, begin_local, min, max, lazy } => {
                let (body, cl, bl, min, max, lazy) =
                    (*body, *count_local, *begin_local, *min, *max, *lazy);
                if lazy {
                    self.lazy_loop(id, body, cl, bl, min, max, i)
                } else {
                    self.greedy_loop(id, body, cl, bl, min, max, i)
                }
            }
            NodeKind::Branch { atoms, conn } => {
                let conn_next = g.next(*conn);
                for atom in atoms.clone() {
                    match atom {
                        Some(a) => {
                            if self.run(a, i)? {
                                return Ok(true);
                            }
                        }
                        None => {
                            if self.run(conn_next, i)? {
                                return Ok(true);
                            }
                        }
                    }
                }
                Ok(false)
            }
            NodeKind::BranchConn => self.run(next, i),
            NodeKind::Pos { cond } => {
                let cond = *cond;
                if !self.run(cond, i)? {
                    return Ok(false);
                }
                self.run(next, i)
            }
            NodeKind::Neg { cond } => {
                let cond = *cond;
                if i >= self.to {
                    // A negative look-ahead that succeeds at the end could
                    // fail with more input.
                    self.require_end = true;
                }
                if self.run(cond, i)? {
                    return Ok(false);
                }
                self.run(next, i)
            }
            NodeKind::Behind { cond, rmin, rmax, negate } => {
                let (cond, rmin, rmax, negate) = (*cond, *rmin, *rmax, *negate);
                let saved_lbt = self.lookbehind_to;
                self.lookbehind_to = i;
                let window_from = (i as i64 - rmax as i64).max(self.from as i64);
                let mut matched = false;
                let mut j = i as i64 - rmin as i64;
                while !matched && j >= window_from {
                    matched = self.run(cond, j as usize)?;
                    j -= 1;
                }
                self.lookbehind_to = saved_lbt;
                if matched == negate {
                    return Ok(false);
                }
                self.run(next, i)
            }
        }
    }

    // A candidate position for the unanchored starter: the next position at
    // or after `at` where a literal prefix of the pattern occurs. Without a
    // usable prefix searcher this is `at` itself.
    fn candidate_at(&self, at: usize, guard: usize) -> Option<usize> {
        if !self.ascii {
            return Some(at);
        }
        match self.pattern.prefixes.find_candidate(self.text.as_bytes(), at) {
            crate::literals::Candidate::None => None,
            crate::literals::Candidate::At(pos) => {
                if pos > guard {
                    None
                } else {
                    Some(pos)
                }
            }
            crate::literals::Candidate::Unknown => Some(at),
        }
    }

    // Greedy bounded repetition: consume as many atoms as possible, then
    // give back one at a time while the continuation fails.
    fn curly_greedy(
        &mut self,
        atom: NodeId,
        next: NodeId,
        cmax: u32,
        mut i: usize,
        mut j: u32,
    ) -> Result<bool, BudgetExceeded> {
        if j >= cmax {
            return self.run(next, i);
        }
        let back_limit = j;
        if self.run(atom, i)? {
            let k = self.last as usize - i;
            if k == 0 {
                // Zero-length iteration: stop extending.
                return self.run(next, i);
            }
            i = self.last as usize;
            j += 1;
            while j < cmax {
                if !self.run(atom, i)? {
                    break;
                }
                if i + k != self.last as usize {
                    // The atom changed width; restart the fast loop there.
                    let at = self.last as usize;
                    if self.curly_greedy(atom, next, cmax, at, j + 1)? {
                        return Ok(true);
                    }
                    break;
                }
                i += k;
                j += 1;
            }
            loop {
                if self.run(next, i)? {
                    return Ok(true);
                }
                if j == back_limit {
                    return Ok(false);
                }
                i -= k;
                j -= 1;
            }
        }
        self.run(next, i)
    }

    // Reluctant repetition: always try the continuation before extending.
    fn curly_lazy(
        &mut self,
        atom: NodeId,
        next: NodeId,
        cmax: u32,
        mut i: usize,
        mut j: u32,
    ) -> Result<bool, BudgetExceeded> {
        loop {
            if self.run(next, i)? {
                return Ok(true);
            }
            if j >= cmax {
                return Ok(false);
            }
            if !self.run(atom, i)? {
                return Ok(false);
            }
            if i == self.last as usize {
                return Ok(false);
            }
            i = self.last as usize;
            j += 1;
        }
    }

    // Possessive repetition: consume the maximum and never give back.
    fn curly_possessive(
        &mut self,
        atom: NodeId,
        next: NodeId,
        cmax: u32,
        mut i: usize,
        mut j: u32,
    ) -> Result<bool, BudgetExceeded> {
        while j < cmax {
            if !self.run(atom, i)? {
                break;
            }
            if i == self.last as usize {
                break;
            }
            i = self.last as usize;
            j += 1;
        }
        self.run(next, i)
    }

    fn group_curly(&mut self, args: GroupCurlyArgs, mut i: usize) -> Result<bool, BudgetExceeded> {
        let GroupCurlyArgs { atom, next, min, max, mode, local, group, capture } = args;
        let save0 = self.locals[local];
        let mut save1 = 0;
        let mut save2 = 0;
        if capture {
            save1 = self.groups[2 * group];
            save2 = self.groups[2 * group + 1];
        }
        // Tell the group tail not to commit captures; they are handled here.
        self.locals[local] = -1;

        let mut ret = true;
        for _ in 0..min {
            if self.run(atom, i)? {
                if capture {
                    self.groups[2 * group] = i as isize;
                    self.groups[2 * group + 1] = self.last;
                }
                i = self.last as usize;
            } else {
                ret = false;
                break;
            }
        }
        if ret {
            ret = match mode {
                Quant::Greedy => self.gc_greedy(&args, i, min)?,
                Quant::Lazy => self.gc_lazy(&args, i, min)?,
                _ => self.gc_possessive(&args, i, min)?,
            };
        }
        if !ret {
            self.locals[local] = save0;
            if capture {
                self.groups[2 * group] = save1;
                self.groups[2 * group + 1] = save2;
            }
        }
        Ok(ret)
    }

    fn gc_greedy(
        &mut self,
        args: &GroupCurlyArgs,
        mut i: usize,
        mut j: u32,
    ) -> Result<bool, BudgetExceeded> {
        let GroupCurlyArgs { atom, next, max, group, capture, .. } = *args;
        let back_limit = j;
        let mut save0 = 0;
        let mut save1 = 0;
        if capture {
            save0 = self.groups[2 * group];
            save1 = self.groups[2 * group + 1];
        }
        let mut k = 0usize;
        let mut backing_off = false;
        if j < max && self.run(atom, i)? {
            k = self.last as usize - i;
            if k == 0 {
                if capture {
                    self.groups[2 * group] = i as isize;
                    self.groups[2 * group + 1] = i as isize;
                }
            } else {
                loop {
                    if capture {
                        self.groups[2 * group] = i as isize;
                        self.groups[2 * group + 1] = (i + k) as isize;
                    }
                    i += k;
                    j += 1;
                    if j >= max {
                        break;
                    }
                    if !self.run(atom, i)? {
                        break;
                    }
                    if i + k != self.last as usize {
                        // The body changed width; re-derive the stride from
                        // here.
                        if self.gc_greedy(args, i, j)? {
                            return Ok(true);
                        }
                        break;
                    }
                }
                backing_off = true;
            }
        }
        if backing_off {
            while j > back_limit {
                if self.run(next, i)? {
                    if capture {
                        self.groups[2 * group + 1] = i as isize;
                        self.groups[2 * group] = (i - k) as isize;
                    }
                    return Ok(true);
                }
                i -= k;
                if capture {
                    self.groups[2 * group + 1] = i as isize;
                    self.groups[2 * group] = (i as isize) - (k as isize);
                }
                j -= 1;
            }
        }
        if capture {
            self.groups[2 * group] = save0;
            self.groups[2 * group + 1] = save1;
        }
        self.run(next, i)
    }

    fn gc_lazy(
        &mut self,
        args: &GroupCurlyArgs,
        mut i: usize,
        mut j: u32,
    ) -> Result<bool, BudgetExceeded> {
        let GroupCurlyArgs { atom, next, max, group, capture, .. } = *args;
        loop {
            if self.run(next, i)? {
                return Ok(true);
            }
            if j >= max {
                return Ok(false);
            }
            if !self.run(atom, i)? {
                return Ok(false);
            }
            if i == self.last as usize {
                return Ok(false);
            }
            if capture {
                self.groups[2 * group] = i as isize;
                self.groups[2 * group + 1] = self.last;
            }
            i = self.last as usize;
            j += 1;
        }
    }

    fn gc_possessive(
        &mut self,
        args: &GroupCurlyArgs,
        mut i: usize,
        mut j: u32,
    ) -> Result<bool, BudgetExceeded> {
        let GroupCurlyArgs { atom, next, max, group, capture, .. } = *args;
        while j < max {
            if !self.run(atom, i)? {
                break;
            }
            if capture {
                self.groups[2 * group] = i as isize;
                self.groups[2 * group + 1] = self.last;
            }
            if i == self.last as usize {
                break;
            }
            i = self.last as usize;
            j += 1;
        }
        self.run(next, i)
    }

    // The prolog seeds the loop counter and forces the first body attempt.
    fn loop_init(&mut self, loop_id: NodeId, i: usize) -> Result<bool, BudgetExceeded> {
        let (body, cl, min, max, lazy) = match *self.pattern.graph.kind(loop_id) {
            NodeKind::Loop { body, count_local, min, max, lazy, .. } => {
                (body, count_local, min, max, lazy)
            }
            _ => return Ok(false),
        };
        let loop_next = self.pattern.graph.next(loop_id);
        let save = self.locals[cl];
        let ret;
        if lazy {
            if min > 0 {
                self.locals[cl] = 1;
                ret = self.run(body, i)?;
            } else if self.run(loop_next, i)? {
                ret = true;
            } else if max > 0 {
                self.locals[cl] = 1;
                ret = self.run(body, i)?;
            } else {
                ret = false;
            }
        } else if min > 0 {
            self.locals[cl] = 1;
            ret = self.run(body, i)?;
        } else if max > 0 {
            self.locals[cl] = 1;
            let first = self.run(body, i)?;
            ret = if first { true } else { self.run(loop_next, i)? };
        } else {
            ret = self.run(loop_next, i)?;
        }
        self.locals[cl] = save;
        Ok(ret)
    }

    fn greedy_loop(
        &mut self,
        loop_id: NodeId,
        body: NodeId,
        cl: usize,
        bl: usize,
        min: u32,
        max: u32,
        i: usize,
    ) -> Result<bool, BudgetExceeded> {
        // Re-enter the body only after consuming something, so zero-length
        // iterations cannot spin forever.
        if (i as isize) > self.locals[bl] {
            let count = self.locals[cl];
            if count < min as isize {
                self.locals[cl] = count + 1;
                let ok = self.run(body, i)?;
                if !ok {
                    self.locals[cl] = count;
                }
                return Ok(ok);
            }
            if count < max as isize {
                self.locals[cl] = count + 1;
                let ok = self.run(body, i)?;
                if !ok {
                    self.locals[cl] = count;
                } else {
                    return Ok(true);
                }
            }
        }
        let next = self.pattern.graph.next(loop_id);
        self.run(next, i)
    }

    fn lazy_loop(
        &mut self,
        loop_id: NodeId,
        body: NodeId,
        cl: usize,
        bl: usize,
        min: u32,
        max: u32,
        i: usize,
    ) -> Result<bool, BudgetExceeded> {
        let next = self.pattern.graph.next(loop_id);
        if (i as isize) > self.locals[bl] {
            let count = self.locals[cl];
            if count < min as isize {
                self.locals[cl] = count + 1;
                let ok = self.run(body, i)?;
                if !ok {
                    self.locals[cl] = count;
                }
                return Ok(ok);
            }
            if self.run(next, i)? {
                return Ok(true);
            }
            if count < max as isize {
                self.locals[cl] = count + 1;
                let ok = self.run(body, i)?;
                if !ok {
                    self.locals[cl] = count;
                }
                return Ok(ok);
            }
            return Ok(false);
        }
        self.run(next, i)
    }
}

#[derive(Clone, Copy, Debug)]
struct GroupCurlyArgs {
    atom: NodeId,
    next: NodeId,
    min: u32,
    max: u32,
    mode: Quant,
    local: usize,
    group: usize,
    capture: bool,
}
