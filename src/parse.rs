use std::sync::Arc;

use crate::charset::{CharSet, NamedPredicate, PropertyOracle};
use crate::error::{Error, ErrorKind};
use crate::node::{
    bound, ClassExpr, ClassNode, Fold, Graph, NodeId, NodeKind, Quant, TreeInfo, ACCEPT,
    BEHIND_END, LAST_ACCEPT,
};
use crate::re::Flags;

const MAX_REPS: u32 = u32::MAX;

/// The pattern parser: a recursive descent over code points with the
/// precedence alternation < concatenation < quantifier < atom. It builds
/// match nodes directly into the graph arena, chaining sequences through
/// `next` and returning sub-graph heads, with tails handed back through a
/// side register (`root`) the way group and sequence parsing interleave.
pub(crate) struct Parser<'o> {
    /// Pattern code points after `\Q...\E` expansion, padded with two NULs
    /// so the cursor can look ahead without bounds checks.
    buf: Vec<char>,
    /// Length in code points, excluding the padding.
    len: usize,
    cursor: usize,
    flags: Flags,
    graph: Graph,
    oracle: &'o dyn PropertyOracle,
    /// Dual-return register: sequence parsing returns heads, and leaves the
    /// matching tail here.
    root: NodeId,
    /// Capturing groups whose `)` has been seen; back-references may only
    /// name these.
    closed_groups: std::collections::HashSet<usize>,
}

/// What an escape sequence turned into.
enum Escaped {
    /// A literal code point.
    Char(char),
    /// A complete match node (anchor, boundary, back-reference).
    Node(NodeId),
    /// A class membership expression (`\d`, `\w`, `\p{...}`, ...).
    Class(ClassExpr),
    /// A node-producing escape probed with `create` off; the caller unwinds.
    Meta,
}

pub(crate) fn parse(
    pattern: &str,
    flags: Flags,
    oracle: &dyn PropertyOracle,
) -> Result<Graph, Error> {
    Parser::new(pattern, flags, oracle).compile()
}

impl<'o> Parser<'o> {
    fn new(pattern: &str, flags: Flags, oracle: &'o dyn PropertyOracle) -> Parser<'o> {
        let mut buf: Vec<char> = pattern.chars().collect();
        let len = buf.len();
        buf.push('\0');
        buf.push('\0');
        Parser {
            buf,
            len,
            cursor: 0,
            flags,
            graph: Graph::new(),
            oracle,
            root: ACCEPT,
            closed_groups: std::collections::HashSet::new(),
        }
    }

    fn compile(mut self) -> Result<Graph, Error> {
        if self.has(Flags::CANON_EQ) && !self.has(Flags::LITERAL) {
            return Err(self.err_at(
                ErrorKind::Unsupported(
                    "canonical equivalence mode is not supported".to_string(),
                ),
                0,
            ));
        }
        if !self.has(Flags::LITERAL) {
            self.remove_qe_quoting();
        }

        let match_root;
        if self.has(Flags::LITERAL) {
            let buf: Vec<char> = self.buf[..self.len].to_vec();
            match_root = self.new_slice(&buf, (0, self.len));
            self.graph.set_next(match_root, LAST_ACCEPT);
        } else {
            match_root = self.expr(LAST_ACCEPT)?;
            if self.cursor != self.len {
                if self.peek() == ')' {
                    return Err(self.err(ErrorKind::Syntax("Unmatched closing ')'".to_string())));
                }
                return Err(self.err(ErrorKind::Syntax("Unexpected internal error".to_string())));
            }
        }
        self.graph.match_root = match_root;

        // Peephole: a leading literal run searches with Boyer-Moore; an
        // anchored pattern needs no starter at all; everything else gets the
        // position-scanning starter.
        let mut info = TreeInfo::new();
        self.graph.study(match_root, &mut info);
        self.graph.root = match self.graph.kind(match_root) {
            NodeKind::Slice { fold: Fold::None, .. } => {
                match self.boyer_moore(match_root) {
                    Some(bnm) => bnm,
                    None => self.start_node(match_root, info.min_length),
                }
            }
            NodeKind::Begin => match_root,
            _ => self.start_node(match_root, info.min_length),
        };

        self.graph.wire();
        log::debug!("compiled pattern into {} nodes", self.graph.nodes.len());
        Ok(self.graph)
    }

    fn start_node(&mut self, match_root: NodeId, min_length: usize) -> NodeId {
        let start = self.graph.add(NodeKind::Start { min_length }, (0, 0));
        self.graph.set_next(start, match_root);
        start
    }

    /// Build the Boyer-Moore tables for a leading literal. Short runs are
    /// left alone: a shift larger than the pattern length cannot be used
    /// anyway.
    fn boyer_moore(&mut self, slice_id: NodeId) -> Option<NodeId> {
        let (buf, next) = match self.graph.kind(slice_id) {
            NodeKind::Slice { ref buf, fold: Fold::None } => {
                (buf.to_vec(), self.graph.next(slice_id))
            }
            _ => return None,
        };
        let n = buf.len();
        if n < 4 {
            return None;
        }
        // Bad character shift over the low 7 bits only; this keeps the table
        // small and covers the heavily used ASCII range, at the price of an
        // occasional aliased match.
        let mut last_occ = vec![0i32; 128];
        for (i, &ch) in buf.iter().enumerate() {
            last_occ[(ch as u32 & 0x7F) as usize] = i as i32 + 1;
        }
        let mut good_suffix = vec![0i32; n];
        'next: for i in (1..=n).rev() {
            let mut j = n - 1;
            while j >= i {
                if buf[j] == buf[j - i] {
                    good_suffix[j - 1] = i as i32;
                } else {
                    continue 'next;
                }
                j -= 1;
            }
            while j > 0 {
                j -= 1;
                good_suffix[j] = i as i32;
            }
        }
        good_suffix[n - 1] = 1;

        let span = self.graph.span(slice_id);
        let bnm = self.graph.add(
            NodeKind::BoyerMoore {
                buf: buf.into_boxed_slice(),
                last_occ: last_occ.into_boxed_slice(),
                good_suffix: good_suffix.into_boxed_slice(),
            },
            span,
        );
        self.graph.set_next(bnm, next);
        Some(bnm)
    }

    // ---- cursor primitives ------------------------------------------------

    #[inline]
    fn get(&self, i: usize) -> char {
        self.buf.get(i).copied().unwrap_or('\0')
    }

    fn has(&self, f: Flags) -> bool {
        self.flags.contains(f)
    }

    /// Peek the next character without advancing the cursor.
    fn peek(&mut self) -> char {
        let ch = self.get(self.cursor);
        if self.has(Flags::COMMENTS) {
            return self.peek_past_whitespace(ch);
        }
        ch
    }

    /// Read the next character and advance the cursor by one.
    fn read(&mut self) -> char {
        let ch = self.get(self.cursor);
        self.cursor += 1;
        if self.has(Flags::COMMENTS) {
            return self.parse_past_whitespace(ch);
        }
        ch
    }

    /// Advance the cursor by one and peek the next character.
    fn next(&mut self) -> char {
        self.cursor += 1;
        let ch = self.get(self.cursor);
        if self.has(Flags::COMMENTS) {
            return self.peek_past_whitespace(ch);
        }
        ch
    }

    /// Advance the cursor by one and peek the next character, ignoring
    /// comments mode.
    fn next_escaped(&mut self) -> char {
        self.cursor += 1;
        self.get(self.cursor)
    }

    /// Read the character after the next one and advance past both.
    fn skip(&mut self) -> char {
        let ch = self.get(self.cursor + 1);
        self.cursor += 2;
        ch
    }

    fn unread(&mut self) {
        self.cursor -= 1;
    }

    fn accept(&mut self, want: char, msg: &str) -> Result<(), Error> {
        let mut got = self.get(self.cursor);
        self.cursor += 1;
        if self.has(Flags::COMMENTS) {
            got = self.parse_past_whitespace(got);
        }
        if got != want {
            return Err(self.err(ErrorKind::Syntax(msg.to_string())));
        }
        Ok(())
    }

    fn is_space(ch: char) -> bool {
        matches!(ch, ' ' | '\t' | '\n' | '\x0B' | '\x0C' | '\r')
    }

    fn peek_past_whitespace(&mut self, mut ch: char) -> char {
        while Self::is_space(ch) || ch == '#' {
            while Self::is_space(ch) {
                self.cursor += 1;
                ch = self.get(self.cursor);
            }
            if ch == '#' {
                while self.cursor < self.len && self.get(self.cursor) != '\n' {
                    self.cursor += 1;
                }
                ch = self.get(self.cursor);
            }
        }
        ch
    }

    fn parse_past_whitespace(&mut self, mut ch: char) -> char {
        while Self::is_space(ch) || ch == '#' {
            while Self::is_space(ch) {
                ch = self.get(self.cursor);
                self.cursor += 1;
            }
            if ch == '#' {
                while self.cursor < self.len && self.get(self.cursor) != '\n' {
                    self.cursor += 1;
                }
                ch = self.get(self.cursor);
                self.cursor += 1;
            }
        }
        ch
    }

    fn err(&self, kind: ErrorKind) -> Error {
        self.err_at(kind, self.cursor.saturating_sub(1))
    }

    fn err_at(&self, kind: ErrorKind, pos: usize) -> Error {
        Error::new(kind, &self.buf[..self.len], pos.min(self.len))
    }

    fn syntax(&self, msg: &str) -> Error {
        self.err(ErrorKind::Syntax(msg.to_string()))
    }

    // ---- \Q...\E pre-processing -------------------------------------------

    /// Expand `\Q...\E` quoting into escaped literals before parsing.
    fn remove_qe_quoting(&mut self) {
        let plen = self.len;
        let mut i = 0;
        while i + 1 < plen {
            if self.buf[i] != '\\' {
                i += 1;
            } else if self.buf[i + 1] != 'Q' {
                i += 2;
            } else {
                break;
            }
        }
        if i + 1 >= plen {
            return;
        }
        let mut out: Vec<char> = self.buf[..i].to_vec();
        let mut in_quote = true;
        let mut begin_quote = true;
        i += 2;
        while i < plen {
            let c = self.buf[i];
            i += 1;
            if !c.is_ascii() || c.is_ascii_alphabetic() {
                out.push(c);
            } else if c.is_ascii_digit() {
                if begin_quote {
                    // A numeric escape could be in front of this quote; keep
                    // this digit out of it.
                    out.push('\\');
                    out.push('x');
                    out.push('3');
                }
                out.push(c);
            } else if c != '\\' {
                if in_quote {
                    out.push('\\');
                }
                out.push(c);
            } else if in_quote {
                if self.get(i) == 'E' {
                    i += 1;
                    in_quote = false;
                } else {
                    out.push('\\');
                    out.push('\\');
                }
            } else {
                if self.get(i) == 'Q' {
                    i += 1;
                    in_quote = true;
                    begin_quote = true;
                    continue;
                }
                out.push(c);
                if i != plen {
                    out.push(self.buf[i]);
                    i += 1;
                }
            }
            begin_quote = false;
        }
        self.len = out.len();
        out.push('\0');
        out.push('\0');
        self.buf = out;
    }

    // ---- expression parsing -----------------------------------------------

    /// The expression closure: alternations of sequences, chained onto
    /// `end`.
    fn expr(&mut self, end: NodeId) -> Result<NodeId, Error> {
        let mut prev: Option<NodeId> = None;
        let mut first_tail: Option<NodeId> = None;
        let mut branch: Option<NodeId> = None;
        let mut branch_conn: Option<NodeId> = None;
        let begin = self.cursor;
        loop {
            let node = self.sequence(end)?;
            let node_tail = self.root;
            if prev.is_none() {
                prev = Some(node);
                first_tail = Some(node_tail);
            } else {
                let conn = match branch_conn {
                    Some(conn) => conn,
                    None => {
                        let conn =
                            self.graph.add(NodeKind::BranchConn, (self.cursor, self.cursor));
                        self.graph.set_next(conn, end);
                        branch_conn = Some(conn);
                        conn
                    }
                };
                // An empty alternative becomes a hole in the branch that
                // jumps straight to the continuation.
                let atom = if node == end {
                    None
                } else {
                    self.graph.set_next(node_tail, conn);
                    Some(node)
                };
                if prev == branch {
                    self.branch_add(branch.unwrap(), atom);
                } else {
                    let first = if prev == Some(end) {
                        None
                    } else {
                        self.graph.set_next(first_tail.unwrap(), conn);
                        prev
                    };
                    let b = self.graph.add(
                        NodeKind::Branch { atoms: vec![first, atom], conn },
                        (begin, self.cursor),
                    );
                    branch = Some(b);
                    prev = Some(b);
                }
            }
            if self.peek() != '|' {
                if let Some(b) = branch {
                    self.graph.nodes[b].span = (begin, self.cursor);
                    self.root = branch_conn.unwrap();
                }
                return Ok(prev.unwrap());
            }
            self.next();
        }
    }

    fn branch_add(&mut self, branch: NodeId, atom: Option<NodeId>) {
        match self.graph.nodes[branch].kind {
            NodeKind::Branch { ref mut atoms, .. } => atoms.push(atom),
            _ => unreachable!("branch_add on a non-branch node"),
        }
    }

    /// One alternation-free run of atoms, each with its optional closure.
    fn sequence(&mut self, end: NodeId) -> Result<NodeId, Error> {
        let mut head: Option<NodeId> = None;
        let mut tail: Option<NodeId> = None;
        loop {
            let begin = self.cursor;
            let node;
            let ch = self.peek();
            match ch {
                '(' => {
                    // A group handles its own closure.
                    let group = self.group0()?;
                    let group = match group {
                        // A comment or a flag directive.
                        None => continue,
                        Some(g) => g,
                    };
                    match head {
                        None => head = Some(group),
                        Some(_) => self.graph.set_next(tail.unwrap(), group),
                    }
                    tail = Some(self.root);
                    self.graph.nodes[group].span = (begin, self.cursor);
                    continue;
                }
                '[' => {
                    let expr = self.clazz(true)?;
                    node = self.add_class(expr, (begin, self.cursor));
                }
                '\\' => {
                    let esc = self.next_escaped();
                    if esc == 'p' || esc == 'P' {
                        let comp = esc == 'P';
                        let mut one_letter = true;
                        if self.next() == '{' {
                            one_letter = false;
                        } else {
                            self.unread();
                        }
                        let expr = self.family(one_letter, comp)?;
                        node = self.add_class(expr, (begin, self.cursor));
                    } else {
                        self.unread();
                        node = self.atom()?;
                    }
                }
                '^' => {
                    self.next();
                    let kind = if self.has(Flags::MULTILINE) {
                        if self.has(Flags::UNIX_LINES) {
                            NodeKind::UnixCaret
                        } else {
                            NodeKind::Caret
                        }
                    } else {
                        NodeKind::Begin
                    };
                    node = self.graph.add(kind, (begin, self.cursor));
                }
                '$' => {
                    self.next();
                    let multiline = self.has(Flags::MULTILINE);
                    let kind = if self.has(Flags::UNIX_LINES) {
                        NodeKind::UnixDollar { multiline }
                    } else {
                        NodeKind::Dollar { multiline }
                    };
                    node = self.graph.add(kind, (begin, self.cursor));
                }
                '.' => {
                    self.next();
                    let expr = if self.has(Flags::DOTALL) {
                        ClassExpr::All
                    } else if self.has(Flags::UNIX_LINES) {
                        ClassExpr::UnixDot
                    } else {
                        ClassExpr::Dot
                    };
                    node = self.add_class(expr, (begin, self.cursor));
                }
                '|' | ')' => break,
                // A dangling ] or } is a literal.
                ']' | '}' => node = self.atom()?,
                '?' | '*' | '+' => {
                    self.next();
                    return Err(self.syntax(&format!("Dangling meta character '{}'", ch)));
                }
                '\0' if self.cursor >= self.len => break,
                _ => node = self.atom()?,
            }
            self.graph.nodes[node].span = (begin, self.cursor);
            let node = self.closure(node)?;
            self.graph.nodes[node].span = (begin, self.cursor);

            match head {
                None => {
                    head = Some(node);
                    tail = Some(node);
                }
                Some(_) => {
                    self.graph.set_next(tail.unwrap(), node);
                    tail = Some(node);
                }
            }
        }
        match head {
            None => {
                self.root = end;
                Ok(end)
            }
            Some(h) => {
                let t = tail.unwrap();
                self.graph.set_next(t, end);
                self.root = t;
                Ok(h)
            }
        }
    }

    /// Parse and collapse a run of literal characters into a single char
    /// node or a slice.
    fn atom(&mut self) -> Result<NodeId, Error> {
        let begin = self.cursor;
        let mut buf: Vec<char> = Vec::new();
        let mut prev = self.cursor;
        let mut ch = self.peek();
        loop {
            match ch {
                '*' | '+' | '?' | '{' => {
                    // The quantifier binds to the last character only;
                    // unwind it out of the slice.
                    if buf.len() > 1 {
                        self.cursor = prev;
                        buf.pop();
                    }
                    break;
                }
                '$' | '.' | '^' | '(' | '[' | '|' | ')' => break,
                '\\' => {
                    let esc = self.next_escaped();
                    if esc == 'p' || esc == 'P' {
                        if !buf.is_empty() {
                            // A slice is waiting; emit it first.
                            self.unread();
                            break;
                        }
                        let comp = esc == 'P';
                        let mut one_letter = true;
                        if self.next() == '{' {
                            one_letter = false;
                        } else {
                            self.unread();
                        }
                        let expr = self.family(one_letter, comp)?;
                        return Ok(self.add_class(expr, (begin, self.cursor)));
                    }
                    self.unread();
                    prev = self.cursor;
                    match self.escape(false, buf.is_empty(), false)? {
                        Escaped::Char(c) => {
                            buf.push(c);
                            ch = self.peek();
                            continue;
                        }
                        Escaped::Node(n) => return Ok(n),
                        Escaped::Class(expr) => {
                            if buf.is_empty() {
                                return Ok(self.add_class(expr, (begin, self.cursor)));
                            }
                            // A slice is waiting; unwind the escape and emit
                            // the slice first.
                            self.cursor = prev;
                            break;
                        }
                        Escaped::Meta => {
                            // Unwind the probed meta escape; the next atom
                            // call re-parses it with creation on.
                            self.cursor = prev;
                            break;
                        }
                    }
                }
                '\0' if self.cursor >= self.len => break,
                _ => {
                    prev = self.cursor;
                    buf.push(ch);
                    ch = self.next();
                    continue;
                }
            }
        }
        if buf.len() == 1 {
            Ok(self.new_single(buf[0], (begin, self.cursor)))
        } else {
            Ok(self.new_slice(&buf, (begin, self.cursor)))
        }
    }

    /// A single-character matcher, case-mode aware.
    fn new_single(&mut self, ch: char, span: (usize, usize)) -> NodeId {
        if self.has(Flags::CASE_INSENSITIVE) {
            if self.has(Flags::UNICODE_CASE) {
                let upper = crate::charset::simple_upper(ch);
                let lower = crate::charset::simple_fold(ch);
                if upper != lower {
                    return self.graph.add(NodeKind::CharU { folded: lower }, span);
                }
            } else if ch.is_ascii() {
                let lo = ch.to_ascii_lowercase();
                let up = ch.to_ascii_uppercase();
                if lo != up {
                    return self.graph.add(NodeKind::CharI { lo, up }, span);
                }
            }
        }
        self.graph.add(NodeKind::Char { ch }, span)
    }

    /// A literal-run matcher; case-insensitive runs store the buffer
    /// pre-folded.
    fn new_slice(&mut self, buf: &[char], span: (usize, usize)) -> NodeId {
        let (folded, fold): (Vec<char>, Fold) = if self.has(Flags::CASE_INSENSITIVE) {
            if self.has(Flags::UNICODE_CASE) {
                (buf.iter().map(|&c| crate::charset::simple_fold(c)).collect(), Fold::Unicode)
            } else {
                (buf.iter().map(|c| c.to_ascii_lowercase()).collect(), Fold::Ascii)
            }
        } else {
            (buf.to_vec(), Fold::None)
        };
        self.graph.add(NodeKind::Slice { buf: folded.into_boxed_slice(), fold }, span)
    }

    fn add_class(&mut self, expr: ClassExpr, span: (usize, usize)) -> NodeId {
        self.graph.add(NodeKind::Class(Box::new(ClassNode::new(expr))), span)
    }

    // ---- closures ----------------------------------------------------------

    /// Parse a quantifier, if one follows, and wrap `prev` in it.
    fn closure(&mut self, prev: NodeId) -> Result<NodeId, Error> {
        match self.peek() {
            '?' => {
                let mode = self.closure_mode();
                Ok(self.graph.add(NodeKind::Ques { atom: prev, mode }, (0, 0)))
            }
            '*' => {
                let mode = self.closure_mode();
                Ok(self.graph.add(
                    NodeKind::Curly { atom: prev, min: 0, max: MAX_REPS, mode },
                    (0, 0),
                ))
            }
            '+' => {
                let mode = self.closure_mode();
                Ok(self.graph.add(
                    NodeKind::Curly { atom: prev, min: 1, max: MAX_REPS, mode },
                    (0, 0),
                ))
            }
            '{' => {
                if !self.get(self.cursor + 1).is_ascii_digit() {
                    return Err(self.syntax("Illegal repetition"));
                }
                self.skip();
                let mut ch = self.get(self.cursor - 1);
                let mut cmin: u64 = 0;
                while ch.is_ascii_digit() {
                    cmin = cmin * 10 + (ch as u64 - '0' as u64);
                    if cmin > MAX_REPS as u64 {
                        return Err(self.syntax("Illegal repetition range"));
                    }
                    ch = self.read();
                }
                let mut cmax = cmin;
                if ch == ',' {
                    ch = self.read();
                    cmax = MAX_REPS as u64;
                    if ch != '}' {
                        cmax = 0;
                        while ch.is_ascii_digit() {
                            cmax = cmax * 10 + (ch as u64 - '0' as u64);
                            if cmax > MAX_REPS as u64 {
                                return Err(self.syntax("Illegal repetition range"));
                            }
                            ch = self.read();
                        }
                    }
                }
                if ch != '}' {
                    return Err(self.syntax("Unclosed counted closure"));
                }
                if cmax < cmin {
                    return Err(self.syntax("Illegal repetition range"));
                }
                // The cursor already sits past the closing brace, so the
                // mode suffix is peeked rather than skipped to.
                let mode = match self.peek() {
                    '?' => {
                        self.next();
                        Quant::Lazy
                    }
                    '+' => {
                        self.next();
                        Quant::Possessive
                    }
                    _ => Quant::Greedy,
                };
                Ok(self.graph.add(
                    NodeKind::Curly { atom: prev, min: cmin as u32, max: cmax as u32, mode },
                    (0, 0),
                ))
            }
            _ => Ok(prev),
        }
    }

    /// Consume the quantifier character and its optional mode suffix.
    fn closure_mode(&mut self) -> Quant {
        match self.next() {
            '?' => {
                self.next();
                Quant::Lazy
            }
            '+' => {
                self.next();
                Quant::Possessive
            }
            _ => Quant::Greedy,
        }
    }

    // ---- groups ------------------------------------------------------------

    /// Group head and tail via double return: the head comes back directly,
    /// the tail through `self.root`.
    fn create_group(&mut self, anonymous: bool) -> NodeId {
        let local = self.graph.local_count;
        self.graph.local_count += 1;
        let group = if anonymous {
            0
        } else {
            let g = self.graph.group_count;
            self.graph.group_count += 1;
            g
        };
        let head = self.graph.add(NodeKind::GroupHead { local }, (self.cursor, self.cursor));
        self.root = self.graph.add(
            NodeKind::GroupTail { local, group },
            (self.cursor, self.cursor),
        );
        head
    }

    /// Parse a parenthesised group: capturing, pure, lookaround, atomic,
    /// named, or an inline flag directive (which produces no node).
    fn group0(&mut self) -> Result<Option<NodeId>, Error> {
        let begin = self.cursor;
        let save_flags = self.flags;
        let mut capturing = false;
        let head;
        let mut tail;
        let ch = self.next();
        if ch == '?' {
            let ch = self.skip();
            match ch {
                ':' => {
                    head = self.create_group(true);
                    tail = self.root;
                    let body = self.expr(tail)?;
                    self.graph.set_next(head, body);
                }
                '=' | '!' => {
                    let ghead = self.create_group(true);
                    let gtail = self.root;
                    let body = self.expr(gtail)?;
                    self.graph.set_next(ghead, body);
                    let kind = if ch == '=' {
                        NodeKind::Pos { cond: ghead }
                    } else {
                        NodeKind::Neg { cond: ghead }
                    };
                    head = self.graph.add(kind, (begin, self.cursor));
                    tail = head;
                }
                '>' => {
                    let ghead = self.create_group(true);
                    let gtail = self.root;
                    let body = self.expr(gtail)?;
                    self.graph.set_next(ghead, body);
                    head = self.graph.add(
                        NodeKind::Ques { atom: ghead, mode: Quant::Independent },
                        (begin, self.cursor),
                    );
                    tail = head;
                }
                '<' => {
                    let ch = self.read();
                    if ch.is_ascii_alphabetic() {
                        // A named capturing group.
                        let name = self.groupname(ch)?;
                        if self.graph.named_groups.contains_key(&name) {
                            return Err(self.syntax(&format!(
                                "Named capturing group <{}> is already defined",
                                name
                            )));
                        }
                        capturing = true;
                        head = self.create_group(false);
                        tail = self.root;
                        self.graph.named_groups.insert(name, self.graph.group_count - 1);
                        let body = self.expr(tail)?;
                        self.graph.set_next(head, body);
                    } else {
                        // A look-behind, which must have a bounded length.
                        let ghead = self.create_group(true);
                        let gtail = self.root;
                        let body = self.expr(gtail)?;
                        self.graph.set_next(ghead, body);
                        self.graph.set_next(gtail, BEHIND_END);
                        let mut info = TreeInfo::new();
                        self.graph.study(ghead, &mut info);
                        if !info.max_valid {
                            return Err(self.err(ErrorKind::Unsupported(
                                "Look-behind group does not have an obvious maximum length"
                                    .to_string(),
                            )));
                        }
                        let negate = match ch {
                            '=' => false,
                            '!' => true,
                            _ => return Err(self.syntax("Unknown look-behind group")),
                        };
                        head = self.graph.add(
                            NodeKind::Behind {
                                cond: ghead,
                                rmin: info.min_length,
                                rmax: info.max_length,
                                negate,
                            },
                            (begin, self.cursor),
                        );
                        tail = head;
                    }
                }
                '$' | '@' => return Err(self.syntax("Unknown group type")),
                _ => {
                    // (?xxx:) or (?xxx) inline flags.
                    self.unread();
                    self.add_flags();
                    let ch = self.read();
                    if ch == ')' {
                        return Ok(None);
                    }
                    if ch != ':' {
                        return Err(self.syntax("Unknown inline modifier"));
                    }
                    head = self.create_group(true);
                    tail = self.root;
                    let body = self.expr(tail)?;
                    self.graph.set_next(head, body);
                }
            }
        } else {
            capturing = true;
            head = self.create_group(false);
            tail = self.root;
            let body = self.expr(tail)?;
            self.graph.set_next(head, body);
        }

        self.accept(')', "Unclosed group")?;
        self.flags = save_flags;
        if capturing {
            if let NodeKind::GroupTail { group, .. } = self.graph.nodes[tail].kind {
                self.closed_groups.insert(group);
            }
        }

        let node = self.closure(head)?;
        self.graph.nodes[node].span = (begin, self.cursor);
        if node == head {
            // No closure.
            self.root = tail;
            return Ok(Some(node));
        }
        if head == tail {
            // A quantified zero-length assertion.
            self.root = node;
            return Ok(Some(node));
        }

        match self.graph.nodes[node].kind {
            NodeKind::Ques { mode, .. } => {
                if mode == Quant::Possessive || mode == Quant::Independent {
                    self.root = node;
                    return Ok(Some(node));
                }
                // An optional group becomes a two-way branch so that group
                // state saves and restores line up.
                let conn = self.graph.add(NodeKind::BranchConn, (self.cursor, self.cursor));
                self.graph.set_next(tail, conn);
                let atoms = if mode == Quant::Greedy {
                    vec![Some(head), None]
                } else {
                    vec![None, Some(head)]
                };
                let branch =
                    self.graph.add(NodeKind::Branch { atoms, conn }, (begin, self.cursor));
                self.root = conn;
                Ok(Some(branch))
            }
            NodeKind::Curly { min, max, mode, .. } => {
                if mode == Quant::Possessive {
                    self.root = node;
                    return Ok(Some(node));
                }
                let mut info = TreeInfo::new();
                if self.graph.study(head, &mut info) {
                    // Deterministic body: iterate in place, saving and
                    // restoring group state without a loop counter.
                    let (local, group) = match self.graph.nodes[tail].kind {
                        NodeKind::GroupTail { local, group } => (local, group),
                        _ => unreachable!("group tail expected"),
                    };
                    let body = self.graph.next(head);
                    let gc = self.graph.add(
                        NodeKind::GroupCurly {
                            atom: body,
                            min,
                            max,
                            mode,
                            local,
                            group,
                            capture: capturing,
                        },
                        (begin, self.cursor),
                    );
                    self.root = gc;
                    Ok(Some(gc))
                } else {
                    // Non-deterministic body: an explicit counter loop.
                    let begin_local = match self.graph.nodes[head].kind {
                        NodeKind::GroupHead { local } => local,
                        _ => unreachable!("group head expected"),
                    };
                    let count_local = self.graph.local_count;
                    self.graph.local_count += 1;
                    let loop_id = self.graph.add(
                        NodeKind::Loop {
                            body: head,
                            count_local,
                            begin_local,
                            min,
                            max,
                            lazy: mode == Quant::Lazy,
                        },
                        (begin, self.cursor),
                    );
                    let prolog =
                        self.graph.add(NodeKind::Prolog { loop_id }, (begin, self.cursor));
                    self.graph.set_next(tail, loop_id);
                    self.root = loop_id;
                    Ok(Some(prolog))
                }
            }
            _ => Err(self.syntax("Internal logic error")),
        }
    }

    fn groupname(&mut self, first: char) -> Result<String, Error> {
        let mut name = String::new();
        name.push(first);
        loop {
            let ch = self.read();
            if ch.is_ascii_alphanumeric() {
                name.push(ch);
            } else if ch == '>' {
                return Ok(name);
            } else {
                return Err(self.syntax("named capturing group is missing trailing '>'"));
            }
        }
    }

    fn add_flags(&mut self) {
        let mut ch = self.peek();
        loop {
            match ch {
                'i' => self.flags |= Flags::CASE_INSENSITIVE,
                'm' => self.flags |= Flags::MULTILINE,
                's' => self.flags |= Flags::DOTALL,
                'd' => self.flags |= Flags::UNIX_LINES,
                'u' => self.flags |= Flags::UNICODE_CASE,
                'c' => self.flags |= Flags::CANON_EQ,
                'x' => self.flags |= Flags::COMMENTS,
                'U' => self.flags |= Flags::UNICODE_CLASS | Flags::UNICODE_CASE,
                '-' => {
                    self.next();
                    self.sub_flags();
                    return;
                }
                _ => return,
            }
            ch = self.next();
        }
    }

    fn sub_flags(&mut self) {
        let mut ch = self.peek();
        loop {
            match ch {
                'i' => self.flags &= !Flags::CASE_INSENSITIVE,
                'm' => self.flags &= !Flags::MULTILINE,
                's' => self.flags &= !Flags::DOTALL,
                'd' => self.flags &= !Flags::UNIX_LINES,
                'u' => self.flags &= !Flags::UNICODE_CASE,
                'c' => self.flags &= !Flags::CANON_EQ,
                'x' => self.flags &= !Flags::COMMENTS,
                'U' => self.flags &= !(Flags::UNICODE_CLASS | Flags::UNICODE_CASE),
                _ => return,
            }
            ch = self.next();
        }
    }

    // ---- escapes -----------------------------------------------------------

    /// Parse an escape sequence. The cursor is at the backslash on entry.
    ///
    /// With `create` off, node-producing escapes are probed but not built;
    /// the caller unwinds and re-parses. `isrange` makes `\v` yield the
    /// vertical-tab code point so it can bound a class range.
    fn escape(&mut self, inclass: bool, create: bool, isrange: bool) -> Result<Escaped, Error> {
        let ch = self.skip();
        let illegal_inclass = |p: &Parser<'_>| -> Result<Escaped, Error> {
            Err(p.syntax("Illegal/unsupported escape sequence"))
        };
        match ch {
            '0' => Ok(Escaped::Char(self.octal()?)),
            '1'..='9' => {
                if inclass {
                    return illegal_inclass(self);
                }
                if create {
                    let n = ch as u32 - '0' as u32;
                    Ok(Escaped::Node(self.backref(n as usize)?))
                } else {
                    Ok(Escaped::Meta)
                }
            }
            'A' => {
                if inclass {
                    return illegal_inclass(self);
                }
                self.meta_node(create, NodeKind::Begin)
            }
            'B' => {
                if inclass {
                    return illegal_inclass(self);
                }
                let unicode = self.has(Flags::UNICODE_CLASS);
                self.meta_node(create, NodeKind::Bound { kind: bound::NONE, unicode })
            }
            'b' => {
                if inclass {
                    return illegal_inclass(self);
                }
                let unicode = self.has(Flags::UNICODE_CLASS);
                self.meta_node(create, NodeKind::Bound { kind: bound::BOTH, unicode })
            }
            'G' => {
                if inclass {
                    return illegal_inclass(self);
                }
                self.meta_node(create, NodeKind::LastMatch)
            }
            'R' => {
                if inclass {
                    return illegal_inclass(self);
                }
                self.meta_node(create, NodeKind::LineEnding)
            }
            'Z' => {
                if inclass {
                    return illegal_inclass(self);
                }
                let kind = if self.has(Flags::UNIX_LINES) {
                    NodeKind::UnixDollar { multiline: false }
                } else {
                    NodeKind::Dollar { multiline: false }
                };
                self.meta_node(create, kind)
            }
            'z' => {
                if inclass {
                    return illegal_inclass(self);
                }
                self.meta_node(create, NodeKind::End)
            }
            'd' => Ok(Escaped::Class(self.ctype_class("digit"))),
            'D' => Ok(Escaped::Class(ClassExpr::Complement(Box::new(self.ctype_class("digit"))))),
            's' => Ok(Escaped::Class(self.ctype_class("space"))),
            'S' => Ok(Escaped::Class(ClassExpr::Complement(Box::new(self.ctype_class("space"))))),
            'w' => Ok(Escaped::Class(self.ctype_class("word"))),
            'W' => Ok(Escaped::Class(ClassExpr::Complement(Box::new(self.ctype_class("word"))))),
            'h' => Ok(Escaped::Class(horiz_ws())),
            'H' => Ok(Escaped::Class(ClassExpr::Complement(Box::new(horiz_ws())))),
            'v' => {
                if isrange {
                    Ok(Escaped::Char('\x0B'))
                } else {
                    Ok(Escaped::Class(vert_ws()))
                }
            }
            'V' => Ok(Escaped::Class(ClassExpr::Complement(Box::new(vert_ws())))),
            'k' => {
                if inclass {
                    return illegal_inclass(self);
                }
                if self.read() != '<' {
                    return Err(
                        self.syntax("\\k is not followed by '<' for named capturing group")
                    );
                }
                let first = self.read();
                let name = self.groupname(first)?;
                let group = match self.graph.named_groups.get(&name) {
                    Some(&g) if self.closed_groups.contains(&g) => g,
                    _ => {
                        return Err(self.err(ErrorKind::NoSuchGroup(format!(
                            "named capturing group <{}> does not exist",
                            name
                        ))))
                    }
                };
                if create {
                    Ok(Escaped::Node(self.backref_node(group)))
                } else {
                    Ok(Escaped::Meta)
                }
            }
            'a' => Ok(Escaped::Char('\x07')),
            'e' => Ok(Escaped::Char('\x1B')),
            'f' => Ok(Escaped::Char('\x0C')),
            'n' => Ok(Escaped::Char('\n')),
            'r' => Ok(Escaped::Char('\r')),
            't' => Ok(Escaped::Char('\t')),
            'c' => Ok(Escaped::Char(self.control()?)),
            'x' => Ok(Escaped::Char(self.hex()?)),
            'u' => Ok(Escaped::Char(self.unicode_escape()?)),
            'C' | 'E' | 'F' | 'I' | 'J' | 'L' | 'M' | 'N' | 'O' | 'P' | 'Q' | 'T' | 'U' | 'X'
            | 'Y' | 'g' | 'i' | 'j' | 'l' | 'm' | 'o' | 'p' | 'q' | 'y' => {
                Err(self.syntax("Illegal/unsupported escape sequence"))
            }
            _ => Ok(Escaped::Char(ch)),
        }
    }

    fn meta_node(&mut self, create: bool, kind: NodeKind) -> Result<Escaped, Error> {
        if create {
            let span = (self.cursor.saturating_sub(2), self.cursor);
            Ok(Escaped::Node(self.graph.add(kind, span)))
        } else {
            Ok(Escaped::Meta)
        }
    }

    /// A numeric back-reference, taking as many digits as name a group that
    /// exists at this point.
    fn backref(&mut self, mut refnum: usize) -> Result<NodeId, Error> {
        loop {
            let ch = self.peek();
            if !ch.is_ascii_digit() {
                break;
            }
            let wider = refnum * 10 + (ch as usize - '0' as usize);
            if self.graph.group_count - 1 < wider {
                break;
            }
            refnum = wider;
            self.read();
        }
        if refnum == 0
            || refnum >= self.graph.group_count
            || !self.closed_groups.contains(&refnum)
        {
            return Err(self.err(ErrorKind::NoSuchGroup(format!(
                "no group {} to reference",
                refnum
            ))));
        }
        Ok(self.backref_node(refnum))
    }

    fn backref_node(&mut self, group: usize) -> NodeId {
        let fold = if self.has(Flags::CASE_INSENSITIVE) {
            if self.has(Flags::UNICODE_CASE) {
                Fold::Unicode
            } else {
                Fold::Ascii
            }
        } else {
            Fold::None
        };
        let span = (self.cursor.saturating_sub(2), self.cursor);
        self.graph.add(NodeKind::BackRef { group, fold }, span)
    }

    /// The `\d`/`\s`/`\w` family, ASCII or Unicode per the flag state.
    fn ctype_class(&self, which: &str) -> ClassExpr {
        if self.has(Flags::UNICODE_CLASS) {
            let (name, pred): (&'static str, fn(char) -> bool) = match which {
                "digit" => ("digit", |c| c.is_numeric()),
                "space" => ("space", |c| c.is_whitespace()),
                _ => ("word", |c| c.is_alphanumeric() || c == '_'),
            };
            ClassExpr::Prop { name: name.into(), pred: Arc::new(NamedPredicate::new(name, pred)) }
        } else {
            let mut set = CharSet::empty();
            match which {
                "digit" => set.add_range('0', '9').unwrap(),
                "space" => {
                    for ch in [' ', '\t', '\n', '\x0B', '\x0C', '\r'] {
                        set.add(ch);
                    }
                }
                _ => {
                    set.add_range('a', 'z').unwrap();
                    set.add_range('A', 'Z').unwrap();
                    set.add_range('0', '9').unwrap();
                    set.add('_');
                }
            }
            ClassExpr::Set(set)
        }
    }

    // ---- escape value helpers ----------------------------------------------

    fn octal(&mut self) -> Result<char, Error> {
        let n = self.read();
        if !('0'..='7').contains(&n) {
            return Err(self.syntax("Illegal octal escape sequence"));
        }
        let m = self.read();
        if !('0'..='7').contains(&m) {
            self.unread();
            return Ok(char::from_u32(n as u32 - '0' as u32).unwrap());
        }
        let o = self.read();
        if ('0'..='7').contains(&o) && ('0'..='3').contains(&n) {
            let cp = (n as u32 - '0' as u32) * 64 + (m as u32 - '0' as u32) * 8
                + (o as u32 - '0' as u32);
            return Ok(char::from_u32(cp).unwrap());
        }
        self.unread();
        let cp = (n as u32 - '0' as u32) * 8 + (m as u32 - '0' as u32);
        Ok(char::from_u32(cp).unwrap())
    }

    fn control(&mut self) -> Result<char, Error> {
        if self.cursor < self.len {
            let ch = self.read();
            return char::from_u32(ch as u32 ^ 64)
                .ok_or_else(|| self.syntax("Illegal control escape sequence"));
        }
        Err(self.syntax("Illegal control escape sequence"))
    }

    fn hex(&mut self) -> Result<char, Error> {
        let n = self.read();
        if n.is_ascii_hexdigit() {
            let m = self.read();
            if m.is_ascii_hexdigit() {
                let cp = n.to_digit(16).unwrap() * 16 + m.to_digit(16).unwrap();
                return Ok(char::from_u32(cp).unwrap());
            }
        } else if n == '{' && self.peek().is_ascii_hexdigit() {
            let mut cp: u32 = 0;
            loop {
                let ch = self.read();
                if !ch.is_ascii_hexdigit() {
                    if ch != '}' {
                        return Err(self.syntax("Unclosed hexadecimal escape sequence"));
                    }
                    break;
                }
                cp = (cp << 4) + ch.to_digit(16).unwrap();
                if cp > 0x10FFFF {
                    return Err(self.syntax("Hexadecimal codepoint is too big"));
                }
            }
            return char::from_u32(cp)
                .ok_or_else(|| self.syntax("Hexadecimal codepoint is not a scalar value"));
        }
        Err(self.syntax("Illegal hexadecimal escape sequence"))
    }

    fn uxxxx(&mut self) -> Result<u32, Error> {
        let mut n: u32 = 0;
        for _ in 0..4 {
            let ch = self.read();
            if !ch.is_ascii_hexdigit() {
                return Err(self.syntax("Illegal Unicode escape sequence"));
            }
            n = n * 16 + ch.to_digit(16).unwrap();
        }
        Ok(n)
    }

    fn unicode_escape(&mut self) -> Result<char, Error> {
        let n = self.uxxxx()?;
        if (0xD800..0xDC00).contains(&n) {
            // A high surrogate pairs with an immediately following \uDCxx.
            let save = self.cursor;
            if self.read() == '\\' && self.read() == 'u' {
                let n2 = self.uxxxx()?;
                if (0xDC00..0xE000).contains(&n2) {
                    let cp = 0x10000 + ((n - 0xD800) << 10) + (n2 - 0xDC00);
                    return Ok(char::from_u32(cp).unwrap());
                }
            }
            self.cursor = save;
        }
        char::from_u32(n).ok_or_else(|| self.syntax("Illegal Unicode escape sequence"))
    }

    // ---- character classes --------------------------------------------------

    /// Parse a character class body. Consumes the trailing `]` when
    /// `consume` is set; the right side of `&&` leaves it for the caller.
    fn clazz(&mut self, consume: bool) -> Result<ClassExpr, Error> {
        let mut prev: Option<ClassExpr> = None;
        let mut include = true;
        let mut first_in_class = true;
        let mut ch = self.next();
        loop {
            match ch {
                '^' => {
                    // Negates only as the first character in the class.
                    if first_in_class && self.get(self.cursor - 1) == '[' {
                        ch = self.next();
                        include = !include;
                        continue;
                    }
                }
                '[' => {
                    first_in_class = false;
                    let node = self.clazz(true)?;
                    prev = Some(match prev {
                        None => node,
                        Some(p) => class_union(p, node),
                    });
                    ch = self.peek();
                    continue;
                }
                '&' => {
                    first_in_class = false;
                    ch = self.next();
                    if ch == '&' {
                        ch = self.next();
                        let mut right: Option<ClassExpr> = None;
                        while ch != ']' && ch != '&' {
                            if ch == '[' {
                                let node = self.clazz(true)?;
                                right = Some(match right {
                                    None => node,
                                    Some(r) => class_union(r, node),
                                });
                            } else {
                                self.unread();
                                let node = self.clazz(false)?;
                                right = Some(node);
                            }
                            ch = self.peek();
                        }
                        match (prev.take(), right) {
                            (Some(p), Some(r)) => {
                                prev = Some(ClassExpr::Intersect(Box::new(p), Box::new(r)));
                            }
                            (None, Some(r)) => prev = Some(r),
                            _ => return Err(self.syntax("Bad class syntax")),
                        }
                        continue;
                    }
                    // A literal &.
                    self.unread();
                }
                '\0' => {
                    first_in_class = false;
                    if self.cursor >= self.len {
                        return Err(self.syntax("Unclosed character class"));
                    }
                }
                ']' => {
                    first_in_class = false;
                    if let Some(p) = prev {
                        if consume {
                            self.next();
                        }
                        return Ok(p);
                    }
                    // A leading ] is a literal.
                }
                _ => {
                    first_in_class = false;
                }
            }
            let node = self.range()?;
            prev = Some(match (prev, include) {
                (None, true) => node,
                (Some(p), true) => class_union(p, node),
                (None, false) => ClassExpr::Complement(Box::new(node)),
                (Some(p), false) => ClassExpr::Difference(Box::new(p), Box::new(node)),
            });
            ch = self.peek();
        }
    }

    /// A single character or a range inside a class.
    fn range(&mut self) -> Result<ClassExpr, Error> {
        let mut ch = self.peek();
        if ch == '\\' {
            let esc = self.next_escaped();
            if esc == 'p' || esc == 'P' {
                let comp = esc == 'P';
                let mut one_letter = true;
                if self.next() == '{' {
                    one_letter = false;
                } else {
                    self.unread();
                }
                return self.family(one_letter, comp);
            }
            let isrange = self.get(self.cursor + 1) == '-';
            self.unread();
            match self.escape(true, true, isrange)? {
                Escaped::Class(expr) => return Ok(expr),
                Escaped::Char(c) => ch = c,
                _ => return Err(self.syntax("Unexpected escape in character class")),
            }
        } else {
            self.next();
        }
        if self.peek() == '-' {
            let end_range = self.get(self.cursor + 1);
            if end_range == '[' {
                return Ok(self.class_single(ch));
            }
            if end_range != ']' {
                self.next();
                let m = self.peek();
                let m = if m == '\\' {
                    match self.escape(true, false, true)? {
                        Escaped::Char(c) => c,
                        _ => return Err(self.err(ErrorKind::InvalidRange)),
                    }
                } else {
                    self.next();
                    m
                };
                if m < ch {
                    return Err(self.err(ErrorKind::InvalidRange));
                }
                if self.has(Flags::CASE_INSENSITIVE) {
                    let unicode = self.has(Flags::UNICODE_CASE);
                    return Ok(ClassExpr::FoldRange { lo: ch, hi: m, unicode });
                }
                let mut set = CharSet::empty();
                set.add_range(ch, m).map_err(|_| self.err(ErrorKind::InvalidRange))?;
                return Ok(ClassExpr::Set(set));
            }
        }
        Ok(self.class_single(ch))
    }

    /// A single class member, with case folds when the mode asks for them.
    fn class_single(&self, ch: char) -> ClassExpr {
        let mut set = CharSet::single(ch);
        if self.has(Flags::CASE_INSENSITIVE) {
            if self.has(Flags::UNICODE_CASE) {
                set.add(crate::charset::simple_upper(ch));
                set.add(crate::charset::simple_fold(ch));
            } else if ch.is_ascii() {
                set.add(ch.to_ascii_uppercase());
                set.add(ch.to_ascii_lowercase());
            }
        }
        ClassExpr::Set(set)
    }

    /// A `\p{...}` or `\P{...}` property family.
    ///
    /// The cursor is one short of the property on entry: at the letter for
    /// the one-letter form, at the `{` otherwise.
    fn family(&mut self, one_letter: bool, maybe_complement: bool) -> Result<ClassExpr, Error> {
        self.next();
        let name = if one_letter {
            let c = self.get(self.cursor);
            self.read();
            c.to_string()
        } else {
            let start = self.cursor;
            while self.cursor <= self.len && self.get(self.cursor) != '}' {
                self.cursor += 1;
            }
            if self.cursor > self.len {
                return Err(self.syntax("Unclosed character family"));
            }
            let name: String = self.buf[start..self.cursor].iter().collect();
            self.cursor += 1;
            if name.is_empty() {
                return Err(self.syntax("Empty character family"));
            }
            name
        };

        let node = if let Some(eq) = name.find('=') {
            // The \p{name=value} construct.
            let value = &name[eq + 1..];
            match name[..eq].to_ascii_lowercase().as_str() {
                "sc" | "script" => self.lookup_prop(value, "script")?,
                "blk" | "block" => self.lookup_prop(value, "block")?,
                "gc" | "general_category" => self.lookup_prop(value, "property")?,
                other => {
                    return Err(self.syntax(&format!(
                        "Unknown Unicode property {{name=<{}>, value=<{}>}}",
                        other, value
                    )))
                }
            }
        } else if let Some(rest) = name.strip_prefix("In") {
            self.lookup_prop(rest, "block")?
        } else if let Some(rest) = name.strip_prefix("Is") {
            self.lookup_prop(rest, "property")?
        } else {
            self.lookup_prop(&name, "property")?
        };
        if maybe_complement {
            return Ok(ClassExpr::Complement(Box::new(node)));
        }
        Ok(node)
    }

    fn lookup_prop(&self, name: &str, what: &str) -> Result<ClassExpr, Error> {
        match self.oracle.property(name) {
            Some(pred) => Ok(ClassExpr::Prop { name: name.into(), pred }),
            None => Err(self.syntax(&format!(
                "Unknown character {} name {{{}}}",
                what, name
            ))),
        }
    }
}

fn class_union(a: ClassExpr, b: ClassExpr) -> ClassExpr {
    // Explicit sets collapse eagerly, so [abc0-9] stays one set.
    match (a, b) {
        (ClassExpr::Set(a), ClassExpr::Set(b)) => ClassExpr::Set(a.union(&b)),
        (a, b) => ClassExpr::Union(Box::new(a), Box::new(b)),
    }
}

fn horiz_ws() -> ClassExpr {
    let mut set = CharSet::empty();
    for ch in ['\t', ' ', '\u{A0}', '\u{1680}', '\u{180E}', '\u{202F}', '\u{205F}', '\u{3000}'] {
        set.add(ch);
    }
    set.add_range('\u{2000}', '\u{200A}').unwrap();
    ClassExpr::Set(set)
}

fn vert_ws() -> ClassExpr {
    let mut set = CharSet::empty();
    set.add_range('\n', '\r').unwrap();
    set.add('\u{85}');
    set.add('\u{2028}');
    set.add('\u{2029}');
    ClassExpr::Set(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::charset::StdPropertyOracle;
    use crate::error::ErrorKind;

    fn compile(pattern: &str) -> Result<Graph, Error> {
        parse(pattern, Flags::empty(), &StdPropertyOracle)
    }

    fn kinds(graph: &Graph) -> Vec<String> {
        graph
            .nodes
            .iter()
            .map(|n| format!("{:?}", n.kind).split(&['(', ' ', '{'][..]).next().unwrap().to_string())
            .collect()
    }

    #[test]
    fn literal_run_collapses_to_slice() {
        let g = compile("abc").unwrap();
        assert!(matches!(
            g.kind(g.match_root),
            NodeKind::Slice { ref buf, fold: Fold::None } if buf.as_ref() == ['a', 'b', 'c']
        ));
    }

    #[test]
    fn quantifier_unwinds_one_char() {
        // In ab+, the + binds to b alone.
        let g = compile("ab+").unwrap();
        match g.kind(g.match_root) {
            NodeKind::Char { ch } => assert_eq!(*ch, 'a'),
            other => panic!("expected Char head, got {:?}", other),
        }
        let rep = g.next(g.match_root);
        match g.kind(rep) {
            NodeKind::Curly { atom, min: 1, max: u32::MAX, mode: Quant::Greedy } => {
                assert!(matches!(g.kind(*atom), NodeKind::Char { ch: 'b' }));
            }
            other => panic!("expected Curly, got {:?}", other),
        }
    }

    #[test]
    fn long_literal_gets_boyer_moore_root() {
        let g = compile("needle").unwrap();
        assert!(matches!(g.kind(g.root), NodeKind::BoyerMoore { .. }));
        assert!(matches!(g.kind(g.match_root), NodeKind::Slice { .. }));
    }

    #[test]
    fn anchored_pattern_has_no_starter() {
        let g = compile("^abc").unwrap();
        assert_eq!(g.root, g.match_root);
        assert!(matches!(g.kind(g.root), NodeKind::Begin));
    }

    #[test]
    fn alternation_builds_branch() {
        let g = compile("a|b|c").unwrap();
        let atoms = g.branch_atoms(g.match_root).unwrap();
        assert_eq!(atoms.len(), 3);
        assert!(atoms.iter().all(|a| a.is_some()));
    }

    #[test]
    fn group_quantifier_non_deterministic_body_uses_loop() {
        let g = compile("(a|b)+").unwrap();
        assert!(matches!(g.kind(g.match_root), NodeKind::Prolog { .. }));
        assert!(kinds(&g).iter().any(|k| k == "Loop"));
    }

    #[test]
    fn group_quantifier_deterministic_body_uses_group_curly() {
        let g = compile("(a)+").unwrap();
        assert!(matches!(
            g.kind(g.match_root),
            NodeKind::GroupCurly { min: 1, capture: true, .. }
        ));
    }

    #[test]
    fn optional_group_becomes_branch() {
        let g = compile("(a)?").unwrap();
        assert!(g.branch_atoms(g.match_root).is_some());
    }

    #[test]
    fn named_groups_register() {
        let g = compile("(?<year>[0-9]{4})").unwrap();
        assert_eq!(g.named_groups.get("year"), Some(&1));
        assert_eq!(g.group_count, 2);
    }

    #[test]
    fn duplicate_named_group_errors() {
        let err = compile("(?<a>x)(?<a>y)").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Syntax(_)));
    }

    #[test]
    fn named_backref_to_missing_group_errors() {
        let err = compile(r"\k<nope>").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::NoSuchGroup(_)));
    }

    #[test]
    fn numeric_backref_is_greedy_only_while_groups_exist() {
        // With 12 groups, \11 references group 11; with 1 group, \11 is
        // group 1 followed by a literal 1.
        let g = compile(r"(a)\11").unwrap();
        let mut found = false;
        for node in g.nodes.iter() {
            if let NodeKind::BackRef { group, .. } = node.kind {
                assert_eq!(group, 1);
                found = true;
            }
        }
        assert!(found);
    }

    #[test]
    fn dangling_meta_character_errors() {
        for p in ["*a", "+a", "?a"] {
            let err = compile(p).unwrap_err();
            assert!(matches!(err.kind(), ErrorKind::Syntax(_)), "pattern {}", p);
        }
    }

    #[test]
    fn unclosed_group_errors() {
        assert!(compile("(ab").is_err());
        assert!(compile("ab)").is_err());
    }

    #[test]
    fn illegal_repetition_range_errors() {
        let err = compile("a{3,2}").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Syntax(_)));
    }

    #[test]
    fn reversed_class_range_errors() {
        let err = compile("[z-a]").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidRange));
    }

    #[test]
    fn unbounded_lookbehind_is_unsupported() {
        let err = compile("(?<=a+)b").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Unsupported(_)));
        assert!(compile("(?<=ab?)c").is_ok());
    }

    #[test]
    fn lookbehind_with_unbounded_branch_errors() {
        let err = compile("(?<=a|b*)c").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Unsupported(_)));
    }

    #[test]
    fn canon_eq_is_unsupported() {
        let err = parse("abc", Flags::CANON_EQ, &StdPropertyOracle).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Unsupported(_)));
    }

    #[test]
    fn linebreak_escape_rejected_in_class() {
        let err = compile(r"[\R]").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Syntax(_)));
    }

    #[test]
    fn quoting_expands_before_parsing() {
        let g = compile(r"\Qa+b\E").unwrap();
        // The quoted body is all literal, so no repetition node exists.
        assert!(!kinds(&g).iter().any(|k| k == "Curly" || k == "Ques"));
    }

    #[test]
    fn literal_flag_makes_one_slice() {
        let g = parse("a+b", Flags::LITERAL, &StdPropertyOracle).unwrap();
        assert!(matches!(
            g.kind(g.match_root),
            NodeKind::Slice { ref buf, .. } if buf.as_ref() == ['a', '+', 'b']
        ));
    }

    #[test]
    fn inline_flags_scope_to_group() {
        let g = compile("(?i:a)a").unwrap();
        let k = kinds(&g);
        assert!(k.iter().any(|s| s == "CharI"));
        assert!(k.iter().any(|s| s == "Char"));
    }

    #[test]
    fn class_negation_and_intersection() {
        assert!(compile("[^a-z]").is_ok());
        assert!(compile("[a-z&&[aeiou]]").is_ok());
        assert!(compile("[a-z&&[^m-p]]").is_ok());
        assert!(compile("[a-[bc]]").is_ok());
    }

    #[test]
    fn unclosed_class_errors() {
        assert!(compile("[abc").is_err());
    }

    #[test]
    fn leading_close_bracket_is_literal() {
        let g = compile("[]a]").unwrap();
        match g.kind(g.match_root) {
            NodeKind::Class(cls) => {
                assert!(cls.contains(']'));
                assert!(cls.contains('a'));
            }
            other => panic!("expected class, got {:?}", other),
        }
    }

    #[test]
    fn hex_and_octal_escapes() {
        assert!(matches!(
            compile(r"\x41").unwrap().kind(3),
            NodeKind::Char { ch: 'A' }
        ));
        assert!(matches!(
            compile(r"\x{1F600}").unwrap().kind(3),
            NodeKind::Char { ch: '\u{1F600}' }
        ));
        assert!(matches!(
            compile(r"\0101").unwrap().kind(3),
            NodeKind::Char { ch: 'A' }
        ));
        assert!(matches!(
            compile(r"\cA").unwrap().kind(3),
            NodeKind::Char { ch: '\x01' }
        ));
        assert!(compile(r"\x{FFFFFF}").is_err());
        assert!(compile(r"\x{D800}").is_err());
    }

    #[test]
    fn surrogate_pair_escape_combines() {
        let g = compile(r"😀").unwrap();
        assert!(matches!(g.kind(3), NodeKind::Char { ch: '\u{1F600}' }));
        let paired = compile(r"\uD83D\uDE00").unwrap();
        assert!(matches!(paired.kind(3), NodeKind::Char { ch: '\u{1F600}' }));
        assert!(compile(r"\uD83D").is_err());
    }

    #[test]
    fn backref_to_unclosed_group_errors() {
        let err = compile(r"(a\1)").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::NoSuchGroup(_)));
        assert!(compile(r"(a)\1").is_ok());
    }

    #[test]
    fn unknown_property_errors() {
        assert!(compile(r"\p{NoSuchThing}").is_err());
        assert!(compile(r"\p{L}").is_ok());
        assert!(compile(r"\p{IsAlphabetic}").is_ok());
    }

    #[test]
    fn error_position_is_reported() {
        let err = compile("ab(?<").unwrap_err();
        assert!(err.position() >= 3);
        assert_eq!(err.pattern(), "ab(?<");
    }

    #[test]
    fn empty_pattern_compiles() {
        let g = compile("").unwrap();
        assert!(matches!(g.kind(g.match_root), NodeKind::LastAccept));
    }

    #[test]
    fn spans_cover_repetitions() {
        let g = compile("x(a|b)+y").unwrap();
        let mut found = false;
        for (id, node) in g.nodes.iter().enumerate() {
            if matches!(node.kind, NodeKind::Loop { .. }) {
                let (b, e) = g.span(id);
                assert!(b < e && e <= 8, "span ({}, {})", b, e);
                found = true;
            }
        }
        assert!(found);
    }
}
