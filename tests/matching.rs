use regex_redos::{Flags, Pattern};

fn find_span(pattern: &str, text: &str) -> Option<(usize, usize)> {
    Pattern::new(pattern).unwrap().find(text).map(|m| (m.start(), m.end()))
}

#[test]
fn literal_and_slice_search() {
    assert_eq!(find_span("abc", "xxabcxx"), Some((2, 5)));
    assert_eq!(find_span("abc", "ab"), None);
    // Long enough to engage the Boyer-Moore leading literal.
    assert_eq!(find_span("needle", "haystack with a needle in it"), Some((16, 22)));
    assert_eq!(find_span("needle", "haystack with nothing"), None);
}

#[test]
fn greedy_lazy_possessive() {
    assert_eq!(find_span("a+", "aaab"), Some((0, 3)));
    assert_eq!(find_span("a+?", "aaab"), Some((0, 1)));
    assert_eq!(find_span("a*b", "aaab"), Some((0, 4)));
    // The possessive run never gives back the final a.
    assert_eq!(find_span("a*+ab", "aaab"), None);
    assert_eq!(find_span("a*+b", "aaab"), Some((0, 4)));
}

#[test]
fn counted_repetition() {
    assert_eq!(find_span("a{2,3}", "aaaa"), Some((0, 3)));
    assert_eq!(find_span("a{2,3}?", "aaaa"), Some((0, 2)));
    assert_eq!(find_span("a{4}", "aaa"), None);
    assert_eq!(find_span("(ab){2}", "ababab"), Some((0, 4)));
}

#[test]
fn alternation_prefers_earlier_branches() {
    let re = Pattern::new("(foo|foobar)").unwrap();
    let m = re.find("foobar").unwrap();
    assert_eq!((m.start(), m.end()), (0, 3));
}

#[test]
fn matches_agrees_with_anchored_find() {
    let re = Pattern::new("a+").unwrap();
    assert!(re.matches("aaa"));
    let m = re.find("aaa").unwrap();
    assert_eq!((m.start(), m.end()), (0, 3));

    assert!(!re.matches("aaab"));
    assert!(re.is_match("aaab"));
}

#[test]
fn capture_groups() {
    let re = Pattern::new("(a+)(b)?").unwrap();
    let mut m = re.matcher("aa");
    assert!(m.find().unwrap().is_some());
    assert_eq!(m.group(1), Some((0, 2)));
    assert_eq!(m.group(2), None);
    assert_eq!(m.group_str(1), Some("aa"));
}

#[test]
fn nested_groups_number_in_source_order() {
    let re = Pattern::new("((a)(b(c)))").unwrap();
    let mut m = re.matcher("abc");
    assert!(m.find().unwrap().is_some());
    assert_eq!(m.group_str(1), Some("abc"));
    assert_eq!(m.group_str(2), Some("a"));
    assert_eq!(m.group_str(3), Some("bc"));
    assert_eq!(m.group_str(4), Some("c"));
}

#[test]
fn back_references() {
    assert_eq!(find_span(r"(a+)\1", "aaaa"), Some((0, 4)));
    assert_eq!(find_span(r"(a+)\1", "aaa"), Some((0, 2)));
    assert_eq!(find_span(r"(ab)\1", "abab"), Some((0, 4)));
    assert_eq!(find_span(r"(ab)\1", "abba"), None);
    // A reference to a group that did not participate cannot match.
    assert_eq!(find_span(r"(?:(a)|b)\1", "bb"), None);
}

#[test]
fn named_back_reference() {
    let re = Pattern::new(r"(?<tag>ab)\k<tag>").unwrap();
    assert!(re.is_match("abab"));
    assert!(!re.is_match("abxy"));
}

#[test]
fn case_insensitive_back_reference() {
    let re = Pattern::with_flags(r"(ab)\1", Flags::CASE_INSENSITIVE).unwrap();
    assert!(re.is_match("abAB"));
}

#[test]
fn lookahead() {
    assert_eq!(find_span("a(?=b)", "ab"), Some((0, 1)));
    assert_eq!(find_span("a(?=b)", "ac"), None);
    assert_eq!(find_span("a(?!b)", "ac"), Some((0, 1)));
    assert_eq!(find_span("a(?!b)", "ab"), None);
}

#[test]
fn lookbehind() {
    assert_eq!(find_span("(?<=a)b", "ab"), Some((1, 2)));
    assert_eq!(find_span("(?<=a)b", "cb"), None);
    assert_eq!(find_span("(?<!a)b", "cb"), Some((1, 2)));
    assert_eq!(find_span("(?<!a)b", "ab"), None);
    // Variable but bounded width.
    assert_eq!(find_span("(?<=ab?)c", "abc"), Some((2, 3)));
    assert_eq!(find_span("(?<=ab?)c", "ac"), Some((1, 2)));
}

#[test]
fn atomic_group_never_gives_back() {
    assert!(Pattern::new("(?>a+)b").unwrap().is_match("aaab"));
    assert!(!Pattern::new("(?>a*)a").unwrap().is_match("aaa"));
    assert!(Pattern::new("(?>a|ab)c").unwrap().is_match("ac"));
    // The a branch commits, so the b can never be matched.
    assert!(!Pattern::new("(?>a|ab)c").unwrap().is_match("abc"));
}

#[test]
fn anchors() {
    assert_eq!(find_span("^a", "ab"), Some((0, 1)));
    assert_eq!(find_span("^b", "ab"), None);
    assert_eq!(find_span("b$", "ab"), Some((1, 2)));
    // $ matches before a final line terminator.
    assert_eq!(find_span("b$", "ab\n"), Some((1, 2)));
    assert_eq!(find_span(r"b\z", "ab\n"), None);
    assert_eq!(find_span(r"ab\z", "ab"), Some((0, 2)));
}

#[test]
fn multiline_anchors() {
    let re = Pattern::with_flags("^b", Flags::MULTILINE).unwrap();
    assert_eq!(re.find("a\nb").map(|m| (m.start(), m.end())), Some((2, 3)));
    let re = Pattern::with_flags("a$", Flags::MULTILINE).unwrap();
    assert_eq!(re.find("a\nb").map(|m| (m.start(), m.end())), Some((0, 1)));
}

#[test]
fn word_boundaries() {
    assert_eq!(find_span(r"\bword\b", "a word."), Some((2, 6)));
    assert_eq!(find_span(r"\bword\b", "password"), None);
    assert_eq!(find_span(r"\Bord\b", "password"), Some((5, 8)));
}

#[test]
fn continuation_anchor() {
    let re = Pattern::new(r"\Ga").unwrap();
    let spans: Vec<(usize, usize)> =
        re.find_iter("aab").map(|m| (m.start(), m.end())).collect();
    assert_eq!(spans, vec![(0, 1), (1, 2)]);
}

#[test]
fn dot_and_dotall() {
    assert_eq!(find_span(".", "\n"), None);
    let re = Pattern::with_flags(".", Flags::DOTALL).unwrap();
    assert!(re.is_match("\n"));
    let re = Pattern::with_flags(".", Flags::UNIX_LINES).unwrap();
    assert!(re.is_match("\r"));
    assert!(!re.is_match("\n"));
}

#[test]
fn classes() {
    assert!(Pattern::new("[a-c]").unwrap().is_match("b"));
    assert!(!Pattern::new("[a-c]").unwrap().is_match("d"));
    assert!(Pattern::new("[^a-c]").unwrap().is_match("d"));
    assert!(Pattern::new("[a-z&&[^m-p]]").unwrap().is_match("a"));
    assert!(!Pattern::new("[a-z&&[^m-p]]").unwrap().is_match("n"));
    assert!(Pattern::new(r"[\d]").unwrap().is_match("7"));
    // A negated complement is just the class itself.
    assert!(Pattern::new(r"[^\D]").unwrap().is_match("7"));
    assert!(!Pattern::new(r"[^\D]").unwrap().is_match("x"));
}

#[test]
fn perl_classes_and_properties() {
    assert!(Pattern::new(r"\w+").unwrap().matches("abc_123"));
    assert!(Pattern::new(r"\s").unwrap().is_match("\t"));
    assert!(!Pattern::new(r"\S").unwrap().is_match(" "));
    assert!(Pattern::new(r"\h").unwrap().is_match("\t"));
    assert!(Pattern::new(r"\v").unwrap().is_match("\n"));
    assert!(Pattern::new(r"\p{Lu}").unwrap().is_match("A"));
    assert!(!Pattern::new(r"\p{Lu}").unwrap().is_match("a"));
    assert!(Pattern::new(r"\P{Lu}").unwrap().is_match("a"));
    assert!(Pattern::new(r"\p{Alpha}").unwrap().is_match("q"));
}

#[test]
fn line_ending_escape() {
    let re = Pattern::new(r"a\Rb").unwrap();
    assert!(re.matches("a\nb"));
    assert!(re.matches("a\r\nb"));
    assert!(re.matches("a\u{2028}b"));
    assert!(!re.matches("a b"));
}

#[test]
fn case_insensitive_matching() {
    let re = Pattern::with_flags("strasse", Flags::CASE_INSENSITIVE).unwrap();
    assert!(re.matches("STRASSE"));
    let re = Pattern::with_flags("[a-f]+", Flags::CASE_INSENSITIVE).unwrap();
    assert!(re.matches("DeadBeef"));
}

#[test]
fn unicode_case_fold_round_trip() {
    let flags = Flags::CASE_INSENSITIVE | Flags::UNICODE_CASE;
    let re = Pattern::with_flags("é", flags).unwrap();
    assert!(re.is_match("É"));
    let re = Pattern::with_flags("É", flags).unwrap();
    assert!(re.is_match("é"));
}

#[test]
fn inline_flags_scope() {
    let re = Pattern::new("(?i:a)a").unwrap();
    assert!(re.matches("Aa"));
    assert!(!re.matches("AA"));
    let re = Pattern::new("(?i)a(?-i)a").unwrap();
    assert!(re.matches("Aa"));
    assert!(!re.matches("aA"));
}

#[test]
fn comments_mode() {
    let re = Pattern::with_flags("a b # trailing comment\nc", Flags::COMMENTS).unwrap();
    assert!(re.matches("abc"));
}

#[test]
fn literal_mode() {
    let re = Pattern::with_flags("a+b", Flags::LITERAL).unwrap();
    assert!(re.matches("a+b"));
    assert!(!re.is_match("aab"));
}

#[test]
fn quoted_section() {
    let re = Pattern::new(r"\Qa+b\E c").unwrap();
    assert!(re.is_match("a+b c"));
    assert!(!re.is_match("aab c"));
}

#[test]
fn empty_pattern_and_empty_input() {
    let re = Pattern::new("").unwrap();
    assert!(re.matches(""));
    assert!(!re.matches("a"));
    assert!(re.is_match("a"));

    let re = Pattern::new("a*").unwrap();
    assert!(re.matches(""));

    let re = Pattern::new("^").unwrap();
    assert_eq!(re.find("").map(|m| (m.start(), m.end())), Some((0, 0)));
}

#[test]
fn find_iter_advances_past_empty_matches() {
    let re = Pattern::new("a*").unwrap();
    let spans: Vec<(usize, usize)> =
        re.find_iter("aab").map(|m| (m.start(), m.end())).collect();
    assert_eq!(spans, vec![(0, 2), (2, 2), (3, 3)]);
}

#[test]
fn non_ascii_haystack_offsets_are_bytes() {
    let re = Pattern::new("b+").unwrap();
    let m = re.find("αβbbγ").unwrap();
    assert_eq!(m.as_str(), "bb");
    assert_eq!(m.start(), 4);
    assert_eq!(m.end(), 6);
}

#[test]
fn supplementary_characters_match() {
    let re = Pattern::new("😀+").unwrap();
    let m = re.find("ab😀😀cd").unwrap();
    assert_eq!(m.as_str(), "😀😀");
}

#[test]
fn compilation_is_deterministic() {
    let a = Pattern::new(r"(x|y)*[a-f]{2,4}\w+$").unwrap();
    let b = Pattern::new(r"(x|y)*[a-f]{2,4}\w+$").unwrap();
    assert_eq!(format!("{:?}", a), format!("{:?}", b));
}

#[test]
fn possessive_match_takes_linear_steps() {
    let text: String = std::iter::repeat('a').take(100).collect();
    let re = Pattern::new("a*+b").unwrap();
    let mut m = re.matcher(&text);
    assert!(!m.matches().unwrap());
    // No backtracking: the step count stays proportional to the input.
    assert!(m.steps() < 500, "took {} steps", m.steps());
}

#[test]
fn budget_aborts_pathological_match() {
    let text: String = std::iter::repeat('a').take(25).collect();
    let re = Pattern::new("^(a|a)*c").unwrap();
    let mut m = re.matcher(&text);
    m.set_budget(100_000);
    let err = m.find().unwrap_err();
    assert!(err.steps() > 100_000);

    // The same search with a disjoint alternation stays cheap.
    let re = Pattern::new("^(a|b)*c").unwrap();
    let mut m = re.matcher(&text);
    m.set_budget(100_000);
    assert_eq!(m.find().unwrap(), None);
}

#[test]
fn budget_zero_is_unlimited() {
    let re = Pattern::new("a+b").unwrap();
    let mut m = re.matcher("aaaa");
    assert_eq!(m.find().unwrap(), None);
    assert!(m.steps() > 0);
}

#[test]
fn hit_end_reporting() {
    let re = Pattern::new("abc").unwrap();
    let mut m = re.matcher("ab");
    assert_eq!(m.find().unwrap(), None);
    assert!(m.hit_end());
}
