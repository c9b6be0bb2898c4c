use regex_redos::{analyze, Analyzer, Pattern};

const THRESHOLD: u64 = 50_000;

fn findings(pattern: &str) -> Vec<regex_redos::Vulnerability> {
    let p = Pattern::new(pattern).unwrap();
    Analyzer::new(&p).pump_count(16).run(THRESHOLD)
}

#[test]
fn nested_quantifier_finding() {
    let found = findings("^(a+)+$");
    assert_eq!(found.len(), 1);
    let v = &found[0];
    assert_eq!(v.pump, "a");
    assert!(v.prefix.is_empty());
    assert!(!v.suffix.is_empty());
    assert!(!v.suffix.contains('a'));
    assert!(v.steps >= THRESHOLD);
}

#[test]
fn exponential_overlapping_alternation() {
    let found = findings("^(a|a)+$");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].pump, "a");
    assert!(!found[0].suffix.contains('a'));
}

#[test]
fn exponential_steps_double_per_pump() {
    // The signature of the exponential case: adding one pump character at
    // least doubles the work.
    let re = Pattern::new("^(a|a)+$").unwrap();
    let mut previous = 0u64;
    for k in 8..=11 {
        let attack = format!("{}b", "a".repeat(k));
        let mut m = re.matcher(&attack);
        assert!(!m.find().unwrap().is_some());
        let steps = m.steps();
        if previous > 0 {
            assert!(
                steps >= previous * 2,
                "k={}: {} steps after {}",
                k,
                steps,
                previous
            );
        }
        previous = steps;
    }
}

#[test]
fn linear_patterns_have_no_findings() {
    for pattern in ["a+", "a*b", "a{3,5}c", "(?>a*)b"] {
        assert!(findings(pattern).is_empty(), "false positive on {}", pattern);
    }
}

#[test]
fn possessive_quantifiers_have_no_findings() {
    for pattern in ["a*+b", "^(a++)+$", "(?>a+)+"] {
        assert!(findings(pattern).is_empty(), "false positive on {}", pattern);
    }
}

#[test]
fn attack_replays_against_the_engine() {
    let re = Pattern::new("^(a+)+$").unwrap();
    let found = Analyzer::new(&re).pump_count(16).run(THRESHOLD);
    let v = &found[0];

    let attack = format!("{}{}{}", v.prefix, v.pump.repeat(16), v.suffix);
    let mut m = re.matcher(&attack);
    m.set_budget(THRESHOLD);
    let err = m.find().unwrap_err();
    assert!(err.steps() > THRESHOLD);

    // Without the suffix the same input matches quickly.
    let benign = format!("{}{}", v.prefix, v.pump.repeat(16));
    let mut m = re.matcher(&benign);
    m.set_budget(THRESHOLD);
    assert!(m.find().unwrap().is_some());
}

#[test]
fn finding_span_nests_in_pattern() {
    let pattern = "x(y|(a+)+z)w";
    let p = Pattern::new(pattern).unwrap();
    let found = Analyzer::new(&p).pump_count(16).run(THRESHOLD);
    for v in &found {
        let (b, e) = v.span;
        assert!(b < e && e <= pattern.chars().count());
    }
}

#[test]
fn batch_for_loop_highlighting_pattern() {
    // From a real syntax highlighter; the nested optional flag group makes
    // the starred group ambiguous.
    let pattern = r#"((?:^|[&(])[ \t]*)for(?: ?/[a-z?](?:[ :](?:"[^"]*"|\S+))?)* \S+ in \([^)]+\) do"#;
    let found = findings(pattern);
    assert!(!found.is_empty());
    assert!(found.iter().any(|v| v.pump.contains('/')));
}

#[test]
fn default_entry_point() {
    let p = Pattern::new("^(a|a)+$").unwrap();
    // The convenience function uses the default pump count of 7; the
    // exponential case still explodes well before 2^7 full walks finish.
    let found = analyze(&p, 500);
    assert_eq!(found.len(), 1);
}

#[test]
fn prefix_reaches_nested_repetition() {
    let found = findings("^start(a+)+$");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].prefix, "start");
    assert_eq!(found[0].pump, "a");
}

#[test]
fn analyzer_is_pure_per_pattern() {
    let p = Pattern::new("^(a+)+$").unwrap();
    let a = Analyzer::new(&p).pump_count(16);
    let first = a.run(THRESHOLD);
    let second = a.run(THRESHOLD);
    assert_eq!(first, second);
}
