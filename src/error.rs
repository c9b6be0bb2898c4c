use std::fmt;

/// An error that occurred while compiling a pattern into a match graph.
///
/// The error carries the pattern text as the parser saw it (after `\Q...\E`
/// expansion) and the code point offset at which compilation failed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Error {
    kind: ErrorKind,
    pattern: String,
    pos: usize,
}

/// The kind of a compilation error.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The pattern text is malformed: a dangling meta character, an
    /// unmatched parenthesis or bracket, an illegal repetition range, an
    /// unknown escape and so on. The message says which.
    Syntax(String),
    /// The pattern is syntactically valid but uses a construct this engine
    /// refuses to compile, e.g. a look-behind without an obvious maximum
    /// length or the canonical-equivalence flag.
    Unsupported(String),
    /// A back-reference or `\k<name>` referred to a group that does not
    /// exist at that point in the pattern.
    NoSuchGroup(String),
    /// A character range whose start is above its end, e.g. `[z-a]`.
    InvalidRange,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, pattern: &[char], pos: usize) -> Error {
        Error { kind, pattern: pattern.iter().collect(), pos }
    }

    /// Return the kind of this error.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// The pattern that failed to compile, after quote expansion.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// The code point offset at which the error was detected.
    pub fn position(&self) -> usize {
        self.pos
    }
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self.kind {
            ErrorKind::Syntax(ref msg) => msg.as_str(),
            ErrorKind::Unsupported(ref msg) => msg.as_str(),
            ErrorKind::NoSuchGroup(ref msg) => msg.as_str(),
            ErrorKind::InvalidRange => "illegal character range",
        };
        writeln!(f, "{} near position {}", msg, self.pos)?;
        writeln!(f, "{}", self.pattern)?;
        // The caret lines up with code points, which is what `pos` counts.
        for _ in 0..self.pos {
            write!(f, " ")?;
        }
        write!(f, "^")
    }
}

/// A signal that a match call ran out of its step budget.
///
/// This is recoverable and distinct from a plain non-match: the caller may
/// retry with a larger budget, or treat the abort as evidence that the
/// pattern is pathological on this input. The step count reached when the
/// budget tripped is observable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BudgetExceeded {
    steps: u64,
}

impl BudgetExceeded {
    pub(crate) fn new(steps: u64) -> BudgetExceeded {
        BudgetExceeded { steps }
    }

    /// The number of steps taken before the budget tripped.
    pub fn steps(&self) -> u64 {
        self.steps
    }
}

impl std::error::Error for BudgetExceeded {}

impl fmt::Display for BudgetExceeded {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "match aborted after exceeding its budget of {} steps", self.steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_points_at_offset() {
        let pattern: Vec<char> = "a{2,1}".chars().collect();
        let err = Error::new(
            ErrorKind::Syntax("illegal repetition range".to_string()),
            &pattern,
            5,
        );
        let printed = err.to_string();
        assert!(printed.contains("a{2,1}"));
        assert!(printed.contains("position 5"));
        let caret_line = printed.lines().last().unwrap();
        assert_eq!(caret_line.find('^'), Some(5));
    }

    #[test]
    fn budget_reports_steps() {
        let b = BudgetExceeded::new(1234);
        assert_eq!(b.steps(), 1234);
        assert!(b.to_string().contains("1234"));
    }
}
