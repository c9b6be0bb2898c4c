/*!
This crate provides a backtracking regular expression engine whose every
step is accountable, together with a static analyzer that decides whether a
pattern is vulnerable to catastrophic backtracking (ReDoS) and, when it is,
synthesizes a concrete attack string.

The two halves are inseparable. The engine (tokenizer, parser, match-node
graph and recursive interpreter) counts each node match against a
caller-supplied step budget, and exceeding the budget aborts with a
recoverable [`BudgetExceeded`] signal rather than a plain non-match. The
analyzer walks the same node graph the interpreter executes, enumerates
candidate *pump* strings for every backtracking repetition, and confirms
each candidate empirically by running the interpreter on
`prefix · pump^k · suffix` with the budget set to the caller's threshold. A
budget abort is the confirmation.

# Example: matching with a budget

```rust
use regex_redos::Pattern;

let re = Pattern::new(r"[a-z]+@[a-z]+").unwrap();
assert!(re.is_match("mail me at kwyjibo@example"));

let mut m = re.matcher("no addresses here");
m.set_budget(10_000);
assert_eq!(m.find().unwrap(), None);
assert!(m.steps() <= 10_000);
```

# Example: finding an attack string

```rust
use regex_redos::{Analyzer, Pattern};

let re = Pattern::new(r"^(a+)+$").unwrap();
let findings = Analyzer::new(&re).pump_count(16).run(50_000);
assert_eq!(findings.len(), 1);
let v = &findings[0];
assert_eq!(v.pump, "a");
// Replaying the attack blows the same budget.
let attack = format!("{}{}{}", v.prefix, v.pump.repeat(16), v.suffix);
let mut m = re.matcher(&attack);
m.set_budget(50_000);
assert!(m.find().is_err());
```

# Syntax

The pattern dialect is the classic backtracking one: literals, classes
(`[a-z&&[^m]]`, nested classes, `\p{...}` properties through a pluggable
oracle), alternation, greedy/lazy/possessive quantifiers, capturing and
named groups, atomic groups `(?>...)`, look-ahead and bounded look-behind,
back-references, anchors, `\Q...\E` quoting and inline flags
`(?idmsuxU-...)`. Unbounded look-behind and canonical-equivalence mode are
rejected at compile time with [`ErrorKind::Unsupported`].

# Worst-case behavior

This engine deliberately backtracks, so pathological patterns take
exponential time on crafted input; that is the phenomenon the analyzer
exists to detect. Use the step budget to bound any single match call; the
budget is the only cancellation mechanism and is checked on every
interpreter step.

A compiled [`Pattern`] is immutable and may be shared across threads
freely. All mutable match state lives in the [`Matcher`] values it hands
out, one per match call family.
*/

#![forbid(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]

pub use crate::analyze::{analyze, Analyzer, Vulnerability};
pub use crate::charset::{
    CharPredicate, CharSet, InvalidRange, NamedPredicate, PropertyOracle, StdPropertyOracle,
};
pub use crate::error::{BudgetExceeded, Error, ErrorKind};
pub use crate::matcher::{Match, Matcher};
pub use crate::re::{Flags, Matches, Pattern, PatternBuilder, Split, SplitN};

mod analyze;
mod charset;
mod error;
mod literals;
mod matcher;
mod node;
mod parse;
mod re;
