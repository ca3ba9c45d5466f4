//! Test Anything Protocol output: building it from assertion outcomes and
//! classifying streams produced by external runners.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapReport {
    pub lines: Vec<String>,
    pub planned: Option<usize>,
    pub passed: usize,
    pub failed: usize,
    pub success: bool,
}

impl TapReport {
    /// Classifies TAP lines. Fails when any test line starts with `not ok`, when
    /// there are no test lines, or when a `1..N` plan disagrees with the count.
    #[must_use]
    pub fn classify<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let lines: Vec<String> = lines.into_iter().map(Into::into).collect();
        let mut planned = None;
        let mut passed = 0_usize;
        let mut failed = 0_usize;

        for line in &lines {
            let trimmed = line.trim_start();
            if is_test_line(trimmed, "not ok") {
                failed += 1;
            } else if is_test_line(trimmed, "ok") {
                passed += 1;
            } else if let Some(count) = parse_plan(trimmed) {
                planned = Some(count);
            }
        }

        let total = passed + failed;
        let plan_matches = planned.map_or(true, |count| count == total);
        Self {
            lines,
            planned,
            passed,
            failed,
            success: failed == 0 && total > 0 && plan_matches,
        }
    }

    /// Splits raw runner output on newlines before classifying.
    #[must_use]
    pub fn parse(output: &str) -> Self {
        Self::classify(output.lines())
    }

    #[must_use]
    pub fn from_outcomes(outcomes: &[AssertionOutcome]) -> Self {
        let mut lines = vec![format!("1..{}", outcomes.len())];
        for (index, outcome) in outcomes.iter().enumerate() {
            let number = index + 1;
            if outcome.passed {
                lines.push(format!("ok {number} - {}", outcome.description));
            } else {
                lines.push(format!("not ok {number} - {}", outcome.description));
            }
            if let Some(diagnostic) = &outcome.diagnostic {
                lines.extend(diagnostic.lines().map(|line| format!("# {line}")));
            }
        }
        Self::classify(lines)
    }

    /// All lines joined with `\n`, as stored in the test result table.
    #[must_use]
    pub fn output(&self) -> String {
        self.lines.join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertionOutcome {
    pub description: String,
    pub passed: bool,
    pub diagnostic: Option<String>,
}

/// `keyword` followed by whitespace or the end of the line, so `okay` is not
/// a passing test.
fn is_test_line(line: &str, keyword: &str) -> bool {
    line.strip_prefix(keyword)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace))
}

fn parse_plan(line: &str) -> Option<usize> {
    let rest = line.strip_prefix("1..")?;
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}
