use std::str::FromStr;

/// Canonicalization applied to both actual and expected output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ComparePolicy {
    /// Per-line normalization: trailing whitespace is ignored on every line
    /// and trailing blank lines are dropped.
    #[default]
    Lines,
    /// Only surrounding whitespace of the whole text is ignored.
    Trim,
}

impl FromStr for ComparePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lines" | "line" => Ok(Self::Lines),
            "trim" | "strict" => Ok(Self::Trim),
            _ => Err(format!("unsupported compare policy: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Comparator {
    policy: ComparePolicy,
}

impl Comparator {
    pub fn new(policy: ComparePolicy) -> Self {
        Self { policy }
    }

    pub fn compare(&self, actual: &str, expected: &str) -> bool {
        match self.policy {
            ComparePolicy::Lines => canonical_lines(actual) == canonical_lines(expected),
            ComparePolicy::Trim => {
                normalize_line_endings(actual).trim() == normalize_line_endings(expected).trim()
            }
        }
    }
}

fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

fn canonical_lines(text: &str) -> Vec<String> {
    let normalized = normalize_line_endings(text.trim_end());
    let mut lines: Vec<String> = normalized
        .split('\n')
        .map(|line| line.trim_end().to_string())
        .collect();
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    lines
}
