use crate::logs::{Severity, StreamKind};

/// How a rule matches a line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    /// Trimmed line starts with the literal
    TrimmedPrefix(String),
    /// Line contains the literal anywhere
    Contains(String),
}

impl Pattern {
    fn matches(&self, line: &str) -> bool {
        match self {
            Pattern::TrimmedPrefix(prefix) => line.trim().starts_with(prefix.as_str()),
            Pattern::Contains(needle) => line.contains(needle.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub pattern: Pattern,
    pub severity: Severity,
}

impl Rule {
    pub fn new(pattern: Pattern, severity: Severity) -> Self {
        Self { pattern, severity }
    }
}

/// Ordered pattern → severity rules, evaluated top to bottom.
///
/// Lines no rule matches fall back to their stream: stderr is `Error`,
/// stdout is `Info`. Classification never fails.
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<Rule>,
}

impl Classifier {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// The rule set child programs are written against:
    /// `[TAG] ...` status lines, then `- LEVEL -` formatted log lines.
    pub fn standard() -> Self {
        Self::new(vec![
            Rule::new(Pattern::TrimmedPrefix("[".to_string()), Severity::Info),
            Rule::new(Pattern::Contains(" - INFO - ".to_string()), Severity::Info),
            Rule::new(Pattern::Contains(" - WARNING - ".to_string()), Severity::Warning),
            Rule::new(Pattern::Contains(" - ERROR - ".to_string()), Severity::Error),
        ])
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn classify(&self, stream: StreamKind, line: &str) -> Severity {
        self.rules
            .iter()
            .find(|rule| rule.pattern.matches(line))
            .map(|rule| rule.severity)
            .unwrap_or(match stream {
                StreamKind::Stdout => Severity::Info,
                StreamKind::Stderr => Severity::Error,
            })
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::standard()
    }
}
