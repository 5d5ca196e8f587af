//! Message filtering.
//!
//! Clients register wildcard patterns through the
//! `processing.include-message` / `processing.exclude-message` properties.
//! A pattern is four characters matched against the upper-case hex form of
//! the message code, `?` matching any digit. The FIRST registered pattern
//! that matches decides; registration order is semantically significant.
//! Messages no pattern matches pass through.

/// Longest message text or argument forwarded to the client, in characters.
pub const MAX_MESSAGE_LEN: usize = 3000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Include,
    Exclude,
}

#[derive(Debug, Default)]
pub struct MessageFilter {
    rules: Vec<(Action, String)>,
}

impl MessageFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register include patterns; `value` may hold several separated by
    /// commas. Malformed patterns are dropped with a warning.
    pub fn include(&mut self, value: &str) {
        self.register(Action::Include, value);
    }

    /// Register exclude patterns, same syntax as [`include`](Self::include).
    pub fn exclude(&mut self, value: &str) {
        self.register(Action::Exclude, value);
    }

    pub fn clear(&mut self) {
        self.rules.clear();
    }

    /// Whether a message with this code passes the filter.
    pub fn allows(&self, code: u16) -> bool {
        let hex = format!("{code:04X}");
        for (action, pattern) in &self.rules {
            if pattern_matches(pattern, &hex) {
                return *action == Action::Include;
            }
        }
        true
    }

    fn register(&mut self, action: Action, value: &str) {
        for raw in value.split(',') {
            let pattern = raw.trim().to_ascii_uppercase();
            if pattern.len() == 4
                && pattern.chars().all(|c| c == '?' || c.is_ascii_hexdigit())
            {
                self.rules.push((action, pattern));
            } else if !pattern.is_empty() {
                tracing::warn!(pattern = raw.trim(), "ignoring malformed message pattern");
            }
        }
    }
}

fn pattern_matches(pattern: &str, hex: &str) -> bool {
    pattern
        .chars()
        .zip(hex.chars())
        .all(|(p, h)| p == '?' || p == h)
}

/// Clip text to [`MAX_MESSAGE_LEN`] characters.
pub fn clip(text: &str) -> String {
    text.chars().take(MAX_MESSAGE_LEN).collect()
}
