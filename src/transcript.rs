//! role-tagged conversation history.
//!
//! a transcript is append-only while a session lives and is cleared wholesale
//! on reset. turns render as `"<Role>: <text>"`, the same line format used to
//! build the prompt sent to the provider.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    User,
    Bot,
}

impl Role {
    pub fn label(self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Bot => "Bot",
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Role::User),
            "bot" | "assistant" => Some(Role::Bot),
            _ => None,
        }
    }
}

/// one message. fields are private so a turn can't be re-tagged after append.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    role: Role,
    text: String,
}

impl Turn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self { role, text: text.into() }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn bot(text: impl Into<String>) -> Self {
        Self::new(Role::Bot, text)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// parse a rendered line such as `"User: hi"`; splits on the first `": "`.
    pub fn parse_line(line: &str) -> Option<Self> {
        let (label, text) = line.split_once(": ")?;
        Role::from_label(label).map(|role| Self::new(role, text))
    }
}

impl fmt::Display for Turn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.role.label(), self.text)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Transcript {
    turns: Vec<Turn>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.push(Turn::user(text));
    }

    pub fn push_bot(&mut self, text: impl Into<String>) {
        self.push(Turn::bot(text));
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn user_turn_count(&self) -> usize {
        self.turns.iter().filter(|t| t.role == Role::User).count()
    }

    /// the last `n` turns in original order (all of them if fewer exist).
    pub fn last(&self, n: usize) -> &[Turn] {
        let start = self.turns.len().saturating_sub(n);
        &self.turns[start..]
    }

    /// one line per turn, joined with newlines.
    pub fn to_prompt(&self) -> String {
        self.turns
            .iter()
            .map(Turn::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl FromIterator<Turn> for Transcript {
    fn from_iter<I: IntoIterator<Item = Turn>>(iter: I) -> Self {
        Self { turns: iter.into_iter().collect() }
    }
}

impl Extend<Turn> for Transcript {
    fn extend<I: IntoIterator<Item = Turn>>(&mut self, iter: I) {
        self.turns.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> Transcript {
        let mut t = Transcript::new();
        t.push_user("hi");
        t.push_bot("hello, how can I help?");
        t.push_user("tell me a joke");
        t.push_bot("why did the crab never share? because it's shellfish");
        t.push_user("another");
        t
    }

    #[test]
    fn prompt_joins_rendered_turns_with_newlines() {
        let t = sample();
        assert_eq!(
            t.to_prompt(),
            "User: hi\n\
             Bot: hello, how can I help?\n\
             User: tell me a joke\n\
             Bot: why did the crab never share? because it's shellfish\n\
             User: another"
        );
    }

    #[test]
    fn user_turns_are_counted_by_role() {
        let t = sample();
        assert_eq!(t.len(), 5);
        assert_eq!(t.user_turn_count(), 3);
        assert_eq!(Transcript::new().user_turn_count(), 0);
    }

    #[test]
    fn last_keeps_order_and_saturates() {
        let t = sample();
        let tail: Vec<_> = t.last(2).iter().map(Turn::text).collect();
        assert_eq!(tail, vec!["why did the crab never share? because it's shellfish", "another"]);
        assert_eq!(t.last(50).len(), 5);
        assert!(t.last(0).is_empty());
    }

    #[test]
    fn clear_empties_everything() {
        let mut t = sample();
        t.clear();
        assert!(t.is_empty());
        assert_eq!(t.to_prompt(), "");
    }

    #[test]
    fn parse_line_splits_on_first_separator() {
        let turn = Turn::parse_line("Bot: note: this has a colon").expect("parses");
        assert_eq!(turn.role(), Role::Bot);
        assert_eq!(turn.text(), "note: this has a colon");

        assert_eq!(Turn::parse_line("user: hi"), Some(Turn::user("hi")));
        assert_eq!(Turn::parse_line("no separator"), None);
        assert_eq!(Turn::parse_line("System: nope"), None);
    }

    #[test]
    fn serializes_as_a_plain_list() {
        let mut t = Transcript::new();
        t.push_user("hi");
        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(json, r#"[{"role":"User","text":"hi"}]"#);
        let back: Transcript = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }
}
