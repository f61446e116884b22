//! Context window for the response generator

use serde::Serialize;

use crate::session::{ConversationTurn, Session, TurnRole};

/// Read-only projection of recent history, bounded by a character budget
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConversationContext {
    /// Oldest first
    pub turns: Vec<ConversationTurn>,
    /// Characters of turn text included
    pub chars: usize,
    /// Turns left out to stay within budget
    pub omitted: usize,
    pub topics: Vec<String>,
}

impl ConversationContext {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Format the history and the new user message as a single prompt
    #[must_use]
    pub fn format_prompt(&self, current_message: &str) -> String {
        let mut parts = Vec::new();

        if !self.topics.is_empty() {
            parts.push(format!(
                "<topics>\n{}\n</topics>",
                self.topics.join(", ")
            ));
        }

        if !self.turns.is_empty() {
            let history: Vec<String> = self
                .turns
                .iter()
                .map(|t| format!("<{}>\n{}\n</{}>", t.role, t.text, t.role))
                .collect();
            parts.push(format!(
                "<conversation-history>\n{}\n</conversation-history>",
                history.join("\n")
            ));
        }

        parts.push(current_message.to_string());
        parts.join("\n\n")
    }
}

/// Select the most recent turns that fit in `max_chars`
///
/// Turns are taken newest first and kept contiguous. The most recent user
/// turn is always included, even when it alone exceeds the budget.
#[must_use]
pub fn build_context(session: &Session, max_chars: usize) -> ConversationContext {
    let turns = &session.turns;
    let anchor = turns.iter().rposition(|t| t.role == TurnRole::User);

    let mut start = turns.len();
    let mut chars = 0;
    for (i, turn) in turns.iter().enumerate().rev() {
        let len = turn.text.chars().count();
        if chars + len > max_chars {
            break;
        }
        chars += len;
        start = i;
    }

    let selected: Vec<ConversationTurn> = match anchor {
        Some(anchor) if anchor < start => {
            let turn = &turns[anchor];
            chars = turn.text.chars().count();
            vec![turn.clone()]
        }
        _ => turns.iter().skip(start).cloned().collect(),
    };

    ConversationContext {
        omitted: turns.len() - selected.len(),
        turns: selected,
        chars,
        topics: session.topics.iter().cloned().collect(),
    }
}
