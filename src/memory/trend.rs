//! Per-session turn history and the views derived from it.

use serde::{Deserialize, Serialize};

use super::stage::{BeliefShift, EmotionTally, Stage, TurnSignal};
use crate::storage::{SessionSummary, TrendPoint};

/// Persisted shape of a tracker, without the session identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendSnapshot {
    pub summary_text: String,
    pub current_stage: Stage,
    pub emotion_trend: Vec<TrendPoint>,
    pub belief_trend: Vec<TrendPoint>,
    pub emotion_digest: String,
    pub belief_shift: BeliefShift,
    pub turn_count: u64,
}

/// Append-only log of turn signals for one session.
///
/// Not synchronised; the owning `SessionMemory` is always accessed under its
/// session lock.
#[derive(Debug, Clone)]
pub struct TrendTracker {
    /// Turns appended since construction or the last seed.
    turns: Vec<TurnSignal>,
    emotion_trend: Vec<TrendPoint>,
    belief_trend: Vec<TrendPoint>,
    current_stage: Stage,
    /// Turn count before `turns[0]`, carried over from a seed.
    seeded_turns: u64,
    /// Condensation covering turns `1..=condensed_through`.
    carried_summary: Option<String>,
    condensed_through: u64,
    summary_max_chars: usize,
}

impl TrendTracker {
    /// Create an empty tracker whose rolling summary stays under `summary_max_chars`.
    pub fn new(summary_max_chars: usize) -> Self {
        Self {
            turns: Vec::new(),
            emotion_trend: Vec::new(),
            belief_trend: Vec::new(),
            current_stage: Stage::default(),
            seeded_turns: 0,
            carried_summary: None,
            condensed_through: 0,
            summary_max_chars,
        }
    }

    /// Record a turn. The reported stage replaces the current one as-is,
    /// including regressions.
    pub fn append(&mut self, signal: TurnSignal) {
        self.emotion_trend
            .push(TrendPoint::new(&signal.emotion, signal.timestamp));
        self.belief_trend
            .push(TrendPoint::new(&signal.belief, signal.timestamp));
        self.current_stage = signal.stage;
        self.turns.push(signal);
    }

    pub fn current_stage(&self) -> Stage {
        self.current_stage
    }

    pub fn is_closing(&self) -> bool {
        self.current_stage.is_closure()
    }

    /// Total turns, including those carried over from a seed.
    pub fn turn_count(&self) -> u64 {
        self.seeded_turns + self.turns.len() as u64
    }

    pub fn emotion_trend(&self) -> &[TrendPoint] {
        &self.emotion_trend
    }

    pub fn belief_trend(&self) -> &[TrendPoint] {
        &self.belief_trend
    }

    pub fn emotion_tally(&self) -> EmotionTally {
        EmotionTally::from_labels(self.emotion_trend.iter().map(|p| p.value.as_str()))
    }

    pub fn belief_shift(&self) -> BeliefShift {
        BeliefShift::from_beliefs(self.belief_trend.iter().map(|p| p.value.as_str()))
    }

    /// Bounded condensation of the conversation.
    ///
    /// Turn lines not covered by the carried condensation (from a load or a
    /// summariser) are kept newest first; older ones collapse into an
    /// omission marker. Whatever budget is left goes to the tail of the
    /// carried condensation, which always comes first.
    pub fn rolling_summary(&self) -> String {
        let lines: Vec<String> = self
            .uncondensed_turns()
            .map(|(n, turn)| format_summary_line(n, turn))
            .collect();
        let budget = self.summary_max_chars;

        let lens: Vec<usize> = lines.iter().map(|l| l.chars().count()).collect();
        let all_lines = lens.iter().sum::<usize>() + lens.len().saturating_sub(1);

        let kept = if all_lines <= budget {
            lines.len()
        } else {
            let marker_cost = omission_marker(lines.len()).chars().count() + 1;
            let mut used = 0;
            let mut kept = 0;
            for len in lens.iter().rev() {
                let cost = len + usize::from(kept > 0);
                if used + cost + marker_cost > budget {
                    break;
                }
                used += cost;
                kept += 1;
            }
            kept
        };

        if kept == 0 {
            if let Some(newest) = lines.last() {
                return truncate_chars(newest, budget);
            }
        }

        let skipped = lines.len() - kept;
        let mut body: Vec<String> = Vec::with_capacity(kept + 1);
        if skipped > 0 {
            body.push(omission_marker(skipped));
        }
        body.extend(lines[skipped..].iter().cloned());
        let body = body.join("\n");

        let body_len = body.chars().count();
        let separator = usize::from(body_len > 0);
        let room = budget.saturating_sub(body_len + separator);

        match self.carried_summary.as_deref().filter(|s| !s.is_empty()) {
            Some(head) if room > 0 => {
                let head = tail_chars(head, room);
                if body.is_empty() {
                    head
                } else {
                    format!("{}\n{}", head, body)
                }
            }
            _ => body,
        }
    }

    /// Last `n` turns, one per line, for prompt injection.
    ///
    /// Turns carried over from a seed have no stage or text, so they render
    /// as `emotion: belief`.
    pub fn recent_context(&self, n: usize) -> String {
        let live = self.turns.len().min(n);
        let paired = self.emotion_trend.len().min(self.belief_trend.len());
        let seeded = paired.saturating_sub(self.turns.len());
        let seed_start = seeded.saturating_sub(n - live);

        let carried = self
            .emotion_trend
            .iter()
            .zip(&self.belief_trend)
            .take(seeded)
            .skip(seed_start)
            .map(|(emotion, belief)| format!("{}: {}", emotion.value, belief.value));

        let recorded = self.turns[self.turns.len() - live..].iter().map(|turn| {
            let body = if turn.text.is_empty() {
                &turn.belief
            } else {
                &turn.text
            };
            format!("[{}] {}: {}", turn.stage, turn.emotion, body)
        });

        carried.chain(recorded).collect::<Vec<_>>().join("\n")
    }

    /// Unbounded transcript for an external summariser, and the turn number
    /// it covers through.
    pub fn transcript(&self) -> (String, u64) {
        let mut parts = Vec::new();
        if let Some(carried) = self.carried_summary.as_deref().filter(|s| !s.is_empty()) {
            parts.push(carried.to_string());
        }
        for (n, turn) in self.uncondensed_turns() {
            let line = format!("{} {}", format_summary_line(n, turn), turn.text);
            parts.push(line.trim_end().to_string());
        }
        (parts.join("\n"), self.turn_count())
    }

    /// Replace the carried condensation with one covering turns `1..=through_turn`.
    ///
    /// Returns false and keeps the current one when `through_turn` is older.
    pub fn absorb_summary(&mut self, text: impl Into<String>, through_turn: u64) -> bool {
        if through_turn < self.condensed_through || through_turn > self.turn_count() {
            return false;
        }
        self.carried_summary = Some(text.into());
        self.condensed_through = through_turn;
        true
    }

    pub fn snapshot(&self) -> TrendSnapshot {
        TrendSnapshot {
            summary_text: self.rolling_summary(),
            current_stage: self.current_stage,
            emotion_trend: self.emotion_trend.clone(),
            belief_trend: self.belief_trend.clone(),
            emotion_digest: self.emotion_tally().to_string(),
            belief_shift: self.belief_shift(),
            turn_count: self.turn_count(),
        }
    }

    /// Replace all state wholesale from a stored row.
    ///
    /// Derived digests are recomputed rather than trusted.
    pub fn seed(&mut self, summary: &SessionSummary) {
        self.turns.clear();
        self.emotion_trend = summary.emotion_trend.clone();
        self.belief_trend = summary.belief_trend.clone();
        self.current_stage = summary.current_stage;
        self.seeded_turns = summary
            .turn_count
            .max(summary.emotion_trend.len() as u64);
        self.carried_summary = if summary.summary_text.is_empty() {
            None
        } else {
            Some(summary.summary_text.clone())
        };
        self.condensed_through = self.seeded_turns;
    }

    fn uncondensed_turns(&self) -> impl Iterator<Item = (u64, &TurnSignal)> {
        let offset = self.seeded_turns;
        let condensed = self.condensed_through;
        self.turns
            .iter()
            .enumerate()
            .map(move |(i, turn)| (offset + i as u64 + 1, turn))
            .filter(move |(n, _)| *n > condensed)
    }
}

fn format_summary_line(n: u64, turn: &TurnSignal) -> String {
    format!("#{} [{}] {} | {}", n, turn.stage, turn.emotion, turn.belief)
}

fn omission_marker(skipped: usize) -> String {
    format!("({} earlier turns omitted)", skipped)
}

/// Cut to at most `max` characters on a char boundary.
fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Last `max` characters, starting at a line break when one is available.
fn tail_chars(text: &str, max: usize) -> String {
    let total = text.chars().count();
    if total <= max {
        return text.to_string();
    }
    let start = text
        .char_indices()
        .nth(total - max)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());
    let tail = &text[start..];
    match tail.find('\n') {
        Some(pos) if pos + 1 < tail.len() => tail[pos + 1..].to_string(),
        _ => tail.to_string(),
    }
}
