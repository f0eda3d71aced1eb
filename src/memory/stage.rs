//! Conversation stages and the per-turn signal extracted from a model reply.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One of the five ordered phases a counseling conversation moves through.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Clarify the problem, the feelings and the thought behind them.
    #[default]
    Clarification,
    /// Gather evidence for and against the belief.
    Evidence,
    /// Reframe the belief into a more flexible one.
    Reframe,
    /// Explore the consequences of the new belief.
    Consequence,
    /// Wrap up the session.
    Closure,
}

impl Stage {
    /// All stages in conversational order.
    pub const ALL: [Stage; 5] = [
        Stage::Clarification,
        Stage::Evidence,
        Stage::Reframe,
        Stage::Consequence,
        Stage::Closure,
    ];

    /// Stable lowercase name, used for persistence.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Clarification => "clarification",
            Stage::Evidence => "evidence",
            Stage::Reframe => "reframe",
            Stage::Consequence => "consequence",
            Stage::Closure => "closure",
        }
    }

    /// Position in the conversational order, 0 through 4.
    pub fn ordinal(&self) -> usize {
        *self as usize
    }

    pub fn is_closure(&self) -> bool {
        *self == Stage::Closure
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "clarification" => Ok(Stage::Clarification),
            "evidence" => Ok(Stage::Evidence),
            "reframe" => Ok(Stage::Reframe),
            "consequence" => Ok(Stage::Consequence),
            "closure" => Ok(Stage::Closure),
            _ => Err(format!("Unknown stage: {}", s)),
        }
    }
}

/// Structured observation extracted from one model turn.
///
/// Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnSignal {
    pub emotion: String,
    pub belief: String,
    pub stage: Stage,
    /// The reply text the signal was extracted from.
    #[serde(default)]
    pub text: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl TurnSignal {
    /// Create a signal stamped with the current time.
    pub fn new(emotion: impl Into<String>, belief: impl Into<String>, stage: Stage) -> Self {
        Self {
            emotion: emotion.into(),
            belief: belief.into(),
            stage,
            text: String::new(),
            timestamp: Utc::now(),
        }
    }

    /// Attach the reply text.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Override the timestamp.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Polarity of a single emotion label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    Positive,
    Neutral,
    Negative,
}

const POSITIVE_EMOTIONS: &[&str] = &[
    "positive", "joy", "happy", "hope", "hopeful", "calm", "relief", "relieved", "grateful",
    "confident", "proud", "content", "optimistic", "excited",
];

const NEGATIVE_EMOTIONS: &[&str] = &[
    "negative", "sad", "sadness", "anger", "angry", "fear", "afraid", "anxious", "anxiety",
    "doubt", "worry", "worried", "shame", "guilt", "frustrated", "frustration", "hopeless",
    "lonely", "despair",
];

impl Polarity {
    /// Classify an emotion label. Labels outside the lexicon are neutral.
    pub fn classify(emotion: &str) -> Self {
        let label = emotion.trim().to_lowercase();
        if POSITIVE_EMOTIONS.contains(&label.as_str()) {
            Polarity::Positive
        } else if NEGATIVE_EMOTIONS.contains(&label.as_str()) {
            Polarity::Negative
        } else {
            Polarity::Neutral
        }
    }
}

/// Counts of positive, neutral and negative emotions across a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmotionTally {
    pub positive: usize,
    pub neutral: usize,
    pub negative: usize,
}

impl EmotionTally {
    /// Tally a sequence of emotion labels.
    pub fn from_labels<'a>(labels: impl IntoIterator<Item = &'a str>) -> Self {
        let mut tally = Self::default();
        for label in labels {
            match Polarity::classify(label) {
                Polarity::Positive => tally.positive += 1,
                Polarity::Neutral => tally.neutral += 1,
                Polarity::Negative => tally.negative += 1,
            }
        }
        tally
    }

    pub fn total(&self) -> usize {
        self.positive + self.neutral + self.negative
    }
}

impl std::fmt::Display for EmotionTally {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "positive:{} neutral:{} negative:{}",
            self.positive, self.neutral, self.negative
        )
    }
}

/// Direction the user's beliefs moved over a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeliefShift {
    /// Irrational beliefs early, rational ones later.
    TowardRational,
    PersistentIrrational,
    PersistentRational,
    /// No belief carried a recognisable marker.
    #[default]
    Unclassified,
}

impl BeliefShift {
    pub fn as_str(&self) -> &'static str {
        match self {
            BeliefShift::TowardRational => "toward_rational",
            BeliefShift::PersistentIrrational => "persistent_irrational",
            BeliefShift::PersistentRational => "persistent_rational",
            BeliefShift::Unclassified => "unclassified",
        }
    }

    /// Derive the shift from a chronological sequence of belief labels.
    ///
    /// A belief is irrational when it carries an absolute or catastrophising
    /// marker ("irrational", "always", "never", "must", ...), rational when it
    /// carries a hedging marker ("rational", "maybe", "sometimes", ...).
    pub fn from_beliefs<'a>(beliefs: impl IntoIterator<Item = &'a str>) -> Self {
        let mut saw_irrational = false;
        let mut rational_after_irrational = false;
        let mut saw_rational = false;

        for belief in beliefs {
            match classify_belief(belief) {
                Some(false) => saw_irrational = true,
                Some(true) => {
                    saw_rational = true;
                    if saw_irrational {
                        rational_after_irrational = true;
                    }
                }
                None => {}
            }
        }

        match (saw_irrational, saw_rational) {
            (true, true) if rational_after_irrational => BeliefShift::TowardRational,
            (true, _) => BeliefShift::PersistentIrrational,
            (false, true) => BeliefShift::PersistentRational,
            (false, false) => BeliefShift::Unclassified,
        }
    }
}

impl std::fmt::Display for BeliefShift {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BeliefShift {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "toward_rational" => Ok(BeliefShift::TowardRational),
            "persistent_irrational" => Ok(BeliefShift::PersistentIrrational),
            "persistent_rational" => Ok(BeliefShift::PersistentRational),
            "unclassified" => Ok(BeliefShift::Unclassified),
            _ => Err(format!("Unknown belief shift: {}", s)),
        }
    }
}

const IRRATIONAL_MARKERS: &[&str] = &[
    "irrational", "always", "never", "must", "should", "everyone", "nobody", "can't stand",
    "what if", "worthless", "failure", "ruined",
];

const RATIONAL_MARKERS: &[&str] = &[
    "rational", "maybe", "sometimes", "might", "possible", "probably", "overestimat",
    "evidence", "can handle",
];

/// `Some(true)` rational, `Some(false)` irrational, `None` unmarked.
///
/// Hedging wins over absolutes so "maybe I never fail" is rational.
fn classify_belief(belief: &str) -> Option<bool> {
    let lower = belief.to_lowercase();
    if lower.contains("irrational") {
        return Some(false);
    }
    if RATIONAL_MARKERS.iter().any(|m| lower.contains(m)) {
        return Some(true);
    }
    if IRRATIONAL_MARKERS.iter().any(|m| lower.contains(m)) {
        return Some(false);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_default_is_clarification() {
        assert_eq!(Stage::default(), Stage::Clarification);
    }

    #[test]
    fn test_stage_order() {
        for (i, stage) in Stage::ALL.iter().enumerate() {
            assert_eq!(stage.ordinal(), i);
        }
        assert!(Stage::Clarification < Stage::Closure);
        assert!(Stage::Closure.is_closure());
        assert!(!Stage::Consequence.is_closure());
    }

    #[test]
    fn test_stage_string_conversion() {
        for stage in Stage::ALL {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
            assert_eq!(stage.to_string(), stage.as_str());
        }
        assert_eq!(" Closure ".parse::<Stage>().unwrap(), Stage::Closure);
        assert!("wrap-up".parse::<Stage>().is_err());
    }

    #[test]
    fn test_turn_signal_deserialize_defaults() {
        let signal: TurnSignal =
            serde_json::from_str(r#"{"emotion":"joy","belief":"ok","stage":"evidence"}"#).unwrap();
        assert_eq!(signal.stage, Stage::Evidence);
        assert!(signal.text.is_empty());
    }

    #[test]
    fn test_polarity_lexicon() {
        assert_eq!(Polarity::classify("Joy"), Polarity::Positive);
        assert_eq!(Polarity::classify("doubt"), Polarity::Negative);
        assert_eq!(Polarity::classify("curious"), Polarity::Neutral);
    }

    #[test]
    fn test_emotion_tally() {
        let tally = EmotionTally::from_labels(["joy", "doubt", "hope", "puzzled"]);
        assert_eq!(tally.positive, 2);
        assert_eq!(tally.negative, 1);
        assert_eq!(tally.neutral, 1);
        assert_eq!(tally.total(), 4);
        assert_eq!(tally.to_string(), "positive:2 neutral:1 negative:1");
    }

    #[test]
    fn test_belief_shift_toward_rational() {
        let shift = BeliefShift::from_beliefs([
            "I always mess things up",
            "but what if I fail",
            "maybe I'm overestimating risk",
        ]);
        assert_eq!(shift, BeliefShift::TowardRational);
    }

    #[test]
    fn test_belief_shift_other_outcomes() {
        assert_eq!(
            BeliefShift::from_beliefs(["I must be perfect", "nobody likes me"]),
            BeliefShift::PersistentIrrational
        );
        assert_eq!(
            BeliefShift::from_beliefs(["maybe it went fine"]),
            BeliefShift::PersistentRational
        );
        assert_eq!(
            BeliefShift::from_beliefs(["the weather was grey"]),
            BeliefShift::Unclassified
        );
        // rational first, irrational later is not an improvement
        assert_eq!(
            BeliefShift::from_beliefs(["maybe it's fine", "I always fail"]),
            BeliefShift::PersistentIrrational
        );
    }

    #[test]
    fn test_belief_shift_string_conversion() {
        let shift: BeliefShift = "toward_rational".parse().unwrap();
        assert_eq!(shift, BeliefShift::TowardRational);
        assert_eq!(BeliefShift::Unclassified.to_string(), "unclassified");
    }
}
