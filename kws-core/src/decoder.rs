//! Score vector → command.

use serde::{Deserialize, Serialize};

use crate::inference::ScoreVector;

/// Closed, ordered command set. Discriminants match model output indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Silence = 0,
    Unknown = 1,
    Yes = 2,
    No = 3,
}

/// Label for raw values that name no command.
pub const INVALID_LABEL: &str = "invalid";

impl Command {
    pub const ALL: [Command; 4] = [Command::Silence, Command::Unknown, Command::Yes, Command::No];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        match self {
            Command::Silence => "silence",
            Command::Unknown => "unknown",
            Command::Yes => "yes",
            Command::No => "no",
        }
    }

    /// Label of a raw command value, `"invalid"` outside `0..=3`.
    pub fn label_of(raw: i32) -> &'static str {
        usize::try_from(raw)
            .ok()
            .and_then(Self::from_index)
            .map_or(INVALID_LABEL, Self::label)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

pub fn command_to_string(command: Command) -> &'static str {
    command.label()
}

/// Decoded result of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub command: Command,
    /// Winning score shifted into `0..=255`.
    pub confidence: u8,
}

/// Pick the highest score. The scan is ascending with a strict `>`, so the
/// lowest index wins a tie.
pub fn decode(scores: &ScoreVector) -> Classification {
    let mut best = 0usize;
    let mut max = i8::MIN;
    for (i, &s) in scores.as_slice().iter().enumerate() {
        if s > max {
            max = s;
            best = i;
        }
    }
    Classification {
        // The vector has exactly one slot per command.
        command: Command::from_index(best).unwrap_or(Command::Silence),
        confidence: confidence_of(max),
    }
}

/// `score + 128`, i.e. the int8 range mapped onto `0..=255`.
pub fn confidence_of(score: i8) -> u8 {
    (i16::from(score) + 128) as u8
}
