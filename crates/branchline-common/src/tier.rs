//! Size classification of a branch's change set.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Small,
    Medium,
    Large,
}

impl Tier {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "small" => Ok(Self::Small),
            "medium" => Ok(Self::Medium),
            "large" => Ok(Self::Large),
            other => Err(format!("invalid tier: {other}")),
        }
    }
}

/// Aggregate statistics about a worktree's change set relative to its base.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeStats {
    pub files_changed: u64,
    pub lines_changed: u64,
}

/// Per-tier thresholds, forming a monotone chain `small < medium < large`,
/// with `large` implicitly bounded by +infinity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierThresholds {
    pub small_max_files: u64,
    pub small_max_lines: u64,
    pub medium_max_files: u64,
    pub medium_max_lines: u64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            small_max_files: 3,
            small_max_lines: 100,
            medium_max_files: 15,
            medium_max_lines: 500,
        }
    }
}

impl TierThresholds {
    /// Classify a change set. A change is `small` iff both counts are at or
    /// under the `small` bound; `medium` iff both are at or under the
    /// `medium` bound; otherwise `large`. Exceeding the bound on file count
    /// OR line count alone is enough to escalate the tier.
    pub fn classify(&self, stats: ChangeStats) -> Tier {
        if stats.files_changed <= self.small_max_files && stats.lines_changed <= self.small_max_lines
        {
            Tier::Small
        } else if stats.files_changed <= self.medium_max_files
            && stats.lines_changed <= self.medium_max_lines
        {
            Tier::Medium
        } else {
            Tier::Large
        }
    }
}
