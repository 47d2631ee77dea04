//! Core data types for the planning engine
//!
//! Defines the records shared across the search: planned code-editing
//! actions, simulation outcomes, tiers, and node lifecycle states.

use std::collections::HashMap;
use std::path::{Component, Path};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PlannerError, PlannerResult};

/// Kind of code edit a plan node proposes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Edit,
    Create,
    Delete,
    Move,
    Refactor,
    Test,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Edit => "edit",
            Self::Create => "create",
            Self::Delete => "delete",
            Self::Move => "move",
            Self::Refactor => "refactor",
            Self::Test => "test",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validation limits applied before an action may be simulated
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Maximum accepted diff size in bytes (0 = unlimited)
    pub max_diff_bytes: usize,
    /// Languages the project accepts; empty accepts any
    pub allowed_languages: Vec<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_diff_bytes: 256 * 1024,
            allowed_languages: Vec::new(),
        }
    }
}

/// A concrete code-editing step proposed by the expander
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlannedAction {
    pub action_type: ActionType,
    pub file_path: String,
    pub code_diff: String,
    pub language: String,
    pub description: String,
    pub validated: bool,
}

impl PlannedAction {
    pub fn new(
        action_type: ActionType,
        file_path: impl Into<String>,
        code_diff: impl Into<String>,
        language: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            action_type,
            file_path: file_path.into(),
            code_diff: code_diff.into(),
            language: language.into(),
            description: description.into(),
            validated: false,
        }
    }

    /// Validate the action against the project before simulation.
    ///
    /// Checks path containment and size limits only; syntax-level checks
    /// belong to the simulator's signal providers. Marks the action
    /// validated on success.
    pub fn validate(
        &mut self,
        project_root: &Path,
        config: &ValidationConfig,
    ) -> PlannerResult<()> {
        if self.file_path.is_empty() {
            return Err(PlannerError::InvalidAction("empty file path".into()));
        }

        let path = Path::new(&self.file_path);
        if path.is_absolute() {
            return Err(PlannerError::InvalidAction(format!(
                "file path must be relative to the project root: {}",
                self.file_path
            )));
        }
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(PlannerError::InvalidAction(format!(
                "file path escapes the project root: {}",
                self.file_path
            )));
        }
        if !project_root.join(path).starts_with(project_root) {
            return Err(PlannerError::InvalidAction(format!(
                "file path resolves outside the project root: {}",
                self.file_path
            )));
        }

        if config.max_diff_bytes > 0 && self.code_diff.len() > config.max_diff_bytes {
            return Err(PlannerError::InvalidAction(format!(
                "diff is {} bytes, limit is {}",
                self.code_diff.len(),
                config.max_diff_bytes
            )));
        }

        if !config.allowed_languages.is_empty()
            && !config
                .allowed_languages
                .iter()
                .any(|l| l.eq_ignore_ascii_case(&self.language))
        {
            return Err(PlannerError::InvalidAction(format!(
                "language not accepted by project: {}",
                self.language
            )));
        }

        self.validated = true;
        Ok(())
    }
}

/// Simulation tiers, trading latency for signal coverage
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationTier {
    Quick,
    Standard,
    Full,
}

impl SimulationTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Standard => "standard",
            Self::Full => "full",
        }
    }

    /// The tier one step above, if any
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Quick => Some(Self::Standard),
            Self::Standard => Some(Self::Full),
            Self::Full => None,
        }
    }
}

impl std::fmt::Display for SimulationTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of simulating one plan node; written once, read-only after
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimulationResult {
    /// Aggregate score in [0, 1]
    pub score: f64,
    /// Per-signal scores in [0, 1]
    pub signals: HashMap<String, f64>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub duration: Duration,
    pub tier: SimulationTier,
    /// Whether the score clears the promotion threshold for the next tier
    pub promote_to_next: bool,
}

impl SimulationResult {
    /// Neutral result for a node that carries no action
    pub fn neutral(tier: SimulationTier) -> Self {
        Self {
            score: 0.5,
            signals: HashMap::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            duration: Duration::ZERO,
            tier,
            promote_to_next: false,
        }
    }

    /// Zero-score result for an action that was never validated
    pub fn rejected(tier: SimulationTier, reason: impl Into<String>) -> Self {
        Self {
            score: 0.0,
            signals: HashMap::new(),
            errors: vec![reason.into()],
            warnings: Vec::new(),
            duration: Duration::ZERO,
            tier,
            promote_to_next: false,
        }
    }
}

/// Lifecycle state of a plan node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Unexplored,
    Exploring,
    Completed,
    Abandoned,
}

impl NodeState {
    /// Completed and abandoned nodes never leave their state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Abandoned)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unexplored => "unexplored",
            Self::Exploring => "exploring",
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_action() -> PlannedAction {
        PlannedAction::new(
            ActionType::Edit,
            "src/main.go",
            "- old line\n+ new line",
            "go",
            "fix typo in greeting",
        )
    }

    #[test]
    fn test_validate_marks_action() {
        let mut action = sample_action();
        assert!(!action.validated);
        action
            .validate(Path::new("/project"), &ValidationConfig::default())
            .unwrap();
        assert!(action.validated);
    }

    #[test]
    fn test_validate_rejects_escaping_paths() {
        let mut action = sample_action();
        action.file_path = "../outside.go".to_string();
        let err = action
            .validate(Path::new("/project"), &ValidationConfig::default())
            .unwrap_err();
        assert_eq!(err.error_type(), "InvalidAction");

        action.file_path = "/etc/passwd".to_string();
        assert!(action
            .validate(Path::new("/project"), &ValidationConfig::default())
            .is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_diff() {
        let mut action = sample_action();
        action.code_diff = "x".repeat(1024);
        let config = ValidationConfig {
            max_diff_bytes: 512,
            ..Default::default()
        };
        assert!(action.validate(Path::new("/project"), &config).is_err());
        assert!(!action.validated);
    }

    #[test]
    fn test_validate_language_filter() {
        let mut action = sample_action();
        let config = ValidationConfig {
            allowed_languages: vec!["rust".to_string()],
            ..Default::default()
        };
        assert!(action.validate(Path::new("/project"), &config).is_err());

        let config = ValidationConfig {
            allowed_languages: vec!["Go".to_string()],
            ..Default::default()
        };
        assert!(action.validate(Path::new("/project"), &config).is_ok());
    }

    #[test]
    fn test_tier_promotion_chain() {
        assert_eq!(SimulationTier::Quick.next(), Some(SimulationTier::Standard));
        assert_eq!(SimulationTier::Standard.next(), Some(SimulationTier::Full));
        assert_eq!(SimulationTier::Full.next(), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!NodeState::Unexplored.is_terminal());
        assert!(!NodeState::Exploring.is_terminal());
        assert!(NodeState::Completed.is_terminal());
        assert!(NodeState::Abandoned.is_terminal());
    }
}
