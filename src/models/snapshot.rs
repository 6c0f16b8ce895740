use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;

/// A captured page state. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentSnapshot {
    pub fingerprint: Fingerprint,
    pub raw_content: String,
    pub captured_at_step: u32,
    pub source_url: String,
}

/// What one interaction step did.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StepAction {
    Clicked(String),
    Scrolled,
    None,
}

impl StepAction {
    pub fn is_none(&self) -> bool {
        matches!(self, StepAction::None)
    }
}

impl std::fmt::Display for StepAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepAction::Clicked(selector) => write!(f, "clicked:{}", selector),
            StepAction::Scrolled => f.write_str("scrolled"),
            StepAction::None => f.write_str("none"),
        }
    }
}

impl Serialize for StepAction {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StepAction {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.as_str() {
            "scrolled" => Ok(StepAction::Scrolled),
            "none" => Ok(StepAction::None),
            other => other
                .strip_prefix("clicked:")
                .map(|selector| StepAction::Clicked(selector.to_string()))
                .ok_or_else(|| serde::de::Error::custom(format!("unknown step action: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TerminationReason {
    InitFailed,
    MaxInteractions,
    NoFurtherAction,
    StagnantLimit,
    SiteTimeout,
    Cancelled,
    /// Static and sitemap acquisitions that visited every page.
    Completed,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TerminationReason::InitFailed => "init-failed",
            TerminationReason::MaxInteractions => "max-interactions",
            TerminationReason::NoFurtherAction => "no-further-action",
            TerminationReason::StagnantLimit => "stagnant-limit",
            TerminationReason::SiteTimeout => "site-timeout",
            TerminationReason::Cancelled => "cancelled",
            TerminationReason::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// Outcome of acquiring one site. Created once, never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionResult {
    pub snapshots: Vec<ContentSnapshot>,
    pub interactions_performed: u32,
    pub termination_reason: TerminationReason,
    #[serde(default)]
    pub actions: Vec<StepAction>,
}

impl AcquisitionResult {
    pub fn empty(reason: TerminationReason) -> Self {
        Self {
            snapshots: Vec::new(),
            interactions_performed: 0,
            termination_reason: reason,
            actions: Vec::new(),
        }
    }

    /// Whether the acquisition was cut short rather than finishing on its own.
    pub fn is_partial(&self) -> bool {
        matches!(
            self.termination_reason,
            TerminationReason::SiteTimeout | TerminationReason::Cancelled
        )
    }
}
