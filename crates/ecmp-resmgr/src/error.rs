//! Error types for the ECMP resource manager.

use crate::state::SwitchingMode;

/// Rejected ECMP resource configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Compression and backup switching mode were both requested.
    #[error(
        "Compression threshold {threshold}% and backup switching mode {mode} are mutually exclusive"
    )]
    MutuallyExclusive { threshold: u32, mode: SwitchingMode },

    #[error("Compression threshold {0}% is out of range (0-100)")]
    ThresholdOutOfRange(u32),

    /// A non-zero compression threshold cannot be changed at runtime.
    #[error("Compression threshold cannot change from {old}% to {new}%")]
    ThresholdChange { old: u32, new: u32 },

    #[error("Backup switching mode {0} cannot be cleared")]
    BackupModeCleared(SwitchingMode),

    #[error("Invalid limit for {field}: {message}")]
    InvalidLimit {
        /// Name of the offending setting.
        field: &'static str,
        message: String,
    },
}

/// Error type for EcmpResourceManager operations.
#[derive(Debug, thiserror::Error)]
pub enum EcmpError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("No merge candidate within the {threshold}% compression threshold")]
    NoMergeCandidate { threshold: u32 },

    #[error("ECMP limit reached with neither compression nor backup switching mode configured")]
    NoRemediation,

    #[error("Expected exactly one state delta, got {0}")]
    UnsupportedDeltaCount(usize),

    #[error("Invariant violation: {0}")]
    Invariant(String),
}

/// Result type for EcmpResourceManager operations.
pub type Result<T> = std::result::Result<T, EcmpError>;
