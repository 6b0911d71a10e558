//! ECMP resource manager configuration.
//!
//! The hardware limits and the make-before-break buffers are fixed for the
//! lifetime of a manager (the group limit can only be raised). The
//! compression threshold and the backup switching mode arrive through
//! state deltas as well and go through [`EcmpResourceManagerConfig::reconfigure`].

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::state::SwitchingMode;

/// Default hardware ECMP group limit.
pub const DEFAULT_MAX_HW_ECMP_GROUPS: u32 = 128;

/// Default number of groups kept free for make-before-break.
pub const DEFAULT_MAKE_BEFORE_BREAK_BUFFER: u32 = 2;

/// Highest accepted compression threshold.
pub const MAX_COMPRESSION_THRESHOLD_PCT: u32 = 100;

/// Configuration for EcmpResourceManager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcmpResourceManagerConfig {
    /// Number of ECMP groups the ASIC supports.
    pub max_hw_ecmp_groups: u32,
    /// Total ECMP members the ASIC supports, if limited.
    pub max_hw_ecmp_members: Option<u32>,
    /// Highest merge penalty allowed, 0 disables compression.
    pub compression_threshold_pct: u32,
    /// Mode new groups are demoted to when the limit is reached.
    pub backup_switching_mode: Option<SwitchingMode>,
    /// Groups reserved for transient make-before-break overshoot.
    pub make_before_break_buffer: u32,
    /// Members reserved for transient make-before-break overshoot.
    pub make_before_break_member_buffer: u32,
}

impl Default for EcmpResourceManagerConfig {
    fn default() -> Self {
        Self {
            max_hw_ecmp_groups: DEFAULT_MAX_HW_ECMP_GROUPS,
            max_hw_ecmp_members: None,
            compression_threshold_pct: 0,
            backup_switching_mode: None,
            make_before_break_buffer: DEFAULT_MAKE_BEFORE_BREAK_BUFFER,
            make_before_break_member_buffer: 0,
        }
    }
}

impl EcmpResourceManagerConfig {
    pub fn new(max_hw_ecmp_groups: u32) -> Self {
        Self {
            max_hw_ecmp_groups,
            ..Default::default()
        }
    }

    pub fn with_max_hw_ecmp_members(mut self, max_members: u32) -> Self {
        self.max_hw_ecmp_members = Some(max_members);
        self
    }

    pub fn with_compression_threshold(mut self, threshold_pct: u32) -> Self {
        self.compression_threshold_pct = threshold_pct;
        self
    }

    pub fn with_backup_switching_mode(mut self, mode: SwitchingMode) -> Self {
        self.backup_switching_mode = Some(mode);
        self
    }

    pub fn with_make_before_break_buffer(mut self, buffer: u32) -> Self {
        self.make_before_break_buffer = buffer;
        self
    }

    pub fn with_make_before_break_member_buffer(mut self, buffer: u32) -> Self {
        self.make_before_break_member_buffer = buffer;
        self
    }

    /// Checks the whole configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_cfg_update(self.compression_threshold_pct, self.backup_switching_mode)?;

        if self.make_before_break_buffer >= self.max_hw_ecmp_groups {
            return Err(ConfigError::InvalidLimit {
                field: "make_before_break_buffer",
                message: format!(
                    "buffer {} leaves no room under the hardware limit of {} groups",
                    self.make_before_break_buffer, self.max_hw_ecmp_groups
                ),
            });
        }

        if let Some(max_members) = self.max_hw_ecmp_members {
            if self.make_before_break_member_buffer >= max_members {
                return Err(ConfigError::InvalidLimit {
                    field: "make_before_break_member_buffer",
                    message: format!(
                        "buffer {} leaves no room under the hardware limit of {} members",
                        self.make_before_break_member_buffer, max_members
                    ),
                });
            }
        }

        Ok(())
    }

    /// Group budget once the make-before-break buffer is set aside.
    pub fn max_primary_ecmp_groups(&self) -> u32 {
        self.max_hw_ecmp_groups
            .saturating_sub(self.make_before_break_buffer)
    }

    /// Member budget once the member buffer is set aside.
    pub fn max_primary_ecmp_members(&self) -> Option<u32> {
        self.max_hw_ecmp_members
            .map(|max| max.saturating_sub(self.make_before_break_member_buffer))
    }

    pub fn compression_enabled(&self) -> bool {
        self.compression_threshold_pct > 0
    }

    /// Returns true if the primary groups or members fill the budget.
    pub fn ecmp_limit_reached(&self, primary_groups: u32, members: u32) -> bool {
        primary_groups >= self.max_primary_ecmp_groups()
            || self
                .max_primary_ecmp_members()
                .is_some_and(|max| members >= max)
    }

    /// Returns true if one more primary group of `width` members would not fit.
    pub fn ecmp_demand_exceeded(&self, primary_groups: u32, members: u32, width: usize) -> bool {
        let width = u32::try_from(width).unwrap_or(u32::MAX);
        primary_groups >= self.max_primary_ecmp_groups()
            || self
                .max_primary_ecmp_members()
                .is_some_and(|max| members.saturating_add(width) > max)
    }

    /// Returns true if `extra_groups` more primary groups and a member
    /// count of `members` fit in the budget.
    pub fn fits(&self, primary_groups: u32, extra_groups: u32, members: u32) -> bool {
        primary_groups.saturating_add(extra_groups) <= self.max_primary_ecmp_groups()
            && self
                .max_primary_ecmp_members()
                .map_or(true, |max| members <= max)
    }

    /// Returns the configuration with a new threshold and backup mode.
    ///
    /// Rejects clearing a backup mode and changing a non-zero threshold, in
    /// addition to everything [`validate_cfg_update`] rejects. Nothing is
    /// applied on error.
    pub fn reconfigure(
        &self,
        compression_threshold_pct: u32,
        backup_switching_mode: Option<SwitchingMode>,
    ) -> Result<Self, ConfigError> {
        if self.compression_threshold_pct != 0
            && compression_threshold_pct != self.compression_threshold_pct
        {
            warn!(
                "EcmpResourceManager: rejecting compression threshold change {}% -> {}%",
                self.compression_threshold_pct, compression_threshold_pct
            );
            return Err(ConfigError::ThresholdChange {
                old: self.compression_threshold_pct,
                new: compression_threshold_pct,
            });
        }

        if let (Some(mode), None) = (self.backup_switching_mode, backup_switching_mode) {
            warn!(
                "EcmpResourceManager: rejecting removal of backup switching mode {}",
                mode
            );
            return Err(ConfigError::BackupModeCleared(mode));
        }

        validate_cfg_update(compression_threshold_pct, backup_switching_mode)?;

        Ok(Self {
            compression_threshold_pct,
            backup_switching_mode,
            ..self.clone()
        })
    }

    /// Returns the configuration with a new hardware group limit.
    pub fn with_ecmp_limit(&self, max_hw_ecmp_groups: u32) -> Result<Self, ConfigError> {
        let next = Self {
            max_hw_ecmp_groups,
            ..self.clone()
        };
        next.validate()?;
        Ok(next)
    }
}

/// Rejects a compression threshold and backup switching mode that cannot
/// be configured together.
pub fn validate_cfg_update(
    compression_threshold_pct: u32,
    backup_switching_mode: Option<SwitchingMode>,
) -> Result<(), ConfigError> {
    if compression_threshold_pct > MAX_COMPRESSION_THRESHOLD_PCT {
        return Err(ConfigError::ThresholdOutOfRange(compression_threshold_pct));
    }

    match backup_switching_mode {
        Some(mode) if compression_threshold_pct > 0 => Err(ConfigError::MutuallyExclusive {
            threshold: compression_threshold_pct,
            mode,
        }),
        _ => Ok(()),
    }
}
