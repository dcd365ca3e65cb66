// Copyright 2026 the Strata Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Refresh-rate configurations and selection policy.
//!
//! A display exposes a set of [`RefreshRateConfig`]s, each identified by a
//! [`ConfigId`]. [`RefreshRateConfigs`] tracks three ids separately:
//!
//! - **current** — what the hardware last confirmed,
//! - **desired** — what policy or content wants next,
//! - **upcoming** — what has been requested from the hardware and not yet
//!   acknowledged.
//!
//! An allowed-policy set restricts which configs may ever be selected.
//! Requests outside the set are rejected without side effects.

use std::collections::BTreeSet;

use tracing::warn;

use crate::error::{Result, Status};
use crate::time::Duration;

/// Identifier of one refresh-rate configuration on a display.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConfigId(pub u32);

/// One refresh-rate configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefreshRateConfig {
    /// Stable id assigned by the hardware composer.
    pub id: ConfigId,
    /// The vsync period at this rate.
    pub vsync_period: Duration,
    /// Whole frames per second, for policy decisions and dumps.
    pub fps: u32,
}

/// Per-connection wakeup offsets relative to hardware vsync.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhaseOffsets {
    /// Offset for application-side consumers.
    pub app: Duration,
    /// Offset for the compositor's own wakeup.
    pub sf: Duration,
}

impl Default for PhaseOffsets {
    fn default() -> Self {
        Self {
            app: Duration::from_millis(1),
            sf: Duration::from_millis(5),
        }
    }
}

/// A layer's say in refresh-rate selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FrameRateVote {
    /// The layer does not care.
    #[default]
    NoVote,
    /// The layer wants at least this many frames per second.
    Desired(u32),
    /// The layer wants the lowest available rate (e.g. static content).
    Min,
    /// The layer wants the highest available rate.
    Max,
}

/// Tracks the configs of one display and the switch bookkeeping.
#[derive(Clone, Debug)]
pub struct RefreshRateConfigs {
    configs: Vec<RefreshRateConfig>,
    current: ConfigId,
    desired: Option<ConfigId>,
    upcoming: Option<ConfigId>,
    allowed: BTreeSet<ConfigId>,
}

impl RefreshRateConfigs {
    /// Creates the tracker with every config allowed.
    ///
    /// # Panics
    ///
    /// Panics if `configs` is empty or does not contain `current`.
    #[must_use]
    pub fn new(mut configs: Vec<RefreshRateConfig>, current: ConfigId) -> Self {
        assert!(
            !configs.is_empty(),
            "a display must expose at least one config"
        );
        configs.sort_by_key(|c| c.fps);
        assert!(
            configs.iter().any(|c| c.id == current),
            "current config must be one of the display's configs"
        );
        let allowed = configs.iter().map(|c| c.id).collect();
        Self {
            configs,
            current,
            desired: None,
            upcoming: None,
            allowed,
        }
    }

    /// All configs, sorted ascending by fps.
    #[must_use]
    pub fn all(&self) -> &[RefreshRateConfig] {
        &self.configs
    }

    /// Looks up a config by id.
    #[must_use]
    pub fn get(&self, id: ConfigId) -> Option<&RefreshRateConfig> {
        self.configs.iter().find(|c| c.id == id)
    }

    /// The last hardware-confirmed config.
    ///
    /// While a switch is in flight this keeps returning the pre-change
    /// config.
    #[must_use]
    pub fn current(&self) -> &RefreshRateConfig {
        self.get(self.current)
            .expect("current id always refers to a known config")
    }

    /// The id desired by policy/content, if different from what is active
    /// or in flight.
    #[must_use]
    pub fn desired(&self) -> Option<ConfigId> {
        self.desired
    }

    /// The id requested from hardware but not yet acknowledged.
    #[must_use]
    pub fn upcoming(&self) -> Option<ConfigId> {
        self.upcoming
    }

    /// Whether a switch has been requested and not yet confirmed.
    #[must_use]
    pub fn switch_in_flight(&self) -> bool {
        self.upcoming.is_some()
    }

    /// Restricts selectable configs. The empty set means "everything
    /// allowed". Unknown ids are rejected wholesale.
    pub fn set_allowed(&mut self, ids: &[ConfigId]) -> Result<()> {
        if ids.is_empty() {
            self.allowed = self.configs.iter().map(|c| c.id).collect();
            return Ok(());
        }
        if ids.iter().any(|id| self.get(*id).is_none()) {
            return Err(Status::BadValue);
        }
        self.allowed = ids.iter().copied().collect();
        Ok(())
    }

    /// Whether `id` may be selected under the current policy.
    #[must_use]
    pub fn is_allowed(&self, id: ConfigId) -> bool {
        self.allowed.contains(&id)
    }

    /// Records a new desired config.
    ///
    /// Rejected with [`Status::BadValue`] for unknown ids and
    /// [`Status::ConfigNotAllowed`] for ids outside the policy set; neither
    /// rejection mutates state.
    pub fn set_desired(&mut self, id: ConfigId) -> Result<()> {
        if self.get(id).is_none() {
            return Err(Status::BadValue);
        }
        if !self.is_allowed(id) {
            warn!(?id, "refresh-rate config outside allowed policy set");
            return Err(Status::ConfigNotAllowed);
        }
        if id == self.current && self.upcoming.is_none() {
            self.desired = None;
            return Ok(());
        }
        self.desired = Some(id);
        Ok(())
    }

    /// Moves the desired id into the upcoming slot if no switch is already
    /// in flight; returns the id to request from hardware.
    ///
    /// While a switch is in flight the desired id stays cached and `None`
    /// is returned; it becomes the next request once the current one
    /// confirms.
    pub fn begin_switch(&mut self) -> Option<ConfigId> {
        if self.upcoming.is_some() {
            return None;
        }
        let id = self.desired.take()?;
        self.upcoming = Some(id);
        Some(id)
    }

    /// Applies a hardware acknowledgment.
    ///
    /// Returns `true` if the confirmation matched the in-flight request.
    /// Spurious or stale confirmations are ignored.
    pub fn confirm(&mut self, id: ConfigId) -> bool {
        if self.upcoming == Some(id) {
            self.current = id;
            self.upcoming = None;
            if self.desired == Some(id) {
                self.desired = None;
            }
            true
        } else {
            warn!(?id, upcoming = ?self.upcoming, "unexpected config confirmation");
            false
        }
    }

    /// Picks the best allowed config for the given layer votes.
    ///
    /// Any [`FrameRateVote::Max`] wins the highest allowed rate. Otherwise
    /// the lowest allowed rate satisfying the largest
    /// [`FrameRateVote::Desired`] is chosen (highest allowed if none
    /// suffices). [`FrameRateVote::Min`] with no competing demand picks the
    /// lowest allowed rate. With no votes at all the current config is kept
    /// when allowed, else the highest allowed rate.
    #[must_use]
    pub fn best_allowed_for_votes(&self, votes: &[FrameRateVote]) -> ConfigId {
        let allowed: Vec<RefreshRateConfig> = self
            .configs
            .iter()
            .filter(|c| self.allowed.contains(&c.id))
            .copied()
            .collect();
        debug_assert!(!allowed.is_empty(), "policy set never empties completely");

        let highest = *allowed.last().expect("allowed set is nonempty");
        let lowest = *allowed.first().expect("allowed set is nonempty");

        if votes.contains(&FrameRateVote::Max) {
            return highest.id;
        }
        let max_desired = votes
            .iter()
            .filter_map(|v| match v {
                FrameRateVote::Desired(fps) => Some(*fps),
                _ => None,
            })
            .max();
        if let Some(fps) = max_desired {
            return allowed
                .iter()
                .find(|c| c.fps >= fps)
                .map_or(highest.id, |c| c.id);
        }
        if votes.contains(&FrameRateVote::Min) {
            return lowest.id;
        }
        if self.allowed.contains(&self.current) {
            self.current
        } else {
            highest.id
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_configs() -> RefreshRateConfigs {
        RefreshRateConfigs::new(
            vec![
                RefreshRateConfig {
                    id: ConfigId(0),
                    vsync_period: Duration(16_666_666),
                    fps: 60,
                },
                RefreshRateConfig {
                    id: ConfigId(1),
                    vsync_period: Duration(11_111_111),
                    fps: 90,
                },
                RefreshRateConfig {
                    id: ConfigId(2),
                    vsync_period: Duration(8_333_333),
                    fps: 120,
                },
            ],
            ConfigId(0),
        )
    }

    #[test]
    fn current_is_stable_while_switch_in_flight() {
        let mut configs = sample_configs();
        configs.set_desired(ConfigId(2)).unwrap();
        assert_eq!(configs.begin_switch(), Some(ConfigId(2)));
        // Mid-transition queries see the pre-change config.
        assert_eq!(configs.current().id, ConfigId(0));
        assert!(configs.switch_in_flight());

        assert!(configs.confirm(ConfigId(2)));
        assert_eq!(configs.current().id, ConfigId(2));
        assert!(!configs.switch_in_flight());
    }

    #[test]
    fn desired_is_cached_while_switch_in_flight() {
        let mut configs = sample_configs();
        configs.set_desired(ConfigId(1)).unwrap();
        assert_eq!(configs.begin_switch(), Some(ConfigId(1)));

        // A newer desire arrives mid-flight; it must not start a second
        // request yet.
        configs.set_desired(ConfigId(2)).unwrap();
        assert_eq!(configs.begin_switch(), None);

        assert!(configs.confirm(ConfigId(1)));
        assert_eq!(configs.begin_switch(), Some(ConfigId(2)));
    }

    #[test]
    fn disallowed_request_is_rejected_without_side_effects() {
        let mut configs = sample_configs();
        configs.set_allowed(&[ConfigId(0), ConfigId(1)]).unwrap();
        assert_eq!(
            configs.set_desired(ConfigId(2)),
            Err(Status::ConfigNotAllowed)
        );
        assert_eq!(configs.desired(), None);
        assert_eq!(configs.set_desired(ConfigId(99)), Err(Status::BadValue));
    }

    #[test]
    fn stale_confirmation_is_ignored() {
        let mut configs = sample_configs();
        assert!(!configs.confirm(ConfigId(1)));
        assert_eq!(configs.current().id, ConfigId(0));
    }

    #[test]
    fn vote_selection() {
        let mut configs = sample_configs();

        assert_eq!(
            configs.best_allowed_for_votes(&[FrameRateVote::Max]),
            ConfigId(2)
        );
        assert_eq!(
            configs.best_allowed_for_votes(&[FrameRateVote::Desired(80)]),
            ConfigId(1),
            "lowest rate satisfying the demand"
        );
        assert_eq!(
            configs.best_allowed_for_votes(&[FrameRateVote::Desired(200)]),
            ConfigId(2),
            "highest allowed when nothing suffices"
        );
        assert_eq!(
            configs.best_allowed_for_votes(&[FrameRateVote::Min, FrameRateVote::NoVote]),
            ConfigId(0)
        );
        assert_eq!(
            configs.best_allowed_for_votes(&[]),
            ConfigId(0),
            "keep current"
        );

        configs.set_allowed(&[ConfigId(1)]).unwrap();
        assert_eq!(
            configs.best_allowed_for_votes(&[]),
            ConfigId(1),
            "current not allowed falls back to highest allowed"
        );
    }

    #[test]
    #[should_panic(expected = "at least one config")]
    fn empty_config_list_panics() {
        let _ = RefreshRateConfigs::new(Vec::new(), ConfigId(0));
    }
}
