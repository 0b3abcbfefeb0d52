//! Theta-state classification and the closed-loop entrainment controller.
//!
//! The controller watches the theta z-score and switches entrainment on when
//! theta drops below baseline, then off once it has recovered:
//!
//! ```text
//!            z < start_below_z  and  cooldown elapsed
//!   ┌─────┐ ─────────────────────────────────────────▶ ┌────┐
//!   │ off │                                            │ on │
//!   └─────┘ ◀───────────────────────────────────────── └────┘
//!            z > stop_above_z  and  min on-time reached
//! ```

use serde::{Deserialize, Serialize};

use crate::types::ControlCommand;

/// Coarse reading of the theta z-score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThetaState {
    Low,
    Normal,
    High,
}

impl ThetaState {
    /// `Low` below `low`, `High` above `high`, otherwise `Normal`.
    /// A NaN z-score reads as `Normal`.
    pub fn classify(z_score: f64, low: f64, high: f64) -> Self {
        if z_score < low {
            ThetaState::Low
        } else if z_score > high {
            ThetaState::High
        } else {
            ThetaState::Normal
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClosedLoopConfig {
    /// Classification bounds for [`ThetaState`].
    pub low_threshold_z: f64,
    pub high_threshold_z: f64,
    /// Start entrainment when z falls below this.
    pub start_below_z: f64,
    /// Stop entrainment when z rises above this.
    pub stop_above_z: f64,
    /// Entrainment stays on at least this long once started.
    pub min_on_secs: f64,
    /// Entrainment stays off at least this long once stopped.
    pub cooldown_secs: f64,
}

impl Default for ClosedLoopConfig {
    fn default() -> Self {
        Self {
            low_threshold_z: -0.5,
            high_threshold_z: 0.5,
            start_below_z: -0.5,
            stop_above_z: 0.0,
            min_on_secs: 5.0,
            cooldown_secs: 10.0,
        }
    }
}

impl ClosedLoopConfig {
    pub fn classify(&self, z_score: f64) -> ThetaState {
        ThetaState::classify(z_score, self.low_threshold_z, self.high_threshold_z)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrainmentStats {
    pub activations: u32,
    /// Time spent on, over finished activations.
    pub total_active_ms: u64,
}

/// Decides when entrainment should run.
///
/// Feed it one z-score per metrics sample with the sample's timestamp; it
/// returns the command to send when the decision flips.  The controller only
/// decides; sending the command is the caller's job.
#[derive(Debug, Clone)]
pub struct EntrainmentController {
    config: ClosedLoopConfig,
    active_since_ms: Option<u64>,
    last_stopped_ms: Option<u64>,
    stats: EntrainmentStats,
}

impl EntrainmentController {
    pub fn new(config: ClosedLoopConfig) -> Self {
        Self {
            config,
            active_since_ms: None,
            last_stopped_ms: None,
            stats: EntrainmentStats::default(),
        }
    }

    pub fn config(&self) -> &ClosedLoopConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.active_since_ms.is_some()
    }

    pub fn stats(&self) -> EntrainmentStats {
        self.stats
    }

    pub fn update(&mut self, z_score: f64, now_ms: u64) -> Option<ControlCommand> {
        match self.active_since_ms {
            Some(since) => {
                let on_secs = now_ms.saturating_sub(since) as f64 / 1000.0;
                if on_secs >= self.config.min_on_secs && z_score > self.config.stop_above_z {
                    Some(self.switch_off(now_ms))
                } else {
                    None
                }
            }
            None => {
                let cooled = self.last_stopped_ms.map_or(true, |t| {
                    now_ms.saturating_sub(t) as f64 / 1000.0 > self.config.cooldown_secs
                });
                if cooled && z_score < self.config.start_below_z {
                    self.active_since_ms = Some(now_ms);
                    self.stats.activations += 1;
                    Some(ControlCommand::StartEntrainment)
                } else {
                    None
                }
            }
        }
    }

    /// Switch off unconditionally, e.g. at session end.  `None` if already off.
    pub fn force_stop(&mut self, now_ms: u64) -> Option<ControlCommand> {
        self.active_since_ms.map(|_| self.switch_off(now_ms))
    }

    fn switch_off(&mut self, now_ms: u64) -> ControlCommand {
        if let Some(since) = self.active_since_ms.take() {
            self.stats.total_active_ms += now_ms.saturating_sub(since);
        }
        self.last_stopped_ms = Some(now_ms);
        ControlCommand::StopEntrainment
    }

    /// Forget all history, keeping the config.
    pub fn reset(&mut self) {
        self.active_since_ms = None;
        self.last_stopped_ms = None;
        self.stats = EntrainmentStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> EntrainmentController {
        EntrainmentController::new(ClosedLoopConfig::default())
    }

    #[test]
    fn test_classify() {
        let c = ClosedLoopConfig::default();
        assert_eq!(c.classify(-0.8), ThetaState::Low);
        assert_eq!(c.classify(-0.5), ThetaState::Normal);
        assert_eq!(c.classify(0.5), ThetaState::Normal);
        assert_eq!(c.classify(0.51), ThetaState::High);
        assert_eq!(c.classify(f64::NAN), ThetaState::Normal);
    }

    #[test]
    fn test_starts_on_low_theta() {
        let mut c = controller();
        assert_eq!(c.update(-0.2, 0), None);
        assert_eq!(c.update(-0.9, 100), Some(ControlCommand::StartEntrainment));
        assert!(c.is_active());
        assert_eq!(c.update(-0.9, 200), None);
    }

    #[test]
    fn test_min_on_duration_holds_entrainment() {
        let mut c = controller();
        c.update(-1.0, 0);
        assert_eq!(c.update(1.0, 4_999), None);
        assert_eq!(c.update(1.0, 5_000), Some(ControlCommand::StopEntrainment));
        assert!(!c.is_active());
        assert_eq!(c.stats().total_active_ms, 5_000);
    }

    #[test]
    fn test_stays_on_until_theta_recovers() {
        let mut c = controller();
        c.update(-1.0, 0);
        assert_eq!(c.update(0.0, 60_000), None);
        assert_eq!(c.update(0.1, 61_000), Some(ControlCommand::StopEntrainment));
    }

    #[test]
    fn test_cooldown_blocks_restart() {
        let mut c = controller();
        c.update(-1.0, 0);
        c.update(1.0, 5_000);
        assert_eq!(c.update(-1.0, 10_000), None);
        assert_eq!(c.update(-1.0, 15_000), None);
        assert_eq!(c.update(-1.0, 15_001), Some(ControlCommand::StartEntrainment));
        assert_eq!(c.stats().activations, 2);
    }

    #[test]
    fn test_force_stop_and_reset() {
        let mut c = controller();
        assert_eq!(c.force_stop(0), None);
        c.update(-1.0, 1_000);
        assert_eq!(c.force_stop(3_000), Some(ControlCommand::StopEntrainment));
        assert_eq!(c.stats().total_active_ms, 2_000);
        c.reset();
        assert_eq!(c.stats(), EntrainmentStats::default());
        assert_eq!(c.update(-1.0, 3_500), Some(ControlCommand::StartEntrainment));
    }
}
