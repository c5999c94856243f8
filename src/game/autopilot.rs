//! Autopilot control law and rudder input arbitration

use glam::DVec2;
use serde::{Deserialize, Serialize};

use super::boat::{angle_diff, BoatState};

/// Largest relative rudder deflection any source may command
pub const RUDDER_RANGE: f64 = 90.0;

/// Where the autopilot steers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "target", rename_all = "kebab-case")]
pub enum TargetSpec {
    /// Fixed map coordinate
    GlobalPos(DVec2),
    /// Boat-frame offset, pinned to a map coordinate when set
    LocalPos(DVec2),
    /// Another session's boat, looked up by name every tick
    User(String),
}

/// Tuning shared by every autopilot in a simulation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutopilotTuning {
    pub gain: f64,
    pub max_rudder: f64,
    /// Degrees per simulated second
    pub max_rudder_movement: f64,
}

/// Per-session autopilot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Autopilot {
    pub enabled: bool,
    pub target: TargetSpec,
    /// Map coordinate a `local-pos` target resolved to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned: Option<DVec2>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_command: Option<f64>,
}

impl Autopilot {
    /// Disabled autopilot aimed at `end`
    pub fn new(end: DVec2) -> Self {
        Self {
            enabled: false,
            target: TargetSpec::GlobalPos(end),
            pinned: None,
            last_command: None,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.last_command = None;
        }
    }

    /// Replace the target, pinning a local offset against the boat's current pose
    pub fn set_target(&mut self, target: TargetSpec, boat: &BoatState) {
        self.pinned = match &target {
            TargetSpec::LocalPos(offset) => Some(boat.to_global_point(*offset)),
            _ => None,
        };
        self.target = target;
    }

    /// Current target coordinate, `None` when a tracked user cannot be followed
    pub fn target_position<F>(&self, lookup: F) -> Option<DVec2>
    where
        F: Fn(&str) -> Option<DVec2>,
    {
        match &self.target {
            TargetSpec::GlobalPos(pos) => Some(*pos),
            TargetSpec::LocalPos(_) => self.pinned,
            TargetSpec::User(name) => lookup(name),
        }
    }

    /// Relative rudder command for this tick, or `None` when disengaged
    ///
    /// The command moves at most `max_rudder_movement * dt` away from the
    /// boat's current rudder. An unreachable target repeats the last command.
    pub fn update<F>(
        &mut self,
        boat: &BoatState,
        lookup: F,
        dt: f64,
        tuning: &AutopilotTuning,
    ) -> Option<f64>
    where
        F: Fn(&str) -> Option<DVec2>,
    {
        if !self.enabled {
            return None;
        }

        let Some(target) = self.target_position(lookup) else {
            return self.last_command;
        };

        let to_target = target - boat.pos;
        if to_target.length_squared() < 1e-12 {
            return self.last_command;
        }

        let bearing = to_target.y.atan2(to_target.x).to_degrees();
        let error = angle_diff(boat.angle, bearing);
        let limit = tuning.max_rudder.clamp(0.0, RUDDER_RANGE);
        let mut desired = (-tuning.gain * error).clamp(-limit, limit);
        if boat.local_velocity().y < 0.0 {
            desired = -desired;
        }

        let current = boat.relative_rudder();
        let diff = desired - current;
        let max_step = tuning.max_rudder_movement.max(0.0) * dt.max(0.0);
        let command = current + diff.signum() * diff.abs().min(max_step);

        self.last_command = Some(command);
        Some(command)
    }
}

/// Competing rudder inputs; the first present of manual, slider, autopilot wins
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RudderInput {
    pub manual: Option<f64>,
    pub slider: Option<f64>,
    pub autopilot: Option<f64>,
}

impl RudderInput {
    /// Winning relative rudder angle, `None` leaves the rudder where it is
    pub fn resolve(&self) -> Option<f64> {
        self.manual
            .or(self.slider)
            .or(self.autopilot)
            .map(|angle| angle.clamp(-RUDDER_RANGE, RUDDER_RANGE))
    }
}
