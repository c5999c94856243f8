//! Boat integration, sanity clamps and contact responses

use glam::DVec2;

use crate::config::SanityLimits;

use super::boat::{to_global, BoatSpec, BoatState};
use super::forces::{self, Forces};
use super::map::LandCheck;

/// Fraction of speed kept after bouncing off land
const LAND_RESTITUTION: f64 = 0.5;

/// What one integration step did besides moving the boat
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub forces: Forces,
    /// A sanity clamp had to be applied
    pub sanity_limited: bool,
}

/// Land contact during a step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LandCollision {
    pub damage: f64,
}

/// Simulated seconds covered by a frame: real elapsed time capped at the lag limit
pub fn frame_dt(elapsed: f64, lag_limit: f64, ratio: f64) -> f64 {
    elapsed.clamp(0.0, lag_limit.max(0.0)) * ratio.max(0.0)
}

/// Integrator for boat kinematics
pub struct PhysicsSystem;

impl PhysicsSystem {
    /// One semi-implicit Euler step: forces, velocities, clamp, then positions
    pub fn step(
        state: &mut BoatState,
        spec: &BoatSpec,
        wind: DVec2,
        dt: f64,
        limits: &SanityLimits,
    ) -> StepReport {
        let report = forces::compute(state, spec, wind);

        for (name, outcome) in &report.sails {
            if let Some(sail) = state.sails.get_mut(name) {
                sail.angle = outcome.angle;
                sail.force = outcome.force;
            }
        }

        if dt > 0.0 {
            if spec.mass > 0.0 {
                let accel = to_global(report.forces.total.force(), state.angle) / spec.mass;
                state.velocity += accel * dt;
            }
            if spec.moment > 0.0 {
                state.angular_velocity += report.torque / spec.moment * dt;
            }
        }

        let sanity_limited = Self::clamp_to_limits(state, limits);

        if dt > 0.0 {
            state.pos += state.velocity * dt;
            state.angle = (state.angle + state.angular_velocity * dt).rem_euclid(360.0);
        }

        StepReport {
            forces: report.forces,
            sanity_limited,
        }
    }

    /// Hard clamp onto the sanity limits; returns whether anything was clamped
    pub fn clamp_to_limits(state: &mut BoatState, limits: &SanityLimits) -> bool {
        let mut clamped = false;

        let speed = state.velocity.length();
        if !speed.is_finite() {
            state.velocity = DVec2::ZERO;
            clamped = true;
        } else if speed > limits.velocity {
            state.velocity *= limits.velocity / speed;
            clamped = true;
        }

        if !state.angular_velocity.is_finite() {
            state.angular_velocity = 0.0;
            clamped = true;
        } else if state.angular_velocity.abs() > limits.angular_velocity {
            state.angular_velocity = state.angular_velocity.signum() * limits.angular_velocity;
            clamped = true;
        }

        clamped
    }

    /// Whether the boat's centre or any hull vertex is over land
    pub fn touches_land(state: &BoatState, spec: &BoatSpec, land: &dyn LandCheck) -> bool {
        land.is_land(state.pos)
            || spec
                .perimeter
                .iter()
                .any(|p| land.is_land(state.to_global_point(*p)))
    }

    /// Undo the step's motion and bounce if the boat ended up on land
    pub fn resolve_land(
        state: &mut BoatState,
        prev_pos: DVec2,
        spec: &BoatSpec,
        land: &dyn LandCheck,
        damage_factor: f64,
    ) -> Option<LandCollision> {
        if !Self::touches_land(state, spec, land) {
            return None;
        }

        let damage = damage_factor.max(0.0) * state.velocity.length() * spec.mass;
        state.pos = prev_pos;
        state.velocity = -state.velocity * LAND_RESTITUTION;
        state.angular_velocity = 0.0;

        Some(LandCollision { damage })
    }

    /// Take damage off the hull; returns true when the hull just gave out
    pub fn apply_damage(state: &mut BoatState, spec: &BoatSpec, damage: f64) -> bool {
        if spec.is_indestructible() || state.hull_durability <= 0.0 {
            return false;
        }
        state.hull_durability = (state.hull_durability - damage.max(0.0)).max(0.0);
        state.hull_durability == 0.0
    }

    /// Check whether two bounding circles overlap
    pub fn check_boat_collision(p1: DVec2, radius1: f64, p2: DVec2, radius2: f64) -> bool {
        let combined = radius1 + radius2;
        p1.distance_squared(p2) <= combined * combined
    }

    /// Push two overlapping boats apart along the line between their centres
    pub fn separate(p1: DVec2, radius1: f64, p2: DVec2, radius2: f64) -> (DVec2, DVec2) {
        let delta = p2 - p1;
        let dist = delta.length();

        if dist < 0.001 {
            return (p1 - DVec2::new(radius1, 0.0), p2 + DVec2::new(radius2, 0.0));
        }

        let overlap = radius1 + radius2 - dist;
        if overlap <= 0.0 {
            return (p1, p2);
        }

        let normal = delta / dist;
        let push = overlap / 2.0 + 0.01;
        (p1 - normal * push, p2 + normal * push)
    }
}
