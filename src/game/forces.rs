//! Force model for a single boat
//!
//! Everything here works in the boat frame: +Y forward, +X starboard. Torque
//! is the 2D cross product of the application point and the force, so
//! counter-clockwise is positive. Angular velocity is in degrees per second
//! and the boat spec's `moment` converts torque straight into deg/s².

use std::collections::BTreeMap;

use glam::DVec2;
use serde::{Deserialize, Serialize};

use super::boat::{angle_diff, to_local, BoatSpec, BoatState};

pub const AIR_DENSITY: f64 = 1.225;
pub const WATER_DENSITY: f64 = 1000.0;

/// Normal force coefficient of a flat plate broadside to the flow
const FLAT_PLATE_CN: f64 = 1.28;

/// Half-width of the sector around dead astern in which forward sails are blanketed
const SHADOW_SECTOR_DEG: f64 = 20.0;

const STILL: f64 = 1e-9;

/// A force and the local point it acts on, serialized as `[[x, y], [fx, fy]]`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AppliedForce(pub DVec2, pub DVec2);

impl AppliedForce {
    pub fn at(&self) -> DVec2 {
        self.0
    }

    pub fn force(&self) -> DVec2 {
        self.1
    }

    fn torque(&self) -> f64 {
        self.0.perp_dot(self.1)
    }
}

/// Named force vectors kept on each session for display
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Forces {
    pub hull_water_drag: AppliedForce,
    pub hull_air_drag: AppliedForce,
    pub sails_total: AppliedForce,
    pub rudder: AppliedForce,
    pub total: AppliedForce,
}

/// What happened to one sail this step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SailOutcome {
    pub angle: f64,
    pub force: DVec2,
    /// Held against its sheet rather than streaming freely
    pub sheeted: bool,
    pub shadowed: bool,
}

/// Output of [`compute`]
#[derive(Debug, Clone, PartialEq)]
pub struct ForceReport {
    pub forces: Forces,
    /// Net torque including hull angular drag
    pub torque: f64,
    /// Apparent wind in the boat frame
    pub apparent_wind: DVec2,
    pub sails: BTreeMap<String, SailOutcome>,
}

/// `½·c·ρ·v|v|·scale`, signed like `speed`
pub fn drag(speed: f64, coefficient: f64, density: f64, scale: f64) -> f64 {
    0.5 * coefficient * density * speed * speed.abs() * scale
}

/// Normal force on a flat plate at local `angle` in a flow of velocity `flow`
pub fn flat_plate_force(flow: DVec2, area: f64, angle: f64, density: f64) -> DVec2 {
    let normal = DVec2::from_angle((angle - 90.0).to_radians());
    let v_perp = flow.dot(normal);
    normal * drag(v_perp, FLAT_PLATE_CN, density, area)
}

/// Hull angular drag torque, always opposing the rotation
pub fn angular_drag(angular_velocity: f64, coefficient: f64, scale: f64) -> f64 {
    -drag(angular_velocity, coefficient, WATER_DENSITY, scale)
}

fn direction_deg(v: DVec2) -> f64 {
    v.y.atan2(v.x).to_degrees().rem_euclid(360.0)
}

/// Sail angle the sheet allows closest to `free`
fn sheet_limit(free: f64, sheeting_angle: f64) -> (f64, bool) {
    let offset = angle_diff(270.0, free);
    let limit = sheeting_angle.clamp(0.0, 180.0);
    if offset.abs() <= limit {
        (free, false)
    } else {
        ((270.0 + offset.signum() * limit).rem_euclid(360.0), true)
    }
}

/// Compute every force on a boat for the given true wind
pub fn compute(state: &BoatState, spec: &BoatSpec, wind: DVec2) -> ForceReport {
    let local_velocity = state.local_velocity();
    let apparent_wind = to_local(wind - state.velocity, state.angle);
    let wind_speed = apparent_wind.length();

    // Sails
    let from_astern = wind_speed > STILL
        && angle_diff(90.0, direction_deg(apparent_wind)).abs() <= SHADOW_SECTOR_DEG;
    let aftmost_tack = spec
        .sails_static
        .values()
        .map(|s| s.tack)
        .fold(f64::INFINITY, f64::min);

    let mut sails = BTreeMap::new();
    let mut sail_forces = Vec::new();
    for (name, sail_spec) in &spec.sails_static {
        let current = state.sails.get(name).copied().unwrap_or_default();

        let (angle, sheeted) = if wind_speed > STILL {
            sheet_limit(direction_deg(apparent_wind), current.sheeting_angle)
        } else {
            (current.angle, false)
        };
        let shadowed = from_astern && sail_spec.tack > aftmost_tack;
        let force = if sheeted && !shadowed {
            flat_plate_force(apparent_wind, sail_spec.area, angle, AIR_DENSITY)
        } else {
            DVec2::ZERO
        };

        let at = DVec2::from_angle(angle.to_radians()) * sail_spec.center_of_effort
            + DVec2::new(0.0, sail_spec.tack);
        sail_forces.push(AppliedForce(at, force));
        sails.insert(
            name.clone(),
            SailOutcome {
                angle,
                force,
                sheeted,
                shadowed,
            },
        );
    }
    let (sails_total, sails_torque) = combine(&sail_forces);

    // Hull
    let hull_water_drag = AppliedForce(
        DVec2::new(0.0, spec.center_of_lateral_resistance),
        -DVec2::new(
            drag(local_velocity.x, spec.sideways_drag, WATER_DENSITY, spec.scale),
            drag(local_velocity.y, spec.forward_drag, WATER_DENSITY, spec.scale),
        ),
    );
    let hull_air_drag = AppliedForce(
        DVec2::ZERO,
        apparent_wind.normalize_or_zero()
            * drag(wind_speed, spec.boat_air_drag, AIR_DENSITY, spec.scale),
    );

    // Rudder
    let rudder = if state.rudder_enable && spec.rudder_area > 0.0 {
        let at = DVec2::new(0.0, spec.rudder_pivot)
            + DVec2::from_angle(state.rudder_angle.to_radians()) * spec.rudder_center_of_effort;
        let omega = state.angular_velocity.to_radians();
        let spin = DVec2::new(-omega * at.y, omega * at.x);
        let flow = -(local_velocity + spin);
        AppliedForce(
            at,
            flat_plate_force(flow, spec.rudder_area, state.rudder_angle, WATER_DENSITY),
        )
    } else {
        AppliedForce::default()
    };

    let (total, _) = combine(&[sails_total, hull_water_drag, hull_air_drag, rudder]);
    // sails_total is only a display resultant, the sails' torque is summed per sail
    let torque = sails_torque
        + hull_water_drag.torque()
        + hull_air_drag.torque()
        + rudder.torque()
        + angular_drag(state.angular_velocity, spec.angular_drag, spec.scale);

    ForceReport {
        forces: Forces {
            hull_water_drag,
            hull_air_drag,
            sails_total,
            rudder,
            total,
        },
        torque,
        apparent_wind,
        sails,
    }
}

/// Resultant of `parts` at their magnitude-weighted centre of effort, plus
/// the summed torque of the individual forces
fn combine(parts: &[AppliedForce]) -> (AppliedForce, f64) {
    let total: DVec2 = parts.iter().map(|p| p.force()).sum();
    let weight: f64 = parts.iter().map(|p| p.force().length()).sum();
    let at = if weight > STILL {
        parts
            .iter()
            .map(|p| p.at() * p.force().length())
            .sum::<DVec2>()
            / weight
    } else {
        DVec2::ZERO
    };
    let torque = parts.iter().map(AppliedForce::torque).sum();
    (AppliedForce(at, total), torque)
}
