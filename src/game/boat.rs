//! Static boat specifications loaded from `boats/<type>.json`

use std::collections::BTreeMap;

use glam::DVec2;
use serde::{Deserialize, Serialize};

use super::map::point_in_polygon;

/// Sail geometry that never changes during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SailSpec {
    pub area: f64,
    /// Distance from the mast to the sail's center of effort
    pub center_of_effort: f64,
    /// Local Y coordinate of the mast
    pub tack: f64,
}

/// Hull, rudder and rig description for one boat type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BoatSpec {
    /// Hull outline in local coordinates, counter-clockwise
    pub perimeter: Vec<DVec2>,
    /// Local Y coordinate of the center of lateral resistance
    pub center_of_lateral_resistance: f64,
    pub forward_drag: f64,
    pub sideways_drag: f64,
    pub scale: f64,
    pub boat_air_drag: f64,
    /// Local Y coordinate of the rudder pivot
    pub rudder_pivot: f64,
    pub rudder_area: f64,
    /// Distance from the rudder pivot to its center of effort
    pub rudder_center_of_effort: f64,
    pub mass: f64,
    /// Angular mass, torque per deg/s²
    pub moment: f64,
    pub angular_drag: f64,
    /// Negative means the hull cannot be damaged
    pub max_hull_durability: f64,
    pub sails_static: BTreeMap<String, SailSpec>,
}

impl BoatSpec {
    pub fn is_indestructible(&self) -> bool {
        self.max_hull_durability < 0.0
    }

    /// Radius of the smallest origin-centered circle containing the hull
    pub fn max_radius(&self) -> f64 {
        self.perimeter
            .iter()
            .map(|p| p.length())
            .fold(0.0, f64::max)
    }

    /// Whether a point given in local coordinates lies inside the hull
    pub fn hull_contains(&self, local: DVec2) -> bool {
        point_in_polygon(local, &self.perimeter)
    }
}

/// Dynamic state of one sail
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SailState {
    /// Local angle in degrees, 270 points straight aft
    pub angle: f64,
    /// How far either side of straight aft the sheet lets the sail out
    pub sheeting_angle: f64,
    #[serde(default)]
    pub force: DVec2,
}

impl Default for SailState {
    fn default() -> Self {
        Self {
            angle: 270.0,
            sheeting_angle: 90.0,
            force: DVec2::ZERO,
        }
    }
}

/// Dynamic state of one boat, persisted as the session's `boat` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BoatState {
    #[serde(rename = "type")]
    pub boat_type: String,
    pub pos: DVec2,
    #[serde(default)]
    pub velocity: DVec2,
    /// Heading, degrees CCW from east
    pub angle: f64,
    /// Degrees per second, CCW positive
    #[serde(default)]
    pub angular_velocity: f64,
    #[serde(default = "straight_aft")]
    pub rudder_angle: f64,
    #[serde(default = "enabled")]
    pub rudder_enable: bool,
    pub hull_durability: f64,
    #[serde(default)]
    pub sails: BTreeMap<String, SailState>,
}

fn straight_aft() -> f64 {
    270.0
}

fn enabled() -> bool {
    true
}

impl BoatState {
    /// Fresh boat at `pos` pointing north with every sail let out
    pub fn new(boat_type: &str, spec: &BoatSpec, pos: DVec2) -> Self {
        Self {
            boat_type: boat_type.to_string(),
            pos,
            velocity: DVec2::ZERO,
            angle: 90.0,
            angular_velocity: 0.0,
            rudder_angle: 270.0,
            rudder_enable: true,
            hull_durability: spec.max_hull_durability,
            sails: spec
                .sails_static
                .keys()
                .map(|name| (name.clone(), SailState::default()))
                .collect(),
        }
    }

    /// Rudder angle relative to straight aft, positive to starboard
    pub fn relative_rudder(&self) -> f64 {
        self.rudder_angle - 270.0
    }

    /// Velocity in the boat frame
    pub fn local_velocity(&self) -> DVec2 {
        to_local(self.velocity, self.angle)
    }

    pub fn to_global_point(&self, local: DVec2) -> DVec2 {
        to_global(local, self.angle) + self.pos
    }

    pub fn to_local_point(&self, global: DVec2) -> DVec2 {
        to_local(global - self.pos, self.angle)
    }
}

/// Rotate a boat-frame vector into the map frame for a boat heading `angle`
pub fn to_global(v: DVec2, angle: f64) -> DVec2 {
    DVec2::from_angle((angle - 90.0).to_radians()).rotate(v)
}

/// Rotate a map-frame vector into the frame of a boat heading `angle`
pub fn to_local(v: DVec2, angle: f64) -> DVec2 {
    DVec2::from_angle((90.0 - angle).to_radians()).rotate(v)
}

/// Signed difference `to - from` wrapped to [-180, 180)
pub fn angle_diff(from: f64, to: f64) -> f64 {
    (to - from + 180.0).rem_euclid(360.0) - 180.0
}

#[cfg(test)]
pub(crate) fn test_boat() -> BoatSpec {
    let mut sails_static = BTreeMap::new();
    sails_static.insert(
        "main".to_string(),
        SailSpec {
            area: 10.0,
            center_of_effort: 2.5,
            tack: 1.0,
        },
    );
    sails_static.insert(
        "jib".to_string(),
        SailSpec {
            area: 4.0,
            center_of_effort: 0.5,
            tack: 3.0,
        },
    );

    BoatSpec {
        perimeter: vec![
            DVec2::new(1.0, -3.0),
            DVec2::new(0.0, 3.0),
            DVec2::new(-1.0, -3.0),
        ],
        center_of_lateral_resistance: 0.0,
        forward_drag: 0.02,
        sideways_drag: 4.0,
        scale: 3.0,
        boat_air_drag: 0.1,
        rudder_pivot: -3.0,
        rudder_area: 1.2,
        rudder_center_of_effort: 0.35,
        mass: 1000.0,
        moment: 500.0,
        angular_drag: 0.0,
        max_hull_durability: 1000.0,
        sails_static,
    }
}
