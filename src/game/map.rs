//! Static map data and land checks

use glam::DVec2;
use serde::{Deserialize, Serialize};

/// One landmass outline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Landmass {
    pub coords: Vec<DVec2>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<[u8; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rep_point: Option<DVec2>,
}

/// Map loaded from `maps/<name>.json`, immutable for the life of a simulation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Map {
    /// Width and height in meters
    pub size: DVec2,
    pub start: DVec2,
    pub end: DVec2,
    #[serde(default)]
    pub landmasses: Vec<Landmass>,
}

/// Answers whether a global point is over land
pub trait LandCheck: Send + Sync {
    fn is_land(&self, point: DVec2) -> bool;
}

/// Land check backed by the map's landmass polygons
#[derive(Debug, Clone, Default)]
pub struct PolygonLandCheck {
    polygons: Vec<Vec<DVec2>>,
}

impl PolygonLandCheck {
    pub fn new(map: &Map) -> Self {
        Self {
            polygons: map
                .landmasses
                .iter()
                .filter(|l| l.coords.len() >= 3)
                .map(|l| l.coords.clone())
                .collect(),
        }
    }
}

impl LandCheck for PolygonLandCheck {
    fn is_land(&self, point: DVec2) -> bool {
        self.polygons.iter().any(|poly| point_in_polygon(point, poly))
    }
}

/// Even-odd ray cast; points exactly on an edge may land either side
pub fn point_in_polygon(point: DVec2, polygon: &[DVec2]) -> bool {
    let n = polygon.len();
    if n < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let a = polygon[i];
        let b = polygon[j];
        if (a.y > point.y) != (b.y > point.y) {
            let x_cross = a.x + (point.y - a.y) / (b.y - a.y) * (b.x - a.x);
            if point.x < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

#[cfg(test)]
pub(crate) fn open_water_map() -> Map {
    Map {
        size: DVec2::new(1000.0, 1000.0),
        start: DVec2::new(100.0, 100.0),
        end: DVec2::new(900.0, 900.0),
        landmasses: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x: f64, y: f64, side: f64) -> Vec<DVec2> {
        vec![
            DVec2::new(x, y),
            DVec2::new(x + side, y),
            DVec2::new(x + side, y + side),
            DVec2::new(x, y + side),
        ]
    }

    #[test]
    fn point_in_square() {
        let poly = square(0.0, 0.0, 10.0);
        assert!(point_in_polygon(DVec2::new(5.0, 5.0), &poly));
        assert!(!point_in_polygon(DVec2::new(15.0, 5.0), &poly));
        assert!(!point_in_polygon(DVec2::new(5.0, -0.1), &poly));
    }

    #[test]
    fn degenerate_polygon_is_never_land() {
        let line = vec![DVec2::ZERO, DVec2::new(10.0, 10.0)];
        assert!(!point_in_polygon(DVec2::new(5.0, 5.0), &line));
    }

    #[test]
    fn land_check_from_map_file() {
        let text = r#"{
            "size": [100, 100],
            "start": [10, 10],
            "end": [90, 90],
            "landmasses": [
                {"coords": [[40, 40], [60, 40], [60, 60], [40, 60]], "name": "rock", "rep-point": [50, 50]}
            ]
        }"#;
        let map: Map = serde_json::from_str(text).unwrap();
        let land = PolygonLandCheck::new(&map);

        assert!(land.is_land(DVec2::new(50.0, 50.0)));
        assert!(!land.is_land(map.start));
        assert_eq!(map.landmasses[0].name.as_deref(), Some("rock"));
    }
}
