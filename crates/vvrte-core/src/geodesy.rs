// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Geodetic helpers: WGS84 conversions, distances and geofences.
//!
//! Positions are latitude/longitude in degrees plus altitude in meters above
//! the ellipsoid. Distances are straight-line distances between the earth
//! centered, earth fixed (ECEF) points of two positions, which is accurate
//! enough for the short ranges vehicles operate on.
//!
//! Areas of operation arrive as GeoJSON text. [`AreaOfOperation::parse`]
//! accepts a `FeatureCollection`, a single `Feature`, or a bare `Polygon` /
//! `MultiPolygon` geometry. Point features tagged `"type": "depot"` in their
//! properties are collected as depots for the task scheduler.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// WGS84 semi-major axis in meters.
pub const WGS84_A: f64 = 6_378_137.0;
/// WGS84 flattening.
pub const WGS84_F: f64 = 1.0 / 298.257_223_563;

const WGS84_E2: f64 = WGS84_F * (2.0 - WGS84_F);

/// A geodetic position.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PolarCoordinate {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Altitude in meters.
    pub altitude: f64,
}

impl PolarCoordinate {
    /// Create a new position.
    pub fn new(latitude: f64, longitude: f64, altitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude,
        }
    }
}

/// An earth centered, earth fixed position in meters.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CartesianCoordinate {
    /// X axis, through the prime meridian at the equator.
    pub x: f64,
    /// Y axis, through 90 degrees east at the equator.
    pub y: f64,
    /// Z axis, through the north pole.
    pub z: f64,
}

impl CartesianCoordinate {
    /// Euclidean distance to another point.
    pub fn distance(&self, other: &CartesianCoordinate) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// The WGS84 reference ellipsoid.
#[derive(Debug, Default, Clone, Copy)]
pub struct Wgs84;

impl Wgs84 {
    /// Convert a geodetic position into ECEF coordinates.
    pub fn polar_to_rectangular(&self, position: &PolarCoordinate) -> CartesianCoordinate {
        let lat = position.latitude.to_radians();
        let lon = position.longitude.to_radians();
        let n = prime_vertical_radius(lat);
        let h = position.altitude;

        CartesianCoordinate {
            x: (n + h) * lat.cos() * lon.cos(),
            y: (n + h) * lat.cos() * lon.sin(),
            z: (n * (1.0 - WGS84_E2) + h) * lat.sin(),
        }
    }

    /// Convert ECEF coordinates back into a geodetic position.
    pub fn rectangular_to_polar(&self, point: &CartesianCoordinate) -> PolarCoordinate {
        let lon = point.y.atan2(point.x);
        let p = point.x.hypot(point.y);

        let mut lat = point.z.atan2(p * (1.0 - WGS84_E2));
        for _ in 0..25 {
            let n = prime_vertical_radius(lat);
            let h = altitude_at(lat, p, point.z, n);
            let next = point.z.atan2(p * (1.0 - WGS84_E2 * n / (n + h)));
            let converged = (next - lat).abs() < 1e-15;
            lat = next;
            if converged {
                break;
            }
        }

        let n = prime_vertical_radius(lat);
        PolarCoordinate {
            latitude: lat.to_degrees(),
            longitude: lon.to_degrees(),
            altitude: altitude_at(lat, p, point.z, n),
        }
    }

    /// Straight-line distance in meters between two positions.
    pub fn distance(&self, a: &PolarCoordinate, b: &PolarCoordinate) -> f64 {
        self.polar_to_rectangular(a)
            .distance(&self.polar_to_rectangular(b))
    }

    /// Move `north`, `east` and `up` meters away from a position.
    pub fn walk(&self, position: &PolarCoordinate, north: f64, east: f64, up: f64) -> PolarCoordinate {
        let lat = position.latitude.to_radians();
        let sin_lat = lat.sin();
        let w = (1.0 - WGS84_E2 * sin_lat * sin_lat).sqrt();
        let meridian = WGS84_A * (1.0 - WGS84_E2) / (w * w * w);
        let normal = WGS84_A / w;

        let d_lat = north / (meridian + position.altitude);
        let d_lon = east / ((normal + position.altitude) * lat.cos());

        PolarCoordinate {
            latitude: position.latitude + d_lat.to_degrees(),
            longitude: position.longitude + d_lon.to_degrees(),
            altitude: position.altitude + up,
        }
    }
}

fn prime_vertical_radius(lat: f64) -> f64 {
    let sin_lat = lat.sin();
    WGS84_A / (1.0 - WGS84_E2 * sin_lat * sin_lat).sqrt()
}

fn altitude_at(lat: f64, p: f64, z: f64, n: f64) -> f64 {
    // Near the poles cos(lat) vanishes, so derive the height from z instead.
    if lat.cos().abs() > 1e-10 {
        p / lat.cos() - n
    } else {
        z / lat.sin() - n * (1.0 - WGS84_E2)
    }
}

/// Errors from parsing an area of operation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GeoError {
    /// The text is not valid JSON.
    #[error("invalid GeoJSON: {0}")]
    Json(String),

    /// The JSON is not a supported GeoJSON structure.
    #[error("unsupported GeoJSON: {0}")]
    Unsupported(String),
}

/// A polygon as an outer ring plus optional holes, coordinates as `[lng, lat]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    /// The outer boundary.
    pub exterior: Vec<[f64; 2]>,
    /// Holes cut out of the outer boundary.
    pub holes: Vec<Vec<[f64; 2]>>,
}

impl Polygon {
    /// True if the point lies inside the outer ring and outside every hole.
    pub fn contains(&self, lng: f64, lat: f64) -> bool {
        ring_contains(&self.exterior, lng, lat)
            && !self.holes.iter().any(|hole| ring_contains(hole, lng, lat))
    }
}

/// Even-odd ray casting over one ring.
fn ring_contains(ring: &[[f64; 2]], lng: f64, lat: f64) -> bool {
    if ring.len() < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = ring.len() - 1;
    for i in 0..ring.len() {
        let [xi, yi] = ring[i];
        let [xj, yj] = ring[j];
        if (yi > lat) != (yj > lat) && lng < (xj - xi) * (lat - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// The geofence a real vehicle may operate in.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AreaOfOperation {
    /// Polygons making up the area.
    pub polygons: Vec<Polygon>,
    /// Depot positions found in the area's point features.
    pub depots: Vec<PolarCoordinate>,
}

impl AreaOfOperation {
    /// Parse GeoJSON text.
    pub fn parse(text: &str) -> Result<Self, GeoError> {
        let value: Value = serde_json::from_str(text).map_err(|e| GeoError::Json(e.to_string()))?;
        let mut area = AreaOfOperation::default();
        area.collect(&value, None)?;
        Ok(area)
    }

    fn collect(&mut self, value: &Value, properties: Option<&Value>) -> Result<(), GeoError> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| GeoError::Unsupported("object without a type".to_string()))?;

        match kind {
            "FeatureCollection" => {
                let features = value
                    .get("features")
                    .and_then(Value::as_array)
                    .ok_or_else(|| GeoError::Unsupported("collection without features".into()))?;
                for feature in features {
                    self.collect(feature, None)?;
                }
            }
            "Feature" => {
                if let Some(geometry) = value.get("geometry").filter(|g| !g.is_null()) {
                    self.collect(geometry, value.get("properties"))?;
                }
            }
            "GeometryCollection" => {
                let geometries = value
                    .get("geometries")
                    .and_then(Value::as_array)
                    .ok_or_else(|| GeoError::Unsupported("collection without geometries".into()))?;
                for geometry in geometries {
                    self.collect(geometry, properties)?;
                }
            }
            "Polygon" => {
                let rings = coordinates(value)?;
                self.polygons.push(parse_polygon(rings)?);
            }
            "MultiPolygon" => {
                let polygons = coordinates(value)?
                    .as_array()
                    .ok_or_else(|| GeoError::Unsupported("multipolygon coordinates".into()))?;
                for polygon in polygons {
                    self.polygons.push(parse_polygon(polygon)?);
                }
            }
            "Point" => {
                let is_depot = properties
                    .and_then(|p| p.get("type"))
                    .and_then(Value::as_str)
                    .is_some_and(|t| t == "depot");
                if is_depot {
                    let position = parse_position(coordinates(value)?)?;
                    self.depots.push(PolarCoordinate::new(
                        position[1],
                        position[0],
                        position.get(2).copied().unwrap_or(0.0),
                    ));
                }
            }
            // Lines and other shapes do not bound an area.
            "LineString" | "MultiLineString" | "MultiPoint" => {}
            other => {
                return Err(GeoError::Unsupported(format!("geometry type {}", other)));
            }
        }
        Ok(())
    }

    /// True if the position lies within any polygon of the area.
    pub fn contains(&self, position: &PolarCoordinate) -> bool {
        self.polygons
            .iter()
            .any(|polygon| polygon.contains(position.longitude, position.latitude))
    }

    /// `[min_lng, min_lat, max_lng, max_lat]` over all polygons, `None` when empty.
    pub fn bounding_box(&self) -> Option<[f64; 4]> {
        let mut points = self.polygons.iter().flat_map(|p| p.exterior.iter());
        let first = points.next()?;
        let mut bbox = [first[0], first[1], first[0], first[1]];
        for [lng, lat] in points {
            bbox[0] = bbox[0].min(*lng);
            bbox[1] = bbox[1].min(*lat);
            bbox[2] = bbox[2].max(*lng);
            bbox[3] = bbox[3].max(*lat);
        }
        Some(bbox)
    }
}

fn coordinates(value: &Value) -> Result<&Value, GeoError> {
    value
        .get("coordinates")
        .ok_or_else(|| GeoError::Unsupported("geometry without coordinates".to_string()))
}

fn parse_polygon(value: &Value) -> Result<Polygon, GeoError> {
    let rings = value
        .as_array()
        .ok_or_else(|| GeoError::Unsupported("polygon rings must be an array".into()))?;
    let mut rings = rings.iter().map(parse_ring);
    let exterior = rings
        .next()
        .ok_or_else(|| GeoError::Unsupported("polygon without rings".into()))??;
    let holes = rings.collect::<Result<Vec<_>, _>>()?;
    Ok(Polygon { exterior, holes })
}

fn parse_ring(value: &Value) -> Result<Vec<[f64; 2]>, GeoError> {
    value
        .as_array()
        .ok_or_else(|| GeoError::Unsupported("ring must be an array".into()))?
        .iter()
        .map(|p| parse_position(p).map(|c| [c[0], c[1]]))
        .collect()
}

fn parse_position(value: &Value) -> Result<Vec<f64>, GeoError> {
    let coords = value
        .as_array()
        .ok_or_else(|| GeoError::Unsupported("position must be an array".into()))?
        .iter()
        .map(|c| {
            c.as_f64()
                .ok_or_else(|| GeoError::Unsupported("coordinate must be a number".into()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if coords.len() < 2 {
        return Err(GeoError::Unsupported("position needs lng and lat".into()));
    }
    Ok(coords)
}
