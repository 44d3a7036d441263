// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::geodesy::{AreaOfOperation, GeoError};

/// Kind of physical vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RealVehicleType {
    Quadrocopter,
    FixedWingAircraft,
    Boat,
    Robot,
    Truck,
    /// Stationary node that collects finished vehicles and serves as the migration fallback.
    GroundStation,
}

impl RealVehicleType {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quadrocopter => "QUADROCOPTER",
            Self::FixedWingAircraft => "FIXED_WING_AIRCRAFT",
            Self::Boat => "BOAT",
            Self::Robot => "ROBOT",
            Self::Truck => "TRUCK",
            Self::GroundStation => "GROUND_STATION",
        }
    }
}

impl fmt::Display for RealVehicleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RealVehicleType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUADROCOPTER" => Ok(Self::Quadrocopter),
            "FIXED_WING_AIRCRAFT" => Ok(Self::FixedWingAircraft),
            "BOAT" => Ok(Self::Boat),
            "ROBOT" => Ok(Self::Robot),
            "TRUCK" => Ok(Self::Truck),
            "GROUND_STATION" => Ok(Self::GroundStation),
            other => Err(CoreError::Validation {
                field: "real_vehicle.vehicle_type".to_string(),
                message: format!("unknown real vehicle type '{}'", other),
            }),
        }
    }
}

/// Which virtual vehicles may read a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SensorVisibility {
    NoVv,
    PrivilegedVv,
    AllVv,
}

/// A sensor a real vehicle carries or a task requires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDefinition {
    /// Fleet-wide sensor id. Sensor sets are compared by id.
    pub id: i64,
    pub description: String,
    /// Sensor family, e.g. `CAMERA` or `GPS`.
    pub sensor_type: String,
    /// Middleware message type the sensor publishes.
    pub message_type: String,
    pub visibility: SensorVisibility,
}

impl SensorDefinition {
    /// A sensor visible to all virtual vehicles.
    pub fn new(id: i64, description: impl Into<String>, sensor_type: impl Into<String>) -> Self {
        Self {
            id,
            description: description.into(),
            sensor_type: sensor_type.into(),
            message_type: String::new(),
            visibility: SensorVisibility::AllVv,
        }
    }
}

/// A physical vehicle (or ground station) participating in the fleet.
#[derive(Debug, Clone, PartialEq)]
pub struct RealVehicle {
    /// Database id. Zero until persisted.
    pub id: i64,
    /// Unique name.
    pub name: String,
    /// Base URL of the node's connector endpoints.
    pub url: String,
    pub vehicle_type: RealVehicleType,
    /// Geofence as GeoJSON text.
    pub area_of_operation: Option<String>,
    /// Sensors carried by the vehicle.
    pub sensors: Vec<SensorDefinition>,
    /// Last time the vehicle reported in.
    pub last_update: Option<DateTime<Utc>>,
    /// Soft-deleted vehicles are ignored by mapping and migration.
    pub deleted: bool,
}

impl RealVehicle {
    /// A new, active vehicle without sensors or area.
    pub fn new(name: impl Into<String>, url: impl Into<String>, vehicle_type: RealVehicleType) -> Self {
        Self {
            id: 0,
            name: name.into(),
            url: url.into(),
            vehicle_type,
            area_of_operation: None,
            sensors: Vec::new(),
            last_update: None,
            deleted: false,
        }
    }

    /// True for ground stations.
    pub fn is_ground_station(&self) -> bool {
        self.vehicle_type == RealVehicleType::GroundStation
    }

    /// Parse the geofence. A vehicle without one has an empty area.
    pub fn area(&self) -> Result<AreaOfOperation, GeoError> {
        match self.area_of_operation.as_deref() {
            Some(text) if !text.trim().is_empty() => AreaOfOperation::parse(text),
            _ => Ok(AreaOfOperation::default()),
        }
    }

    /// True if this vehicle carries every sensor in `required` (compared by id).
    pub fn has_sensors(&self, required: &[SensorDefinition]) -> bool {
        let available: HashSet<i64> = self.sensors.iter().map(|s| s.id).collect();
        required.iter().all(|s| available.contains(&s.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_sensors_is_a_superset_check() {
        let camera = SensorDefinition::new(1, "camera", "CAMERA");
        let gps = SensorDefinition::new(2, "gps", "GPS");
        let sonar = SensorDefinition::new(3, "sonar", "SONAR");

        let mut rv = RealVehicle::new("rv1", "http://rv1", RealVehicleType::Quadrocopter);
        rv.sensors = vec![camera.clone(), gps.clone()];

        assert!(rv.has_sensors(&[]));
        assert!(rv.has_sensors(&[gps.clone()]));
        assert!(rv.has_sensors(&[gps.clone(), camera]));
        assert!(!rv.has_sensors(&[gps, sonar]));
    }

    #[test]
    fn test_area_defaults_to_empty() {
        let rv = RealVehicle::new("gs", "http://gs", RealVehicleType::GroundStation);
        assert!(rv.is_ground_station());
        assert!(rv.area().unwrap().polygons.is_empty());
    }

    #[test]
    fn test_type_strings() {
        assert_eq!(
            "FIXED_WING_AIRCRAFT".parse::<RealVehicleType>().unwrap(),
            RealVehicleType::FixedWingAircraft
        );
        assert!("BLIMP".parse::<RealVehicleType>().is_err());
    }
}
