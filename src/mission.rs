//! Mission model: waypoints, geofence, frame normalization and validation
//!
//! Uploads arrive in one of three frames (LLA, NED, XYZ) and are normalized
//! to geodetic latitude/longitude with altitude relative to the init point.
//! Validation is all-or-nothing: any failing waypoint discards the whole
//! upload and the previously accepted mission stays active.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Meters per degree of latitude (1852 m per nautical mile * 60)
const METERS_PER_DEG: f64 = 111_120.0;

/// Minimum waypoint speed in m/s
pub const MIN_SPEED: f64 = 0.1;

/// Acceptance radius when flying to a waypoint, in meters
pub const WP_ACCEPTANCE_M: f64 = 2.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MissionError {
    #[error("mission is empty")]
    Empty,

    #[error("waypoint numbering error: missing id{0}")]
    MissingId(usize),

    #[error("waypoint numbering error: ids must be id0..id{}", .count - 1)]
    ExtraIds { count: usize },

    #[error("unknown position format for id{0}")]
    BadPosition(usize),

    #[error("faulty heading for id{0}: must be in [0, 360) or \"course\"")]
    FaultyHeading(usize),

    #[error("faulty speed for id{0}: must be at least {MIN_SPEED} m/s")]
    FaultySpeed(usize),

    #[error("waypoint id{0} violates the geofence")]
    GeofenceViolation(usize),
}

/// Where the vehicle points while traversing a leg
///
/// On the wire this is either a number in `[0, 360)` or the literal string
/// `"course"`, meaning follow the direction of travel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Heading {
    Degrees(f64),
    Course,
}

impl Serialize for Heading {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Degrees(d) => serializer.serialize_f64(*d),
            Self::Course => serializer.serialize_str("course"),
        }
    }
}

impl<'de> Deserialize<'de> for Heading {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;
        match Value::deserialize(deserializer)? {
            Value::Number(n) => n
                .as_f64()
                .map(Self::Degrees)
                .ok_or_else(|| D::Error::custom("heading out of numeric range")),
            Value::String(s) if s == "course" => Ok(Self::Course),
            _ => Err(D::Error::custom("heading must be a number or \"course\"")),
        }
    }
}

/// A normalized waypoint: geodetic position, altitude relative to the init
/// point, global heading, and the speed to fly the leg at
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Waypoint {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub heading: Heading,
    pub speed: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl Waypoint {
    /// 2D ground distance to another point in meters (equirectangular)
    pub fn distance_2d(&self, lat: f64, lon: f64) -> f64 {
        let dlat = (self.lat - lat) * METERS_PER_DEG;
        let dlon = (self.lon - lon) * METERS_PER_DEG * lat.to_radians().cos();
        (dlat * dlat + dlon * dlon).sqrt()
    }
}

/// Cylindrical fence around the init point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    pub height_low: f64,
    pub height_high: f64,
    pub radius: f64,
}

impl Default for Geofence {
    fn default() -> Self {
        Self {
            height_low: 2.0,
            height_high: 50.0,
            radius: 50.0,
        }
    }
}

impl Geofence {
    /// Check an altitude band and ground distance against the fence
    pub fn contains(&self, alt: f64, distance_m: f64) -> bool {
        alt >= self.height_low && alt <= self.height_high && distance_m <= self.radius
    }
}

/// Reference captured at `set_init_point`: position, AMSL altitude and the
/// heading the local XYZ frame is rotated by
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InitPoint {
    pub lat: f64,
    pub lon: f64,
    pub alt_amsl: f64,
    pub heading: f64,
}

/// Input frame of an uploaded mission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    Lla,
    Ned,
    Xyz,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum AltType {
    Relative,
    Amsl,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PositionSpec {
    Lla {
        lat: f64,
        lon: f64,
        alt: f64,
        alt_type: AltType,
    },
    Ned {
        north: f64,
        east: f64,
        down: f64,
    },
    Xyz {
        x: f64,
        y: f64,
        z: f64,
    },
}

#[derive(Debug, Deserialize)]
struct WaypointSpec {
    #[serde(flatten)]
    position: PositionSpec,
    heading: Heading,
    #[serde(default)]
    speed: Option<f64>,
    #[serde(default)]
    action: Option<String>,
}

/// Parse, normalize and validate an uploaded mission
///
/// `mission` maps contiguous keys `id0..idN` to waypoint objects in the
/// frame named by the verb. The returned plan is fully normalized; on any
/// error nothing of the upload survives.
pub fn parse_mission(
    frame: Frame,
    mission: &Value,
    init: &InitPoint,
    fence: &Geofence,
    default_speed: f64,
) -> Result<Vec<Waypoint>, MissionError> {
    let Some(map) = mission.as_object() else {
        return Err(MissionError::Empty);
    };
    if map.is_empty() {
        return Err(MissionError::Empty);
    }

    let count = map.len();
    let mut waypoints = Vec::with_capacity(count);
    for index in 0..count {
        let key = format!("id{index}");
        let Some(item) = map.get(&key) else {
            // Either a hole in the numbering or a key outside id0..idN
            return if map.keys().all(|k| {
                k.strip_prefix("id")
                    .and_then(|n| n.parse::<usize>().ok())
                    .is_some()
            }) {
                Err(MissionError::MissingId(index))
            } else {
                Err(MissionError::ExtraIds { count })
            };
        };
        let spec: WaypointSpec = serde_json::from_value(item.clone())
            .map_err(|_| MissionError::BadPosition(index))?;
        let waypoint = normalize(frame, spec, index, init, default_speed)?;

        let distance = waypoint.distance_2d(init.lat, init.lon);
        if !fence.contains(waypoint.alt, distance) {
            return Err(MissionError::GeofenceViolation(index));
        }
        waypoints.push(waypoint);
    }
    Ok(waypoints)
}

fn normalize(
    frame: Frame,
    spec: WaypointSpec,
    index: usize,
    init: &InitPoint,
    default_speed: f64,
) -> Result<Waypoint, MissionError> {
    let (lat, lon, alt, heading) = match (frame, spec.position) {
        (Frame::Lla, PositionSpec::Lla { lat, lon, alt, alt_type }) => {
            let alt = match alt_type {
                AltType::Relative => alt,
                AltType::Amsl => alt - init.alt_amsl,
            };
            (lat, lon, alt, spec.heading)
        }
        (Frame::Ned, PositionSpec::Ned { north, east, down }) => {
            let (lat, lon) = offset_to_geodetic(init, north, east);
            (lat, lon, -down, spec.heading)
        }
        (Frame::Xyz, PositionSpec::Xyz { x, y, z }) => {
            // Rotate the local frame by the init heading
            let beta = (-init.heading).to_radians();
            let north = x * beta.cos() + y * beta.sin();
            let east = -x * beta.sin() + y * beta.cos();
            let (lat, lon) = offset_to_geodetic(init, north, east);
            let heading = match spec.heading {
                Heading::Degrees(d) => Heading::Degrees((d + init.heading).rem_euclid(360.0)),
                Heading::Course => Heading::Course,
            };
            (lat, lon, z, heading)
        }
        // The frame is named by the verb; fields from another frame are a
        // format error
        _ => return Err(MissionError::BadPosition(index)),
    };

    if let Heading::Degrees(d) = heading {
        if !(0.0..360.0).contains(&d) || !d.is_finite() {
            return Err(MissionError::FaultyHeading(index));
        }
    }

    let speed = spec.speed.unwrap_or(default_speed);
    if !speed.is_finite() || speed < MIN_SPEED {
        return Err(MissionError::FaultySpeed(index));
    }

    Ok(Waypoint {
        lat,
        lon,
        alt,
        heading,
        speed,
        action: spec.action,
    })
}

fn offset_to_geodetic(init: &InitPoint, north: f64, east: f64) -> (f64, f64) {
    let lat = init.lat + north / METERS_PER_DEG;
    let lon = init.lon + east / (METERS_PER_DEG * init.lat.to_radians().cos());
    (lat, lon)
}

/// NED offsets of a geodetic point from the init point; `down` is the
/// negated altitude above the init point
pub fn geodetic_to_ned(init: &InitPoint, lat: f64, lon: f64, alt: f64) -> (f64, f64, f64) {
    let north = (lat - init.lat) * METERS_PER_DEG;
    let east = (lon - init.lon) * METERS_PER_DEG * init.lat.to_radians().cos();
    (north, east, -alt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn init() -> InitPoint {
        InitPoint {
            lat: 58.4,
            lon: 15.6,
            alt_amsl: 40.0,
            heading: 90.0,
        }
    }

    fn fence() -> Geofence {
        Geofence::default()
    }

    #[test]
    fn test_lla_relative_and_amsl_altitudes() {
        let mission = json!({
            "id0": {"lat": 58.4001, "lon": 15.6001, "alt": 20.0, "alt_type": "relative", "heading": "course"},
            "id1": {"lat": 58.4001, "lon": 15.6001, "alt": 60.0, "alt_type": "amsl", "heading": "course"},
        });
        let plan = parse_mission(Frame::Lla, &mission, &init(), &fence(), 5.0).unwrap();
        assert_eq!(plan[0].alt, 20.0);
        // 60 m AMSL above a 40 m AMSL init point is 20 m relative
        assert_eq!(plan[1].alt, 20.0);
    }

    #[test]
    fn test_ned_round_trip_preserves_offsets() {
        let mission = json!({
            "id0": {"north": 30.0, "east": -20.0, "down": -15.0, "heading": 45.0},
        });
        let plan = parse_mission(Frame::Ned, &mission, &init(), &fence(), 5.0).unwrap();
        let wp = &plan[0];
        assert_eq!(wp.alt, 15.0);
        assert_eq!(wp.heading, Heading::Degrees(45.0));

        // Recover the original offsets from the geodetic form
        let north = (wp.lat - init().lat) * 111_120.0;
        let east = (wp.lon - init().lon) * 111_120.0 * init().lat.to_radians().cos();
        assert!((north - 30.0).abs() < 1e-6);
        assert!((east + 20.0).abs() < 1e-6);
    }

    #[test]
    fn test_xyz_rotates_by_init_heading() {
        // Init heading 90: local x points east
        let mission = json!({
            "id0": {"x": 10.0, "y": 0.0, "z": 10.0, "heading": 0.0},
        });
        let plan = parse_mission(Frame::Xyz, &mission, &init(), &fence(), 5.0).unwrap();
        let wp = &plan[0];
        let north = (wp.lat - init().lat) * 111_120.0;
        let east = (wp.lon - init().lon) * 111_120.0 * init().lat.to_radians().cos();
        assert!(north.abs() < 1e-6, "north was {north}");
        assert!((east - 10.0).abs() < 1e-6, "east was {east}");
        // Numeric headings rotate into the global frame
        assert_eq!(wp.heading, Heading::Degrees(90.0));
    }

    #[test]
    fn test_missing_id_rejects_whole_mission() {
        let mission = json!({
            "id0": {"north": 5.0, "east": 0.0, "down": -10.0, "heading": "course"},
            "id1": {"north": 10.0, "east": 0.0, "down": -10.0, "heading": "course"},
            "id3": {"north": 15.0, "east": 0.0, "down": -10.0, "heading": "course"},
        });
        let err = parse_mission(Frame::Ned, &mission, &init(), &fence(), 5.0).unwrap_err();
        assert_eq!(err, MissionError::MissingId(2));
        assert!(err.to_string().contains("numbering"));
    }

    #[test]
    fn test_non_id_keys_are_rejected() {
        let mission = json!({
            "id0": {"north": 5.0, "east": 0.0, "down": -10.0, "heading": "course"},
            "wp1": {"north": 10.0, "east": 0.0, "down": -10.0, "heading": "course"},
        });
        let err = parse_mission(Frame::Ned, &mission, &init(), &fence(), 5.0).unwrap_err();
        assert!(matches!(err, MissionError::ExtraIds { count: 2 }));
    }

    #[test]
    fn test_heading_range_and_course() {
        let bad = json!({
            "id0": {"north": 5.0, "east": 0.0, "down": -10.0, "heading": 360.0},
        });
        assert_eq!(
            parse_mission(Frame::Ned, &bad, &init(), &fence(), 5.0).unwrap_err(),
            MissionError::FaultyHeading(0)
        );

        let good = json!({
            "id0": {"north": 5.0, "east": 0.0, "down": -10.0, "heading": "course"},
        });
        let plan = parse_mission(Frame::Ned, &good, &init(), &fence(), 5.0).unwrap();
        assert_eq!(plan[0].heading, Heading::Course);
    }

    #[test]
    fn test_speed_floor_and_default() {
        let slow = json!({
            "id0": {"north": 5.0, "east": 0.0, "down": -10.0, "heading": "course", "speed": 0.05},
        });
        assert_eq!(
            parse_mission(Frame::Ned, &slow, &init(), &fence(), 5.0).unwrap_err(),
            MissionError::FaultySpeed(0)
        );

        let unspecified = json!({
            "id0": {"north": 5.0, "east": 0.0, "down": -10.0, "heading": "course"},
        });
        let plan = parse_mission(Frame::Ned, &unspecified, &init(), &fence(), 5.0).unwrap();
        assert_eq!(plan[0].speed, 5.0);
    }

    #[test]
    fn test_geofence_radius_and_height_band() {
        let too_far = json!({
            "id0": {"north": 60.0, "east": 0.0, "down": -10.0, "heading": "course"},
        });
        assert_eq!(
            parse_mission(Frame::Ned, &too_far, &init(), &fence(), 5.0).unwrap_err(),
            MissionError::GeofenceViolation(0)
        );

        let too_low = json!({
            "id0": {"north": 5.0, "east": 0.0, "down": -1.0, "heading": "course"},
        });
        assert_eq!(
            parse_mission(Frame::Ned, &too_low, &init(), &fence(), 5.0).unwrap_err(),
            MissionError::GeofenceViolation(0)
        );

        let too_high = json!({
            "id0": {"north": 5.0, "east": 0.0, "down": -55.0, "heading": "course"},
        });
        assert_eq!(
            parse_mission(Frame::Ned, &too_high, &init(), &fence(), 5.0).unwrap_err(),
            MissionError::GeofenceViolation(0)
        );
    }

    #[test]
    fn test_frame_mismatch_is_a_position_error() {
        let mission = json!({
            "id0": {"lat": 58.4, "lon": 15.6, "alt": 10.0, "alt_type": "relative", "heading": "course"},
        });
        assert_eq!(
            parse_mission(Frame::Ned, &mission, &init(), &fence(), 5.0).unwrap_err(),
            MissionError::BadPosition(0)
        );
    }

    #[test]
    fn test_action_is_stored() {
        let mission = json!({
            "id0": {"north": 5.0, "east": 0.0, "down": -10.0, "heading": "course", "action": "take_photo"},
        });
        let plan = parse_mission(Frame::Ned, &mission, &init(), &fence(), 5.0).unwrap();
        assert_eq!(plan[0].action.as_deref(), Some("take_photo"));
    }
}
