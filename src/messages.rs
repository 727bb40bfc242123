//! Vehicle server request set and reject reasons

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::mission::MissionError;

fn default_takeoff_height() -> f64 {
    2.0
}

fn default_heading_ref() -> String {
    "drone".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "fcn")]
pub enum VehicleRequest {
    #[serde(rename = "set_owner")]
    SetOwner { id: String, owner: String },

    #[serde(rename = "who_controls")]
    WhoControls { id: String },

    #[serde(rename = "get_owner")]
    GetOwner { id: String },

    #[serde(rename = "set_init_point")]
    SetInitPoint {
        id: String,
        #[serde(default = "default_heading_ref")]
        heading_ref: String,
    },

    #[serde(rename = "set_geofence")]
    SetGeofence {
        id: String,
        height_low: f64,
        height_high: f64,
        radius: f64,
    },

    #[serde(rename = "upload_mission_LLA")]
    UploadMissionLla { id: String, mission: Value },

    #[serde(rename = "upload_mission_NED")]
    UploadMissionNed { id: String, mission: Value },

    #[serde(rename = "upload_mission_XYZ")]
    UploadMissionXyz { id: String, mission: Value },

    #[serde(rename = "arm_take_off")]
    ArmTakeOff {
        id: String,
        #[serde(default = "default_takeoff_height")]
        height: f64,
    },

    #[serde(rename = "gogo")]
    Gogo { id: String, next_wp: String },

    #[serde(rename = "land")]
    Land { id: String },

    #[serde(rename = "rtl")]
    Rtl { id: String },

    #[serde(rename = "dss_srtl")]
    DssSrtl {
        id: String,
        #[serde(default)]
        hover_time: f64,
    },

    #[serde(rename = "reset_dss_srtl")]
    ResetDssSrtl { id: String },

    #[serde(rename = "get_currentWP")]
    GetCurrentWp { id: String },

    #[serde(rename = "data_stream")]
    DataStream {
        id: String,
        stream: String,
        enable: bool,
    },

    #[serde(rename = "disconnect")]
    Disconnect { id: String },

    #[serde(rename = "heart_beat")]
    HeartBeat {
        id: String,
        #[serde(default)]
        tick: Option<u64>,
    },

    #[serde(rename = "get_armed")]
    GetArmed { id: String },

    #[serde(rename = "get_idle")]
    GetIdle { id: String },

    #[serde(rename = "get_info")]
    GetInfo { id: String },
}

impl VehicleRequest {
    pub fn caller(&self) -> &str {
        match self {
            Self::SetOwner { id, .. }
            | Self::WhoControls { id }
            | Self::GetOwner { id }
            | Self::SetInitPoint { id, .. }
            | Self::SetGeofence { id, .. }
            | Self::UploadMissionLla { id, .. }
            | Self::UploadMissionNed { id, .. }
            | Self::UploadMissionXyz { id, .. }
            | Self::ArmTakeOff { id, .. }
            | Self::Gogo { id, .. }
            | Self::Land { id }
            | Self::Rtl { id }
            | Self::DssSrtl { id, .. }
            | Self::ResetDssSrtl { id }
            | Self::GetCurrentWp { id }
            | Self::DataStream { id, .. }
            | Self::Disconnect { id }
            | Self::HeartBeat { id, .. }
            | Self::GetArmed { id }
            | Self::GetIdle { id }
            | Self::GetInfo { id } => id,
        }
    }
}

/// Why a request was refused; `Display` is the wire description
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RejectReason {
    #[error("requester is not the owner")]
    NotOwner,

    #[error("set_owner is reserved for the broker")]
    NotBroker,

    #[error("application is not in controls")]
    NotInControls,

    #[error("another task is still running")]
    TaskRunning,

    #[error("init point is not set")]
    NoInitPoint,

    #[error("init point cannot change while flying")]
    InitPointWhileFlying,

    #[error("vehicle is not flying")]
    NotFlying,

    #[error("vehicle is already flying")]
    AlreadyFlying,

    #[error(transparent)]
    Mission(#[from] MissionError),

    #[error("no mission uploaded")]
    NoMission,

    #[error("unknown waypoint: {0}")]
    UnknownWaypoint(String),

    #[error("unknown data stream: {0}")]
    UnknownStream(String),

    #[error("{0}")]
    BadRequest(String),
}
