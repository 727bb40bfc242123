//! Broker request set and reject reasons
//!
//! Requests form a closed union tagged by `fcn`; anything outside it is
//! nacked at parse time. Reject reasons render to the nack description.

use serde::Deserialize;
use thiserror::Error;

use crate::registry::ClientType;

fn default_launch() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "fcn")]
pub enum BrokerRequest {
    #[serde(rename = "register")]
    Register {
        /// Present only for two-phase registration of broker-spawned processes
        #[serde(default)]
        id: Option<String>,
        name: String,
        #[serde(default)]
        desc: String,
        #[serde(rename = "type")]
        client_type: ClientType,
        ip: String,
        port: u16,
        #[serde(default)]
        capabilities: Vec<String>,
    },

    #[serde(rename = "get_drone")]
    GetDrone {
        id: String,
        #[serde(default)]
        force: Option<String>,
        #[serde(default)]
        capabilities: Option<Vec<String>>,
    },

    #[serde(rename = "release_drone")]
    ReleaseDrone { id: String, id_released: String },

    #[serde(rename = "clients")]
    Clients {
        id: String,
        #[serde(default)]
        filter: String,
    },

    #[serde(rename = "unregister")]
    Unregister { id: String },

    #[serde(rename = "app_lost")]
    AppLost { id: String },

    #[serde(rename = "launch_app")]
    LaunchApp {
        id: String,
        app: String,
        #[serde(default)]
        extra_args: Vec<String>,
        #[serde(default = "default_launch")]
        launch: bool,
    },

    #[serde(rename = "heart_beat")]
    HeartBeat {
        id: String,
        #[serde(default)]
        tick: Option<u64>,
    },

    #[serde(rename = "delStaleClients")]
    DelStaleClients { id: String },

    #[serde(rename = "get_info")]
    GetInfo { id: String },
}

impl BrokerRequest {
    /// Caller id, absent only for fresh registrations
    pub fn caller(&self) -> Option<&str> {
        match self {
            Self::Register { id, .. } => id.as_deref(),
            Self::GetDrone { id, .. }
            | Self::ReleaseDrone { id, .. }
            | Self::Clients { id, .. }
            | Self::Unregister { id }
            | Self::AppLost { id }
            | Self::LaunchApp { id, .. }
            | Self::HeartBeat { id, .. }
            | Self::DelStaleClients { id }
            | Self::GetInfo { id } => Some(id),
        }
    }
}

/// Why a request was refused; `Display` is the wire description
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    #[error("unknown client id: {0}")]
    UnknownClient(String),

    #[error("ip already in use by a live vehicle")]
    IpInUse,

    #[error("id is not pre-registered")]
    NotPreRegistered,

    #[error("pre-registration does not match name and type")]
    PreRegistrationMismatch,

    #[error("id is already bound to an endpoint")]
    AlreadyBound,

    #[error("no available drone with requested capabilities")]
    NoAvailableDrone,

    #[error("drone is not available")]
    DroneNotAvailable,

    #[error("requester is not the owner")]
    NotOwner,

    #[error("requires root privileges")]
    NotRoot,

    #[error("either force or capabilities must be given")]
    MissingSelector,

    #[error("{0}")]
    BadRequest(String),
}
