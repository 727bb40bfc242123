//! Flight controller seam
//!
//! Everything the server knows about the autopilot goes through this trait.
//! Command methods can fail; state reads return the latest known value the
//! way a telemetry cache would.

pub mod monitor;
pub mod sim;

use async_trait::async_trait;

use fleetlink_shared::LinkResult;

use crate::mission::Waypoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightMode {
    Guided,
    Land,
    Rtl,
    Loiter,
    Stabilize,
}

impl std::fmt::Display for FlightMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Guided => "GUIDED",
            Self::Land => "LAND",
            Self::Rtl => "RTL",
            Self::Loiter => "LOITER",
            Self::Stabilize => "STABILIZE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
    pub alt_amsl: f64,
    /// Altitude above the arming location
    pub alt_rel: f64,
}

#[async_trait]
pub trait FlightController: Send + Sync {
    async fn is_armable(&self) -> bool;
    async fn is_armed(&self) -> bool;
    async fn mode(&self) -> FlightMode;
    async fn position(&self) -> Position;
    async fn heading(&self) -> f64;
    async fn battery_percent(&self) -> f64;

    /// Clearance switch on the pilot's transmitter is in its high position
    async fn clearance_high(&self) -> bool;
    /// Throttle stick is centered
    async fn midstick(&self) -> bool;

    async fn arm(&self) -> LinkResult<()>;
    async fn set_mode(&self, mode: FlightMode) -> LinkResult<()>;
    async fn take_off(&self, height: f64) -> LinkResult<()>;
    async fn goto_waypoint(&self, waypoint: &Waypoint) -> LinkResult<()>;
    async fn set_speed(&self, speed: f64) -> LinkResult<()>;
    /// Brake and hold the current position
    async fn stop(&self) -> LinkResult<()>;
}
