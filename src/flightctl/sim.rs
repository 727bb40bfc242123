//! Simulated flight controller
//!
//! Maneuvers complete instantly: a goto relocates the vehicle, LAND and RTL
//! put it on the ground disarmed. That keeps task code honest about ordering
//! and abort handling without modelling flight dynamics.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use fleetlink_shared::{LinkError, LinkResult};

use crate::mission::{Heading, Waypoint};

use super::{FlightController, FlightMode, Position};

#[derive(Debug, Clone)]
struct SimState {
    armable: bool,
    armed: bool,
    mode: FlightMode,
    lat: f64,
    lon: f64,
    home_lat: f64,
    home_lon: f64,
    alt_amsl_ground: f64,
    alt_rel: f64,
    heading: f64,
    speed: f64,
    battery: f64,
    clearance_high: bool,
    midstick: bool,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            armable: true,
            armed: false,
            mode: FlightMode::Guided,
            lat: 58.4,
            lon: 15.6,
            home_lat: 58.4,
            home_lon: 15.6,
            alt_amsl_ground: 40.0,
            alt_rel: 0.0,
            heading: 0.0,
            speed: 0.0,
            battery: 100.0,
            clearance_high: false,
            midstick: true,
        }
    }
}

#[derive(Clone, Default)]
pub struct SimFlightController {
    state: Arc<Mutex<SimState>>,
}

impl SimFlightController {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_armable(&self, armable: bool) {
        self.state.lock().await.armable = armable;
    }

    pub async fn set_clearance_high(&self, high: bool) {
        self.state.lock().await.clearance_high = high;
    }

    pub async fn set_midstick(&self, midstick: bool) {
        self.state.lock().await.midstick = midstick;
    }

    /// The safety pilot flips the mode switch on the transmitter
    pub async fn pilot_set_mode(&self, mode: FlightMode) {
        self.state.lock().await.mode = mode;
    }

    pub async fn set_battery(&self, percent: f64) {
        self.state.lock().await.battery = percent;
    }
}

#[async_trait]
impl FlightController for SimFlightController {
    async fn is_armable(&self) -> bool {
        self.state.lock().await.armable
    }

    async fn is_armed(&self) -> bool {
        self.state.lock().await.armed
    }

    async fn mode(&self) -> FlightMode {
        self.state.lock().await.mode
    }

    async fn position(&self) -> Position {
        let state = self.state.lock().await;
        Position {
            lat: state.lat,
            lon: state.lon,
            alt_amsl: state.alt_amsl_ground + state.alt_rel,
            alt_rel: state.alt_rel,
        }
    }

    async fn heading(&self) -> f64 {
        self.state.lock().await.heading
    }

    async fn battery_percent(&self) -> f64 {
        self.state.lock().await.battery
    }

    async fn clearance_high(&self) -> bool {
        self.state.lock().await.clearance_high
    }

    async fn midstick(&self) -> bool {
        self.state.lock().await.midstick
    }

    async fn arm(&self) -> LinkResult<()> {
        let mut state = self.state.lock().await;
        if !state.armable {
            return Err(LinkError::Invalid("vehicle is not armable".into()));
        }
        state.armed = true;
        state.home_lat = state.lat;
        state.home_lon = state.lon;
        Ok(())
    }

    async fn set_mode(&self, mode: FlightMode) -> LinkResult<()> {
        let mut state = self.state.lock().await;
        state.mode = mode;
        match mode {
            FlightMode::Land => {
                state.alt_rel = 0.0;
                state.armed = false;
            }
            FlightMode::Rtl => {
                state.lat = state.home_lat;
                state.lon = state.home_lon;
                state.alt_rel = 0.0;
                state.armed = false;
            }
            _ => {}
        }
        Ok(())
    }

    async fn take_off(&self, height: f64) -> LinkResult<()> {
        let mut state = self.state.lock().await;
        if !state.armed {
            return Err(LinkError::Invalid("cannot take off while disarmed".into()));
        }
        if state.mode != FlightMode::Guided {
            return Err(LinkError::Invalid("take off requires GUIDED mode".into()));
        }
        state.alt_rel = height;
        Ok(())
    }

    async fn goto_waypoint(&self, waypoint: &Waypoint) -> LinkResult<()> {
        let mut state = self.state.lock().await;
        if !state.armed {
            return Err(LinkError::Invalid("cannot fly while disarmed".into()));
        }
        state.lat = waypoint.lat;
        state.lon = waypoint.lon;
        state.alt_rel = waypoint.alt;
        if let Heading::Degrees(d) = waypoint.heading {
            state.heading = d;
        }
        Ok(())
    }

    async fn set_speed(&self, speed: f64) -> LinkResult<()> {
        self.state.lock().await.speed = speed;
        Ok(())
    }

    async fn stop(&self) -> LinkResult<()> {
        self.state.lock().await.speed = 0.0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_arm_respects_armable() {
        let sim = SimFlightController::new();
        sim.set_armable(false).await;
        assert!(sim.arm().await.is_err());
        sim.set_armable(true).await;
        assert!(sim.arm().await.is_ok());
        assert!(sim.is_armed().await);
    }

    #[tokio::test]
    async fn test_rtl_returns_home_and_disarms() {
        let sim = SimFlightController::new();
        sim.arm().await.unwrap();
        sim.take_off(10.0).await.unwrap();
        let wp = Waypoint {
            lat: 58.5,
            lon: 15.7,
            alt: 10.0,
            heading: Heading::Course,
            speed: 5.0,
            action: None,
        };
        sim.goto_waypoint(&wp).await.unwrap();

        sim.set_mode(FlightMode::Rtl).await.unwrap();
        assert!(!sim.is_armed().await);
        let pos = sim.position().await;
        assert_eq!(pos.lat, 58.4);
        assert_eq!(pos.alt_rel, 0.0);
    }
}
