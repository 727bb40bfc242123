//! Telemetry publisher
//!
//! Streams are opt-in per `data_stream` request and published on the
//! vehicle's pub socket at a fixed cadence. Slow subscribers are the
//! socket's problem, not ours.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use fleetlink_shared::pubsub::PubSocket;

use crate::flightctl::FlightController;
use crate::mission::{geodetic_to_ned, InitPoint};
use crate::tasks::MissionPlan;

const PUBLISH_PERIOD: Duration = Duration::from_secs(1);

/// Which streams are currently enabled
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamFlags {
    pub lla: bool,
    pub ned: bool,
    pub current_wp: bool,
    pub battery: bool,
}

impl StreamFlags {
    /// Toggle a stream by its wire name; false means the name is unknown
    pub fn set(&mut self, stream: &str, enable: bool) -> bool {
        match stream {
            "LLA" => self.lla = enable,
            "NED" => self.ned = enable,
            "currentWP" => self.current_wp = enable,
            "battery" => self.battery = enable,
            _ => return false,
        }
        true
    }
}

pub fn spawn_telemetry(
    fc: Arc<dyn FlightController>,
    publisher: PubSocket,
    flags: Arc<Mutex<StreamFlags>>,
    init_point: Arc<Mutex<Option<InitPoint>>>,
    plan: Arc<Mutex<MissionPlan>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(PUBLISH_PERIOD).await;
            let flags = *flags.lock().await;

            if flags.lla {
                let pos = fc.position().await;
                let heading = fc.heading().await;
                let msg = json!({
                    "lat": pos.lat,
                    "lon": pos.lon,
                    "alt": pos.alt_rel,
                    "heading": heading,
                });
                if publisher.publish("LLA", &msg).await.is_err() {
                    debug!("LLA publish failed");
                }
            }

            if flags.ned {
                // NED needs a reference; without an init point the stream
                // stays quiet
                if let Some(init) = *init_point.lock().await {
                    let pos = fc.position().await;
                    let (north, east, down) =
                        geodetic_to_ned(&init, pos.lat, pos.lon, pos.alt_rel);
                    let msg = json!({"north": north, "east": east, "down": down});
                    let _ = publisher.publish("NED", &msg).await;
                }
            }

            if flags.current_wp {
                let plan = plan.lock().await;
                if !plan.waypoints.is_empty() {
                    let last = plan.waypoints.len() - 1;
                    let msg = json!({
                        "currentWP": format!("id{}", plan.current.min(last)),
                        "finalWP": format!("id{last}"),
                    });
                    let _ = publisher.publish("currentWP", &msg).await;
                }
            }

            if flags.battery {
                let percent = fc.battery_percent().await;
                let _ = publisher.publish("battery", &json!({"percent": percent})).await;
            }
        }
    })
}
