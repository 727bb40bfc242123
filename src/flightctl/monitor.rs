//! Flying state derivation
//!
//! `on_ground -> flying` once the vehicle is armed and clearly above its
//! start altitude, `flying -> landed` on disarm. The state feeds task
//! preconditions and the arbitration snapshot.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

use super::FlightController;

/// Altitude gain that counts as airborne, in meters
const TAKEOFF_THRESHOLD_M: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlyingState {
    OnGround,
    Flying,
    Landed,
}

impl FlyingState {
    pub fn is_flying(self) -> bool {
        self == Self::Flying
    }
}

/// Spawn the monitor; the task exits when the last receiver is dropped
pub fn spawn_flying_state_monitor(
    fc: Arc<dyn FlightController>,
    interval: Duration,
) -> watch::Receiver<FlyingState> {
    let (tx, rx) = watch::channel(FlyingState::OnGround);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let armed = fc.is_armed().await;
            let alt_rel = fc.position().await.alt_rel;
            let current = *tx.borrow();
            let next = match current {
                FlyingState::OnGround | FlyingState::Landed => {
                    if armed && alt_rel > TAKEOFF_THRESHOLD_M {
                        FlyingState::Flying
                    } else {
                        current
                    }
                }
                FlyingState::Flying => {
                    if !armed {
                        FlyingState::Landed
                    } else {
                        FlyingState::Flying
                    }
                }
            };
            let alive = tx.send_if_modified(|state| {
                let changed = *state != next;
                *state = next;
                changed
            });
            let _ = alive;
            if tx.is_closed() {
                return;
            }
        }
    });
    rx
}
