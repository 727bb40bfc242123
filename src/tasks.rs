//! Flight task bodies
//!
//! Tasks run on the single-worker queue, strictly one at a time. Every wait
//! loop polls the shared abort flag and unwinds with `AbortTask`; the abort
//! is cooperative, a running autopilot command is never yanked mid-call.
//! The safety return deliberately ignores the abort flag: it is what runs
//! right after an abort was raised.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::info;

use fleetlink_shared::{LinkError, LinkResult};

use crate::flightctl::{FlightController, FlightMode};
use crate::mission::{Heading, Waypoint, WP_ACCEPTANCE_M};

/// Poll interval inside wait loops
const POLL: Duration = Duration::from_millis(100);

/// Motor spin-up delay between arming and take off
const SPINUP: Duration = Duration::from_millis(200);

/// How long to wait for the autopilot to become armable
const ARMABLE_WAIT: Duration = Duration::from_secs(30);

/// Floor for the seeded home waypoint altitude
const SRTL_HOME_ALT_MIN: f64 = 2.0;

/// Uploaded mission and the index of the waypoint being flown
#[derive(Debug, Default)]
pub struct MissionPlan {
    pub waypoints: Vec<Waypoint>,
    pub current: usize,
}

/// State shared between the dispatcher and the task bodies
#[derive(Clone)]
pub struct FlightContext {
    pub fc: Arc<dyn FlightController>,
    pub abort: Arc<AtomicBool>,
    /// Mode our own tasks last commanded; divergence means pilot takeover
    pub expected_mode: Arc<Mutex<FlightMode>>,
    pub plan: Arc<Mutex<MissionPlan>>,
    /// Visited waypoints, most recent first, with home at the back
    pub srtl: Arc<Mutex<Vec<Waypoint>>>,
    pub default_speed: f64,
}

impl FlightContext {
    pub fn new(fc: Arc<dyn FlightController>) -> Self {
        Self {
            fc,
            abort: Arc::new(AtomicBool::new(false)),
            expected_mode: Arc::new(Mutex::new(FlightMode::Guided)),
            plan: Arc::new(Mutex::new(MissionPlan::default())),
            srtl: Arc::new(Mutex::new(Vec::new())),
            default_speed: 5.0,
        }
    }

    /// Replace the smart-return trail with a single home waypoint
    pub async fn reset_srtl_home(&self, lat: f64, lon: f64, alt: f64) {
        let home = Waypoint {
            lat,
            lon,
            alt: alt.max(SRTL_HOME_ALT_MIN),
            heading: Heading::Course,
            speed: self.default_speed,
            action: None,
        };
        *self.srtl.lock().await = vec![home];
    }

    fn check_abort(&self) -> LinkResult<()> {
        if self.abort.load(Ordering::SeqCst) {
            Err(LinkError::AbortTask)
        } else {
            Ok(())
        }
    }

    async fn command_mode(&self, mode: FlightMode) -> LinkResult<()> {
        // Record intent first so the arbitration tick never sees our own
        // mode change as a pilot takeover
        *self.expected_mode.lock().await = mode;
        self.fc.set_mode(mode).await
    }

    async fn abortable_sleep(&self, total: Duration) -> LinkResult<()> {
        let mut remaining = total;
        while !remaining.is_zero() {
            self.check_abort()?;
            let step = remaining.min(POLL);
            tokio::time::sleep(step).await;
            remaining = remaining.saturating_sub(step);
        }
        self.check_abort()
    }

    async fn fly_to(&self, waypoint: &Waypoint) -> LinkResult<()> {
        self.fc.set_speed(waypoint.speed).await?;
        self.fc.goto_waypoint(waypoint).await?;
        loop {
            self.check_abort()?;
            let pos = self.fc.position().await;
            let arrived = waypoint.distance_2d(pos.lat, pos.lon) <= WP_ACCEPTANCE_M
                && (waypoint.alt - pos.alt_rel).abs() <= WP_ACCEPTANCE_M;
            if arrived {
                return Ok(());
            }
            tokio::time::sleep(POLL).await;
        }
    }
}

/// Wait until armable, arm in GUIDED, take off and climb to `height`
pub async fn arm_take_off(ctx: FlightContext, height: f64) -> LinkResult<()> {
    // An abort raised while this task sat in the queue must never arm
    ctx.check_abort()?;
    let deadline = tokio::time::Instant::now() + ARMABLE_WAIT;
    while !ctx.fc.is_armable().await {
        ctx.check_abort()?;
        if tokio::time::Instant::now() >= deadline {
            return Err(LinkError::Invalid("vehicle never became armable".into()));
        }
        tokio::time::sleep(POLL).await;
    }

    ctx.command_mode(FlightMode::Guided).await?;
    ctx.fc.arm().await?;
    info!("armed, taking off to {height} m");
    ctx.abortable_sleep(SPINUP).await?;
    ctx.fc.take_off(height).await?;

    loop {
        ctx.check_abort()?;
        if ctx.fc.position().await.alt_rel >= height * 0.95 {
            break;
        }
        tokio::time::sleep(POLL).await;
    }

    // Home goes on the trail first; a retrace ends where the flight began
    let pos = ctx.fc.position().await;
    ctx.reset_srtl_home(pos.lat, pos.lon, pos.alt_rel).await;
    Ok(())
}

/// Land at the current position and wait for disarm
pub async fn land(ctx: FlightContext) -> LinkResult<()> {
    ctx.command_mode(FlightMode::Land).await?;
    loop {
        if !ctx.fc.is_armed().await {
            info!("landed and disarmed");
            return Ok(());
        }
        if ctx.check_abort().is_err() {
            // Aborted mid-descent: hand a controllable vehicle back
            ctx.command_mode(FlightMode::Guided).await?;
            return Err(LinkError::AbortTask);
        }
        tokio::time::sleep(POLL).await;
    }
}

/// Autopilot return-to-launch, waiting for disarm
pub async fn rtl(ctx: FlightContext) -> LinkResult<()> {
    ctx.command_mode(FlightMode::Rtl).await?;
    loop {
        if !ctx.fc.is_armed().await {
            info!("returned to launch");
            return Ok(());
        }
        if ctx.check_abort().is_err() {
            ctx.command_mode(FlightMode::Guided).await?;
            return Err(LinkError::AbortTask);
        }
        tokio::time::sleep(POLL).await;
    }
}

/// Walk the uploaded mission from the current index; every reached waypoint
/// is prepended to the smart-return trail
pub async fn gogo(ctx: FlightContext) -> LinkResult<()> {
    loop {
        ctx.check_abort()?;
        let next = {
            let plan = ctx.plan.lock().await;
            plan.waypoints.get(plan.current).cloned()
        };
        let Some(waypoint) = next else {
            info!("mission complete");
            return Ok(());
        };
        ctx.fly_to(&waypoint).await?;
        ctx.srtl.lock().await.insert(0, waypoint);
        ctx.plan.lock().await.current += 1;
    }
}

/// Retrace the smart-return trail, hover, then land
pub async fn dss_srtl(ctx: FlightContext, hover_time: f64) -> LinkResult<()> {
    loop {
        ctx.check_abort()?;
        let next = ctx.srtl.lock().await.first().cloned();
        let Some(waypoint) = next else { break };
        ctx.fly_to(&waypoint).await?;
        ctx.srtl.lock().await.remove(0);
    }
    if hover_time > 0.0 {
        ctx.abortable_sleep(Duration::from_secs_f64(hover_time)).await?;
    }
    land(ctx).await
}

/// The owner walked away cleanly: stop, then come home along the trail if
/// one exists, otherwise straight back
pub async fn disconnect(ctx: FlightContext) -> LinkResult<()> {
    ctx.fc.stop().await?;
    let has_trail = !ctx.srtl.lock().await.is_empty();
    if has_trail {
        dss_srtl(ctx, 0.0).await
    } else {
        rtl(ctx).await
    }
}

/// Safety-layer return after an application loss. Runs with the abort flag
/// raised, so it must not poll it.
pub async fn safety_return(ctx: FlightContext) -> LinkResult<()> {
    ctx.command_mode(FlightMode::Rtl).await?;
    loop {
        if !ctx.fc.is_armed().await {
            info!("safety return complete");
            return Ok(());
        }
        tokio::time::sleep(POLL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flightctl::sim::SimFlightController;

    fn context() -> (Arc<SimFlightController>, FlightContext) {
        let sim = Arc::new(SimFlightController::new());
        let ctx = FlightContext::new(sim.clone());
        (sim, ctx)
    }

    fn waypoint(lat: f64, lon: f64, alt: f64) -> Waypoint {
        Waypoint {
            lat,
            lon,
            alt,
            heading: Heading::Course,
            speed: 5.0,
            action: None,
        }
    }

    #[tokio::test]
    async fn test_arm_take_off_reaches_height() {
        let (sim, ctx) = context();
        arm_take_off(ctx, 10.0).await.unwrap();
        assert!(sim.is_armed().await);
        assert_eq!(sim.position().await.alt_rel, 10.0);
    }

    #[tokio::test]
    async fn test_abort_unwinds_before_arming() {
        let (sim, ctx) = context();
        ctx.abort.store(true, Ordering::SeqCst);
        let err = arm_take_off(ctx, 10.0).await.unwrap_err();
        assert!(err.is_abort());
        assert!(!sim.is_armed().await);
    }

    #[tokio::test]
    async fn test_take_off_seeds_the_return_trail_with_home() {
        let (sim, ctx) = context();
        arm_take_off(ctx.clone(), 10.0).await.unwrap();

        let launch = sim.position().await;
        let trail = ctx.srtl.lock().await;
        assert_eq!(trail.len(), 1);
        assert!((trail[0].lat - launch.lat).abs() < 1e-9);
        assert!((trail[0].lon - launch.lon).abs() < 1e-9);
        assert_eq!(trail[0].alt, 10.0);
    }

    #[tokio::test]
    async fn test_gogo_walks_mission_and_builds_trail() {
        let (sim, ctx) = context();
        arm_take_off(ctx.clone(), 10.0).await.unwrap();

        let wps = vec![
            waypoint(58.4001, 15.6, 10.0),
            waypoint(58.4002, 15.6, 12.0),
            waypoint(58.4003, 15.6, 14.0),
        ];
        *ctx.plan.lock().await = MissionPlan {
            waypoints: wps.clone(),
            current: 0,
        };

        gogo(ctx.clone()).await.unwrap();

        assert_eq!(sim.position().await.alt_rel, 14.0);
        assert_eq!(ctx.plan.lock().await.current, 3);
        // Trail is most-recent-first, home at the back
        let trail = ctx.srtl.lock().await;
        assert_eq!(trail.len(), 4);
        assert_eq!(trail[0], wps[2]);
        assert_eq!(trail[2], wps[0]);
        assert!((trail[3].lat - 58.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_dss_srtl_retraces_then_lands() {
        let (sim, ctx) = context();
        arm_take_off(ctx.clone(), 10.0).await.unwrap();
        *ctx.plan.lock().await = MissionPlan {
            waypoints: vec![waypoint(58.4001, 15.6, 10.0), waypoint(58.4002, 15.6, 10.0)],
            current: 0,
        };
        gogo(ctx.clone()).await.unwrap();

        dss_srtl(ctx.clone(), 0.0).await.unwrap();
        assert!(!sim.is_armed().await);
        assert!(ctx.srtl.lock().await.is_empty());
        // The retrace ends at the launch point, not at the first waypoint
        let pos = sim.position().await;
        assert!((pos.lat - 58.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_safety_return_ignores_abort() {
        let (sim, ctx) = context();
        arm_take_off(ctx.clone(), 10.0).await.unwrap();
        ctx.abort.store(true, Ordering::SeqCst);

        safety_return(ctx).await.unwrap();
        assert!(!sim.is_armed().await);
        let pos = sim.position().await;
        assert_eq!(pos.alt_rel, 0.0);
    }
}
