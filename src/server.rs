//! Vehicle request dispatcher
//!
//! Single-threaded over the vehicle's state: requests are handled one at a
//! time off the reply socket, and the arbitration tick runs between them.
//! Flight commands never execute inline, they are queued on the single
//! flight-task worker so a long maneuver cannot block the control link.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use fleetlink_shared::envelope::fcn_of;
use fleetlink_shared::reqrep::ReplySocket;
use fleetlink_shared::task_queue::TaskQueue;
use fleetlink_shared::{now_s, timing, LinkError, Reply};

use crate::arbitration::{Action, Arbiter, Authority, StatusSnapshot};
use crate::broker_client::BrokerClient;
use crate::flightctl::monitor::FlyingState;
use crate::flightctl::{FlightController, FlightMode};
use crate::messages::{RejectReason, VehicleRequest};
use crate::mission::{parse_mission, Frame, Geofence, InitPoint};
use crate::tasks::{self, FlightContext, MissionPlan};
use crate::telemetry::StreamFlags;

/// No owner: the broker holds unleased vehicles
const BROKER_OWNER: &str = "broker";

pub struct VehicleServer {
    id: String,
    fc: Arc<dyn FlightController>,
    ctx: FlightContext,
    queue: TaskQueue,
    arbiter: Arbiter,
    owner: String,
    last_owner_msg: f64,
    app_connected: bool,
    init_point: Arc<Mutex<Option<InitPoint>>>,
    geofence: Geofence,
    streams: Arc<Mutex<StreamFlags>>,
    flying: watch::Receiver<FlyingState>,
    gcs_vital: Option<watch::Receiver<bool>>,
    broker: Option<BrokerClient>,
    info_port: Option<u16>,
    default_speed: f64,
}

impl VehicleServer {
    pub fn new(
        id: String,
        fc: Arc<dyn FlightController>,
        flying: watch::Receiver<FlyingState>,
    ) -> Self {
        let queue = TaskQueue::with_error_handler(Arc::new(|e: &LinkError| {
            if e.is_abort() {
                warn!("flight task aborted");
            } else {
                error!("flight task failed: {e}");
            }
        }));
        Self {
            id,
            fc: fc.clone(),
            ctx: FlightContext::new(fc),
            queue,
            arbiter: Arbiter::new(true),
            owner: BROKER_OWNER.into(),
            last_owner_msg: 0.0,
            app_connected: false,
            init_point: Arc::new(Mutex::new(None)),
            geofence: Geofence::default(),
            streams: Arc::new(Mutex::new(StreamFlags::default())),
            flying,
            gcs_vital: None,
            broker: None,
            info_port: None,
            default_speed: 5.0,
        }
    }

    pub fn with_gcs(mut self, vital: watch::Receiver<bool>) -> Self {
        self.gcs_vital = Some(vital);
        self
    }

    pub fn with_broker(mut self, broker: BrokerClient) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn with_info_port(mut self, port: u16) -> Self {
        self.info_port = Some(port);
        self
    }

    pub fn with_midstick_check(mut self, check: bool) -> Self {
        self.arbiter = Arbiter::new(check);
        self
    }

    pub fn with_default_speed(mut self, speed: f64) -> Self {
        self.default_speed = speed;
        self.ctx.default_speed = speed;
        self
    }

    /// Shared handles for wiring up the telemetry publisher
    pub fn telemetry_handles(
        &self,
    ) -> (
        Arc<Mutex<StreamFlags>>,
        Arc<Mutex<Option<InitPoint>>>,
        Arc<Mutex<MissionPlan>>,
    ) {
        (
            self.streams.clone(),
            self.init_point.clone(),
            self.ctx.plan.clone(),
        )
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub async fn run(mut self, mut socket: ReplySocket) {
        info!("vehicle {} serving on port {}", self.id, socket.port());
        loop {
            let incoming = socket
                .recv_timeout(Duration::from_millis(timing::REQUEST_TIMEOUT_MS))
                .await;
            let now = now_s();
            self.tick(now).await;
            if let Some(incoming) = incoming {
                let reply = self.handle_request(incoming.message(), now).await;
                incoming.respond(&reply);
            }
        }
    }

    /// One arbitration step: sample the autopilot, advance the machine,
    /// apply whatever it asks for
    pub async fn tick(&mut self, now: f64) {
        let observed = self.fc.mode().await;
        if self.arbiter.authority() == Authority::Pilot {
            // While the pilot flies, whatever mode they pick is the baseline
            *self.ctx.expected_mode.lock().await = observed;
        }
        let expected = *self.ctx.expected_mode.lock().await;

        let status = StatusSnapshot {
            armable: self.fc.is_armable().await,
            gcs_vital: self
                .gcs_vital
                .as_ref()
                .map(|rx| *rx.borrow())
                .unwrap_or(true),
            mode_ok: observed == expected,
            mode_baseline: observed == FlightMode::Guided,
            clearance_high: self.fc.clearance_high().await,
            midstick: self.fc.midstick().await,
            app_connected: self.app_connected,
            owner_silence_s: now - self.last_owner_msg,
            queue_idle: self.queue.is_idle(),
            landed_and_disarmed: !self.fc.is_armed().await && !self.flying.borrow().is_flying(),
        };

        let actions = self.arbiter.tick(&status);
        self.apply(actions).await;
    }

    async fn apply(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::RaiseAbort => {
                    warn!("aborting the running flight task");
                    self.ctx.abort.store(true, Ordering::SeqCst);
                }
                Action::ClearAbort => {
                    self.ctx.abort.store(false, Ordering::SeqCst);
                }
                Action::EnqueueReturn => {
                    warn!("queueing safety return");
                    self.queue.add(tasks::safety_return(self.ctx.clone()));
                }
                Action::ReportAppLost => {
                    self.app_connected = false;
                    if let Some(broker) = self.broker.clone() {
                        tokio::spawn(async move {
                            if let Err(e) = broker.app_lost().await {
                                warn!("app_lost report failed: {e}");
                            }
                        });
                    }
                }
                Action::WarnLinkDegraded => {
                    warn!("owner link degraded, no message for {}s", timing::APP_LINK_WARN_S);
                }
            }
        }
    }

    pub async fn handle_request(&mut self, msg: &Value, now: f64) -> Reply {
        let fcn = fcn_of(msg).unwrap_or("unknown").to_string();
        let request: VehicleRequest = match serde_json::from_value(msg.clone()) {
            Ok(request) => request,
            Err(e) => return Reply::nack(fcn, format!("unsupported request: {e}")),
        };

        // Any message from the owner keeps the application link alive
        let caller = request.caller().to_string();
        if caller == self.owner && self.owner != BROKER_OWNER {
            self.last_owner_msg = now;
            if !self.app_connected {
                info!("owner {caller} connected");
                self.app_connected = true;
            }
        }

        match self.dispatch(request, now).await {
            Ok(Some(data)) => Reply::ack_with(fcn, data),
            Ok(None) => Reply::ack(fcn),
            Err(reason) => {
                debug!("nacking {fcn} from {caller}: {reason}");
                Reply::nack(fcn, reason)
            }
        }
    }

    async fn dispatch(
        &mut self,
        request: VehicleRequest,
        now: f64,
    ) -> Result<Option<Value>, RejectReason> {
        match request {
            VehicleRequest::SetOwner { id, owner } => {
                if id != BROKER_OWNER {
                    return Err(RejectReason::NotBroker);
                }
                info!("owner changed: {} -> {owner}", self.owner);
                self.owner = owner;
                // The new owner has not spoken yet
                self.app_connected = false;
                self.last_owner_msg = now;
                Ok(None)
            }

            VehicleRequest::WhoControls { .. } => {
                Ok(Some(json!({"in_controls": self.arbiter.authority()})))
            }

            VehicleRequest::GetOwner { .. } => Ok(Some(json!({"owner": self.owner}))),

            VehicleRequest::SetInitPoint { id, heading_ref } => {
                self.require_owner(&id)?;
                if self.is_flying() {
                    return Err(RejectReason::InitPointWhileFlying);
                }
                if heading_ref != "drone" && heading_ref != "camera" {
                    return Err(RejectReason::BadRequest(format!(
                        "unknown heading_ref {heading_ref:?}"
                    )));
                }
                let pos = self.fc.position().await;
                let heading = self.fc.heading().await;
                let init = InitPoint {
                    lat: pos.lat,
                    lon: pos.lon,
                    alt_amsl: pos.alt_amsl,
                    heading,
                };
                info!(
                    "init point set at ({:.6}, {:.6}), heading {heading:.1}",
                    init.lat, init.lon
                );
                *self.init_point.lock().await = Some(init);
                Ok(None)
            }

            VehicleRequest::SetGeofence {
                id,
                height_low,
                height_high,
                radius,
            } => {
                self.require_owner(&id)?;
                let sane = height_low.is_finite()
                    && height_high.is_finite()
                    && radius.is_finite()
                    && height_low < height_high
                    && radius > 0.0;
                if !sane {
                    return Err(RejectReason::BadRequest("invalid geofence".into()));
                }
                self.geofence = Geofence {
                    height_low,
                    height_high,
                    radius,
                };
                Ok(None)
            }

            VehicleRequest::UploadMissionLla { id, mission } => {
                self.upload(&id, Frame::Lla, &mission).await
            }
            VehicleRequest::UploadMissionNed { id, mission } => {
                self.upload(&id, Frame::Ned, &mission).await
            }
            VehicleRequest::UploadMissionXyz { id, mission } => {
                self.upload(&id, Frame::Xyz, &mission).await
            }

            VehicleRequest::ArmTakeOff { id, height } => {
                self.require_owner(&id)?;
                self.require_controls()?;
                self.require_idle()?;
                if self.is_flying() {
                    return Err(RejectReason::AlreadyFlying);
                }
                if !height.is_finite() || height <= 0.0 {
                    return Err(RejectReason::BadRequest("invalid take off height".into()));
                }
                self.queue.add(tasks::arm_take_off(self.ctx.clone(), height));
                Ok(None)
            }

            VehicleRequest::Gogo { id, next_wp } => {
                self.require_owner(&id)?;
                self.require_controls()?;
                self.require_idle()?;
                if !self.is_flying() {
                    return Err(RejectReason::NotFlying);
                }
                let mut plan = self.ctx.plan.lock().await;
                if plan.waypoints.is_empty() {
                    return Err(RejectReason::NoMission);
                }
                let index = next_wp
                    .strip_prefix("id")
                    .and_then(|n| n.parse::<usize>().ok())
                    .filter(|i| *i < plan.waypoints.len())
                    .ok_or_else(|| RejectReason::UnknownWaypoint(next_wp.clone()))?;
                plan.current = index;
                drop(plan);
                self.queue.add(tasks::gogo(self.ctx.clone()));
                Ok(None)
            }

            VehicleRequest::Land { id } => {
                self.require_owner(&id)?;
                self.require_controls()?;
                self.require_idle()?;
                if !self.is_flying() {
                    return Err(RejectReason::NotFlying);
                }
                self.queue.add(tasks::land(self.ctx.clone()));
                Ok(None)
            }

            VehicleRequest::Rtl { id } => {
                self.require_owner(&id)?;
                self.require_controls()?;
                self.require_idle()?;
                if !self.is_flying() {
                    return Err(RejectReason::NotFlying);
                }
                self.queue.add(tasks::rtl(self.ctx.clone()));
                Ok(None)
            }

            VehicleRequest::DssSrtl { id, hover_time } => {
                self.require_owner(&id)?;
                self.require_controls()?;
                self.require_idle()?;
                if !self.is_flying() {
                    return Err(RejectReason::NotFlying);
                }
                if !hover_time.is_finite() || hover_time < 0.0 {
                    return Err(RejectReason::BadRequest("invalid hover time".into()));
                }
                self.queue.add(tasks::dss_srtl(self.ctx.clone(), hover_time));
                Ok(None)
            }

            VehicleRequest::ResetDssSrtl { id } => {
                self.require_owner(&id)?;
                self.require_controls()?;
                self.require_idle()?;
                if !self.is_flying() {
                    return Err(RejectReason::NotFlying);
                }
                let pos = self.fc.position().await;
                info!(
                    "smart return home moved to ({:.6}, {:.6})",
                    pos.lat, pos.lon
                );
                self.ctx.reset_srtl_home(pos.lat, pos.lon, pos.alt_rel).await;
                Ok(None)
            }

            VehicleRequest::GetCurrentWp { id } => {
                self.require_owner(&id)?;
                let plan = self.ctx.plan.lock().await;
                if plan.waypoints.is_empty() {
                    return Err(RejectReason::NoMission);
                }
                let last = plan.waypoints.len() - 1;
                Ok(Some(json!({
                    "currentWP": format!("id{}", plan.current.min(last)),
                    "finalWP": format!("id{last}"),
                })))
            }

            VehicleRequest::DataStream { id, stream, enable } => {
                self.require_owner(&id)?;
                if !self.streams.lock().await.set(&stream, enable) {
                    return Err(RejectReason::UnknownStream(stream));
                }
                Ok(None)
            }

            VehicleRequest::Disconnect { id } => {
                self.require_owner(&id)?;
                info!("owner {id} disconnected");
                let actions = self.arbiter.app_disconnected();
                self.apply(actions).await;
                self.app_connected = false;
                self.owner = BROKER_OWNER.into();
                if self.is_flying() {
                    // The return flight must outlive the abort that just
                    // killed the owner's task, so it gets a fresh flag
                    let mut ctx = self.ctx.clone();
                    ctx.abort = Arc::new(std::sync::atomic::AtomicBool::new(false));
                    self.queue.add(tasks::disconnect(ctx));
                }
                Ok(None)
            }

            VehicleRequest::HeartBeat { .. } => Ok(None),

            VehicleRequest::GetArmed { .. } => {
                Ok(Some(json!({"armed": self.fc.is_armed().await})))
            }

            VehicleRequest::GetIdle { .. } => Ok(Some(json!({"idle": self.queue.is_idle()}))),

            VehicleRequest::GetInfo { .. } => {
                let mut data = json!({
                    "id": self.id,
                    "version": env!("CARGO_PKG_VERSION"),
                });
                if let Some(port) = self.info_port {
                    data["info_pub_port"] = json!(port);
                }
                Ok(Some(data))
            }
        }
    }

    async fn upload(
        &mut self,
        caller: &str,
        frame: Frame,
        mission: &Value,
    ) -> Result<Option<Value>, RejectReason> {
        self.require_owner(caller)?;
        self.require_idle()?;
        let init = self
            .init_point
            .lock()
            .await
            .ok_or(RejectReason::NoInitPoint)?;
        let waypoints = parse_mission(frame, mission, &init, &self.geofence, self.default_speed)?;
        info!("mission accepted, {} waypoints", waypoints.len());
        *self.ctx.plan.lock().await = MissionPlan {
            waypoints,
            current: 0,
        };
        Ok(None)
    }

    fn require_owner(&self, caller: &str) -> Result<(), RejectReason> {
        if caller == self.owner {
            Ok(())
        } else {
            Err(RejectReason::NotOwner)
        }
    }

    /// Flight commands need the application in controls. The broker gets a
    /// pass while the safety layer flies so it can order a conditional RTL
    /// on a vehicle it just reclaimed.
    fn require_controls(&self) -> Result<(), RejectReason> {
        match self.arbiter.authority() {
            Authority::Application => Ok(()),
            Authority::SafetyLayer if self.owner == BROKER_OWNER => Ok(()),
            _ => Err(RejectReason::NotInControls),
        }
    }

    fn require_idle(&self) -> Result<(), RejectReason> {
        if self.queue.is_idle() {
            Ok(())
        } else {
            Err(RejectReason::TaskRunning)
        }
    }

    fn is_flying(&self) -> bool {
        self.flying.borrow().is_flying()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flightctl::monitor::spawn_flying_state_monitor;
    use crate::flightctl::sim::SimFlightController;
    use serde_json::json;

    const APP: &str = "app001";

    async fn server_with_sim() -> (Arc<SimFlightController>, VehicleServer) {
        let sim = Arc::new(SimFlightController::new());
        let fc: Arc<dyn FlightController> = sim.clone();
        let flying = spawn_flying_state_monitor(fc.clone(), Duration::from_millis(10));
        let server = VehicleServer::new("vehicle001".into(), fc, flying);
        (sim, server)
    }

    async fn request(server: &mut VehicleServer, msg: Value, now: f64) -> Reply {
        server.handle_request(&msg, now).await
    }

    /// Assign the owner and run a full clearance cycle
    async fn hand_over(sim: &SimFlightController, server: &mut VehicleServer, now: f64) {
        let reply = request(
            server,
            json!({"fcn": "set_owner", "id": "broker", "owner": APP}),
            now,
        )
        .await;
        assert!(reply.is_ack());
        request(server, json!({"fcn": "heart_beat", "id": APP}), now).await;

        sim.set_clearance_high(true).await;
        server.tick(now).await;
        sim.set_clearance_high(false).await;
        server.tick(now).await;
        assert_eq!(server.arbiter.authority(), Authority::Application);
    }

    async fn wait_flying(sim: &SimFlightController) {
        for _ in 0..50 {
            if sim.is_armed().await && sim.position().await.alt_rel > 1.0 {
                // Give the monitor a beat to observe it
                tokio::time::sleep(Duration::from_millis(30)).await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("vehicle never took off");
    }

    #[tokio::test]
    async fn test_set_owner_is_reserved_for_the_broker() {
        let (_sim, mut server) = server_with_sim().await;
        let reply = request(
            &mut server,
            json!({"fcn": "set_owner", "id": APP, "owner": APP}),
            1.0,
        )
        .await;
        assert!(!reply.is_ack());

        let reply = request(
            &mut server,
            json!({"fcn": "set_owner", "id": "broker", "owner": APP}),
            1.0,
        )
        .await;
        assert!(reply.is_ack());
        let reply = request(&mut server, json!({"fcn": "get_owner", "id": APP}), 1.0).await;
        assert_eq!(reply.field("owner").unwrap(), APP);
    }

    #[tokio::test]
    async fn test_clearance_cycle_hands_over_and_pilot_takes_back() {
        let (sim, mut server) = server_with_sim().await;
        let t0 = 100.0;
        hand_over(&sim, &mut server, t0).await;

        let reply = request(
            &mut server,
            json!({"fcn": "who_controls", "id": "observer"}),
            t0,
        )
        .await;
        assert_eq!(reply.field("in_controls").unwrap(), "APPLICATION");

        // The pilot flips the mode switch: unconditional takeover
        sim.pilot_set_mode(FlightMode::Loiter).await;
        server.tick(t0 + 1.0).await;
        let reply = request(
            &mut server,
            json!({"fcn": "who_controls", "id": "observer"}),
            t0 + 1.0,
        )
        .await;
        assert_eq!(reply.field("in_controls").unwrap(), "PILOT");

        // Application commands are refused until a new clearance cycle
        let reply = request(
            &mut server,
            json!({"fcn": "arm_take_off", "id": APP}),
            t0 + 1.0,
        )
        .await;
        assert_eq!(
            reply.description().unwrap(),
            "application is not in controls"
        );
    }

    #[tokio::test]
    async fn test_command_verbs_require_ownership() {
        let (sim, mut server) = server_with_sim().await;
        hand_over(&sim, &mut server, 1.0).await;

        let reply = request(
            &mut server,
            json!({"fcn": "arm_take_off", "id": "app999"}),
            1.0,
        )
        .await;
        assert_eq!(reply.description().unwrap(), "requester is not the owner");
    }

    #[tokio::test]
    async fn test_upload_needs_init_point_then_flows_to_current_wp() {
        let (sim, mut server) = server_with_sim().await;
        hand_over(&sim, &mut server, 1.0).await;

        let mission = json!({
            "id0": {"north": 10.0, "east": 0.0, "down": -10.0, "heading": "course"},
            "id1": {"north": 20.0, "east": 0.0, "down": -10.0, "heading": "course"},
        });
        let reply = request(
            &mut server,
            json!({"fcn": "upload_mission_NED", "id": APP, "mission": mission}),
            1.0,
        )
        .await;
        assert_eq!(reply.description().unwrap(), "init point is not set");

        let reply = request(&mut server, json!({"fcn": "set_init_point", "id": APP}), 1.0).await;
        assert!(reply.is_ack());

        let mission = json!({
            "id0": {"north": 10.0, "east": 0.0, "down": -10.0, "heading": "course"},
            "id1": {"north": 20.0, "east": 0.0, "down": -10.0, "heading": "course"},
        });
        let reply = request(
            &mut server,
            json!({"fcn": "upload_mission_NED", "id": APP, "mission": mission}),
            1.0,
        )
        .await;
        assert!(reply.is_ack());

        let reply = request(&mut server, json!({"fcn": "get_currentWP", "id": APP}), 1.0).await;
        assert_eq!(reply.field("currentWP").unwrap(), "id0");
        assert_eq!(reply.field("finalWP").unwrap(), "id1");
    }

    #[tokio::test]
    async fn test_faulty_upload_keeps_the_previous_mission() {
        let (sim, mut server) = server_with_sim().await;
        hand_over(&sim, &mut server, 1.0).await;
        request(&mut server, json!({"fcn": "set_init_point", "id": APP}), 1.0).await;

        let good = json!({
            "id0": {"north": 10.0, "east": 0.0, "down": -10.0, "heading": "course"},
        });
        let reply = request(
            &mut server,
            json!({"fcn": "upload_mission_NED", "id": APP, "mission": good}),
            1.0,
        )
        .await;
        assert!(reply.is_ack());

        // Numbering hole: id1 is missing
        let bad = json!({
            "id0": {"north": 10.0, "east": 0.0, "down": -10.0, "heading": "course"},
            "id2": {"north": 20.0, "east": 0.0, "down": -10.0, "heading": "course"},
        });
        let reply = request(
            &mut server,
            json!({"fcn": "upload_mission_NED", "id": APP, "mission": bad}),
            1.0,
        )
        .await;
        assert!(!reply.is_ack());
        assert!(reply.description().unwrap().contains("missing id1"));

        // The single-waypoint mission survived
        let reply = request(&mut server, json!({"fcn": "get_currentWP", "id": APP}), 1.0).await;
        assert_eq!(reply.field("finalWP").unwrap(), "id0");
    }

    #[tokio::test]
    async fn test_take_off_and_fly_mission() {
        let (sim, mut server) = server_with_sim().await;
        hand_over(&sim, &mut server, 1.0).await;
        request(&mut server, json!({"fcn": "set_init_point", "id": APP}), 1.0).await;

        let mission = json!({
            "id0": {"north": 10.0, "east": 0.0, "down": -10.0, "heading": "course"},
            "id1": {"north": 20.0, "east": 5.0, "down": -12.0, "heading": "course"},
        });
        let reply = request(
            &mut server,
            json!({"fcn": "upload_mission_NED", "id": APP, "mission": mission}),
            1.0,
        )
        .await;
        assert!(reply.is_ack());

        let reply = request(
            &mut server,
            json!({"fcn": "arm_take_off", "id": APP, "height": 10.0}),
            1.0,
        )
        .await;
        assert!(reply.is_ack());

        // A second task while the first runs is refused
        let reply = request(&mut server, json!({"fcn": "land", "id": APP}), 1.0).await;
        assert_eq!(
            reply.description().unwrap(),
            "another task is still running"
        );

        server.queue().join().await;
        wait_flying(&sim).await;

        let reply = request(
            &mut server,
            json!({"fcn": "gogo", "id": APP, "next_wp": "id0"}),
            2.0,
        )
        .await;
        assert!(reply.is_ack());
        server.queue().join().await;

        let reply = request(&mut server, json!({"fcn": "get_idle", "id": APP}), 3.0).await;
        assert_eq!(reply.field("idle").unwrap(), true);
        assert_eq!(sim.position().await.alt_rel, 12.0);

        let reply = request(
            &mut server,
            json!({"fcn": "gogo", "id": APP, "next_wp": "id7"}),
            3.0,
        )
        .await;
        assert!(!reply.is_ack());
    }

    #[tokio::test]
    async fn test_link_loss_warns_then_triggers_safety_return() {
        let (sim, mut server) = server_with_sim().await;
        let t0 = 1000.0;
        hand_over(&sim, &mut server, t0).await;

        let reply = request(
            &mut server,
            json!({"fcn": "arm_take_off", "id": APP, "height": 10.0}),
            t0,
        )
        .await;
        assert!(reply.is_ack());
        server.queue().join().await;
        wait_flying(&sim).await;

        // Degraded but still in controls
        server.tick(t0 + timing::APP_LINK_WARN_S + 0.5).await;
        assert_eq!(server.arbiter.authority(), Authority::Application);

        // Silence past the loss threshold: safety layer flies home
        server.tick(t0 + timing::APP_LINK_LOST_S + 0.5).await;
        assert_eq!(server.arbiter.authority(), Authority::SafetyLayer);
        server.queue().join().await;
        assert!(!sim.is_armed().await);

        // Once the monitor sees the landing the pilot gets the vehicle back
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.tick(t0 + timing::APP_LINK_LOST_S + 1.0).await;
        assert_eq!(server.arbiter.authority(), Authority::Pilot);
    }

    #[tokio::test]
    async fn test_disconnect_retraces_the_trail() {
        let (sim, mut server) = server_with_sim().await;
        hand_over(&sim, &mut server, 1.0).await;
        request(&mut server, json!({"fcn": "set_init_point", "id": APP}), 1.0).await;
        let mission = json!({
            "id0": {"north": 10.0, "east": 0.0, "down": -10.0, "heading": "course"},
        });
        request(
            &mut server,
            json!({"fcn": "upload_mission_NED", "id": APP, "mission": mission}),
            1.0,
        )
        .await;
        request(
            &mut server,
            json!({"fcn": "arm_take_off", "id": APP, "height": 10.0}),
            1.0,
        )
        .await;
        server.queue().join().await;
        wait_flying(&sim).await;
        request(
            &mut server,
            json!({"fcn": "gogo", "id": APP, "next_wp": "id0"}),
            2.0,
        )
        .await;
        server.queue().join().await;

        let reply = request(&mut server, json!({"fcn": "disconnect", "id": APP}), 3.0).await;
        assert!(reply.is_ack());
        assert_eq!(server.arbiter.authority(), Authority::SafetyLayer);

        server.queue().join().await;
        assert!(!sim.is_armed().await);
        // The owner is gone; the vehicle is back in the broker's pool
        let reply = request(&mut server, json!({"fcn": "get_owner", "id": "observer"}), 3.0).await;
        assert_eq!(reply.field("owner").unwrap(), "broker");
    }

    #[tokio::test]
    async fn test_reset_dss_srtl_moves_home() {
        use crate::mission::{Heading, Waypoint};

        let (sim, mut server) = server_with_sim().await;
        hand_over(&sim, &mut server, 1.0).await;

        // Refused on the ground
        let reply = request(&mut server, json!({"fcn": "reset_dss_srtl", "id": APP}), 1.0).await;
        assert_eq!(reply.description().unwrap(), "vehicle is not flying");

        request(
            &mut server,
            json!({"fcn": "arm_take_off", "id": APP, "height": 10.0}),
            1.0,
        )
        .await;
        server.queue().join().await;
        wait_flying(&sim).await;

        // Fly somewhere and declare it the new return home
        let wp = Waypoint {
            lat: 58.41,
            lon: 15.61,
            alt: 10.0,
            heading: Heading::Course,
            speed: 5.0,
            action: None,
        };
        sim.goto_waypoint(&wp).await.unwrap();
        let reply = request(&mut server, json!({"fcn": "reset_dss_srtl", "id": APP}), 2.0).await;
        assert!(reply.is_ack());

        let reply = request(&mut server, json!({"fcn": "dss_srtl", "id": APP}), 2.0).await;
        assert!(reply.is_ack());
        server.queue().join().await;
        assert!(!sim.is_armed().await);
        let pos = sim.position().await;
        assert!((pos.lat - 58.41).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_data_stream_toggles_and_rejects_unknown() {
        let (sim, mut server) = server_with_sim().await;
        hand_over(&sim, &mut server, 1.0).await;

        let reply = request(
            &mut server,
            json!({"fcn": "data_stream", "id": APP, "stream": "LLA", "enable": true}),
            1.0,
        )
        .await;
        assert!(reply.is_ack());
        assert!(server.streams.lock().await.lla);

        let reply = request(
            &mut server,
            json!({"fcn": "data_stream", "id": APP, "stream": "photos", "enable": true}),
            1.0,
        )
        .await;
        assert_eq!(
            reply.description().unwrap(),
            "unknown data stream: photos"
        );
    }

    #[tokio::test]
    async fn test_get_info_and_get_armed() {
        let (_sim, mut server) = server_with_sim().await;
        server = server.with_info_port(5581);

        let reply = request(&mut server, json!({"fcn": "get_info", "id": "anyone"}), 1.0).await;
        assert_eq!(reply.field("id").unwrap(), "vehicle001");
        assert_eq!(reply.field("info_pub_port").unwrap(), 5581);

        let reply = request(&mut server, json!({"fcn": "get_armed", "id": "anyone"}), 1.0).await;
        assert_eq!(reply.field("armed").unwrap(), false);
    }

    #[tokio::test]
    async fn test_handover_blocked_without_gcs_vitality() {
        let sim = Arc::new(SimFlightController::new());
        let fc: Arc<dyn FlightController> = sim.clone();
        let flying = spawn_flying_state_monitor(fc.clone(), Duration::from_millis(10));
        let (gcs_tx, gcs_rx) = watch::channel(false);
        let mut server = VehicleServer::new("vehicle001".into(), fc, flying).with_gcs(gcs_rx);

        request(
            &mut server,
            json!({"fcn": "set_owner", "id": "broker", "owner": APP}),
            1.0,
        )
        .await;
        request(&mut server, json!({"fcn": "heart_beat", "id": APP}), 1.0).await;
        sim.set_clearance_high(true).await;
        server.tick(1.0).await;
        sim.set_clearance_high(false).await;
        server.tick(1.0).await;
        assert_eq!(server.arbiter.authority(), Authority::Pilot);

        // With the link vital a fresh cycle succeeds
        gcs_tx.send(true).unwrap();
        sim.set_clearance_high(true).await;
        server.tick(2.0).await;
        sim.set_clearance_high(false).await;
        server.tick(2.0).await;
        assert_eq!(server.arbiter.authority(), Authority::Application);
    }
}
