//! Request dispatcher of the resource broker
//!
//! One loop owns the registry. Requests are handled strictly one at a time;
//! `now` is sampled once per loop tick so every decision within a tick sees
//! the same clock. Anything that talks back to a vehicle (owner pushes,
//! conditional return-to-launch) runs on the task queue, after the
//! synchronous ack.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use fleetlink_shared::envelope::fcn_of;
use fleetlink_shared::reqrep::{ReplySocket, RequestSocket};
use fleetlink_shared::task_queue::TaskQueue;
use fleetlink_shared::{now_s, timing, LinkError, Reply};

use crate::launcher::{LaunchSpec, ProcessLauncher};
use crate::messages::{BrokerRequest, RejectReason};
use crate::registry::{ClientRecord, ClientType, Registry};

/// Attempts to push an ownership change to a vehicle before giving up
const SET_OWNER_ATTEMPTS: u32 = 3;

pub struct Broker {
    registry: Registry,
    launcher: Arc<dyn ProcessLauncher>,
    queue: TaskQueue,
    /// Own endpoint as `ip:port`, baked into launched application argv
    endpoint: String,
}

impl Broker {
    pub fn new(
        registry: Registry,
        launcher: Arc<dyn ProcessLauncher>,
        endpoint: impl Into<String>,
    ) -> Self {
        let queue = TaskQueue::with_error_handler(Arc::new(|err: &LinkError| {
            if err.is_abort() {
                warn!("background task aborted: {err}");
            } else {
                error!("background task failed: {err}");
            }
        }));
        Self {
            registry,
            launcher,
            queue,
            endpoint: endpoint.into(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Serve requests until the socket goes away
    pub async fn run(mut self, mut socket: ReplySocket) -> anyhow::Result<()> {
        info!(port = socket.port(), "broker ready");
        loop {
            let wait = Duration::from_millis(timing::REQUEST_TIMEOUT_MS);
            match socket.recv_timeout(wait).await {
                Some(incoming) => {
                    let reply = self.handle_request(incoming.message(), now_s());
                    incoming.respond(&reply);
                }
                // Quiet tick; use it to sweep the registry
                None => self.evict_stale(now_s()),
            }
        }
    }

    /// Handle one request against the clock value `now`
    pub fn handle_request(&mut self, msg: &Value, now: f64) -> Reply {
        let fcn = fcn_of(msg).unwrap_or("unknown").to_string();
        let request: BrokerRequest = match serde_json::from_value(msg.clone()) {
            Ok(request) => request,
            Err(e) => return Reply::nack(fcn, format!("unsupported request: {e}")),
        };

        // Any message from a known caller counts as a sign of life
        if let Some(caller) = request.caller() {
            self.registry.touch(caller, now);
        }
        if let Err(reason) = self.check_caller(&request) {
            return Reply::nack(fcn, reason);
        }

        let result = match request {
            BrokerRequest::Register {
                id,
                name,
                desc,
                client_type,
                ip,
                port,
                capabilities,
            } => self.register(id, name, desc, client_type, ip, port, capabilities, now),
            BrokerRequest::GetDrone {
                id,
                force,
                capabilities,
            } => self.get_drone(id, force, capabilities, now),
            BrokerRequest::ReleaseDrone { id, id_released } => {
                self.release_drone(&id, &id_released)
            }
            BrokerRequest::Clients { filter, .. } => self.clients(&filter),
            BrokerRequest::Unregister { id } => self.unregister(&id),
            BrokerRequest::AppLost { id } => self.app_lost(&id),
            BrokerRequest::LaunchApp {
                id,
                app,
                extra_args,
                launch,
            } => self.launch_app(id, app, extra_args, launch, now),
            BrokerRequest::HeartBeat { .. } => Ok(Value::Object(Map::new())),
            BrokerRequest::DelStaleClients { id } => self.del_stale_clients(&id, now),
            BrokerRequest::GetInfo { .. } => Ok(json!({
                "id": "broker",
                "version": env!("CARGO_PKG_VERSION"),
            })),
        };

        // Full snapshot after every handled request, last write wins
        self.registry.save();

        match result {
            Ok(data) => Reply::ack_with(fcn, data),
            Err(reason) => Reply::nack(fcn, reason),
        }
    }

    /// Sweep clients that have been silent past the staleness threshold
    pub fn evict_stale(&mut self, now: f64) {
        let stale = self.registry.stale_ids(now);
        if stale.is_empty() {
            return;
        }
        for id in stale {
            if let Some(record) = self.registry.remove(&id) {
                let orphaned = self.registry.vehicles_owned_by(&id);
                if !orphaned.is_empty() {
                    // Leases are never revoked from here; the vehicles'
                    // own link monitors decide what to do
                    warn!(%id, vehicles = ?orphaned, "evicted client still owned vehicles");
                }
                info!(%id, name = %record.name, "evicted stale client");
            }
        }
        self.registry.save();
    }

    fn check_caller(&self, request: &BrokerRequest) -> Result<(), RejectReason> {
        // Fresh registrations have no id yet; two-phase ids are checked
        // against the pre-registration in the handler
        if matches!(request, BrokerRequest::Register { .. }) {
            return Ok(());
        }
        let caller = request.caller().unwrap_or_default();
        if caller == "root" || self.registry.contains(caller) {
            Ok(())
        } else {
            Err(RejectReason::UnknownClient(caller.to_string()))
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn register(
        &mut self,
        id: Option<String>,
        name: String,
        desc: String,
        client_type: ClientType,
        ip: String,
        port: u16,
        capabilities: Vec<String>,
        now: f64,
    ) -> Result<Value, RejectReason> {
        if let Some(id) = id {
            // Two-phase: a broker-spawned process claims its reserved id.
            // The claim is matched on self-reported name and type only;
            // there is no authentication token on this path.
            let Some(record) = self.registry.get_mut(&id) else {
                return Err(RejectReason::NotPreRegistered);
            };
            if record.is_bound() {
                return Err(RejectReason::AlreadyBound);
            }
            if record.name != name || record.client_type != client_type {
                return Err(RejectReason::PreRegistrationMismatch);
            }
            record.ip = ip;
            record.port = port;
            record.desc = desc;
            record.capabilities = capabilities;
            record.last_seen = now;
            info!(%id, %name, "client completed two-phase registration");
            return Ok(json!({ "id": id }));
        }

        if client_type == ClientType::Vehicle {
            if self.registry.live_vehicle_on_ip(&ip, now).is_some() {
                return Err(RejectReason::IpInUse);
            }
            for stale in self.registry.stale_vehicles_on_ip(&ip, now) {
                self.registry.remove(&stale);
                info!(id = %stale, %ip, "evicted stale vehicle to free its address");
            }
        }

        let id = self.registry.allocate_id(client_type);
        self.registry.insert(
            id.clone(),
            ClientRecord {
                name: name.clone(),
                desc,
                client_type,
                ip,
                port,
                capabilities,
                owner: "broker".into(),
                last_seen: now,
            },
        );
        info!(%id, %name, "registered client");
        Ok(json!({ "id": id }))
    }

    fn get_drone(
        &mut self,
        caller: String,
        force: Option<String>,
        capabilities: Option<Vec<String>>,
        now: f64,
    ) -> Result<Value, RejectReason> {
        let target = if let Some(force) = force {
            let Some(record) = self.registry.get(&force) else {
                return Err(RejectReason::DroneNotAvailable);
            };
            let available = record.client_type == ClientType::Vehicle
                && record.owner == "broker"
                && record.is_bound()
                && record.is_fresh(now);
            if !available {
                return Err(RejectReason::DroneNotAvailable);
            }
            force
        } else if let Some(capabilities) = capabilities {
            self.registry
                .find_available(&capabilities, now)
                .map(String::from)
                .ok_or(RejectReason::NoAvailableDrone)?
        } else {
            return Err(RejectReason::MissingSelector);
        };

        // The lease is recorded before the ack so a concurrent request
        // cannot win the same vehicle; the vehicle itself learns its owner
        // asynchronously
        let Some(record) = self.registry.get_mut(&target) else {
            return Err(RejectReason::DroneNotAvailable);
        };
        record.owner = caller.clone();
        let (ip, port) = (record.ip.clone(), record.port);
        info!(vehicle = %target, owner = %caller, "leased vehicle");
        self.queue_set_owner(target.clone(), ip.clone(), port, caller);

        Ok(json!({ "id": target, "ip": ip, "port": port }))
    }

    fn release_drone(&mut self, caller: &str, id_released: &str) -> Result<Value, RejectReason> {
        let Some(record) = self.registry.get_mut(id_released) else {
            return Err(RejectReason::UnknownClient(id_released.to_string()));
        };
        if record.owner != caller {
            return Err(RejectReason::NotOwner);
        }
        record.owner = "broker".into();
        let (ip, port) = (record.ip.clone(), record.port);
        info!(vehicle = %id_released, "released vehicle");
        self.queue_release(id_released.to_string(), ip, port);
        Ok(Value::Object(Map::new()))
    }

    fn clients(&self, filter: &str) -> Result<Value, RejectReason> {
        let mut clients = Map::new();
        for (id, record) in self.registry.iter() {
            if !id.contains(filter) {
                continue;
            }
            let value = serde_json::to_value(record)
                .map_err(|e| RejectReason::BadRequest(e.to_string()))?;
            clients.insert(id.clone(), value);
        }
        Ok(json!({ "clients": clients }))
    }

    fn unregister(&mut self, caller: &str) -> Result<Value, RejectReason> {
        let Some(record) = self.registry.remove(caller) else {
            return Err(RejectReason::UnknownClient(caller.to_string()));
        };
        info!(id = %caller, name = %record.name, "unregistered client");

        // Vehicles the leaver still held go back to the pool
        for vehicle_id in self.registry.vehicles_owned_by(caller) {
            if let Some(vehicle) = self.registry.get_mut(&vehicle_id) {
                vehicle.owner = "broker".into();
                let (ip, port) = (vehicle.ip.clone(), vehicle.port);
                self.queue_release(vehicle_id, ip, port);
            }
        }
        Ok(Value::Object(Map::new()))
    }

    fn app_lost(&mut self, caller: &str) -> Result<Value, RejectReason> {
        let Some(record) = self.registry.get_mut(caller) else {
            return Err(RejectReason::UnknownClient(caller.to_string()));
        };
        warn!(vehicle = %caller, owner = %record.owner, "vehicle reports its application lost");
        record.owner = "broker".into();
        let (ip, port) = (record.ip.clone(), record.port);
        self.queue_release(caller.to_string(), ip, port);
        Ok(Value::Object(Map::new()))
    }

    fn launch_app(
        &mut self,
        caller: String,
        app: String,
        extra_args: Vec<String>,
        launch: bool,
        now: f64,
    ) -> Result<Value, RejectReason> {
        let app_id = self.registry.allocate_id(ClientType::App);
        self.registry.insert(
            app_id.clone(),
            ClientRecord {
                name: app.clone(),
                desc: "launched application".into(),
                client_type: ClientType::App,
                ip: String::new(),
                port: 0,
                capabilities: Vec::new(),
                owner: caller.clone(),
                last_seen: now,
            },
        );
        if launch {
            let spec = LaunchSpec {
                app,
                id: app_id.clone(),
                broker: self.endpoint.clone(),
                owner: caller,
                extra_args,
            };
            let launcher = self.launcher.clone();
            self.queue.add(async move { launcher.launch(&spec).await });
        }
        Ok(json!({ "id": app_id }))
    }

    fn del_stale_clients(&mut self, caller: &str, now: f64) -> Result<Value, RejectReason> {
        if caller != "root" {
            return Err(RejectReason::NotRoot);
        }
        self.evict_stale(now);
        Ok(Value::Object(Map::new()))
    }

    /// Push the new owner to the vehicle, a few times if needed
    fn queue_set_owner(&self, vehicle_id: String, ip: String, port: u16, owner: String) {
        self.queue.add(async move {
            let socket = RequestSocket::new(ip, port, "broker");
            let msg = json!({"fcn": "set_owner", "id": "broker", "owner": owner});
            let mut last = LinkError::Invalid("set_owner never attempted".into());
            for attempt in 1..=SET_OWNER_ATTEMPTS {
                match socket.request(msg.clone()).await {
                    Ok(_) => {
                        info!(vehicle = %vehicle_id, "owner change acknowledged");
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(vehicle = %vehicle_id, attempt, "set_owner not acknowledged: {e}");
                        last = e;
                    }
                }
            }
            Err(last)
        });
    }

    /// Hand a vehicle back to the pool and bring it home if it is airborne
    fn queue_release(&self, vehicle_id: String, ip: String, port: u16) {
        self.queue.add(async move {
            let socket = RequestSocket::new(ip, port, "broker");
            let msg = json!({"fcn": "set_owner", "id": "broker", "owner": "broker"});
            for attempt in 1..=SET_OWNER_ATTEMPTS {
                match socket.request(msg.clone()).await {
                    Ok(_) => break,
                    Err(e) => {
                        warn!(vehicle = %vehicle_id, attempt, "release not acknowledged: {e}")
                    }
                }
            }
            let armed = socket
                .request(json!({"fcn": "get_armed", "id": "broker"}))
                .await?
                .get("armed")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if armed {
                info!(vehicle = %vehicle_id, "released vehicle is armed, commanding return");
                socket.request(json!({"fcn": "rtl", "id": "broker"})).await?;
            }
            Ok(())
        });
    }
}
