//! Vehicle-side client for the resource broker
//!
//! Registers the vehicle, keeps the registration alive with the request
//! socket's embedded heartbeat, and reports application loss. Everything is
//! best-effort: a vehicle without a broker still flies.

use serde_json::json;
use tracing::info;

use fleetlink_shared::reqrep::RequestSocket;
use fleetlink_shared::{LinkError, LinkResult};

/// What the vehicle advertises about itself at registration
#[derive(Debug, Clone)]
pub struct Registration {
    /// Pre-allocated id from a two-phase launch, if any
    pub id: Option<String>,
    pub name: String,
    pub desc: String,
    /// Address and port of our own reply socket, as reachable by clients
    pub ip: String,
    pub port: u16,
    pub capabilities: Vec<String>,
}

#[derive(Clone)]
pub struct BrokerClient {
    socket: RequestSocket,
    id: String,
}

impl BrokerClient {
    /// Register with the broker and start heartbeating under the granted id
    pub async fn register(
        broker_ip: &str,
        broker_port: u16,
        reg: &Registration,
    ) -> LinkResult<Self> {
        let socket = RequestSocket::new(broker_ip, broker_port, "broker-link");
        let mut msg = json!({
            "fcn": "register",
            "name": reg.name,
            "desc": reg.desc,
            "type": "vehicle",
            "ip": reg.ip,
            "port": reg.port,
            "capabilities": reg.capabilities,
        });
        if let Some(id) = &reg.id {
            msg["id"] = json!(id);
        }
        let data = socket.request(msg).await?;
        let id = data
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| LinkError::Invalid("register ack carried no id".into()))?
            .to_string();
        info!("registered with broker {broker_ip}:{broker_port} as {id}");
        socket.start_heartbeat(&id).await;
        Ok(Self { socket, id })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Tell the broker the owning application went silent on us
    pub async fn app_lost(&self) -> LinkResult<()> {
        self.socket
            .request(json!({"fcn": "app_lost", "id": self.id}))
            .await
            .map(|_| ())
    }

    /// Drop the registration on clean shutdown
    pub async fn unregister(&self) -> LinkResult<()> {
        self.socket
            .request(json!({"fcn": "unregister", "id": self.id}))
            .await?;
        self.socket.close().await;
        Ok(())
    }
}
