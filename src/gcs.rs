//! Ground-control-station heartbeat link
//!
//! Subscribes to the GCS heartbeat stream and distills it into a single
//! vitality flag. The flag gates control handover; losing it never takes
//! the vehicle over by itself.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use fleetlink_shared::pubsub::SubSocket;
use fleetlink_shared::timing;

const HEARTBEAT_TOPIC: &str = "heartbeat";
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

pub struct GcsLink {
    vital: watch::Receiver<bool>,
}

impl GcsLink {
    /// Connect in the background and keep reconnecting on link loss
    pub fn connect(ip: String, port: u16) -> Self {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            monitor(ip, port, tx).await;
        });
        Self { vital: rx }
    }

    pub fn vital(&self) -> bool {
        *self.vital.borrow()
    }

    pub fn receiver(&self) -> watch::Receiver<bool> {
        self.vital.clone()
    }
}

async fn monitor(ip: String, port: u16, tx: watch::Sender<bool>) {
    loop {
        if tx.is_closed() {
            return;
        }
        let mut sub = match SubSocket::connect(&ip, port).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!("gcs link unreachable at {ip}:{port}: {e}");
                tokio::time::sleep(RECONNECT_BACKOFF).await;
                continue;
            }
        };
        sub.subscribe(HEARTBEAT_TOPIC);
        info!("listening for gcs heartbeats on {ip}:{port}");

        let mut misses = 0;
        loop {
            match sub.recv_timeout(HEARTBEAT_PERIOD).await {
                Ok(Some(_)) => {
                    misses = 0;
                    let _ = tx.send(true);
                }
                Ok(None) => {
                    misses += 1;
                    if misses >= timing::HEARTBEAT_ATTEMPTS {
                        if *tx.borrow() {
                            warn!("gcs heartbeat lost after {misses} misses");
                        }
                        let _ = tx.send(false);
                    }
                }
                Err(e) => {
                    warn!("gcs link dropped: {e}");
                    let _ = tx.send(false);
                    break;
                }
            }
            if tx.is_closed() {
                return;
            }
        }
        tokio::time::sleep(RECONNECT_BACKOFF).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetlink_shared::pubsub::PubSocket;
    use serde_json::json;

    #[tokio::test]
    async fn test_heartbeats_raise_and_silence_drops_vitality() {
        let publisher = PubSocket::bind("127.0.0.1", 0).await.unwrap();
        let link = GcsLink::connect("127.0.0.1".into(), publisher.port());
        assert!(!link.vital());

        let mut vital = link.receiver();
        // A few beats while the subscriber settles in
        for tick in 0..5u64 {
            publisher
                .publish("heartbeat", &json!({"tick": tick}))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::timeout(Duration::from_secs(2), vital.wait_for(|v| *v))
            .await
            .unwrap()
            .unwrap();

        // Silence for longer than the allowed misses drops the flag
        tokio::time::timeout(Duration::from_secs(6), vital.wait_for(|v| !*v))
            .await
            .unwrap()
            .unwrap();
    }
}
