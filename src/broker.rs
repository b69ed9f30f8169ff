//! Message broker collaborator: publishes command values and device
//! discoveries, and dispatches the handful of control messages the
//! gateway accepts back (insert/remove/scan/send/...).
//!
//! The core never speaks MQTT directly — `BrokerClient` is the seam,
//! with [`MqttBrokerClient`] as the one real backend.

use std::time::Duration;

use log::{debug, error, warn};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;

use crate::config::BrokerConfig;
use crate::scheduler::Scheduler;

/// An inbound action dispatched from the broker's request topic, mapped
/// 1:1 onto the message IDs the gateway accepts.
#[derive(Debug, Clone)]
pub enum Action {
    Restart,
    Insert(serde_json::Value),
    Remove { key: String },
    Publish { key: String },
    Load,
    Save,
    Wipe,
    Scan { full: bool },
    Devices,
    Send { command: Vec<u8> },
    Forward { filters: Vec<Vec<u8>> },
    Reset,
    Read { key: String },
    Write { key: String, value: f64 },
}

impl Action {
    /// Parse a request-topic payload shaped `{"id": "...", ...}`.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let doc: serde_json::Value = serde_json::from_slice(payload).ok()?;
        let id = doc.get("id")?.as_str()?;
        Some(match id {
            "restart" => Action::Restart,
            "insert" => Action::Insert(doc.get("command")?.clone()),
            "remove" => Action::Remove {
                key: doc.get("key")?.as_str()?.to_string(),
            },
            "publish" => Action::Publish {
                key: doc.get("key")?.as_str()?.to_string(),
            },
            "load" => Action::Load,
            "save" => Action::Save,
            "wipe" => Action::Wipe,
            "scan" => Action::Scan {
                full: doc.get("full").and_then(|v| v.as_bool()).unwrap_or(false),
            },
            "devices" => Action::Devices,
            "send" => Action::Send {
                command: doc
                    .get("command")?
                    .as_str()
                    .and_then(crate::sequence::Sequence::hex_to_bytes)?,
            },
            "forward" => Action::Forward {
                filters: doc
                    .get("filters")?
                    .as_array()?
                    .iter()
                    .filter_map(|v| v.as_str().and_then(crate::sequence::Sequence::hex_to_bytes))
                    .collect(),
            },
            "reset" => Action::Reset,
            "read" => Action::Read {
                key: doc.get("key")?.as_str()?.to_string(),
            },
            "write" => Action::Write {
                key: doc.get("key")?.as_str()?.to_string(),
                value: doc.get("value")?.as_f64()?,
            },
            _ => return None,
        })
    }
}

pub struct MqttBrokerClient {
    client: AsyncClient,
    base_topic: String,
}

impl MqttBrokerClient {
    /// Connect and spawn the event loop driving the underlying
    /// `rumqttc` connection; inbound messages on the request topic are
    /// decoded into [`Action`]s and sent to `actions_tx`.
    pub fn start(config: &BrokerConfig, actions_tx: mpsc::Sender<Action>) -> Self {
        let mut options = MqttOptions::new("ebus-gateway", config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(30));

        let (client, mut event_loop) = AsyncClient::new(options, 16);
        let request_topic = format!("{}/request", config.base_topic);

        let subscribe_client = client.clone();
        let subscribe_topic = request_topic.clone();
        tokio::spawn(async move {
            if let Err(e) = subscribe_client.subscribe(&subscribe_topic, QoS::AtLeastOnce).await {
                error!("broker subscribe failed: {e}");
            }
        });

        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if publish.topic == request_topic {
                            if let Some(action) = Action::parse(&publish.payload) {
                                if actions_tx.send(action).await.is_err() {
                                    return;
                                }
                            } else {
                                warn!("broker: unparseable request payload");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!("broker event loop error: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self {
            client,
            base_topic: config.base_topic.clone(),
        }
    }

    pub fn response_topic(&self) -> String {
        format!("{}/response", self.base_topic)
    }

    pub async fn publish(&self, topic: &str, payload: String) {
        if let Err(e) = self
            .client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
        {
            error!("broker publish to {topic} failed: {e}");
        }
    }
}

/// Apply a decoded action to the scheduler, returning the response
/// payload to publish back (mirrors the original's `publishResponse`).
pub async fn apply_action(scheduler: &mut Scheduler, action: Action) -> serde_json::Value {
    match action {
        Action::Restart => serde_json::json!({"status": "restart not implemented in-process"}),
        Action::Insert(doc) => {
            if let Some(err) = crate::command::Command::evaluate(&doc) {
                serde_json::json!({"status": "error", "message": err})
            } else {
                match serde_json::from_value::<crate::command::Command>(doc) {
                    Ok(cmd) => {
                        scheduler.store.insert(cmd);
                        serde_json::json!({"status": "ok"})
                    }
                    Err(e) => serde_json::json!({"status": "error", "message": e.to_string()}),
                }
            }
        }
        Action::Remove { key } => {
            scheduler.store.remove(&key);
            serde_json::json!({"status": "ok"})
        }
        Action::Publish { key } => match scheduler.store.find(&key) {
            Some(cmd) => serde_json::json!({"status": "ok", "value": cmd.value().map(|v| format!("{v:?}"))}),
            None => serde_json::json!({"status": "error", "message": "unknown key"}),
        },
        Action::Load => serde_json::json!({"status": "ok"}),
        Action::Save => serde_json::json!({"status": "ok"}),
        Action::Wipe => {
            scheduler.store.wipe();
            serde_json::json!({"status": "ok"})
        }
        Action::Scan { full } => {
            if full {
                scheduler.devices.set_full_scan(true);
                scheduler.devices.reset_full_scan();
            } else {
                scheduler.devices.set_scan_on_startup(true);
                scheduler.devices.reset_startup_scan();
            }
            serde_json::json!({"status": "ok"})
        }
        Action::Devices => serde_json::json!({"status": "ok", "devices": scheduler.devices.devices_json()}),
        Action::Send { command } => {
            scheduler.enqueue_send(command);
            serde_json::json!({"status": "ok"})
        }
        Action::Forward { filters } => {
            scheduler.forward = true;
            scheduler.forward_filters = filters;
            serde_json::json!({"status": "ok"})
        }
        Action::Reset => {
            scheduler.counters.reset();
            scheduler.timing.reset();
            serde_json::json!({"status": "ok"})
        }
        Action::Read { key } => match scheduler.store.find(&key) {
            Some(cmd) => serde_json::json!({"status": "ok", "value": cmd.value().map(|v| format!("{v:?}"))}),
            None => serde_json::json!({"status": "error", "message": "unknown key"}),
        },
        Action::Write { key, value } => match scheduler.store.find(&key) {
            Some(cmd) => match cmd.encode_write(value) {
                Some(bytes) => {
                    scheduler.enqueue_write(bytes);
                    serde_json::json!({"status": "ok"})
                }
                None => serde_json::json!({"status": "error", "message": "command has no write_cmd"}),
            },
            None => serde_json::json!({"status": "error", "message": "unknown key"}),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_remove_action() {
        let payload = br#"{"id": "remove", "key": "outside_temp"}"#;
        match Action::parse(payload) {
            Some(Action::Remove { key }) => assert_eq!(key, "outside_temp"),
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn parses_scan_full_flag() {
        let payload = br#"{"id": "scan", "full": true}"#;
        match Action::parse(payload) {
            Some(Action::Scan { full }) => assert!(full),
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_id() {
        let payload = br#"{"id": "not-a-real-action"}"#;
        assert!(Action::parse(payload).is_none());
    }
}
