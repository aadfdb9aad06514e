//! Events pushed to stream clients.
//!
//! Every frame on the wire is one of these variants serialized as JSON with
//! a `type` discriminator. Events are immutable once built and are cloned
//! into each client queue, so no client ever sees another client's copy.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// The per-reading metrics echoed back to stream consumers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Metrics {
    pub length: f64,
    pub width: f64,
    pub area: f64,
    pub weight: f64,
    pub count: i32,
}

/// One unit of broadcast data.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Handshake sent once at stream start, carrying the assigned id.
    Connected { message: String, client_id: String },
    /// Keep-alive frame; `timestamp` is unix seconds.
    Heartbeat { timestamp: f64 },
    /// A sensor reading was persisted.
    NewData {
        tray_number: i32,
        timestamp: DateTime<Utc>,
        image_saved: bool,
        metrics: Metrics,
    },
    /// An image was uploaded and persisted.
    NewImage {
        tray_number: i32,
        timestamp: DateTime<Utc>,
        image_id: i32,
        count: Option<i32>,
        avg_length: Option<f64>,
        avg_weight: Option<f64>,
    },
}

impl StreamEvent {
    pub fn heartbeat_now() -> Self {
        let now = Utc::now();
        Self::Heartbeat {
            timestamp: now.timestamp() as f64 + f64::from(now.timestamp_subsec_millis()) / 1000.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_data_wire_format() {
        let event = StreamEvent::NewData {
            tray_number: 3,
            timestamp: Utc::now(),
            image_saved: true,
            metrics: Metrics {
                length: 12.5,
                width: 4.1,
                area: 51.2,
                weight: 0.18,
                count: 230,
            },
        };

        let value: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "new_data");
        assert_eq!(value["tray_number"], 3);
        assert_eq!(value["image_saved"], true);
        assert_eq!(value["metrics"]["count"], 230);
        assert_eq!(value["metrics"]["length"], 12.5);
    }

    #[test]
    fn connected_wire_format() {
        let event = StreamEvent::Connected {
            message: "Stream started".to_string(),
            client_id: "client_abc123_17".to_string(),
        };

        let value: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "connected");
        assert_eq!(value["client_id"], "client_abc123_17");
    }

    #[test]
    fn heartbeat_carries_unix_timestamp() {
        let value: serde_json::Value = serde_json::to_value(StreamEvent::heartbeat_now()).unwrap();
        assert_eq!(value["type"], "heartbeat");
        assert!(value["timestamp"].as_f64().unwrap() > 1_600_000_000.0);
    }

    #[test]
    fn new_image_omits_nothing() {
        let event = StreamEvent::NewImage {
            tray_number: 1,
            timestamp: Utc::now(),
            image_id: 42,
            count: None,
            avg_length: Some(11.0),
            avg_weight: None,
        };

        let value: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "new_image");
        assert_eq!(value["image_id"], 42);
        // Optional fields serialize as null, matching the original wire shape
        assert!(value["count"].is_null());
        assert_eq!(value["avg_length"], 11.0);
    }
}
