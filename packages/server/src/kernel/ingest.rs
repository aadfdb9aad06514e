//! Broker ingestion bridge.
//!
//! One long-lived subscription to the sensor topic. Each message is decoded,
//! validated, persisted, and only then broadcast to stream clients. A bad
//! message is logged and dropped; only losing the broker connection restarts
//! the subscribe loop, after a fixed backoff, forever.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;

use super::clients::ClientRegistry;
use super::events::{Metrics, StreamEvent};
use super::images;
use super::storage::{MeasurementStore, NewImage, NewReading};

/// Wire format of a sensor reading as published by the tray fleet.
///
/// The six metric fields are required; everything else is optional. A
/// payload missing a required field fails deserialization and is discarded.
#[derive(Debug, Deserialize)]
pub struct ReadingPayload {
    pub tray_number: i32,
    pub length: f64,
    pub width: f64,
    pub area: f64,
    pub weight: f64,
    pub count: i32,
    #[serde(default)]
    pub image_data_base64: Option<String>,
    #[serde(default)]
    pub avg_length: Option<f64>,
    #[serde(default)]
    pub avg_weight: Option<f64>,
    #[serde(default)]
    pub bounding_boxes: Option<serde_json::Value>,
    #[serde(default)]
    pub masks: Option<serde_json::Value>,
}

/// Bridge between the broker subscription and the stream client registry.
pub struct IngestBridge {
    store: Arc<dyn MeasurementStore>,
    registry: Arc<ClientRegistry>,
    broker_url: String,
    topic: String,
    reconnect_backoff: Duration,
}

impl IngestBridge {
    pub fn new(
        store: Arc<dyn MeasurementStore>,
        registry: Arc<ClientRegistry>,
        broker_url: String,
        topic: String,
        reconnect_backoff: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            broker_url,
            topic,
            reconnect_backoff,
        }
    }

    /// Connect-subscribe-drain loop. Never returns: any connection failure
    /// or subscription end is followed by a fixed backoff and a retry.
    pub async fn run(self) {
        loop {
            match self.run_subscription().await {
                Ok(()) => tracing::warn!("broker subscription ended"),
                Err(error) => tracing::error!(%error, "broker connection failed"),
            }
            tracing::info!(
                backoff_secs = self.reconnect_backoff.as_secs(),
                "reconnecting to broker"
            );
            tokio::time::sleep(self.reconnect_backoff).await;
        }
    }

    async fn run_subscription(&self) -> Result<()> {
        let client = async_nats::connect(self.broker_url.as_str())
            .await
            .with_context(|| format!("connecting to broker at {}", self.broker_url))?;
        tracing::info!(url = %self.broker_url, "connected to broker");

        let mut subscriber = client
            .subscribe(self.topic.clone())
            .await
            .with_context(|| format!("subscribing to {}", self.topic))?;
        tracing::info!(topic = %self.topic, "subscribed to sensor readings");

        while let Some(message) = subscriber.next().await {
            self.handle_message(&message.payload).await;
        }
        Ok(())
    }

    /// Process one broker message end to end. Infallible by design: decode,
    /// validation, and persistence failures are logged and the message is
    /// dropped, so one bad message can never take down the subscription.
    pub async fn handle_message(&self, payload: &[u8]) {
        let reading: ReadingPayload = match serde_json::from_slice(payload) {
            Ok(reading) => reading,
            Err(error) => {
                tracing::warn!(%error, "discarding undecodable sensor message");
                return;
            }
        };

        let tray_number = reading.tray_number;
        if let Err(error) = self.process(reading).await {
            tracing::error!(%error, tray_number, "failed to store sensor reading");
        }
    }

    async fn process(&self, payload: ReadingPayload) -> Result<()> {
        let now = Utc::now();
        let reading = NewReading {
            tray_number: payload.tray_number,
            length: payload.length,
            width: payload.width,
            area: payload.area,
            weight: payload.weight,
            count: payload.count,
            timestamp: now,
        };

        // A corrupt embedded image is dropped while the reading still persists
        let image = match payload.image_data_base64.as_deref() {
            Some(encoded) => match images::decode_image(encoded) {
                Ok(decoded) => Some(NewImage {
                    tray_number: payload.tray_number,
                    size: decoded.bytes.len() as i32,
                    data: decoded.bytes,
                    format: decoded.format,
                    avg_length: payload.avg_length,
                    avg_weight: payload.avg_weight,
                    count: Some(payload.count),
                    bounding_boxes: payload.bounding_boxes.map(|v| v.to_string()),
                    masks: payload.masks.map(|v| v.to_string()),
                    timestamp: now,
                }),
                Err(error) => {
                    tracing::warn!(
                        %error,
                        tray_number = payload.tray_number,
                        "rejecting embedded image, storing reading without it"
                    );
                    None
                }
            },
            None => None,
        };

        let image_saved = image.is_some();
        let persisted = self.store.persist_reading(&reading, image.as_ref()).await?;

        // Broadcast only after the transaction committed
        let event = StreamEvent::NewData {
            tray_number: reading.tray_number,
            timestamp: now,
            image_saved,
            metrics: Metrics {
                length: reading.length,
                width: reading.width,
                area: reading.area,
                weight: reading.weight,
                count: reading.count,
            },
        };
        let delivered = self.registry.broadcast(&event);

        tracing::info!(
            reading_id = persisted.reading_id,
            tray_number = reading.tray_number,
            image_saved,
            delivered,
            "sensor reading persisted and broadcast"
        );
        Ok(())
    }
}
