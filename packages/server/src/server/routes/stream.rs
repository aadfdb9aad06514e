//! SSE streaming endpoint.
//!
//! GET /stream?client_id=...
//!
//! Registers the connection in the client registry, emits a `connected`
//! frame, then alternates between draining the client queue (1 second
//! bounded waits) and heartbeats after 25 seconds of silence. Every frame is
//! `data: <JSON>\n\n` with the discriminator inside the JSON, so consumers
//! switch on the payload's `type` field rather than SSE event names.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::stream;
use axum::{
    extract::{Extension, Query},
    http::{header, HeaderName},
    response::sse::{Event, Sse},
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::kernel::clients::ClientRegistry;
use crate::kernel::events::StreamEvent;
use crate::server::app::AxumAppState;

const QUEUE_WAIT: Duration = Duration::from_secs(1);

#[derive(Deserialize)]
pub struct StreamQuery {
    /// Consumer-supplied id; a random one is generated when absent.
    client_id: Option<String>,
}

/// Unregisters the client when the stream is dropped, whatever the exit
/// path: clean disconnect, broken pipe, or an error inside the generator.
struct SessionGuard {
    registry: Arc<ClientRegistry>,
    client_id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.client_id);
    }
}

pub async fn stream_handler(
    Extension(state): Extension<AxumAppState>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    let client_id = query.client_id.unwrap_or_else(generate_client_id);
    let mut rx = state.registry.add(&client_id);
    let guard = SessionGuard {
        registry: state.registry.clone(),
        client_id: client_id.clone(),
    };
    let heartbeat_interval = state.heartbeat_interval;

    let events = stream! {
        // Owned by the generator so registry removal runs on every exit path
        let _guard = guard;

        // The handshake bypasses the queue: it can never be lost to a full one
        yield frame(&StreamEvent::Connected {
            message: "Stream started".to_string(),
            client_id: client_id.clone(),
        });

        let mut last_emit = Instant::now();
        let mut queue_open = true;
        loop {
            if queue_open {
                match tokio::time::timeout(QUEUE_WAIT, rx.recv()).await {
                    Ok(Some(event)) => {
                        yield frame(&event);
                        last_emit = Instant::now();
                        continue;
                    }
                    Ok(None) => {
                        // Evicted by the hub or the reaper. Keep heartbeating:
                        // an evicted consumer sees an idle stream, not an error.
                        tracing::debug!(%client_id, "queue closed, heartbeat-only mode");
                        queue_open = false;
                    }
                    Err(_) => {} // queue empty, fall through to heartbeat check
                }
            } else {
                tokio::time::sleep(QUEUE_WAIT).await;
            }

            if last_emit.elapsed() >= heartbeat_interval {
                yield frame(&StreamEvent::heartbeat_now());
                last_emit = Instant::now();
            }
        }
    };

    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(events),
    )
}

fn frame(event: &StreamEvent) -> Result<Event, Infallible> {
    // Serialization of StreamEvent cannot fail; the fallback keeps the
    // stream alive rather than panicking in a long-lived connection
    let json = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Ok(Event::default().data(json))
}

fn generate_client_id() -> String {
    let token = Uuid::new_v4().simple().to_string();
    format!("client_{}_{}", &token[..8], Utc::now().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_prefixed() {
        let a = generate_client_id();
        let b = generate_client_id();
        assert!(a.starts_with("client_"));
        assert_ne!(a, b);
    }

    #[test]
    fn session_guard_removes_client_on_drop() {
        let registry = Arc::new(ClientRegistry::new(5, 5));
        let _rx = registry.add("guarded");
        {
            let _guard = SessionGuard {
                registry: registry.clone(),
                client_id: "guarded".to_string(),
            };
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());
    }
}
