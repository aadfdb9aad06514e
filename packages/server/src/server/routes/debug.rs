//! Read-only diagnostics for the stream client registry.
//!
//! GET /debug/stream_clients — operational visibility only, no control.

use std::collections::BTreeMap;

use axum::{extract::Extension, Json};
use serde::Serialize;

use crate::kernel::clients::ClientStats;
use crate::server::app::AxumAppState;

#[derive(Serialize)]
pub struct StreamClientsResponse {
    pub total_clients: usize,
    pub max_clients: usize,
    pub clients: BTreeMap<String, ClientStats>,
}

pub async fn debug_stream_clients_handler(
    Extension(state): Extension<AxumAppState>,
) -> Json<StreamClientsResponse> {
    let clients: BTreeMap<String, ClientStats> = state.registry.stats().into_iter().collect();

    Json(StreamClientsResponse {
        total_clients: clients.len(),
        max_clients: state.registry.max_clients(),
        clients,
    })
}
