//! Context source registration endpoint.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use tracing::info;

use crate::error::{BrokerError, BrokerResult};
use crate::remote::{CsourceRegistration, RemoteContextSource};
use crate::server::AppState;

/// POST /ngsi-ld/v1/csourceRegistration
///
/// Decodes a registration record and adds a remote context source to the
/// registry. Registration is additive; sources are never dropped.
pub async fn register_context_source(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> BrokerResult<Response> {
    let registration: CsourceRegistration = serde_json::from_slice(&body).map_err(|e| {
        BrokerError::bad_parameter(format!("unable to decode registration payload: {e}"))
    })?;

    let source = RemoteContextSource::new(&registration)?;

    info!(
        entity_type = %registration.entity_type,
        endpoint = %registration.endpoint,
        id_pattern = registration.id_pattern.as_deref().unwrap_or(""),
        "registering remote context source"
    );

    state.registry.register(Arc::new(source)).await;

    Ok(StatusCode::CREATED.into_response())
}
