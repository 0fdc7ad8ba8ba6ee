//! Entity CRUD handlers: create, retrieve, query and attribute update.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use tracing::debug;

use crate::error::{BrokerError, BrokerResult};
use crate::geojson::{self, EntityFeatureProjector, FeatureCollection};
use crate::query::Query;
use crate::registry::Entity;
use crate::request::RequestWrapper;
use crate::server::AppState;
use crate::types::BaseEntity;

/// Content type for NGSI-LD responses.
pub const NGSI_LD_CONTENT_TYPE: &str = "application/ld+json;charset=utf-8";

/// Entity property that carries the geometry used for GeoJSON projections.
const LOCATION_PROPERTY: &str = "location";

/// True when any entry in the Accept header asks for GeoJSON.
fn wants_geojson(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|acceptable| acceptable.trim().starts_with(geojson::CONTENT_TYPE))
}

/// True when the `options` parameter selects the simplified key-value
/// projection.
fn wants_key_values(request: &RequestWrapper) -> bool {
    crate::query::parse_query_string(request.raw_query())
        .get("options")
        .map(|options| options == "keyValues")
        .unwrap_or(false)
}

fn json_response(
    status: StatusCode,
    content_type: &'static str,
    body: &impl serde::Serialize,
) -> BrokerResult<Response> {
    let bytes = serde_json::to_vec(body).map_err(|e| BrokerError::Serialize(e.to_string()))?;
    Ok((status, [(header::CONTENT_TYPE, content_type)], bytes).into_response())
}

/// GET /ngsi-ld/v1/entities
///
/// Builds a query from the URL parameters, gathers the matching context
/// sources and accumulates up to `limit` entities through the callback
/// chain. The response is either an NGSI-LD array or, when the Accept
/// header asks for it, a GeoJSON FeatureCollection.
pub async fn query_entities(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> BrokerResult<Response> {
    let request = RequestWrapper::new(method, &uri, headers.clone(), Bytes::new());
    let params = crate::query::parse_query_string(request.raw_query());

    let entity_type_names = params.get("type").cloned().unwrap_or_default();
    let attribute_names = params.get("attrs").cloned().unwrap_or_default();

    if entity_type_names.is_empty() && attribute_names.is_empty() {
        return Err(BrokerError::bad_parameter(
            "A request for entities MUST specify at least one of type or attrs.",
        ));
    }

    let types: Vec<String> = entity_type_names.split(',').map(str::to_string).collect();
    let attributes: Vec<String> = attribute_names.split(',').map(str::to_string).collect();
    let q = params.get("q").cloned().unwrap_or_default();

    let simplified = wants_key_values(&request);
    let geojson_requested = wants_geojson(&headers);

    let query = Query::from_parameters(request, types, attributes, &q)?;
    let sources = state.registry.sources_for_query(&query).await;
    debug!(sources = sources.len(), "dispatching entity query");

    let projector = EntityFeatureProjector::new(LOCATION_PROPERTY, simplified);
    let mut collection = FeatureCollection::default();
    let mut entities: Vec<Entity> = Vec::new();

    // zero only ever means "use the default limit", never unlimited
    let max_count = match query.pagination_limit() {
        0 => u64::MAX,
        limit => limit,
    };
    let mut count: u64 = 0;

    for source in &sources {
        let result = source
            .get_entities(&query, &mut |entity| {
                if count < max_count {
                    if geojson_requested {
                        projector.project_into(&entity, &mut collection)?;
                    } else {
                        entities.push(entity);
                    }
                    count += 1;
                }
                Ok(())
            })
            .await;

        if let Err(e) = result {
            return Err(BrokerError::internal(format!(
                "an internal error was encountered when trying to get entities from the context source: {e}"
            )));
        }
    }

    // TODO: add an RFC 8288 Link header describing previous and next pages
    if geojson_requested {
        json_response(StatusCode::OK, geojson::CONTENT_TYPE, &collection)
    } else {
        json_response(StatusCode::OK, NGSI_LD_CONTENT_TYPE, &entities)
    }
}

/// GET /ngsi-ld/v1/entities/{id}
pub async fn retrieve_entity(
    State(state): State<Arc<AppState>>,
    Path(entity_id): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> BrokerResult<Response> {
    let request = RequestWrapper::new(method, &uri, headers.clone(), Bytes::new());

    let sources = state.registry.sources_for_entity(&entity_id).await;
    if sources.is_empty() {
        return Err(BrokerError::not_found(format!(
            "no context source claims entity {entity_id}"
        )));
    }

    // First-source-wins: the remaining sources are deliberately not
    // consulted, even on failure.
    let entity = match sources[0].retrieve_entity(&entity_id, &request).await {
        Ok(entity) => entity,
        Err(e @ BrokerError::NotFound(_)) => return Err(e),
        Err(e) => {
            return Err(BrokerError::source_failure(format!(
                "failed to find entity: {e}"
            )))
        }
    };

    if wants_geojson(&headers) {
        let projector = EntityFeatureProjector::new(LOCATION_PROPERTY, wants_key_values(&request));
        let feature = projector.project(&entity)?;
        json_response(StatusCode::OK, geojson::CONTENT_TYPE, &feature)
    } else {
        json_response(StatusCode::OK, NGSI_LD_CONTENT_TYPE, &entity)
    }
}

/// POST /ngsi-ld/v1/entities
///
/// Every source providing the entity's type must accept the create; the
/// first failure aborts the request.
pub async fn create_entity(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> BrokerResult<Response> {
    let request = RequestWrapper::new(method, &uri, headers, body);

    let entity: BaseEntity = request.decode_body_into().map_err(|e| {
        BrokerError::bad_parameter(format!("unable to decode request payload: {e}"))
    })?;

    let sources = state
        .registry
        .sources_for_entity_type(&entity.entity_type)
        .await;
    if sources.is_empty() {
        return Err(BrokerError::source_failure(format!(
            "no context sources found matching the provided type {}",
            entity.entity_type
        )));
    }

    for source in &sources {
        source
            .create_entity(&entity.entity_type, &entity.id, &request)
            .await
            .map_err(|e| BrokerError::source_failure(format!("failed to create entity: {e}")))?;
    }

    if let Some(hook) = &state.on_entity_created {
        hook(&entity.entity_type, &entity.id, &request);
    }

    Ok(StatusCode::CREATED.into_response())
}

/// PATCH /ngsi-ld/v1/entities/{id}/attrs/
pub async fn update_entity_attributes(
    State(state): State<Arc<AppState>>,
    Path(entity_id): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> BrokerResult<Response> {
    let request = RequestWrapper::new(method, &uri, headers, body);

    let sources = state.registry.sources_for_entity(&entity_id).await;
    if sources.is_empty() {
        return Err(BrokerError::not_found(format!(
            "no context source claims entity {entity_id}"
        )));
    }

    sources[0]
        .update_entity_attributes(&entity_id, &request)
        .await
        .map_err(|e| {
            BrokerError::source_failure(format!("unable to update entity attributes: {e}"))
        })?;

    if let Some(hook) = &state.on_attributes_updated {
        // the completion hook only fires when the source can name the type
        if let Ok(entity_type) = sources[0].provided_type_from_id(&entity_id) {
            hook(&entity_type, &entity_id, &request);
        }
    }

    Ok(StatusCode::NO_CONTENT.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn geojson_is_selected_by_accept_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/ld+json"));
        assert!(!wants_geojson(&headers));

        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/geo+json"),
        );
        assert!(wants_geojson(&headers));
    }

    #[test]
    fn geojson_is_found_in_comma_separated_accept_values() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("text/html, application/geo+json;q=0.9"),
        );
        assert!(wants_geojson(&headers));
    }

    #[test]
    fn key_values_option_must_match_exactly() {
        let uri: Uri = "/ngsi-ld/v1/entities?options=keyValues".parse().unwrap();
        let request = RequestWrapper::new(Method::GET, &uri, HeaderMap::new(), Bytes::new());
        assert!(wants_key_values(&request));

        let uri: Uri = "/ngsi-ld/v1/entities?options=sysAttrs".parse().unwrap();
        let request = RequestWrapper::new(Method::GET, &uri, HeaderMap::new(), Bytes::new());
        assert!(!wants_key_values(&request));
    }
}
