//! Context source adapter that forwards to a remote NGSI-LD endpoint.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::header;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::{BrokerError, BrokerResult};
use crate::geojson;
use crate::query::Query;
use crate::registry::{
    entity_type_from_urn, ContextSource, Entity, QueryEntitiesCallback,
};
use crate::request::RequestWrapper;

const REMOTE_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A context source registration record, as posted to
/// `/csourceRegistration` or seeded from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsourceRegistration {
    /// Entity type the source provides; empty acts as a wildcard.
    #[serde(rename = "type")]
    pub entity_type: String,
    /// Attributes the source provides; an empty entry acts as a wildcard.
    #[serde(default)]
    pub attributes: Vec<String>,
    /// Base URL of the remote endpoint.
    pub endpoint: String,
    /// Optional regular expression matched against entity IDs.
    #[serde(rename = "idPattern", skip_serializing_if = "Option::is_none")]
    pub id_pattern: Option<String>,
}

/// Implements the context source contract by proxying to a remote HTTP
/// endpoint. Requests are reissued with the original method, path and query
/// string below the registered base URL.
#[derive(Debug)]
pub struct RemoteContextSource {
    entity_type: String,
    attributes: Vec<String>,
    endpoint: String,
    id_pattern: Option<Regex>,
    client: reqwest::Client,
}

impl RemoteContextSource {
    pub fn new(registration: &CsourceRegistration) -> BrokerResult<Self> {
        let id_pattern = registration
            .id_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| {
                BrokerError::bad_parameter(format!("invalid idPattern in registration: {e}"))
            })?;

        let client = reqwest::Client::builder()
            .timeout(REMOTE_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BrokerError::internal(e.to_string()))?;

        Ok(RemoteContextSource {
            entity_type: registration.entity_type.clone(),
            attributes: registration.attributes.clone(),
            endpoint: registration.endpoint.clone(),
            id_pattern,
            client,
        })
    }

    fn remote_url(&self, path: &str, raw_query: &str) -> BrokerResult<Url> {
        let mut target = format!("{}{}", self.endpoint.trim_end_matches('/'), path);
        if !raw_query.is_empty() {
            target.push('?');
            target.push_str(raw_query);
        }
        Url::parse(&target).map_err(|e| {
            BrokerError::source_failure(format!("invalid remote endpoint {target}: {e}"))
        })
    }

    /// Reissues the buffered request verbatim at the remote base URL.
    async fn forward(&self, request: &RequestWrapper) -> BrokerResult<()> {
        let url = self.remote_url(request.path(), "")?;
        debug!(method = %request.method(), %url, "forwarding request to remote context source");

        let mut builder = self
            .client
            .request(request.method().clone(), url)
            .body(request.body_bytes());
        if let Some(content_type) = request.header("content-type") {
            builder = builder.header(header::CONTENT_TYPE, content_type);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| BrokerError::source_failure(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let reason = response.text().await.unwrap_or_default();
            return Err(BrokerError::source_failure(format!(
                "remote endpoint returned status {status}: {reason}"
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl ContextSource for RemoteContextSource {
    fn provides_type(&self, entity_type: &str) -> bool {
        self.entity_type.is_empty() || self.entity_type == entity_type
    }

    fn provides_attribute(&self, attribute: &str) -> bool {
        self.attributes.is_empty()
            || self
                .attributes
                .iter()
                .any(|provided| provided.is_empty() || provided == attribute)
    }

    fn provides_entities_with_matching_id(&self, entity_id: &str) -> bool {
        match &self.id_pattern {
            Some(pattern) => pattern.is_match(entity_id),
            None => entity_type_from_urn(entity_id)
                .map(|entity_type| self.provides_type(entity_type))
                .unwrap_or(false),
        }
    }

    fn provided_type_from_id(&self, entity_id: &str) -> BrokerResult<String> {
        if !self.entity_type.is_empty() {
            return Ok(self.entity_type.clone());
        }

        if let Some(pattern) = &self.id_pattern {
            if pattern.is_match(entity_id) {
                if let Some(entity_type) = entity_type_from_urn(entity_id) {
                    return Ok(entity_type.to_string());
                }
            }
        }

        Err(BrokerError::NotProvided(format!(
            "no type provided for entity {entity_id}"
        )))
    }

    async fn create_entity(
        &self,
        _entity_type: &str,
        _entity_id: &str,
        request: &RequestWrapper,
    ) -> BrokerResult<()> {
        self.forward(request).await
    }

    async fn update_entity_attributes(
        &self,
        _entity_id: &str,
        request: &RequestWrapper,
    ) -> BrokerResult<()> {
        self.forward(request).await
    }

    async fn get_entities(
        &self,
        query: &Query,
        callback: QueryEntitiesCallback<'_>,
    ) -> BrokerResult<()> {
        let request = query.request();
        let url = self.remote_url(request.path(), request.raw_query())?;
        debug!(%url, "querying remote context source");

        let mut builder = self.client.get(url);
        if let Some(accept) = request.header("accept") {
            builder = builder.header(header::ACCEPT, accept);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| BrokerError::source_failure(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BrokerError::source_failure(format!(
                "remote endpoint returned status {status}"
            )));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response
            .bytes()
            .await
            .map_err(|e| BrokerError::source_failure(e.to_string()))?;

        if content_type.starts_with(geojson::CONTENT_TYPE) {
            geojson::unpack_geojson(&body, |feature| callback(feature.to_entity()))
        } else {
            let entities: Vec<Entity> = serde_json::from_slice(&body)
                .map_err(|e| BrokerError::Serialize(e.to_string()))?;
            for entity in entities {
                callback(entity)?;
            }
            Ok(())
        }
    }

    async fn retrieve_entity(
        &self,
        entity_id: &str,
        request: &RequestWrapper,
    ) -> BrokerResult<Entity> {
        let url = self.remote_url(request.path(), "")?;
        debug!(entity_id, %url, "retrieving entity from remote context source");

        let mut builder = self.client.get(url);
        if let Some(accept) = request.header("accept") {
            builder = builder.header(header::ACCEPT, accept);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| BrokerError::source_failure(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(BrokerError::not_found(format!(
                "entity {entity_id} not found at remote endpoint"
            )));
        }
        if !status.is_success() {
            return Err(BrokerError::source_failure(format!(
                "remote endpoint returned status {status}"
            )));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response
            .bytes()
            .await
            .map_err(|e| BrokerError::source_failure(e.to_string()))?;

        if content_type.starts_with(geojson::CONTENT_TYPE) {
            // a singleton Feature (or a collection holding one) is unpacked
            // into the entity envelope
            let mut entity = None;
            geojson::unpack_geojson(&body, |feature| {
                entity.get_or_insert_with(|| feature.to_entity());
                Ok(())
            })?;
            entity.ok_or_else(|| {
                BrokerError::not_found(format!("entity {entity_id} not found at remote endpoint"))
            })
        } else {
            serde_json::from_slice(&body).map_err(|e| BrokerError::Serialize(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(
        entity_type: &str,
        attributes: &[&str],
        endpoint: &str,
        id_pattern: Option<&str>,
    ) -> CsourceRegistration {
        CsourceRegistration {
            entity_type: entity_type.to_string(),
            attributes: attributes.iter().map(|s| s.to_string()).collect(),
            endpoint: endpoint.to_string(),
            id_pattern: id_pattern.map(str::to_string),
        }
    }

    #[test]
    fn registration_body_decodes() {
        let reg: CsourceRegistration = serde_json::from_str(
            r#"{"type": "WeatherObserved", "attributes": ["snowHeight"],
                "endpoint": "http://localhost:1234", "idPattern": "^urn:ngsi-ld:WeatherObserved:.+"}"#,
        )
        .unwrap();

        assert_eq!(reg.entity_type, "WeatherObserved");
        assert_eq!(reg.attributes, vec!["snowHeight"]);
        assert!(reg.id_pattern.is_some());
    }

    #[test]
    fn invalid_id_pattern_is_rejected() {
        let reg = registration("A", &["a"], "http://localhost", Some("["));
        assert!(matches!(
            RemoteContextSource::new(&reg).unwrap_err(),
            BrokerError::BadParameter(_)
        ));
    }

    #[test]
    fn provided_type_prefers_the_registration() {
        let source =
            RemoteContextSource::new(&registration("Road", &[], "", Some("^urn:ngsi-ld:Road:.+")))
                .unwrap();

        let entity_type = source.provided_type_from_id("urn:ngsi-ld:Road:myid").unwrap();
        assert_eq!(entity_type, "Road");
    }

    #[test]
    fn provided_type_falls_back_to_the_urn_segment() {
        let source =
            RemoteContextSource::new(&registration("", &[], "", Some("^urn:ngsi-ld:.+"))).unwrap();

        let entity_type = source
            .provided_type_from_id("urn:ngsi-ld:Beach:omaha")
            .unwrap();
        assert_eq!(entity_type, "Beach");

        assert!(matches!(
            source.provided_type_from_id("nomatch").unwrap_err(),
            BrokerError::NotProvided(_)
        ));
    }

    #[test]
    fn provided_type_requires_a_type_or_a_matching_pattern() {
        let source = RemoteContextSource::new(&registration("", &[], "", None)).unwrap();
        assert!(source.provided_type_from_id("urn:ngsi-ld:Beach:omaha").is_err());
    }

    #[test]
    fn matching_predicates_honour_wildcards() {
        let source = RemoteContextSource::new(&registration("Beach", &[""], "", None)).unwrap();

        assert!(source.provides_type("Beach"));
        assert!(!source.provides_type("Device"));
        assert!(source.provides_attribute("anything"));

        // no pattern: the URN type decides
        assert!(source.provides_entities_with_matching_id("urn:ngsi-ld:Beach:omaha"));
        assert!(!source.provides_entities_with_matching_id("urn:ngsi-ld:Device:d1"));
    }

    #[test]
    fn id_pattern_overrides_urn_type_matching() {
        let source = RemoteContextSource::new(&registration(
            "TypeA",
            &["a"],
            "",
            Some("^urn:ngsi-ld:TypeA:.+"),
        ))
        .unwrap();

        assert!(source.provides_entities_with_matching_id("urn:ngsi-ld:TypeA:myentity"));
        assert!(!source.provides_entities_with_matching_id("urn:ngsi-ld:TypeB:other"));
    }
}
