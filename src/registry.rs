//! The context registry: the broker's directory of registered sources.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::BrokerResult;
use crate::query::Query;
use crate::request::RequestWrapper;

/// An entity is a self-describing JSON-LD document; past the
/// `{id, type, @context}` envelope the broker treats it as opaque.
pub type Entity = serde_json::Value;

/// Invoked by a queried context source once per matching entity. Delivery is
/// strictly sequential within a request.
pub type QueryEntitiesCallback<'a> = &'a mut (dyn FnMut(Entity) -> BrokerResult<()> + Send);

/// Extracts the entity type from a `urn:ngsi-ld:<Type>:<localId>` identifier.
///
/// The third colon-separated segment is authoritative. Identifiers that do
/// not follow the canonical shape yield whatever occupies that position, so
/// type-based fallbacks can misfire on non-canonical IDs.
pub fn entity_type_from_urn(entity_id: &str) -> Option<&str> {
    entity_id.split(':').nth(2).filter(|s| !s.is_empty())
}

/// The capability contract every context source implements, whether it runs
/// in-process or proxies a remote endpoint.
///
/// Sources must propagate errors returned by the entity callback so that a
/// cancelled or failed consumer stops the stream promptly.
#[async_trait]
pub trait ContextSource: Send + Sync {
    /// True when the source serves the given entity type. An empty
    /// registered type is a wildcard that satisfies any requested value.
    fn provides_type(&self, entity_type: &str) -> bool;

    /// True when the source serves the given attribute, with the same
    /// empty-string wildcard rule.
    fn provides_attribute(&self, attribute: &str) -> bool;

    /// True when the source claims jurisdiction over the entity ID, either
    /// via its registered ID pattern or, absent one, via the type parsed
    /// out of the URN.
    fn provides_entities_with_matching_id(&self, entity_id: &str) -> bool;

    /// The entity type this source provides for the given ID.
    fn provided_type_from_id(&self, entity_id: &str) -> BrokerResult<String>;

    async fn create_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
        request: &RequestWrapper,
    ) -> BrokerResult<()>;

    async fn update_entity_attributes(
        &self,
        entity_id: &str,
        request: &RequestWrapper,
    ) -> BrokerResult<()>;

    /// Streams all entities matching `query` through `callback`.
    async fn get_entities(
        &self,
        query: &Query,
        callback: QueryEntitiesCallback<'_>,
    ) -> BrokerResult<()>;

    async fn retrieve_entity(
        &self,
        entity_id: &str,
        request: &RequestWrapper,
    ) -> BrokerResult<Entity>;
}

/// An ordered, append-only list of context sources.
///
/// Registrations are rare and queries frequent, so the list sits behind a
/// reader-preferring lock. Sources are never removed; a failing source stays
/// registered for subsequent requests.
#[derive(Default)]
pub struct ContextRegistry {
    sources: RwLock<Vec<Arc<dyn ContextSource>>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a source. Selection results preserve registration order.
    pub async fn register(&self, source: Arc<dyn ContextSource>) {
        let mut sources = self.sources.write().await;
        sources.push(source);
        debug!(count = sources.len(), "context source registered");
    }

    /// Every source that provides all requested types and all requested
    /// attributes.
    pub async fn sources_for_query(&self, query: &Query) -> Vec<Arc<dyn ContextSource>> {
        let sources = self.sources.read().await;
        sources
            .iter()
            .filter(|source| {
                query
                    .entity_types()
                    .iter()
                    .all(|entity_type| source.provides_type(entity_type))
                    && query
                        .entity_attributes()
                        .iter()
                        .all(|attribute| source.provides_attribute(attribute))
            })
            .cloned()
            .collect()
    }

    /// Every source claiming jurisdiction over the entity ID.
    pub async fn sources_for_entity(&self, entity_id: &str) -> Vec<Arc<dyn ContextSource>> {
        let sources = self.sources.read().await;
        sources
            .iter()
            .filter(|source| source.provides_entities_with_matching_id(entity_id))
            .cloned()
            .collect()
    }

    /// Every source providing the entity type.
    pub async fn sources_for_entity_type(&self, entity_type: &str) -> Vec<Arc<dyn ContextSource>> {
        let sources = self.sources.read().await;
        sources
            .iter()
            .filter(|source| source.provides_type(entity_type))
            .cloned()
            .collect()
    }
}
