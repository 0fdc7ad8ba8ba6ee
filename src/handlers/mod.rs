//! HTTP request handlers for the NGSI-LD v1 API surface.

pub mod entities;
pub mod registration;

pub use entities::{
    create_entity, query_entities, retrieve_entity, update_entity_attributes, NGSI_LD_CONTENT_TYPE,
};
pub use registration::register_context_source;
