//! # ngsild-broker
//!
//! A federating context broker for the NGSI-LD context-information API.
//!
//! The broker accepts HTTP requests that create, patch, retrieve or query
//! entities (self-describing JSON-LD documents identified by a URN) and
//! dispatches each request to the registered context sources claiming
//! jurisdiction over the entity's type, attribute set or identifier
//! pattern. Sources may run in-process (any [`registry::ContextSource`]
//! implementation) or behind a remote HTTP endpoint
//! ([`remote::RemoteContextSource`]); the broker is transparent to both.
//!
//! The broker persists nothing itself and treats entities as opaque beyond
//! the `{id, type, @context}` envelope.
//!
//! ## Example
//!
//! ```rust,no_run
//! use ngsild_broker::Server;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let server = Server::builder()
//!     .host("0.0.0.0")
//!     .port(8080)
//!     .build()
//!     .await?;
//!
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

pub mod config;
pub mod error;
pub mod geojson;
pub mod handlers;
pub mod query;
pub mod registry;
pub mod remote;
pub mod request;
pub mod server;
pub mod types;

use config::BrokerConfig;
use error::{BrokerError, BrokerResult};
use registry::ContextRegistry;
use remote::RemoteContextSource;
use server::{AppState, CompletionCallback, Runtime};

/// The NGSI-LD broker HTTP server.
pub struct Server {
    addr: SocketAddr,
    state: Arc<AppState>,
}

impl Server {
    /// Create a new server builder.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// The registry this server dispatches against; in-process sources are
    /// registered here.
    pub fn registry(&self) -> Arc<ContextRegistry> {
        self.state.registry.clone()
    }

    /// Run the server until shutdown.
    pub async fn run(self) -> BrokerResult<()> {
        Runtime::new(self.addr, self.state).run().await
    }
}

/// Server builder for configuration.
pub struct ServerBuilder {
    config: BrokerConfig,
    registry: Option<Arc<ContextRegistry>>,
    on_entity_created: Option<CompletionCallback>,
    on_attributes_updated: Option<CompletionCallback>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        ServerBuilder {
            config: BrokerConfig::default(),
            registry: None,
            on_entity_created: None,
            on_attributes_updated: None,
        }
    }

    /// Replace the whole configuration in one step.
    pub fn config(mut self, config: BrokerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Use an existing registry instead of a fresh one; useful when
    /// in-process sources are registered before startup.
    pub fn registry(mut self, registry: Arc<ContextRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Completion hook fired after an entity has been created by every
    /// matching source.
    pub fn on_entity_created(mut self, callback: CompletionCallback) -> Self {
        self.on_entity_created = Some(callback);
        self
    }

    /// Completion hook fired after entity attributes have been updated.
    pub fn on_attributes_updated(mut self, callback: CompletionCallback) -> Self {
        self.on_attributes_updated = Some(callback);
        self
    }

    pub async fn build(self) -> BrokerResult<Server> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| BrokerError::Config(format!("invalid listen address: {e}")))?;

        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(ContextRegistry::new()));

        for registration in &self.config.registrations {
            let source = RemoteContextSource::new(registration).map_err(|e| {
                BrokerError::Config(format!(
                    "invalid context source registration for type {}: {e}",
                    registration.entity_type
                ))
            })?;
            registry.register(Arc::new(source)).await;
        }

        let state = Arc::new(AppState {
            registry,
            on_entity_created: self.on_entity_created,
            on_attributes_updated: self.on_attributes_updated,
        });

        Ok(Server { addr, state })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
