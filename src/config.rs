//! Broker configuration, layered from defaults, an optional TOML file and
//! `NGSILD_`-prefixed environment variables.

use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, BrokerResult};
use crate::remote::CsourceRegistration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Interface the listener binds to.
    pub host: String,
    /// Port the listener binds to.
    pub port: u16,
    /// Remote context sources registered at startup, before the
    /// registration endpoint accepts any.
    pub registrations: Vec<CsourceRegistration>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
            registrations: Vec::new(),
        }
    }
}

impl BrokerConfig {
    /// Loads configuration: defaults, then the TOML file if given, then
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> BrokerResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(BrokerConfig::default()));

        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }

        figment
            .merge(Env::prefixed("NGSILD_"))
            .extract()
            .map_err(|e| BrokerError::Config(e.to_string()))
    }
}
