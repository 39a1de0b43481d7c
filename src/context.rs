//! Shared client context
//!
//! Every long-lived component receives a `TorContext` at construction
//! instead of reading global settings. It carries the configuration and
//! the `log` target the component should report under.

use crate::config::TorConfig;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct TorContext {
    config: Arc<TorConfig>,
}

impl TorContext {
    pub fn new(config: TorConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &TorConfig {
        &self.config
    }

    pub fn log_target(&self) -> &str {
        &self.config.log_target
    }
}

impl Default for TorContext {
    fn default() -> Self {
        Self::new(TorConfig::default())
    }
}
