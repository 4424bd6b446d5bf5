//! Process-wide state handed to everything that builds pipelines.

use std::sync::Arc;

use knive_av::ToolRegistry;
use knive_core::config::Config;
use knive_core::events::EventBus;

/// Broadcast capacity of the pipeline event bus.
const EVENT_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct KniveContext {
    pub config: Arc<Config>,
    pub tools: Arc<ToolRegistry>,
    pub events: Arc<EventBus>,
}

impl KniveContext {
    /// Discover tools for `config` and create a fresh event bus.
    pub fn new(config: Config) -> Self {
        let tools = ToolRegistry::discover(&config.tools);
        Self::with_tools(config, tools)
    }

    pub fn with_tools(config: Config, tools: ToolRegistry) -> Self {
        Self {
            config: Arc::new(config),
            tools: Arc::new(tools),
            events: Arc::new(EventBus::new(EVENT_CAPACITY)),
        }
    }
}
