//! Provider registry for runtime client construction
//!
//! Maps a provider identifier to a factory that builds a client for a given
//! API key and model. Nodes select their provider by id at execution time.

use std::collections::HashMap;
use std::sync::Arc;

use super::{CompletionProvider, ProviderConfig, ProviderError};

/// Factory trait for creating provider clients
pub trait ProviderFactory: Send + Sync {
    /// Create a client configured with the given credentials
    fn create(&self, config: &ProviderConfig) -> Result<Arc<dyn CompletionProvider>, ProviderError>;
}

/// Factory backed by a closure
///
/// Handy for hosts that already hold a configured client, and for tests.
pub struct FnProviderFactory<F> {
    build: F,
}

impl<F> FnProviderFactory<F>
where
    F: Fn(&ProviderConfig) -> Result<Arc<dyn CompletionProvider>, ProviderError> + Send + Sync,
{
    pub fn new(build: F) -> Self {
        Self { build }
    }
}

impl<F> ProviderFactory for FnProviderFactory<F>
where
    F: Fn(&ProviderConfig) -> Result<Arc<dyn CompletionProvider>, ProviderError> + Send + Sync,
{
    fn create(&self, config: &ProviderConfig) -> Result<Arc<dyn CompletionProvider>, ProviderError> {
        (self.build)(config)
    }
}

/// Registry of completion providers keyed by provider id
#[derive(Default)]
pub struct ProviderRegistry {
    factories: HashMap<String, Box<dyn ProviderFactory>>,
}

impl ProviderRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider factory, replacing any previous one for `name`
    pub fn register(&mut self, name: &str, factory: Box<dyn ProviderFactory>) {
        log::debug!("Registered completion provider '{}'", name);
        self.factories.insert(name.to_string(), factory);
    }

    /// Register a single shared client that ignores per-node credentials
    pub fn register_shared(&mut self, name: &str, provider: Arc<dyn CompletionProvider>) {
        self.register(
            name,
            Box::new(FnProviderFactory::new(move |_config: &ProviderConfig| {
                Ok(Arc::clone(&provider))
            })),
        );
    }

    /// List registered provider ids
    pub fn available_names(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }

    /// Build a client for provider `name`
    pub fn create(
        &self,
        name: &str,
        config: &ProviderConfig,
    ) -> Result<Arc<dyn CompletionProvider>, ProviderError> {
        self.factories
            .get(name)
            .ok_or_else(|| ProviderError::UnknownProvider(name.to_string()))?
            .create(config)
    }

    /// Check if a provider is registered
    pub fn is_available(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}
