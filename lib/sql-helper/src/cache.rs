//! Process-lifetime cache of stored procedure parameter templates.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::discovery::discover_parameters;
use crate::{Backend, ParameterDescriptor, SqlHelperError};

/// Cache of parameter templates keyed by data source and command text.
///
/// Templates are never handed out directly: every read returns a deep copy,
/// so callers may assign values freely. Concurrent first-time discovery of
/// the same key may run twice; the last writer wins and both results are
/// equivalent.
#[derive(Debug, Default)]
pub struct ParameterCache {
    entries: RwLock<HashMap<CacheKey, Arc<[ParameterDescriptor]>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    data_source: String,
    command_text: String,
    include_return_value: bool,
}

impl CacheKey {
    fn new(data_source: &str, command_text: &str, include_return_value: bool) -> Self {
        Self {
            data_source: data_source.to_string(),
            command_text: command_text.to_string(),
            include_return_value,
        }
    }
}

impl ParameterCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a template, replacing any existing entry for the key.
    pub fn put(
        &self,
        data_source: &str,
        command_text: &str,
        parameters: Vec<ParameterDescriptor>,
    ) {
        let key = CacheKey::new(data_source, command_text, false);
        self.entries.write().insert(key, Arc::from(parameters));
    }

    /// A copy of the cached template, or `None` if the key was never cached.
    ///
    /// Never triggers discovery.
    pub fn get(&self, data_source: &str, command_text: &str) -> Option<Vec<ParameterDescriptor>> {
        self.lookup(&CacheKey::new(data_source, command_text, false))
    }

    /// A copy of the cached template, discovering and caching it on a miss.
    pub async fn get_or_discover<B: Backend + ?Sized>(
        &self,
        backend: &B,
        data_source: &str,
        procedure: &str,
        include_return_value: bool,
    ) -> Result<Vec<ParameterDescriptor>, SqlHelperError> {
        let key = CacheKey::new(data_source, procedure, include_return_value);
        if let Some(parameters) = self.lookup(&key) {
            trace!(procedure, "parameter cache hit");
            return Ok(parameters);
        }

        debug!(procedure, "parameter cache miss");
        let discovered =
            discover_parameters(backend, data_source, procedure, include_return_value).await?;
        let template: Arc<[ParameterDescriptor]> = Arc::from(discovered);
        self.entries.write().insert(key, Arc::clone(&template));
        Ok(template.to_vec())
    }

    /// Drop the templates cached for a procedure, with and without return value.
    pub fn invalidate(&self, data_source: &str, procedure: &str) {
        let mut entries = self.entries.write();
        entries.remove(&CacheKey::new(data_source, procedure, false));
        entries.remove(&CacheKey::new(data_source, procedure, true));
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn lookup(&self, key: &CacheKey) -> Option<Vec<ParameterDescriptor>> {
        let template = self.entries.read().get(key).cloned()?;
        Some(template.to_vec())
    }
}
