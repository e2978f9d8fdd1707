//! Statement registry
//!
//! Process-wide catalog of compiled statements, result maps, parameter maps,
//! namespace caches and cache references. Ids resolve both fully qualified
//! (`namespace.id`) and by short name when the short name is unambiguous.
//! Treated as immutable once the mapping build completes.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::mapping::{MappedStatement, ParameterMap, ResultMap};

/// Registry of everything the mapping compiler produces
#[derive(Default)]
pub struct StatementRegistry {
    statements: HashMap<String, Arc<MappedStatement>>,
    result_maps: HashMap<String, Arc<ResultMap>>,
    parameter_maps: HashMap<String, Arc<ParameterMap>>,
    caches: HashMap<String, Arc<dyn Cache>>,
    cache_refs: HashMap<String, String>,
    statement_shorts: HashMap<String, Option<String>>,
    result_map_shorts: HashMap<String, Option<String>>,
}

fn short_name(id: &str) -> Option<&str> {
    id.rsplit_once('.').map(|(_, short)| short)
}

fn register_short(shorts: &mut HashMap<String, Option<String>>, id: &str) {
    if let Some(short) = short_name(id) {
        match shorts.get(short) {
            // A second owner poisons the short name.
            Some(Some(existing)) if existing != id => {
                shorts.insert(short.to_string(), None);
            }
            Some(_) => {}
            None => {
                shorts.insert(short.to_string(), Some(id.to_string()));
            }
        }
    }
}

impl StatementRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    // ==================== Statements ====================

    /// Register a statement under its fully qualified id
    pub fn add_statement(&mut self, statement: Arc<MappedStatement>) -> Result<()> {
        let id = statement.id.clone();
        if self.statements.contains_key(&id) {
            return Err(Error::malformed(format!(
                "mapped statement '{id}' is already registered"
            )));
        }
        debug!(id = %id, "registered mapped statement");
        register_short(&mut self.statement_shorts, &id);
        self.statements.insert(id, statement);
        Ok(())
    }

    /// Replace an existing statement (database-id shadowing)
    pub fn replace_statement(&mut self, statement: Arc<MappedStatement>) {
        self.statements.insert(statement.id.clone(), statement);
    }

    /// Whether a statement id (fully qualified) is registered
    pub fn has_statement(&self, id: &str) -> bool {
        self.statements.contains_key(id)
    }

    /// Fetch a statement by id, resolving unambiguous short names
    pub fn statement(&self, id: &str) -> Result<Arc<MappedStatement>> {
        if let Some(statement) = self.statements.get(id) {
            return Ok(statement.clone());
        }
        if let Some(Some(full)) = self.statement_shorts.get(id) {
            if let Some(statement) = self.statements.get(full) {
                return Ok(statement.clone());
            }
        }
        Err(Error::statement_not_found(id))
    }

    /// Ids of all registered statements
    pub fn statement_ids(&self) -> impl Iterator<Item = &str> {
        self.statements.keys().map(String::as_str)
    }

    /// Whether any statement belongs to the namespace
    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.statements
            .values()
            .any(|s| s.namespace == namespace)
    }

    // ==================== Result maps ====================

    /// Register a result map
    pub fn add_result_map(&mut self, map: ResultMap) -> Result<()> {
        let id = map.id.clone();
        if self.result_maps.contains_key(&id) {
            return Err(Error::malformed(format!(
                "result map '{id}' is already registered"
            )));
        }
        register_short(&mut self.result_map_shorts, &id);
        self.result_maps.insert(id, Arc::new(map));
        Ok(())
    }

    /// Whether a result map id is registered
    pub fn has_result_map(&self, id: &str) -> bool {
        self.result_maps.contains_key(id)
            || matches!(self.result_map_shorts.get(id), Some(Some(_)))
    }

    /// Fetch a result map, resolving unambiguous short names
    pub fn result_map(&self, id: &str) -> Result<Arc<ResultMap>> {
        if let Some(map) = self.result_maps.get(id) {
            return Ok(map.clone());
        }
        if let Some(Some(full)) = self.result_map_shorts.get(id) {
            if let Some(map) = self.result_maps.get(full) {
                return Ok(map.clone());
            }
        }
        Err(Error::incomplete(format!(
            "result map '{id}' is not registered"
        )))
    }

    // ==================== Parameter maps ====================

    /// Register a parameter map
    pub fn add_parameter_map(&mut self, map: ParameterMap) -> Result<()> {
        let id = map.id.clone();
        if self.parameter_maps.contains_key(&id) {
            return Err(Error::malformed(format!(
                "parameter map '{id}' is already registered"
            )));
        }
        self.parameter_maps.insert(id, Arc::new(map));
        Ok(())
    }

    /// Fetch a parameter map
    pub fn parameter_map(&self, id: &str) -> Result<Arc<ParameterMap>> {
        self.parameter_maps
            .get(id)
            .cloned()
            .ok_or_else(|| Error::incomplete(format!("parameter map '{id}' is not registered")))
    }

    // ==================== Caches ====================

    /// Register a namespace cache
    pub fn add_cache(&mut self, cache: Arc<dyn Cache>) {
        self.caches.insert(cache.id().to_string(), cache);
    }

    /// Whether a namespace declares its own cache
    pub fn has_cache(&self, namespace: &str) -> bool {
        self.caches.contains_key(namespace)
    }

    /// Record a cache reference from one namespace to another
    pub fn add_cache_ref(&mut self, namespace: impl Into<String>, referenced: impl Into<String>) {
        self.cache_refs.insert(namespace.into(), referenced.into());
    }

    /// The cache serving a namespace, following one cache-ref hop
    pub fn cache_for_namespace(&self, namespace: &str) -> Option<Arc<dyn Cache>> {
        if let Some(cache) = self.caches.get(namespace) {
            return Some(cache.clone());
        }
        self.cache_refs
            .get(namespace)
            .and_then(|target| self.caches.get(target))
            .cloned()
    }

    /// All registered caches
    pub fn caches(&self) -> impl Iterator<Item = &Arc<dyn Cache>> {
        self.caches.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PerpetualCache;
    use crate::dynsql::StaticSqlSource;
    use crate::mapping::SqlCommandType;

    fn statement(id: &str) -> Arc<MappedStatement> {
        MappedStatement::builder(
            id,
            SqlCommandType::Select,
            Arc::new(StaticSqlSource::new("SELECT 1", Vec::new())),
        )
        .build()
    }

    #[test]
    fn resolves_full_and_short_ids() {
        let mut registry = StatementRegistry::new();
        registry.add_statement(statement("user.findById")).unwrap();

        assert!(registry.statement("user.findById").is_ok());
        assert!(registry.statement("findById").is_ok());
        let err = registry.statement("nope").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::StatementNotFound);
    }

    #[test]
    fn ambiguous_short_names_are_poisoned() {
        let mut registry = StatementRegistry::new();
        registry.add_statement(statement("a.find")).unwrap();
        registry.add_statement(statement("b.find")).unwrap();

        assert!(registry.statement("a.find").is_ok());
        assert!(registry.statement("find").is_err());
    }

    #[test]
    fn duplicate_statement_ids_are_rejected() {
        let mut registry = StatementRegistry::new();
        registry.add_statement(statement("u.find")).unwrap();
        assert!(registry.add_statement(statement("u.find")).is_err());
    }

    #[test]
    fn cache_refs_resolve_one_hop() {
        let mut registry = StatementRegistry::new();
        registry.add_cache(Arc::new(PerpetualCache::new("shared")));
        registry.add_cache_ref("user", "shared");

        assert!(registry.cache_for_namespace("shared").is_some());
        assert!(registry.cache_for_namespace("user").is_some());
        assert!(registry.cache_for_namespace("other").is_none());
        assert!(registry.has_cache("shared"));
        assert!(!registry.has_cache("user"));
    }

    #[test]
    fn result_map_lookup_reports_incomplete() {
        let registry = StatementRegistry::new();
        let err = registry.result_map("u.map").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ConfigIncomplete);
    }
}
