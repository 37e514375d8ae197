//! Concurrent collection registry
//!
//! Read-mostly map from collection name to schema. Schemas are immutable
//! once registered; reconfiguring a collection swaps in a new `Arc`.

use std::sync::Arc;

use dashmap::DashMap;

use super::types::{CollectionSchema, Index};
use crate::error::{DbError, DbResult};

#[derive(Debug, Default)]
pub struct SchemaRegistry {
    collections: DashMap<String, Arc<CollectionSchema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a collection, failing with `UnknownCollection`
    pub fn get(&self, collection: &str) -> DbResult<Arc<CollectionSchema>> {
        self.find(collection)
            .ok_or_else(|| DbError::UnknownCollection(collection.to_string()))
    }

    pub fn find(&self, collection: &str) -> Option<Arc<CollectionSchema>> {
        self.collections.get(collection).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, collection: &str) -> bool {
        self.collections.contains_key(collection)
    }

    /// Registers or replaces a schema, returning the previous one
    pub fn insert(&self, schema: CollectionSchema) -> Option<Arc<CollectionSchema>> {
        self.collections
            .insert(schema.collection.clone(), Arc::new(schema))
    }

    pub fn remove(&self, collection: &str) -> Option<Arc<CollectionSchema>> {
        self.collections.remove(collection).map(|(_, schema)| schema)
    }

    /// Registered collection names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Indexes in other collections whose foreign key targets `collection`
    pub fn referencing(&self, collection: &str) -> Vec<(Arc<CollectionSchema>, Index)> {
        let mut out: Vec<(Arc<CollectionSchema>, Index)> = self
            .collections
            .iter()
            .flat_map(|entry| {
                let schema = Arc::clone(entry.value());
                entry
                    .value()
                    .indexes
                    .iter()
                    .filter(|index| {
                        index
                            .foreign_key
                            .as_ref()
                            .is_some_and(|fk| fk.collection == collection)
                    })
                    .map(|index| (Arc::clone(&schema), index.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        out.sort_by(|a, b| (&a.0.collection, &a.1.name).cmp(&(&b.0.collection, &b.1.name)));
        out
    }

    pub fn clear(&self) {
        self.collections.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let registry = SchemaRegistry::new();
        assert!(registry.get("user").unwrap_err().is_not_found());

        assert!(registry.insert(CollectionSchema::new("user")).is_none());
        assert!(registry.insert(CollectionSchema::new("user")).is_some());
        assert_eq!(registry.get("user").unwrap().collection, "user");

        registry.insert(CollectionSchema::new("account"));
        assert_eq!(registry.names(), vec!["account", "user"]);

        registry.remove("user");
        assert!(!registry.contains("user"));
    }

    #[test]
    fn test_referencing() {
        let registry = SchemaRegistry::new();
        registry.insert(CollectionSchema::new("account"));
        registry.insert(
            CollectionSchema::new("user")
                .with_index(Index::new("account_fk", ["account_id"]).references("account")),
        );
        registry.insert(
            CollectionSchema::new("task")
                .with_index(Index::new("owner_fk", ["owner"]).references("user")),
        );

        let refs = registry.referencing("account");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].0.collection, "user");
        assert_eq!(refs[0].1.name, "account_fk");
        assert!(registry.referencing("task").is_empty());
    }
}
