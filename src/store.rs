//! Immutable, indexed snapshot of the resolved metadata

use std::{collections::HashMap, sync::Arc};

use time::OffsetDateTime;

use crate::metadata::{EntityDescriptor, MetadataDocument};

/// Descriptors in document order plus an entity-id index over the same values.
#[derive(Debug, Default)]
pub struct BackingStore {
    ordered_descriptors: Vec<Arc<EntityDescriptor>>,
    by_entity_id: HashMap<String, Vec<Arc<EntityDescriptor>>>,
    expiration: Option<OffsetDateTime>,
    digest: Option<String>,
}

impl BackingStore {
    /// Build a store from a parsed document; `digest` identifies the source bytes.
    pub fn new(document: MetadataDocument, digest: Option<String>) -> Self {
        let expiration = document.expiration();
        let ordered_descriptors: Vec<_> = document
            .entity_descriptors
            .into_iter()
            .map(Arc::new)
            .collect();

        let mut by_entity_id: HashMap<String, Vec<Arc<EntityDescriptor>>> = HashMap::new();
        for descriptor in &ordered_descriptors {
            by_entity_id
                .entry(descriptor.entity_id.clone())
                .or_default()
                .push(Arc::clone(descriptor));
        }

        Self {
            ordered_descriptors,
            by_entity_id,
            expiration,
            digest,
        }
    }

    pub fn ordered_descriptors(&self) -> &[Arc<EntityDescriptor>] {
        &self.ordered_descriptors
    }

    pub fn lookup(&self, entity_id: &str) -> &[Arc<EntityDescriptor>] {
        self.by_entity_id
            .get(entity_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.ordered_descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered_descriptors.is_empty()
    }

    pub fn expiration(&self) -> Option<OffsetDateTime> {
        self.expiration
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str) -> EntityDescriptor {
        EntityDescriptor {
            entity_id: id.into(),
            valid_until: None,
            sp_sso_descriptors: Vec::new(),
        }
    }

    #[test]
    fn index_matches_ordered_descriptors() {
        let store = BackingStore::new(
            MetadataDocument {
                valid_until: None,
                entity_descriptors: vec![descriptor("a"), descriptor("b"), descriptor("a")],
            },
            Some("digest".into()),
        );

        assert_eq!(store.len(), 3);
        assert_eq!(store.lookup("a").len(), 2);
        assert_eq!(store.lookup("b").len(), 1);
        assert!(store.lookup("c").is_empty());
        for descriptor in store.ordered_descriptors() {
            assert!(store
                .lookup(&descriptor.entity_id)
                .iter()
                .any(|d| Arc::ptr_eq(d, descriptor)));
        }
        assert_eq!(store.digest(), Some("digest"));
    }

    #[test]
    fn default_store_is_empty() {
        let store = BackingStore::default();
        assert!(store.is_empty());
        assert!(store.lookup("a").is_empty());
        assert_eq!(store.expiration(), None);
    }
}
