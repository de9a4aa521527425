//! Filters applied to parsed metadata before it is indexed

use std::sync::Arc;

use crate::{
    error::MetadataResult,
    metadata::{EntityDescriptor, MetadataDocument},
};

/// Transforms or rejects a parsed document. An error rejects the whole refresh.
pub trait MetadataFilter: Send + Sync {
    fn filter(&self, document: MetadataDocument) -> MetadataResult<MetadataDocument>;
}

/// Keeps only the descriptors matching a predicate.
pub struct EntityPredicateFilter<F> {
    predicate: F,
}

impl<F> EntityPredicateFilter<F>
where
    F: Fn(&EntityDescriptor) -> bool + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> MetadataFilter for EntityPredicateFilter<F>
where
    F: Fn(&EntityDescriptor) -> bool + Send + Sync,
{
    fn filter(&self, mut document: MetadataDocument) -> MetadataResult<MetadataDocument> {
        document.entity_descriptors.retain(|descriptor| {
            let keep = (self.predicate)(descriptor);
            if !keep {
                tracing::debug!(entity_id = %descriptor.entity_id, "Filtered out entity");
            }
            keep
        });
        Ok(document)
    }
}

/// Run each filter in order.
pub(crate) fn apply_filters(
    filters: &[Arc<dyn MetadataFilter>],
    document: MetadataDocument,
) -> MetadataResult<MetadataDocument> {
    filters
        .iter()
        .try_fold(document, |document, filter| filter.filter(document))
}
