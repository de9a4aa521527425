//! Metadata resolver over the services table

use std::sync::Arc;

use crate::{
    error::ResolverResult,
    filter::MetadataFilter,
    metadata::EntityDescriptor,
    reloading::{ReloadingConfig, ReloadingMetadataResolver},
    row_source::RowSource,
    synthesizer::{MetadataSynthesizer, XmlEncoding},
};

/// Selects descriptors by `entityID`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityIdCriterion {
    entity_id: String,
}

impl EntityIdCriterion {
    pub fn new(entity_id: &str) -> Self {
        Self {
            entity_id: entity_id.into(),
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }
}

/// Lookup criteria. An empty set matches every descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CriteriaSet {
    entity_id: Option<EntityIdCriterion>,
}

impl CriteriaSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_entity_id(entity_id: &str) -> Self {
        Self::new().with(EntityIdCriterion::new(entity_id))
    }

    pub fn with(self, criterion: EntityIdCriterion) -> Self {
        Self {
            entity_id: Some(criterion),
        }
    }

    pub fn entity_id(&self) -> Option<&EntityIdCriterion> {
        self.entity_id.as_ref()
    }
}

pub struct DataSourceMetadataResolverBuilder {
    id: String,
    row_source: Arc<dyn RowSource>,
    config: ReloadingConfig,
    encoding: XmlEncoding,
    filters: Vec<Arc<dyn MetadataFilter>>,
}

impl DataSourceMetadataResolverBuilder {
    pub fn new(id: &str, row_source: Arc<dyn RowSource>) -> Self {
        Self {
            id: id.into(),
            row_source,
            config: ReloadingConfig::default(),
            encoding: XmlEncoding::default(),
            filters: Vec::new(),
        }
    }

    pub fn config(self, config: ReloadingConfig) -> Self {
        Self { config, ..self }
    }

    pub fn encoding(self, encoding: XmlEncoding) -> Self {
        Self { encoding, ..self }
    }

    pub fn filter(mut self, filter: Arc<dyn MetadataFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn build(self) -> DataSourceMetadataResolver {
        let synthesizer = MetadataSynthesizer::new(self.row_source).encoding(self.encoding);

        let reloading = self
            .filters
            .into_iter()
            .fold(
                ReloadingMetadataResolver::builder(self.id, synthesizer).config(self.config),
                |builder, filter| builder.filter(filter),
            )
            .build();

        DataSourceMetadataResolver { reloading }
    }
}

/// SAML metadata resolver whose entities are synthesized from the services table.
///
/// Every row becomes one SP `EntityDescriptor` with a single POST-binding ACS.
pub struct DataSourceMetadataResolver {
    reloading: ReloadingMetadataResolver<MetadataSynthesizer>,
}

impl DataSourceMetadataResolver {
    /// Resolver with the default refresh settings.
    pub fn new(id: &str, row_source: Arc<dyn RowSource>) -> Self {
        Self::builder(id, row_source).build()
    }

    pub fn builder(id: &str, row_source: Arc<dyn RowSource>) -> DataSourceMetadataResolverBuilder {
        DataSourceMetadataResolverBuilder::new(id, row_source)
    }

    pub fn id(&self) -> &str {
        self.reloading.metadata_identifier()
    }

    pub fn metadata_identifier(&self) -> &str {
        self.reloading.metadata_identifier()
    }

    pub fn row_source(&self) -> &Arc<dyn RowSource> {
        self.reloading.source().row_source()
    }

    pub fn is_fail_fast_initialization(&self) -> bool {
        self.reloading.is_fail_fast_initialization()
    }

    pub fn is_require_valid_metadata(&self) -> bool {
        self.reloading.is_require_valid_metadata()
    }

    /// Refresh bookkeeping and the published store.
    pub fn reloading(&self) -> &ReloadingMetadataResolver<MetadataSynthesizer> {
        &self.reloading
    }

    pub async fn initialize(&self) -> ResolverResult<()> {
        self.reloading.initialize().await
    }

    pub async fn refresh(&self) -> ResolverResult<()> {
        self.reloading.refresh().await
    }

    pub async fn destroy(&self) {
        self.reloading.destroy().await
    }

    /// Descriptors matching the criteria.
    ///
    /// Without an entity id criterion (or with an empty one) this is a copy of all
    /// descriptors in row order; otherwise the descriptors with that `entityID`.
    pub fn resolve(&self, criteria: &CriteriaSet) -> ResolverResult<Vec<Arc<EntityDescriptor>>> {
        match criteria.entity_id() {
            Some(criterion) if !criterion.entity_id().is_empty() => {
                self.reloading.lookup_entity_id(criterion.entity_id())
            }
            _ => self.reloading.ordered_descriptors(),
        }
    }

    /// First descriptor matching the criteria, if any.
    pub fn resolve_single(
        &self,
        criteria: &CriteriaSet,
    ) -> ResolverResult<Option<Arc<EntityDescriptor>>> {
        Ok(self.resolve(criteria)?.into_iter().next())
    }
}
