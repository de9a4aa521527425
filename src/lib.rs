//! Database-backed SAML 2.0 metadata provider.
//!
//! Each row of the `mpass_services` table becomes an SP `EntityDescriptor` with
//! one POST-binding assertion consumer service. The rows are serialized into an
//! `EntitiesDescriptor` document, parsed back like any other metadata source,
//! and published as an indexed snapshot that is refreshed in the background.

mod config;
mod error;
mod filter;
mod metadata;
mod reloading;
mod resolver;
mod row_source;
mod source;
mod store;
mod synthesizer;

pub use config::{
    parse_provider_configs, DataSourceMetadataProviderConfig, DataSourceMetadataProviderParser,
    DataSourceRegistry, ELEMENT_NAME, MPASS_METADATA_NAMESPACE,
};
pub use error::{
    ConfigurationError, MetadataError, MetadataResult, ReloadingConfigError, ResolverError,
    ResolverResult, RowSourceError,
};
pub use filter::{EntityPredicateFilter, MetadataFilter};
pub use metadata::{
    parse_metadata, AssertionConsumerService, EntityDescriptor, MetadataDocument,
    ProtocolBinding, SpSsoDescriptor,
};
pub use reloading::{ReloadingConfig, ReloadingMetadataResolver, ReloadingMetadataResolverBuilder};
pub use resolver::{
    CriteriaSet, DataSourceMetadataResolver, DataSourceMetadataResolverBuilder, EntityIdCriterion,
};
pub use row_source::{
    InMemoryRowSource, RowSource, ServiceRow, SqlRowSource, COLUMN_ID_ACS_URL,
    COLUMN_ID_ENTITY_ID, TABLE_NAME_SERVICES,
};
pub use source::{FilesystemMetadataSource, MetadataSource};
pub use store::BackingStore;
pub use synthesizer::{MetadataSynthesizer, XmlEncoding};

pub const SAML20MD_NS: &str = "urn:oasis:names:tc:SAML:2.0:metadata";

pub const SAML20P_NS: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
