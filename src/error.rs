//! Error types for the metadata provider

use libxml::parser::XmlParseError;
use thiserror::Error;

/// Failure reading service rows from the data source.
#[derive(Debug, Error)]
pub enum RowSourceError {
    /// Connect, query or row decoding failure
    #[error("Service row source unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),

    /// Failure raised by a non-SQL row source
    #[error("Service row source unavailable: {0}")]
    Other(String),
}

/// Failure producing or interpreting metadata bytes during a refresh.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error(transparent)]
    RowSource(#[from] RowSourceError),

    /// Marshalling of the synthesized tree failed
    #[error("Could not serialize EntitiesDescriptor: {0}")]
    Serialization(String),

    /// The fetched bytes are not well-formed XML
    #[error("Invalid XML: {0:?}")]
    InvalidXml(XmlParseError),

    /// Well-formed XML that is not usable SAML metadata
    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    /// The metadata root is no longer valid
    #[error("Metadata expired at {0}")]
    Expired(String),

    /// A metadata filter rejected the document
    #[error("Metadata filter failed: {0}")]
    Filter(String),

    #[error("Could not read metadata: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced to callers of the resolver.
#[derive(Debug, Error)]
pub enum ResolverError {
    /// Resolver used before `initialize` completed
    #[error("Metadata resolver '{0}' has not been initialized")]
    Uninitialized(String),

    /// Resolver used after `destroy`
    #[error("Metadata resolver '{0}' has been destroyed")]
    Destroyed(String),

    /// The first refresh failed while fail-fast initialization is enabled
    #[error("Metadata resolver '{id}' failed to initialize: {source}")]
    InitializationFailed {
        id: String,
        #[source]
        source: MetadataError,
    },

    /// A forced refresh failed; the previously published store is kept
    #[error("Metadata resolver '{id}' refresh failed: {source}")]
    RefreshFailed {
        id: String,
        #[source]
        source: MetadataError,
    },

    /// Refresh settings that cannot drive a schedule
    #[error("Metadata resolver '{id}' is misconfigured: {source}")]
    InvalidConfiguration {
        id: String,
        #[source]
        source: ReloadingConfigError,
    },

    /// Failure in the indexed lookup path
    #[error("Metadata lookup failed: {0}")]
    Lookup(String),
}

/// Refresh settings rejected by [`crate::ReloadingConfig::validate`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReloadingConfigError {
    #[error("{attribute} must be greater than zero")]
    ZeroDelay { attribute: &'static str },

    #[error("maxRefreshDelay must not be shorter than minRefreshDelay")]
    InvertedDelays,

    #[error("refreshDelayFactor must be a number between 0 and 1")]
    DelayFactor,
}

impl ReloadingConfigError {
    /// Name of the configuration attribute at fault.
    pub fn attribute(&self) -> &'static str {
        match self {
            ReloadingConfigError::ZeroDelay { attribute } => attribute,
            ReloadingConfigError::InvertedDelays => "maxRefreshDelay",
            ReloadingConfigError::DelayFactor => "refreshDelayFactor",
        }
    }
}

/// Declarative configuration problem, reported with the resource it was found in.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("{location}: dataSource configuration not found")]
    MissingDataSource { location: String },

    #[error("{location}: dataSource '{reference}' is not registered")]
    UnresolvedDataSource { location: String, reference: String },

    #[error("{location}: required attribute '{attribute}' not found")]
    MissingAttribute { location: String, attribute: String },

    #[error("{location}: invalid value '{value}' for attribute '{attribute}': {reason}")]
    InvalidAttribute {
        location: String,
        attribute: String,
        value: String,
        reason: String,
    },

    #[error("{location}: no DataSourceMetadataProvider element found")]
    MissingElement { location: String },

    #[error("{location}: invalid XML: {error:?}")]
    InvalidXml {
        location: String,
        error: XmlParseError,
    },
}

/// Result type for refresh-side metadata operations
pub type MetadataResult<T> = Result<T, MetadataError>;

/// Result type for resolver operations
pub type ResolverResult<T> = Result<T, ResolverError>;
