//! Declarative configuration for [`DataSourceMetadataResolver`]
//!
//! Binds `DataSourceMetadataProvider` elements in the `urn:mpassid:shib3:metadata`
//! namespace to resolvers, for example:
//!
//! ```xml
//! <MetadataProvider xmlns:mpass="urn:mpassid:shib3:metadata" id="chain">
//!   <mpass:DataSourceMetadataProvider id="dataSourceEntity"
//!       dataSource="shibboleth.MySQLDataSource" maxRefreshDelay="30m"/>
//! </MetadataProvider>
//! ```
//!
//! `dataSource` names a row source registered in a [`DataSourceRegistry`].

use std::{collections::HashMap, sync::Arc, time::Duration};

use libxml::{
    parser::{Parser as XmlParser, ParserOptions},
    tree::Node,
    xpath::Context,
};

use crate::{
    error::ConfigurationError,
    reloading::ReloadingConfig,
    resolver::DataSourceMetadataResolver,
    row_source::{RowSource, SqlRowSource},
};

/// The namespace for the metadata parser.
pub const MPASS_METADATA_NAMESPACE: &str = "urn:mpassid:shib3:metadata";

/// Element name.
pub const ELEMENT_NAME: &str = "DataSourceMetadataProvider";

/// Named data sources that configuration may reference.
#[derive(Clone, Default)]
pub struct DataSourceRegistry {
    sources: HashMap<String, Arc<dyn RowSource>>,
}

impl DataSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, source: Arc<dyn RowSource>) {
        self.sources.insert(name.into(), source);
    }

    /// Register a lazily connecting SQL data source for a database URL.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn register_url(&mut self, name: &str, url: &str) -> Result<(), sqlx::Error> {
        let source = SqlRowSource::connect_lazy(url)?;
        self.register(name, Arc::new(source));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RowSource>> {
        self.sources.get(name).cloned()
    }
}

/// Settings read from one `DataSourceMetadataProvider` element.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSourceMetadataProviderConfig {
    pub id: String,
    pub data_source: String,
    pub reloading: ReloadingConfig,
}

/// Parser for `DataSourceMetadataProvider` elements.
pub struct DataSourceMetadataProviderParser<'a> {
    registry: &'a DataSourceRegistry,
}

impl<'a> DataSourceMetadataProviderParser<'a> {
    pub fn new(registry: &'a DataSourceRegistry) -> Self {
        Self { registry }
    }

    /// Build an uninitialized resolver for every provider element in the document.
    ///
    /// `resource` describes where the document came from and is used as the
    /// location of any error.
    pub fn parse(
        &self,
        resource: &str,
        input: &[u8],
    ) -> Result<Vec<DataSourceMetadataResolver>, ConfigurationError> {
        parse_provider_configs(resource, input)?
            .into_iter()
            .map(|config| self.build(resource, config))
            .collect()
    }

    fn build(
        &self,
        resource: &str,
        config: DataSourceMetadataProviderConfig,
    ) -> Result<DataSourceMetadataResolver, ConfigurationError> {
        let source = self.registry.get(&config.data_source).ok_or_else(|| {
            tracing::error!(
                data_source = %config.data_source,
                "{}: dataSource is not registered",
                resource
            );
            ConfigurationError::UnresolvedDataSource {
                location: resource.into(),
                reference: config.data_source.clone(),
            }
        })?;

        tracing::debug!(
            metadata_id = %config.id,
            data_source = %config.data_source,
            "Configured DataSourceMetadataProvider"
        );
        Ok(DataSourceMetadataResolver::builder(&config.id, source)
            .config(config.reloading)
            .build())
    }
}

/// Read the settings of every provider element without resolving data sources.
pub fn parse_provider_configs(
    resource: &str,
    input: &[u8],
) -> Result<Vec<DataSourceMetadataProviderConfig>, ConfigurationError> {
    let parser = XmlParser::default();
    let document = parser
        .parse_string_with_options(
            input,
            ParserOptions {
                recover: false,
                ..ParserOptions::default()
            },
        )
        .map_err(|error| ConfigurationError::InvalidXml {
            location: resource.into(),
            error,
        })?;

    let missing = || ConfigurationError::MissingElement {
        location: resource.into(),
    };
    let mut context = Context::new(&document).map_err(|_| missing())?;
    context
        .register_namespace("mpass", MPASS_METADATA_NAMESPACE)
        .map_err(|_| missing())?;
    let nodes = context
        .evaluate(&format!("//mpass:{ELEMENT_NAME}"))
        .map_err(|_| missing())?
        .get_nodes_as_vec();

    if nodes.is_empty() {
        return Err(missing());
    }
    nodes
        .iter()
        .map(|node| parse_provider_element(resource, node))
        .collect()
}

fn parse_provider_element(
    resource: &str,
    element: &Node,
) -> Result<DataSourceMetadataProviderConfig, ConfigurationError> {
    let id = trimmed_attribute(element, "id").ok_or_else(|| {
        ConfigurationError::MissingAttribute {
            location: resource.into(),
            attribute: "id".into(),
        }
    })?;

    let Some(data_source) = trimmed_attribute(element, "dataSource") else {
        tracing::error!("{}: dataSource configuration not found", resource);
        return Err(ConfigurationError::MissingDataSource {
            location: resource.into(),
        });
    };

    let defaults = ReloadingConfig::default();
    let min_refresh_delay = duration_attribute(resource, element, "minRefreshDelay")?
        .unwrap_or(defaults.min_refresh_delay);
    let max_refresh_delay = duration_attribute(resource, element, "maxRefreshDelay")?
        .unwrap_or(defaults.max_refresh_delay);

    let refresh_delay_factor = match trimmed_attribute(element, "refreshDelayFactor") {
        None => defaults.refresh_delay_factor,
        Some(value) => value.parse::<f32>().map_err(|_| {
            invalid(
                resource,
                "refreshDelayFactor",
                &value,
                "must be a number between 0 and 1",
            )
        })?,
    };

    let reloading = ReloadingConfig {
        min_refresh_delay,
        max_refresh_delay,
        refresh_delay_factor,
        ..defaults
    };
    reloading.validate().map_err(|e| {
        let value = match e.attribute() {
            "minRefreshDelay" => humantime::format_duration(min_refresh_delay).to_string(),
            "maxRefreshDelay" => humantime::format_duration(max_refresh_delay).to_string(),
            _ => refresh_delay_factor.to_string(),
        };
        invalid(resource, e.attribute(), &value, &e.to_string())
    })?;

    Ok(DataSourceMetadataProviderConfig {
        id,
        data_source,
        reloading,
    })
}

fn trimmed_attribute(element: &Node, name: &str) -> Option<String> {
    element
        .get_attribute(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn duration_attribute(
    resource: &str,
    element: &Node,
    name: &str,
) -> Result<Option<Duration>, ConfigurationError> {
    trimmed_attribute(element, name)
        .map(|value| {
            humantime::parse_duration(&value)
                .map_err(|e| invalid(resource, name, &value, &e.to_string()))
        })
        .transpose()
}

fn invalid(resource: &str, attribute: &str, value: &str, reason: &str) -> ConfigurationError {
    ConfigurationError::InvalidAttribute {
        location: resource.into(),
        attribute: attribute.into(),
        value: value.into(),
        reason: reason.into(),
    }
}
