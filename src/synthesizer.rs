use std::sync::Arc;

use async_trait::async_trait;
use yaserde::YaSerialize;

use crate::{
    error::{MetadataError, MetadataResult},
    row_source::{RowSource, ServiceRow},
    source::MetadataSource,
    ProtocolBinding, SAML20P_NS,
};

#[derive(YaSerialize)]
#[yaserde(
  namespaces = {
    "md" = "urn:oasis:names:tc:SAML:2.0:metadata",
  },
  prefix = "md"
)]
struct EntitiesDescriptor {
    #[yaserde(rename = "EntityDescriptor", prefix = "md")]
    entity_descriptors: Vec<EntityDescriptor>,
}

#[derive(YaSerialize)]
struct EntityDescriptor {
    #[yaserde(attribute = true, rename = "entityID")]
    entity_id: Option<String>,
    #[yaserde(rename = "SPSSODescriptor", prefix = "md")]
    sp_sso_descriptor: SPSSODescriptor,
}

#[derive(YaSerialize)]
struct SPSSODescriptor {
    #[yaserde(attribute = true, rename = "protocolSupportEnumeration")]
    protocol_support_enumeration: String,
    #[yaserde(rename = "AssertionConsumerService", prefix = "md")]
    assertion_consumer_service: AssertionConsumerService,
}

#[derive(YaSerialize)]
struct AssertionConsumerService {
    #[yaserde(attribute = true, rename = "Binding")]
    binding: String,
    #[yaserde(attribute = true, rename = "Location")]
    location: Option<String>,
    #[yaserde(attribute = true)]
    index: u32,
    #[yaserde(attribute = true, rename = "isDefault")]
    is_default: bool,
}

impl From<&ServiceRow> for EntityDescriptor {
    fn from(row: &ServiceRow) -> Self {
        EntityDescriptor {
            entity_id: row.entity_id.clone(),
            sp_sso_descriptor: SPSSODescriptor {
                protocol_support_enumeration: SAML20P_NS.into(),
                assertion_consumer_service: AssertionConsumerService {
                    binding: ProtocolBinding::Post.to_string(),
                    location: row.acs_url.clone(),
                    index: 1,
                    is_default: true,
                },
            },
        }
    }
}

/// Character encoding of the synthesized document.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum XmlEncoding {
    /// Big-endian with a byte order mark
    #[default]
    Utf16,
    Utf8,
}

impl XmlEncoding {
    pub fn name(&self) -> &'static str {
        match self {
            XmlEncoding::Utf16 => "UTF-16",
            XmlEncoding::Utf8 => "UTF-8",
        }
    }

    fn encode(&self, document: &str) -> Vec<u8> {
        match self {
            XmlEncoding::Utf16 => {
                let mut bytes = Vec::with_capacity(2 + document.len() * 2);
                bytes.extend_from_slice(&[0xFE, 0xFF]);
                for unit in document.encode_utf16() {
                    bytes.extend_from_slice(&unit.to_be_bytes());
                }
                bytes
            }
            XmlEncoding::Utf8 => document.as_bytes().to_vec(),
        }
    }
}

/// Builds an `md:EntitiesDescriptor` from the service rows, one SP entity per row.
pub struct MetadataSynthesizer {
    row_source: Arc<dyn RowSource>,
    encoding: XmlEncoding,
}

impl MetadataSynthesizer {
    pub fn new(row_source: Arc<dyn RowSource>) -> Self {
        Self {
            row_source,
            encoding: XmlEncoding::default(),
        }
    }

    pub fn encoding(self, encoding: XmlEncoding) -> Self {
        Self { encoding, ..self }
    }

    pub fn row_source(&self) -> &Arc<dyn RowSource> {
        &self.row_source
    }

    /// Serialize the rows, in order, as an encoded `EntitiesDescriptor` document.
    pub fn synthesize(&self, rows: &[ServiceRow]) -> MetadataResult<Vec<u8>> {
        let entities = EntitiesDescriptor {
            entity_descriptors: rows
                .iter()
                .map(|row| {
                    tracing::debug!(
                        entity_id = row.entity_id.as_deref().unwrap_or_default(),
                        "Added one entity descriptor"
                    );
                    EntityDescriptor::from(row)
                })
                .collect(),
        };

        let config = yaserde::ser::Config {
            perform_indent: false,
            write_document_declaration: false,
            indent_string: None,
        };
        let body = yaserde::ser::to_string_with_config(&entities, &config)
            .map_err(MetadataError::Serialization)?;
        let document = format!(
            "<?xml version=\"1.0\" encoding=\"{}\"?>{}",
            self.encoding.name(),
            body
        );
        tracing::trace!(
            document = %document,
            "Built the following element from the contents of the database"
        );

        Ok(self.encoding.encode(&document))
    }
}

#[async_trait]
impl MetadataSource for MetadataSynthesizer {
    async fn fetch_metadata(&self) -> MetadataResult<Vec<u8>> {
        tracing::trace!("Start fetching metadata");

        let rows = self.row_source.fetch_all().await.map_err(|e| {
            tracing::error!(error = %e, "Could not fetch the services from the database");
            MetadataError::from(e)
        })?;

        self.synthesize(&rows).map_err(|e| {
            tracing::error!(error = %e, "Could not marshall EntitiesDescriptor");
            e
        })
    }
}
