use std::{fmt::Display, str::FromStr};

use libxml::{
    parser::{Parser as XmlParser, ParserOptions},
    tree::Node,
};
use time::{format_description::well_known::Iso8601, OffsetDateTime};

use crate::{
    error::{MetadataError, MetadataResult},
    SAML20MD_NS,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolBinding {
    #[default]
    Post,
    Redirect,
}

impl Display for ProtocolBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ProtocolBinding::Post => write!(f, "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST"),
            ProtocolBinding::Redirect => {
                write!(f, "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect")
            }
        }
    }
}

impl FromStr for ProtocolBinding {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" => Ok(ProtocolBinding::Post),
            "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" => Ok(ProtocolBinding::Redirect),
            _ => Err(()),
        }
    }
}

/// An `md:AssertionConsumerService` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertionConsumerService {
    pub binding: String,
    /// Absent when the source had no URL for the endpoint
    pub location: Option<String>,
    pub index: u16,
    pub is_default: Option<bool>,
}

impl AssertionConsumerService {
    /// The binding as a known protocol binding, if it is one.
    pub fn protocol_binding(&self) -> Option<ProtocolBinding> {
        self.binding.parse().ok()
    }
}

/// An `md:SPSSODescriptor` role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpSsoDescriptor {
    pub supported_protocols: Vec<String>,
    pub assertion_consumer_services: Vec<AssertionConsumerService>,
}

impl SpSsoDescriptor {
    pub fn supports_protocol(&self, protocol: &str) -> bool {
        self.supported_protocols.iter().any(|p| p == protocol)
    }

    /// The ACS flagged `isDefault`, or else the first one without an explicit `false`.
    pub fn default_assertion_consumer_service(&self) -> Option<&AssertionConsumerService> {
        self.assertion_consumer_services
            .iter()
            .find(|acs| acs.is_default == Some(true))
            .or_else(|| {
                self.assertion_consumer_services
                    .iter()
                    .find(|acs| acs.is_default.is_none())
            })
            .or_else(|| self.assertion_consumer_services.first())
    }
}

/// An `md:EntityDescriptor` as held by the backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescriptor {
    pub entity_id: String,
    pub valid_until: Option<OffsetDateTime>,
    pub sp_sso_descriptors: Vec<SpSsoDescriptor>,
}

impl EntityDescriptor {
    /// The SP role supporting the given protocol, e.g. [`crate::SAML20P_NS`].
    pub fn sp_sso_descriptor(&self, protocol: &str) -> Option<&SpSsoDescriptor> {
        self.sp_sso_descriptors
            .iter()
            .find(|role| role.supports_protocol(protocol))
    }

    pub fn is_valid_at(&self, now: OffsetDateTime) -> bool {
        self.valid_until.map_or(true, |until| now < until)
    }
}

/// Result of unmarshalling a fetched metadata document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataDocument {
    pub valid_until: Option<OffsetDateTime>,
    pub entity_descriptors: Vec<EntityDescriptor>,
}

impl MetadataDocument {
    /// Earliest `validUntil` found at the root or on any kept descriptor.
    pub fn expiration(&self) -> Option<OffsetDateTime> {
        self.entity_descriptors
            .iter()
            .filter_map(|descriptor| descriptor.valid_until)
            .chain(self.valid_until)
            .min()
    }
}

/// Parse metadata bytes into descriptors.
///
/// The root must be an `md:EntitiesDescriptor` or `md:EntityDescriptor`. The
/// byte encoding is taken from the BOM or XML declaration. Descriptors lacking an
/// `entityID` or carrying a malformed ACS `index`/`isDefault` are dropped; an ACS
/// without a `Location` is kept as is. With `require_valid`, an expired root
/// fails the parse and expired descendants are dropped.
pub fn parse_metadata(
    input: &[u8],
    now: OffsetDateTime,
    require_valid: bool,
) -> MetadataResult<MetadataDocument> {
    let parser = XmlParser::default();

    // Without recovery a truncated document is an error instead of a repaired tree.
    let document = parser
        .parse_string_with_options(
            input,
            ParserOptions {
                recover: false,
                ..ParserOptions::default()
            },
        )
        .map_err(MetadataError::InvalidXml)?;

    let root = document
        .get_root_element()
        .ok_or_else(|| MetadataError::InvalidMetadata("document has no root element".into()))?;

    if !is_metadata_element(&root, "EntitiesDescriptor")
        && !is_metadata_element(&root, "EntityDescriptor")
    {
        return Err(MetadataError::InvalidMetadata(format!(
            "unexpected root element {}",
            root.get_name()
        )));
    }

    let valid_until = parse_valid_until(&root)?;
    if require_valid {
        if let Some(until) = valid_until {
            if now >= until {
                return Err(MetadataError::Expired(until.to_string()));
            }
        }
    }

    let mut entity_descriptors = Vec::new();
    collect_descriptors(&root, now, require_valid, &mut entity_descriptors)?;

    Ok(MetadataDocument {
        valid_until,
        entity_descriptors,
    })
}

fn collect_descriptors(
    node: &Node,
    now: OffsetDateTime,
    require_valid: bool,
    out: &mut Vec<EntityDescriptor>,
) -> MetadataResult<()> {
    if is_metadata_element(node, "EntityDescriptor") {
        if let Some(descriptor) = parse_entity_descriptor(node)? {
            if require_valid && !descriptor.is_valid_at(now) {
                tracing::warn!(
                    entity_id = %descriptor.entity_id,
                    "Dropping expired EntityDescriptor"
                );
            } else {
                out.push(descriptor);
            }
        }
        return Ok(());
    }

    if is_metadata_element(node, "EntitiesDescriptor") {
        let valid_until = parse_valid_until(node)?;
        if require_valid && valid_until.is_some_and(|until| now >= until) {
            tracing::warn!(
                name = %node.get_attribute("Name").unwrap_or_default(),
                "Dropping expired nested EntitiesDescriptor"
            );
            return Ok(());
        }
        for child in node.get_child_elements() {
            collect_descriptors(&child, now, require_valid, out)?;
        }
    }

    Ok(())
}

fn parse_entity_descriptor(node: &Node) -> MetadataResult<Option<EntityDescriptor>> {
    let entity_id = match node.get_attribute("entityID") {
        Some(id) if !id.trim().is_empty() => id,
        _ => {
            tracing::warn!("Dropping EntityDescriptor without an entityID");
            return Ok(None);
        }
    };

    let mut sp_sso_descriptors = Vec::new();
    for role in node.get_child_elements() {
        if !is_metadata_element(&role, "SPSSODescriptor") {
            continue;
        }
        match parse_sp_sso_descriptor(&role) {
            Some(descriptor) => sp_sso_descriptors.push(descriptor),
            None => {
                tracing::warn!(
                    entity_id = %entity_id,
                    "Dropping EntityDescriptor with an invalid AssertionConsumerService"
                );
                return Ok(None);
            }
        }
    }

    Ok(Some(EntityDescriptor {
        valid_until: parse_valid_until(node)?,
        entity_id,
        sp_sso_descriptors,
    }))
}

fn parse_sp_sso_descriptor(node: &Node) -> Option<SpSsoDescriptor> {
    let supported_protocols = node
        .get_attribute("protocolSupportEnumeration")
        .unwrap_or_default()
        .split_whitespace()
        .map(String::from)
        .collect();

    let mut assertion_consumer_services = Vec::new();
    for endpoint in node.get_child_elements() {
        if !is_metadata_element(&endpoint, "AssertionConsumerService") {
            continue;
        }
        let location = endpoint.get_attribute("Location");
        let index = endpoint.get_attribute("index")?.trim().parse().ok()?;
        let is_default = match endpoint.get_attribute("isDefault").as_deref() {
            None => None,
            Some("true") | Some("1") => Some(true),
            Some("false") | Some("0") => Some(false),
            Some(_) => return None,
        };
        assertion_consumer_services.push(AssertionConsumerService {
            binding: endpoint.get_attribute("Binding").unwrap_or_default(),
            location,
            index,
            is_default,
        });
    }

    Some(SpSsoDescriptor {
        supported_protocols,
        assertion_consumer_services,
    })
}

fn parse_valid_until(node: &Node) -> MetadataResult<Option<OffsetDateTime>> {
    node.get_attribute("validUntil")
        .map(|value| {
            OffsetDateTime::parse(value.trim(), &Iso8601::DEFAULT).map_err(|_| {
                MetadataError::InvalidMetadata(format!("invalid validUntil '{value}'"))
            })
        })
        .transpose()
}

fn is_metadata_element(node: &Node, local_name: &str) -> bool {
    node.get_name() == local_name
        && node
            .get_namespace()
            .is_some_and(|ns| ns.get_href() == SAML20MD_NS)
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use crate::SAML20P_NS;

    use super::*;

    const SAMPLE_METADATA: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<md:EntitiesDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata">
  <md:EntityDescriptor entityID="https://sp.example.org/one">
    <md:SPSSODescriptor protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">
      <md:AssertionConsumerService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="https://sp.example.org/one/acs" index="1" isDefault="true"/>
    </md:SPSSODescriptor>
  </md:EntityDescriptor>
  <md:EntitiesDescriptor Name="nested">
    <md:EntityDescriptor entityID="https://sp.example.org/two">
      <md:SPSSODescriptor protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">
        <md:AssertionConsumerService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="https://sp.example.org/two/acs" index="3"/>
      </md:SPSSODescriptor>
    </md:EntityDescriptor>
  </md:EntitiesDescriptor>
  <md:EntityDescriptor entityID="">
    <md:SPSSODescriptor protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol"/>
  </md:EntityDescriptor>
  <md:EntityDescriptor entityID="https://sp.example.org/no-location">
    <md:SPSSODescriptor protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">
      <md:AssertionConsumerService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" index="1"/>
    </md:SPSSODescriptor>
  </md:EntityDescriptor>
</md:EntitiesDescriptor>"#;

    #[test]
    fn parses_and_flattens_descriptors() {
        let document =
            parse_metadata(SAMPLE_METADATA.as_bytes(), OffsetDateTime::now_utc(), true).unwrap();

        let ids: Vec<_> = document
            .entity_descriptors
            .iter()
            .map(|d| d.entity_id.as_str())
            .collect();
        assert_eq!(
            ids,
            [
                "https://sp.example.org/one",
                "https://sp.example.org/two",
                "https://sp.example.org/no-location"
            ]
        );

        let one = &document.entity_descriptors[0];
        let acs = one
            .sp_sso_descriptor(SAML20P_NS)
            .unwrap()
            .default_assertion_consumer_service()
            .unwrap();
        assert_eq!(acs.protocol_binding(), Some(ProtocolBinding::Post));
        assert_eq!(acs.location.as_deref(), Some("https://sp.example.org/one/acs"));
        assert_eq!(acs.index, 1);
        assert_eq!(acs.is_default, Some(true));

        let two = &document.entity_descriptors[1].sp_sso_descriptors[0];
        assert_eq!(
            two.assertion_consumer_services[0].protocol_binding(),
            Some(ProtocolBinding::Redirect)
        );
        assert_eq!(two.assertion_consumer_services[0].is_default, None);

        let no_location = &document.entity_descriptors[2].sp_sso_descriptors[0];
        assert_eq!(no_location.assertion_consumer_services[0].location, None);
        assert_eq!(document.expiration(), None);
    }

    #[test]
    fn malformed_acs_index_drops_descriptor() {
        let xml = r#"<md:EntitiesDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata">
  <md:EntityDescriptor entityID="https://bad.example.org">
    <md:SPSSODescriptor protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">
      <md:AssertionConsumerService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="https://bad.example.org/acs" index="first"/>
    </md:SPSSODescriptor>
  </md:EntityDescriptor>
  <md:EntityDescriptor entityID="https://good.example.org"/>
</md:EntitiesDescriptor>"#;

        let document = parse_metadata(xml.as_bytes(), OffsetDateTime::now_utc(), true).unwrap();
        assert_eq!(document.entity_descriptors.len(), 1);
        assert_eq!(document.entity_descriptors[0].entity_id, "https://good.example.org");
    }

    #[test]
    fn rejects_foreign_root() {
        let result = parse_metadata(
            b"<root xmlns=\"urn:example\"/>",
            OffsetDateTime::now_utc(),
            true,
        );
        assert!(matches!(result, Err(MetadataError::InvalidMetadata(_))));
    }

    #[test]
    fn rejects_malformed_xml() {
        let result = parse_metadata(b"<md:Entities", OffsetDateTime::now_utc(), true);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_truncated_document() {
        let xml = r#"<md:EntitiesDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata">
  <md:EntityDescriptor entityID="https://sp.example.org/one"/>
  <md:EntityDescriptor entityID="https://sp.example.org/two">
    <md:SPSSODescriptor protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">"#;

        assert!(matches!(
            parse_metadata(xml.as_bytes(), OffsetDateTime::now_utc(), true),
            Err(MetadataError::InvalidXml(_))
        ));
    }

    #[test]
    fn expired_root_only_rejected_when_validity_required() {
        let xml = r#"<md:EntitiesDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" validUntil="2020-01-01T00:00:00Z"/>"#;
        let now = OffsetDateTime::now_utc();

        assert!(matches!(
            parse_metadata(xml.as_bytes(), now, true),
            Err(MetadataError::Expired(_))
        ));
        let document = parse_metadata(xml.as_bytes(), now, false).unwrap();
        assert!(document.valid_until.is_some());
        assert!(document.entity_descriptors.is_empty());
    }

    #[test]
    fn expired_descriptor_dropped() {
        let now = OffsetDateTime::parse("2025-06-01T00:00:00Z", &Iso8601::DEFAULT).unwrap();
        let xml = r#"<md:EntitiesDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata">
  <md:EntityDescriptor entityID="https://old.example.org" validUntil="2025-01-01T00:00:00Z"/>
  <md:EntityDescriptor entityID="https://new.example.org" validUntil="2025-07-01T00:00:00Z"/>
</md:EntitiesDescriptor>"#;

        let document = parse_metadata(xml.as_bytes(), now, true).unwrap();
        assert_eq!(document.entity_descriptors.len(), 1);
        assert_eq!(document.entity_descriptors[0].entity_id, "https://new.example.org");
        assert_eq!(
            document.expiration().map(|e| e - now),
            Some(Duration::days(30))
        );
    }

    #[test]
    fn single_entity_descriptor_root() {
        let xml = r#"<EntityDescriptor xmlns="urn:oasis:names:tc:SAML:2.0:metadata" entityID="https://sp.example.org"/>"#;
        let document = parse_metadata(xml.as_bytes(), OffsetDateTime::now_utc(), true).unwrap();
        assert_eq!(document.entity_descriptors.len(), 1);
        assert!(document.entity_descriptors[0].sp_sso_descriptors.is_empty());
    }

    #[test]
    fn protocol_binding_round_trips_through_display() {
        for binding in [ProtocolBinding::Post, ProtocolBinding::Redirect] {
            assert_eq!(binding.to_string().parse(), Ok(binding));
        }
        assert_eq!("urn:example".parse::<ProtocolBinding>(), Err(()));
    }
}
