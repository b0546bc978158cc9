//! Operational context: the process-wide facts and factories a remote
//! service consumes, resolved once from operational configuration.

use std::{collections::HashMap, sync::Arc};

use gridlink_net::provider::{AddressProvider, ConfigurableAddressProvider};

use crate::{Error, Result, XmlElement};

/// Identity the local process presents to the cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemberIdentity {
    pub cluster_name: String,
    pub site_name: String,
    pub machine_name: String,
    pub process_name: String,
    pub member_name: String,
}

impl MemberIdentity {
    fn from_xml(xml: &XmlElement) -> Self {
        Self {
            cluster_name: xml.string_of("cluster-name", ""),
            site_name: xml.string_of("site-name", ""),
            machine_name: xml.string_of("machine-name", ""),
            process_name: xml.string_of("process-name", ""),
            member_name: xml.string_of("member-name", ""),
        }
    }
}

/// Payload serializer; the concrete wire representation lives above this
/// crate.
pub trait Serializer: Send + Sync {
    fn name(&self) -> &str;
}

pub trait SerializerFactory: Send + Sync {
    fn create_serializer(&self) -> Arc<dyn Serializer>;
}

/// Validates a security token presented on connection open.
pub trait IdentityAsserter: Send + Sync {
    fn assert_identity(&self, token: &[u8]) -> Result<()>;
}

/// Produces the security token sent on connection open.
pub trait IdentityTransformer: Send + Sync {
    fn transform_identity(&self, principal: &str) -> Result<Vec<u8>>;
}

/// Produces an [`AddressProvider`] on demand.
pub trait AddressProviderFactory: Send + Sync {
    fn create_provider(&self) -> Result<Box<dyn AddressProvider>>;
}

/// Factory over an inline address list configuration.
pub struct ConfigurableAddressProviderFactory {
    config: XmlElement,
}

impl ConfigurableAddressProviderFactory {
    pub fn new(config: XmlElement) -> Self {
        Self { config }
    }
}

impl AddressProviderFactory for ConfigurableAddressProviderFactory {
    fn create_provider(&self) -> Result<Box<dyn AddressProvider>> {
        let addresses = parse_socket_addresses(&self.config)?;
        Ok(Box::new(ConfigurableAddressProvider::new(addresses, true)?))
    }
}

/// Extracts `(host, port)` pairs from an address-list element. Accepts
/// `socket-address` children as well as bare `address`/`host-address`
/// children (which carry port zero for the name service to fill in).
pub fn parse_socket_addresses(xml: &XmlElement) -> Result<Vec<(String, i64)>> {
    let mut addresses = Vec::new();
    for child in xml.children() {
        let (host, port) = match child.name() {
            "socket-address" => {
                (child.string_of("address", ""), child.i64_of("port", 0)?)
            }
            "address" | "host-address" => (child.text().to_string(), 0),
            _ => continue,
        };
        if host.is_empty() {
            continue;
        }
        if !(0..=0xFFFF).contains(&port) {
            return Err(Error::illegal_argument(format!(
                "invalid configuration element: the \"{}\" port {port} is out of range",
                child.name()
            )));
        }
        addresses.push((host, port));
    }
    Ok(addresses)
}

/// Everything a remote service consumes from the operational layer: the
/// local member identity, named factories and the logging/discovery knobs.
pub struct OperationalContext {
    local_member: MemberIdentity,
    address_provider_factories: HashMap<String, Arc<dyn AddressProviderFactory>>,
    serializer_factories: HashMap<String, Arc<dyn SerializerFactory>>,
    filters: HashMap<String, XmlElement>,
    identity_asserter: Option<Arc<dyn IdentityAsserter>>,
    identity_transformer: Option<Arc<dyn IdentityTransformer>>,
    discovery_ttl: u32,
    log_destination: String,
    log_severity: i32,
}

impl Default for OperationalContext {
    fn default() -> Self {
        Self {
            local_member: MemberIdentity::default(),
            address_provider_factories: HashMap::new(),
            serializer_factories: HashMap::new(),
            filters: HashMap::new(),
            identity_asserter: None,
            identity_transformer: None,
            discovery_ttl: 4,
            log_destination: "stderr".to_string(),
            log_severity: 5,
        }
    }
}

impl OperationalContext {
    /// Builds a context from an operational configuration document.
    pub fn from_xml(xml: &XmlElement) -> Result<Self> {
        let mut ctx = Self::default();

        if let Some(identity) = xml.element("member-identity") {
            ctx.local_member = MemberIdentity::from_xml(identity);
        }

        if let Some(providers) = xml.element("address-providers") {
            for provider in providers.elements("address-provider") {
                let Some(name) = provider.attribute("id") else {
                    return Err(Error::illegal_argument(
                        "address-provider element is missing its \"id\" attribute",
                    ));
                };
                ctx.address_provider_factories.insert(
                    name.to_string(),
                    Arc::new(ConfigurableAddressProviderFactory::new(provider.clone())),
                );
            }
        }

        if let Some(filters) = xml.element("filters") {
            for filter in filters.elements("filter") {
                if let Some(name) = filter.attribute("id") {
                    ctx.filters.insert(name.to_string(), filter.clone());
                }
            }
        }

        if let Some(logging) = xml.element("logging-config") {
            ctx.log_destination = logging.string_of("destination", &ctx.log_destination);
            ctx.log_severity = logging.i64_of("severity-level", i64::from(ctx.log_severity))? as i32;
        }

        if let Some(multicast) = xml.element("multicast-listener") {
            ctx.discovery_ttl = multicast.i64_of("time-to-live", i64::from(ctx.discovery_ttl))? as u32;
        }

        Ok(ctx)
    }

    pub fn local_member(&self) -> &MemberIdentity {
        &self.local_member
    }

    pub fn set_local_member(&mut self, member: MemberIdentity) {
        self.local_member = member;
    }

    pub fn address_provider_factory(&self, name: &str) -> Option<Arc<dyn AddressProviderFactory>> {
        self.address_provider_factories.get(name).cloned()
    }

    pub fn register_address_provider_factory(
        &mut self,
        name: impl Into<String>,
        factory: Arc<dyn AddressProviderFactory>,
    ) {
        self.address_provider_factories.insert(name.into(), factory);
    }

    pub fn serializer_factory(&self, name: &str) -> Option<Arc<dyn SerializerFactory>> {
        self.serializer_factories.get(name).cloned()
    }

    pub fn register_serializer_factory(
        &mut self,
        name: impl Into<String>,
        factory: Arc<dyn SerializerFactory>,
    ) {
        self.serializer_factories.insert(name.into(), factory);
    }

    pub fn filter(&self, name: &str) -> Option<&XmlElement> {
        self.filters.get(name)
    }

    pub fn identity_asserter(&self) -> Option<Arc<dyn IdentityAsserter>> {
        self.identity_asserter.clone()
    }

    pub fn set_identity_asserter(&mut self, asserter: Arc<dyn IdentityAsserter>) {
        self.identity_asserter = Some(asserter);
    }

    pub fn identity_transformer(&self) -> Option<Arc<dyn IdentityTransformer>> {
        self.identity_transformer.clone()
    }

    pub fn set_identity_transformer(&mut self, transformer: Arc<dyn IdentityTransformer>) {
        self.identity_transformer = Some(transformer);
    }

    pub fn discovery_ttl(&self) -> u32 {
        self.discovery_ttl
    }

    pub fn log_destination(&self) -> &str {
        &self.log_destination
    }

    pub fn log_severity(&self) -> i32 {
        self.log_severity
    }
}
