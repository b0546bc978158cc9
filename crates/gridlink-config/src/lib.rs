mod context;
mod error;
pub mod xml;

pub use context::{
    AddressProviderFactory, ConfigurableAddressProviderFactory, IdentityAsserter,
    IdentityTransformer, MemberIdentity, OperationalContext, Serializer, SerializerFactory,
    parse_socket_addresses,
};
pub use error::Error;
pub use xml::XmlElement;

pub type Result<T> = core::result::Result<T, Error>;
