pub mod channel;
mod connection;
mod dispatch;
mod error;
pub mod event;
mod initiator;
mod remote;
mod safe;
mod service;

pub use connection::{Connection, ConnectionState, ConnectionStatsSnapshot};
pub use error::Error;
pub use gridlink_config as config;
pub use gridlink_net as net;
pub use initiator::{TcpInitiator, TcpInitiatorConfig};
pub use remote::RemoteService;
pub use safe::{SafeService, SafeServiceState, Subject};
pub use service::{ServiceKind, ServiceState};

pub type Result<T> = core::result::Result<T, Error>;
