//! Seams to the messaging layer above framing.
//!
//! The channel owns everything inside a frame: the open negotiation, the
//! payload encoding and the request/response bookkeeping. This crate only
//! moves frames and tells the channel when its connection comes and goes.

use std::sync::Arc;

use crate::{Connection, Error, Result, service::ServiceKind};

/// Result of the channel-open negotiation on a fresh connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpenOutcome {
    Accepted,
    /// The peer wants the client elsewhere: `(host, subport-encoded port)`
    /// pairs to try in order. The endpoint that redirected is not at fault.
    Redirect(Vec<(String, i32)>),
}

pub trait Channel: Send + Sync {
    /// Performs the open negotiation. The connection is live: frames may be
    /// sent and will be delivered to [`Channel::on_frame`] while this call
    /// is in progress.
    fn open(&self, connection: &Connection) -> Result<OpenOutcome>;

    /// One inbound frame, delivered in wire order by the connection's
    /// reader task.
    fn on_frame(&self, frame: Vec<u8>);

    /// The connection closed on request.
    fn connection_closed(&self);

    /// The connection failed mid-session.
    fn connection_error(&self, cause: &Error);

    /// Resolves a service name to `(host, subport-encoded port)`. Only the
    /// name-service channel answers this.
    fn lookup(&self, _name: &str) -> Result<Option<(String, i32)>> {
        Err(Error::illegal_state("channel does not support name lookup"))
    }
}

/// Creates the channel for each service incarnation.
pub trait ChannelFactory: Send + Sync {
    fn create_channel(&self, kind: ServiceKind, service_name: &str) -> Arc<dyn Channel>;
}
