//! Accept/reject-aware sources of cluster endpoints.
//!
//! The initiator walks a provider until an endpoint is accepted: every
//! handed-out endpoint stays pending until `accept` commits the cycle or a
//! full pass over the configured holders comes up empty. The holder order
//! is shuffled once at load so a fleet of clients spreads across the
//! cluster, but stays deterministic under rejection within one process.

use std::{
    collections::VecDeque,
    fmt,
    net::{SocketAddr, ToSocketAddrs},
};

use rand::seq::SliceRandom;
use tracing::warn;

use crate::{Error, Result};

pub trait AddressProvider: Send + fmt::Display {
    /// Next resolved endpoint, or `None` once a full cycle has been walked
    /// without an accept. The call after `None` starts a fresh cycle.
    fn next_address(&mut self) -> Result<Option<SocketAddr>>;

    /// Commits the most recently returned endpoint.
    fn accept(&mut self);

    /// Marks the most recently returned endpoint bad for this cycle.
    fn reject(&mut self, cause: Option<&dyn std::error::Error>);
}

/// One configured `host:port` pair plus its iteration state.
#[derive(Clone, Debug)]
struct AddressHolder {
    host: String,
    port: u16,
    /// Handed out but neither accepted nor rejected this cycle.
    pending: bool,
    /// An unresolvable host is only reported once.
    reported: bool,
}

impl AddressHolder {
    fn new(host: impl Into<String>, port: i64) -> Result<Self> {
        let host = host.into();
        if host.is_empty() {
            return Err(Error::illegal_argument("address host may not be empty"));
        }
        if !(0..=0xFFFF).contains(&port) {
            return Err(Error::illegal_argument(format!(
                "port {port} out of range of 0 to {}",
                0xFFFF
            )));
        }
        Ok(Self { host, port: port as u16, pending: false, reported: false })
    }
}

/// Provider over a configured holder list, shuffled once at load.
#[derive(Debug)]
pub struct ConfigurableAddressProvider {
    holders: Vec<AddressHolder>,
    /// Index of the last holder handed out; `None` means unstarted.
    last: Option<usize>,
    /// Remaining resolved addresses of the current holder.
    resolved: VecDeque<SocketAddr>,
    /// Skip unresolvable hosts instead of failing.
    safe: bool,
}

impl ConfigurableAddressProvider {
    pub fn new(addresses: impl IntoIterator<Item = (String, i64)>, safe: bool) -> Result<Self> {
        let mut holders = addresses
            .into_iter()
            .map(|(host, port)| AddressHolder::new(host, port))
            .collect::<Result<Vec<_>>>()?;
        holders.shuffle(&mut rand::rng());
        Ok(Self { holders, last: None, resolved: VecDeque::new(), safe })
    }

    fn reset(&mut self, last: Option<usize>) {
        for holder in &mut self.holders {
            holder.pending = false;
        }
        self.resolved.clear();
        self.last = last;
    }

    /// All addresses a hostname resolves to, shuffled.
    fn resolve(host: &str, port: u16) -> Result<VecDeque<SocketAddr>> {
        let mut addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|_| Error::UnknownHost(host.to_string()))?
            .collect();
        if addrs.is_empty() {
            return Err(Error::UnknownHost(host.to_string()));
        }
        addrs.shuffle(&mut rand::rng());
        Ok(addrs.into())
    }
}

impl AddressProvider for ConfigurableAddressProvider {
    fn next_address(&mut self) -> Result<Option<SocketAddr>> {
        let count = self.holders.len();
        if count == 0 {
            return Ok(None);
        }

        loop {
            if let Some(addr) = self.resolved.pop_front() {
                return Ok(Some(addr));
            }

            // advance to the next configured holder
            let next = self.last.map_or(0, |last| (last + 1) % count);
            self.last = Some(next);

            let holder = &mut self.holders[next];
            if holder.pending {
                // walked a full cycle without an accept
                self.reset(None);
                return Ok(None);
            }
            holder.pending = true;

            match Self::resolve(&holder.host, holder.port) {
                Ok(addrs) => self.resolved = addrs,
                Err(err) => {
                    if !self.safe {
                        return Err(err);
                    }
                    if !holder.reported {
                        holder.reported = true;
                        warn!(host = %holder.host, "skipping unresolvable address");
                    }
                }
            }
        }
    }

    fn accept(&mut self) {
        // re-enter the next cycle from the current position
        let last = self.last;
        self.reset(last);
    }

    fn reject(&mut self, _cause: Option<&dyn std::error::Error>) {
        // the holder stays pending until the cycle completes
    }
}

impl fmt::Display for ConfigurableAddressProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, holder) in self.holders.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}:{}", holder.host, holder.port)?;
        }
        write!(f, "]")
    }
}

/// Hands out one fixed endpoint exactly once per cycle.
pub struct SingleAddressProvider {
    address: SocketAddr,
    given: bool,
}

impl SingleAddressProvider {
    pub fn new(address: SocketAddr) -> Self {
        Self { address, given: false }
    }
}

impl AddressProvider for SingleAddressProvider {
    fn next_address(&mut self) -> Result<Option<SocketAddr>> {
        self.given = !self.given;
        Ok(self.given.then_some(self.address))
    }

    fn accept(&mut self) {}

    fn reject(&mut self, _cause: Option<&dyn std::error::Error>) {}
}

impl fmt::Display for SingleAddressProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address={}:{}", self.address.ip(), self.address.port())
    }
}

/// Decorator substituting a real port for the wildcard port zero, used once
/// the name service has supplied the port to dial.
pub struct SubstitutionAddressProvider {
    delegate: Box<dyn AddressProvider>,
    port: u16,
}

impl SubstitutionAddressProvider {
    pub fn new(delegate: Box<dyn AddressProvider>, port: u16) -> Self {
        Self { delegate, port }
    }
}

impl AddressProvider for SubstitutionAddressProvider {
    fn next_address(&mut self) -> Result<Option<SocketAddr>> {
        let mut addr = self.delegate.next_address()?;
        if let Some(addr) = addr.as_mut()
            && self.port != 0
            && addr.port() == 0
        {
            addr.set_port(self.port);
        }
        Ok(addr)
    }

    fn accept(&mut self) {
        self.delegate.accept();
    }

    fn reject(&mut self, cause: Option<&dyn std::error::Error>) {
        self.delegate.reject(cause);
    }
}

impl fmt::Display for SubstitutionAddressProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (port {})", self.delegate, self.port)
    }
}
