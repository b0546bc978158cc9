//! Service, member and connection events, and the copy-on-write listener
//! collections they fan out through.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use arc_swap::ArcSwap;
use gridlink_config::MemberIdentity;

use crate::Error;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Stable identity of one service incarnation. Listeners use the instance
/// number to tell a current event source from a stale one.
#[derive(Debug)]
pub struct ServiceIdentity {
    name: String,
    instance: u64,
}

impl ServiceIdentity {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance(&self) -> u64 {
        self.instance
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberEventId {
    Joined,
    Leaving,
    Left,
}

#[derive(Clone, Debug)]
pub struct MemberEvent {
    pub id: MemberEventId,
    pub member: MemberIdentity,
    pub source: Arc<ServiceIdentity>,
}

impl MemberEvent {
    pub fn dispatch(&self, listener: &dyn MemberListener) {
        match self.id {
            MemberEventId::Joined => listener.member_joined(self),
            MemberEventId::Leaving => listener.member_leaving(self),
            MemberEventId::Left => listener.member_left(self),
        }
    }
}

pub trait MemberListener: Send + Sync {
    fn member_joined(&self, event: &MemberEvent);
    fn member_leaving(&self, event: &MemberEvent);
    fn member_left(&self, event: &MemberEvent);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceEventId {
    Starting,
    Started,
    Stopping,
    Stopped,
}

#[derive(Clone, Debug)]
pub struct ServiceEvent {
    pub id: ServiceEventId,
    pub source: Arc<ServiceIdentity>,
}

impl ServiceEvent {
    pub fn dispatch(&self, listener: &dyn ServiceListener) {
        match self.id {
            ServiceEventId::Starting => listener.service_starting(self),
            ServiceEventId::Started => listener.service_started(self),
            ServiceEventId::Stopping => listener.service_stopping(self),
            ServiceEventId::Stopped => listener.service_stopped(self),
        }
    }
}

pub trait ServiceListener: Send + Sync {
    fn service_starting(&self, event: &ServiceEvent);
    fn service_started(&self, event: &ServiceEvent);
    fn service_stopping(&self, event: &ServiceEvent);
    fn service_stopped(&self, event: &ServiceEvent);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionEventId {
    Opened,
    Closed,
    Error,
}

#[derive(Clone, Debug)]
pub struct ConnectionEvent {
    pub id: ConnectionEventId,
    pub cause: Option<Arc<Error>>,
}

impl ConnectionEvent {
    pub fn dispatch(&self, listener: &dyn ConnectionListener) {
        match self.id {
            ConnectionEventId::Opened => listener.connection_opened(self),
            ConnectionEventId::Closed => listener.connection_closed(self),
            ConnectionEventId::Error => listener.connection_error(self),
        }
    }
}

pub trait ConnectionListener: Send + Sync {
    fn connection_opened(&self, event: &ConnectionEvent);
    fn connection_closed(&self, event: &ConnectionEvent);
    fn connection_error(&self, event: &ConnectionEvent);
}

/// Copy-on-write listener collection: mutation swaps in a new snapshot, so
/// iteration never takes a lock and never observes a half-applied change.
pub struct Listeners<L: ?Sized> {
    snapshot: ArcSwap<Vec<Arc<L>>>,
}

impl<L: ?Sized> Listeners<L> {
    pub fn new() -> Self {
        Self { snapshot: ArcSwap::from_pointee(Vec::new()) }
    }

    pub fn add(&self, listener: Arc<L>) {
        self.snapshot.rcu(|current| {
            let mut next = (**current).clone();
            next.push(listener.clone());
            next
        });
    }

    /// Removes by listener identity.
    pub fn remove(&self, listener: &Arc<L>) {
        self.snapshot.rcu(|current| {
            current.iter().filter(|l| !Arc::ptr_eq(l, listener)).cloned().collect::<Vec<_>>()
        });
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<L>>> {
        self.snapshot.load_full()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }
}

impl<L: ?Sized> Default for Listeners<L> {
    fn default() -> Self {
        Self::new()
    }
}
