//! Safe service wrapper: the durable, application-facing identity whose
//! inner service may be rebuilt any number of times.
//!
//! If the link to the proxy is severed, the inner service stops itself;
//! the next use through this wrapper detects the stopped inner and builds,
//! wires and starts a replacement. Application listeners live here, not on
//! the inner, so no registration is lost across restarts.

use std::{
    any::Any,
    sync::{Arc, Weak},
};

use gridlink_config::{OperationalContext, Serializer, XmlElement, xml};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::{
    Error, Result,
    channel::ChannelFactory,
    event::{
        Listeners, MemberEvent, MemberListener, ServiceEvent, ServiceIdentity, ServiceListener,
    },
    remote::RemoteService,
    service::ServiceKind,
};

/// Wrapper lifecycle. `Stopped` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SafeServiceState {
    Initial,
    Started,
    Stopped,
}

/// Identity an application attaches to its cluster traffic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subject {
    pub principal: String,
}

pub struct SafeService {
    identity: Arc<ServiceIdentity>,
    kind: ServiceKind,
    channel_factory: Arc<dyn ChannelFactory>,
    state: Mutex<SafeServiceState>,
    /// The current inner incarnation.
    service: Mutex<Option<Arc<RemoteService>>>,
    /// Serialises restarts; never held while calling into the inner.
    restart: Mutex<()>,
    member_listeners: Listeners<dyn MemberListener>,
    service_listeners: Listeners<dyn ServiceListener>,
    config: Mutex<Option<XmlElement>>,
    context: Mutex<Option<Arc<OperationalContext>>>,
    user_context: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    subject: Mutex<Option<Subject>>,
}

impl SafeService {
    pub fn new(
        name: impl Into<String>,
        kind: ServiceKind,
        channel_factory: Arc<dyn ChannelFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity: ServiceIdentity::new(name),
            kind,
            channel_factory,
            state: Mutex::new(SafeServiceState::Initial),
            service: Mutex::new(None),
            restart: Mutex::new(()),
            member_listeners: Listeners::new(),
            service_listeners: Listeners::new(),
            config: Mutex::new(None),
            context: Mutex::new(None),
            user_context: Mutex::new(None),
            subject: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        self.identity.name()
    }

    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    pub fn state(&self) -> SafeServiceState {
        *self.state.lock()
    }

    // ----- identity owned by the wrapper ----------------------------------

    pub fn add_member_listener(&self, listener: Arc<dyn MemberListener>) {
        self.member_listeners.add(listener);
    }

    pub fn remove_member_listener(&self, listener: &Arc<dyn MemberListener>) {
        self.member_listeners.remove(listener);
    }

    pub fn add_service_listener(&self, listener: Arc<dyn ServiceListener>) {
        self.service_listeners.add(listener);
    }

    pub fn remove_service_listener(&self, listener: &Arc<dyn ServiceListener>) {
        self.service_listeners.remove(listener);
    }

    pub fn user_context(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.user_context.lock().clone()
    }

    pub fn set_user_context(&self, context: Arc<dyn Any + Send + Sync>) {
        *self.user_context.lock() = Some(context);
    }

    pub fn subject(&self) -> Option<Subject> {
        self.subject.lock().clone()
    }

    pub fn set_subject(&self, subject: Subject) {
        *self.subject.lock() = Some(subject);
    }

    /// Installs the operational context; setting it twice is an error.
    pub fn set_operational_context(&self, context: Arc<OperationalContext>) -> Result<()> {
        let mut slot = self.context.lock();
        if slot.is_some() {
            return Err(Error::illegal_state("operational context has already been set"));
        }
        *slot = Some(context);
        Ok(())
    }

    pub fn operational_context(&self) -> Arc<OperationalContext> {
        self.context.lock().get_or_insert_with(Default::default).clone()
    }

    /// Stores configuration after macro substitution; the cached copy is
    /// replayed into every inner incarnation.
    pub fn configure(&self, config: XmlElement) -> Result<()> {
        if self.state() == SafeServiceState::Stopped {
            return Err(Error::illegal_state("service was explicitly stopped"));
        }
        let mut config = config;
        xml::apply_env_macros(&mut config);
        *self.config.lock() = Some(config);
        Ok(())
    }

    pub fn serializer(&self) -> Option<Arc<dyn Serializer>> {
        self.service.lock().as_ref().and_then(|service| service.serializer())
    }

    pub fn is_running(&self) -> bool {
        self.state() == SafeServiceState::Started
            && self.service.lock().as_ref().is_some_and(|service| service.is_running())
    }

    // ----- lifecycle ------------------------------------------------------

    pub fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                SafeServiceState::Stopped => {
                    return Err(Error::illegal_state("service was explicitly stopped"));
                }
                _ => *state = SafeServiceState::Started,
            }
        }
        self.ensure_running_service().map(|_| ())
    }

    pub fn shutdown(&self) {
        self.stop_with(RemoteService::shutdown);
    }

    pub fn stop(&self) {
        self.stop_with(RemoteService::stop);
    }

    fn stop_with(&self, halt: impl Fn(&RemoteService)) {
        *self.state.lock() = SafeServiceState::Stopped;
        let service = self.service.lock().take();
        if let Some(service) = service {
            halt(&service);
        }
    }

    /// The running inner service, restarted first if the previous one died.
    /// Fails with `IllegalState` once the wrapper has been stopped.
    pub fn ensure_running_service(self: &Arc<Self>) -> Result<Arc<RemoteService>> {
        if self.state() == SafeServiceState::Stopped {
            return Err(Error::illegal_state("service was explicitly stopped"));
        }
        if let Some(service) = self.service.lock().clone()
            && service.is_running()
        {
            return Ok(service);
        }

        let _guard = self.restart.lock();
        // another caller may have restarted while we waited
        if self.state() == SafeServiceState::Stopped {
            return Err(Error::illegal_state("service was explicitly stopped"));
        }
        if let Some(service) = self.service.lock().clone()
            && service.is_running()
        {
            return Ok(service);
        }

        let stale = self.service.lock().take();
        if let Some(stale) = stale {
            info!(service = %self.identity, "restarting stopped service");
            stale.stop();
        }

        let service = self.create_service()?;
        // the handle must be current before start: events fired while the
        // inner comes up are dropped unless they match the current inner
        *self.service.lock() = Some(service.clone());
        if let Err(err) = service.start() {
            // best-effort teardown of the half-built inner; the original
            // failure is what the caller needs to see
            warn!(service = %self.identity, err = %err, "failed to restart service");
            service.stop();
            *self.service.lock() = None;
            return Err(err);
        }
        Ok(service)
    }

    /// The current inner, without any restart attempt.
    pub fn service(&self) -> Option<Arc<RemoteService>> {
        self.service.lock().clone()
    }

    fn create_service(self: &Arc<Self>) -> Result<Arc<RemoteService>> {
        let config = self
            .config
            .lock()
            .clone()
            .ok_or_else(|| Error::illegal_argument("xml configuration must not be null"))?;

        let service = RemoteService::new(
            self.kind,
            self.name(),
            self.operational_context(),
            self.channel_factory.clone(),
        );
        service.configure(&config)?;
        if let Some(user_context) = self.user_context() {
            service.set_user_context(user_context);
        }

        // one adapter per incarnation; it drops events from anything but
        // the wrapper's current inner and re-sources the rest
        let hooks = Arc::new(SafeServiceHooks {
            wrapper: Arc::downgrade(self),
            inner: service.identity(),
        });
        service.add_member_listener(hooks.clone());
        service.add_service_listener(hooks);

        Ok(service)
    }

    fn is_current_inner(&self, instance: u64) -> bool {
        self.service
            .lock()
            .as_ref()
            .is_some_and(|service| service.identity().instance() == instance)
    }
}

impl std::fmt::Display for SafeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Safe{}{{Name={}}}", self.kind, self.identity.name())
    }
}

/// Adapter installed on each inner incarnation. Events from a stale inner
/// are dropped; live ones are re-dispatched with the wrapper as source.
struct SafeServiceHooks {
    wrapper: Weak<SafeService>,
    inner: Arc<ServiceIdentity>,
}

impl SafeServiceHooks {
    fn relay_member(&self, event: &MemberEvent) {
        let Some(wrapper) = self.wrapper.upgrade() else { return };
        if event.source.instance() != self.inner.instance()
            || !wrapper.is_current_inner(self.inner.instance())
        {
            return;
        }
        let rewritten = MemberEvent { source: wrapper.identity.clone(), ..event.clone() };
        for listener in wrapper.member_listeners.snapshot().iter() {
            rewritten.dispatch(&**listener);
        }
    }

    fn relay_service(&self, event: &ServiceEvent) {
        let Some(wrapper) = self.wrapper.upgrade() else { return };
        if event.source.instance() != self.inner.instance()
            || !wrapper.is_current_inner(self.inner.instance())
        {
            return;
        }
        let rewritten = ServiceEvent { id: event.id, source: wrapper.identity.clone() };
        for listener in wrapper.service_listeners.snapshot().iter() {
            rewritten.dispatch(&**listener);
        }
    }
}

impl MemberListener for SafeServiceHooks {
    fn member_joined(&self, event: &MemberEvent) {
        self.relay_member(event);
    }

    fn member_leaving(&self, event: &MemberEvent) {
        self.relay_member(event);
    }

    fn member_left(&self, event: &MemberEvent) {
        self.relay_member(event);
    }
}

impl ServiceListener for SafeServiceHooks {
    fn service_starting(&self, event: &ServiceEvent) {
        self.relay_service(event);
    }

    fn service_started(&self, event: &ServiceEvent) {
        self.relay_service(event);
    }

    fn service_stopping(&self, event: &ServiceEvent) {
        self.relay_service(event);
    }

    fn service_stopped(&self, event: &ServiceEvent) {
        self.relay_service(event);
    }
}
