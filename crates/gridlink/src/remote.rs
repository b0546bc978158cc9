//! Inner remote service: drives one initiator, maps connection events to
//! member events and bootstraps the proxy endpoint through the cluster
//! name service when so configured.

use std::{
    any::Any,
    sync::{Arc, Weak, atomic::AtomicBool, atomic::Ordering},
};

use gridlink_config::{OperationalContext, Serializer, XmlElement};
use gridlink_net::{provider::SingleAddressProvider, wire};
use parking_lot::Mutex;
use tracing::debug;

use crate::{
    Error, Result,
    channel::{Channel, ChannelFactory},
    dispatch::DispatchEvent,
    event::{
        ConnectionEvent, ConnectionListener, Listeners, MemberEvent, MemberEventId, MemberListener,
        ServiceEvent, ServiceIdentity, ServiceListener,
    },
    initiator::TcpInitiator,
    service::{ServiceKind, ServiceState},
};

/// One incarnation of a remote service. The safe wrapper builds a fresh
/// instance per restart; the instance itself never restarts.
pub struct RemoteService {
    kind: ServiceKind,
    identity: Arc<ServiceIdentity>,
    context: Arc<OperationalContext>,
    channel_factory: Arc<dyn ChannelFactory>,
    initiator: Mutex<Option<TcpInitiator>>,
    member_listeners: Listeners<dyn MemberListener>,
    service_listeners: Listeners<dyn ServiceListener>,
    remote_cluster_name: Mutex<Option<String>>,
    remote_service_name: Mutex<Option<String>>,
    name_service_provider: AtomicBool,
    xml: Mutex<Option<XmlElement>>,
    serializer: Mutex<Option<Arc<dyn Serializer>>>,
    user_context: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl std::fmt::Debug for RemoteService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteService")
            .field("kind", &self.kind)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl RemoteService {
    pub fn new(
        kind: ServiceKind,
        name: impl Into<String>,
        context: Arc<OperationalContext>,
        channel_factory: Arc<dyn ChannelFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            identity: ServiceIdentity::new(name),
            context,
            channel_factory,
            initiator: Mutex::new(None),
            member_listeners: Listeners::new(),
            service_listeners: Listeners::new(),
            remote_cluster_name: Mutex::new(None),
            remote_service_name: Mutex::new(None),
            name_service_provider: AtomicBool::new(false),
            xml: Mutex::new(None),
            serializer: Mutex::new(None),
            user_context: Mutex::new(None),
        })
    }

    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        self.identity.name()
    }

    pub fn identity(&self) -> Arc<ServiceIdentity> {
        self.identity.clone()
    }

    pub fn operational_context(&self) -> &OperationalContext {
        &self.context
    }

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

    pub fn serializer(&self) -> Option<Arc<dyn Serializer>> {
        self.serializer.lock().clone()
    }

    pub fn user_context(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.user_context.lock().clone()
    }

    pub fn set_user_context(&self, context: Arc<dyn Any + Send + Sync>) {
        *self.user_context.lock() = Some(context);
    }

    /// Cluster to ask for; name-service lookups always carry one, falling
    /// back to the local member's cluster.
    pub fn remote_cluster_name(&self) -> Option<String> {
        let name = self.remote_cluster_name.lock().clone();
        match name {
            Some(name) if !name.is_empty() => Some(name),
            _ if self.is_name_service_provider() => {
                Some(self.context.local_member().cluster_name.clone())
            }
            _ => None,
        }
    }

    pub fn set_remote_cluster_name(&self, name: impl Into<String>) {
        *self.remote_cluster_name.lock() = Some(name.into());
    }

    /// Proxy service to locate; defaults to this service's own name for
    /// name-service based configurations.
    pub fn remote_service_name(&self) -> Option<String> {
        let name = self.remote_service_name.lock().clone();
        match name {
            Some(name) if !name.is_empty() => Some(name),
            _ if self.is_name_service_provider() => Some(self.name().to_string()),
            _ => None,
        }
    }

    pub fn set_remote_service_name(&self, name: impl Into<String>) {
        *self.remote_service_name.lock() = Some(name.into());
    }

    pub fn is_name_service_provider(&self) -> bool {
        self.name_service_provider.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.initiator.lock().as_ref().is_some_and(TcpInitiator::is_running)
    }

    pub fn state(&self) -> ServiceState {
        self.initiator.lock().as_ref().map_or(ServiceState::Initial, |i| i.core().state())
    }

    fn initiator(&self) -> Result<TcpInitiator> {
        self.initiator
            .lock()
            .clone()
            .ok_or_else(|| Error::illegal_state("service has not been configured"))
    }

    // ----- configuration --------------------------------------------------

    /// Validates and stores configuration, building the initiator. The
    /// `incoming-message-handler` settings flow down from the enclosing
    /// remote-service element when absent.
    pub fn configure(&self, xml: &XmlElement) -> Result<()> {
        if self.is_running() {
            return Err(Error::illegal_state(format!(
                "service \"{}\" cannot be configured while running",
                self.name()
            )));
        }

        let mut initiator_xml =
            xml.element("initiator-config").cloned().unwrap_or_else(|| XmlElement::new("initiator-config"));
        let handler = initiator_xml.ensure_element("incoming-message-handler");
        for setting in ["thread-count", "task-hung-threshold", "task-timeout", "request-timeout"] {
            let child = handler.ensure_element(setting);
            if child.text().is_empty()
                && let Some(flowed) = xml.element(setting)
            {
                child.set_text(flowed.text());
            }
        }

        let channel = self.channel_factory.create_channel(self.kind, self.name());
        let initiator = TcpInitiator::new(&format!("{}:TcpInitiator", self.name()), channel);
        initiator.configure(&initiator_xml, &self.context)?;

        self.set_remote_cluster_name(xml.string_of("cluster-name", ""));
        self.set_remote_service_name(xml.string_of("proxy-service-name", ""));
        self.name_service_provider.store(initiator.is_name_service_provider(), Ordering::Release);

        let serializer_name = xml.string_of("serializer", "");
        if !serializer_name.is_empty() {
            let factory = self.context.serializer_factory(&serializer_name).ok_or_else(|| {
                Error::illegal_argument(format!(
                    "serializer name \"{serializer_name}\" is undefined"
                ))
            })?;
            *self.serializer.lock() = Some(factory.create_serializer());
        }

        *self.xml.lock() = Some(xml.clone());
        *self.initiator.lock() = Some(initiator);
        Ok(())
    }

    // ----- lifecycle ------------------------------------------------------

    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        let initiator = self.initiator()?;

        let hooks = Arc::new(RemoteServiceHooks { service: Arc::downgrade(self) });
        initiator.add_connection_listener(hooks.clone());
        initiator.add_service_listener(hooks);

        match self.do_start(&initiator) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.stop();
                Err(err)
            }
        }
    }

    fn do_start(self: &Arc<Self>, initiator: &TcpInitiator) -> Result<()> {
        initiator.start()?;
        self.open_channel(initiator)?;
        Ok(())
    }

    fn open_channel(self: &Arc<Self>, initiator: &TcpInitiator) -> Result<Arc<dyn Channel>> {
        if self.is_name_service_provider() && self.kind != ServiceKind::RemoteNameService {
            self.lookup_proxy_service_address(initiator)?;
        }
        initiator.ensure_connection()?;
        Ok(initiator.channel())
    }

    /// The channel over a live connection, transparently redialling after a
    /// disconnect while this incarnation is still running.
    pub fn ensure_channel(self: &Arc<Self>) -> Result<Arc<dyn Channel>> {
        let initiator = self.initiator()?;
        if !initiator.is_running() {
            return Err(Error::illegal_state(format!(
                "service \"{}\" has been stopped",
                self.name()
            )));
        }
        initiator.ensure_connection()?;
        Ok(initiator.channel())
    }

    pub fn shutdown(&self) {
        if let Ok(initiator) = self.initiator() {
            initiator.shutdown();
        }
    }

    pub fn stop(&self) {
        if let Ok(initiator) = self.initiator() {
            initiator.stop();
        }
    }

    // ----- name-service bootstrap -----------------------------------------

    /// Asks the cluster name service (subport 3) where the proxy service
    /// lives, then points the initiator at the answer.
    fn lookup_proxy_service_address(self: &Arc<Self>, initiator: &TcpInitiator) -> Result<()> {
        let service_name = self
            .remote_service_name()
            .ok_or_else(|| Error::illegal_state("proxy service name is not configured"))?;
        let cluster_name = self.remote_cluster_name().unwrap_or_default();
        let xml = self
            .xml
            .lock()
            .clone()
            .ok_or_else(|| Error::illegal_state("service has not been configured"))?;

        let lookup_service = Self::new(
            ServiceKind::RemoteNameService,
            format!("{}:RemoteNameService", self.name()),
            self.context.clone(),
            self.channel_factory.clone(),
        );
        lookup_service.configure(&xml)?;
        lookup_service.set_remote_cluster_name(cluster_name.clone());
        lookup_service.set_remote_service_name("NameService");

        let looked_up = lookup_service
            .start()
            .and_then(|()| lookup_service.ensure_channel())
            .and_then(|channel| channel.lookup(&service_name))
            .map_err(|err| {
                // the cluster itself was unreachable
                Error::connection(
                    format!(
                        "unable to locate cluster '{cluster_name}' while looking for its \
                         ProxyService '{service_name}'"
                    ),
                    Some(err),
                )
            });
        lookup_service.stop();

        match looked_up? {
            None => Err(Error::connection(
                format!(
                    "unable to locate ProxyService '{service_name}' within cluster '{cluster_name}'"
                ),
                None,
            )),
            Some((host, encoded)) => {
                let base = wire::baseport(encoded);
                let sub = wire::subport(encoded);
                debug!(host = %host, port = base, subport = sub, "resolved proxy service endpoint");
                let addr = crate::initiator::resolve_one(&host, base as u16).map_err(|err| {
                    Error::connection(
                        format!(
                            "unable to locate cluster '{cluster_name}' while looking for its \
                             ProxyService '{service_name}'"
                        ),
                        Some(err.into()),
                    )
                })?;
                initiator.set_remote_address_provider(Box::new(SingleAddressProvider::new(addr)));
                initiator.set_subport(sub);
                Ok(())
            }
        }
    }

    // ----- event fan-out --------------------------------------------------

    fn dispatch_member_event(&self, id: MemberEventId) {
        if self.member_listeners.is_empty() {
            return;
        }
        let Ok(initiator) = self.initiator() else { return };
        let event = MemberEvent {
            id,
            member: self.context.local_member().clone(),
            source: self.identity.clone(),
        };
        let listeners = self.member_listeners.snapshot();
        initiator.core().dispatcher().post(DispatchEvent::new("member-event", move || {
            for listener in listeners.iter() {
                event.dispatch(&**listener);
            }
        }));
    }

    /// Re-dispatches an initiator service event with this service as the
    /// source, so listeners observe one stable identity.
    fn redispatch_service_event(&self, event: &ServiceEvent) {
        if self.service_listeners.is_empty() {
            return;
        }
        let rewritten = ServiceEvent { id: event.id, source: self.identity.clone() };
        let listeners = self.service_listeners.snapshot();
        for listener in listeners.iter() {
            rewritten.dispatch(&**listener);
        }
    }

    /// A severed connection stops this incarnation; the safe wrapper builds
    /// a fresh one on the next use.
    fn on_disconnect(&self, cause: Option<Arc<Error>>) {
        if let (Some(cause), Ok(initiator)) = (cause, self.initiator()) {
            initiator.core().on_exception(&cause);
        }
        self.stop();
    }
}

impl std::fmt::Display for RemoteService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{{Name={}}}", self.kind, self.identity.name())
    }
}

/// Listener the remote service installs on its own initiator. Connection
/// events become member events; service events are re-sourced.
struct RemoteServiceHooks {
    service: Weak<RemoteService>,
}

impl ConnectionListener for RemoteServiceHooks {
    fn connection_opened(&self, _event: &ConnectionEvent) {
        if let Some(service) = self.service.upgrade() {
            service.dispatch_member_event(MemberEventId::Joined);
        }
    }

    fn connection_closed(&self, _event: &ConnectionEvent) {
        if let Some(service) = self.service.upgrade() {
            service.dispatch_member_event(MemberEventId::Leaving);
            service.dispatch_member_event(MemberEventId::Left);
            service.on_disconnect(None);
        }
    }

    fn connection_error(&self, event: &ConnectionEvent) {
        if let Some(service) = self.service.upgrade() {
            service.dispatch_member_event(MemberEventId::Leaving);
            service.dispatch_member_event(MemberEventId::Left);
            service.on_disconnect(event.cause.clone());
        }
    }
}

impl ServiceListener for RemoteServiceHooks {
    fn service_starting(&self, event: &ServiceEvent) {
        if let Some(service) = self.service.upgrade() {
            service.redispatch_service_event(event);
        }
    }

    fn service_started(&self, event: &ServiceEvent) {
        if let Some(service) = self.service.upgrade() {
            service.redispatch_service_event(event);
        }
    }

    fn service_stopping(&self, event: &ServiceEvent) {
        if let Some(service) = self.service.upgrade() {
            service.redispatch_service_event(event);
        }
    }

    fn service_stopped(&self, event: &ServiceEvent) {
        if let Some(service) = self.service.upgrade() {
            service.redispatch_service_event(event);
        }
    }
}
