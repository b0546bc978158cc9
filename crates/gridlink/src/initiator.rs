//! Outbound connection initiator: owns the address provider, dials one
//! endpoint at a time and maintains the single framed connection a remote
//! service runs over.

use std::{
    net::{SocketAddr, ToSocketAddrs},
    sync::{
        Arc, Weak,
        atomic::{AtomicI32, Ordering},
    },
    time::Duration,
};

use gridlink_config::{
    AddressProviderFactory, ConfigurableAddressProviderFactory, OperationalContext, XmlElement,
};
use gridlink_net::{TcpSocket, provider::AddressProvider, task, wire};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{
    Error, Result,
    channel::{Channel, OpenOutcome},
    connection::{Connection, ConnectionOwner},
    dispatch::DispatchEvent,
    event::{ConnectionEvent, ConnectionEventId, ConnectionListener, Listeners},
    service::{ServiceCore, ServiceState},
};

/// Name of the implicit address-provider factory used when neither address
/// list is configured.
const CLUSTER_DISCOVERY: &str = "cluster-discovery";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_INCOMING: i64 = 1 << 26;

#[derive(Clone, Debug)]
pub struct TcpInitiatorConfig {
    pub local_address: Option<SocketAddr>,
    pub local_address_reusable: bool,
    pub keep_alive: bool,
    pub tcp_no_delay: bool,
    /// Linger in millis; negative disables, zero leaves the OS default.
    pub linger_millis: i64,
    pub receive_buffer_size: usize,
    pub send_buffer_size: usize,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub max_incoming_message_size: i64,
    /// Flows down to the external message-processing pool.
    pub thread_count: i64,
    pub task_timeout: Duration,
    pub task_hung_threshold: Duration,
    pub name_service_provider: bool,
}

impl Default for TcpInitiatorConfig {
    fn default() -> Self {
        Self {
            local_address: None,
            local_address_reusable: false,
            keep_alive: false,
            tcp_no_delay: true,
            linger_millis: 0,
            receive_buffer_size: 0,
            send_buffer_size: 0,
            connect_timeout: DEFAULT_REQUEST_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_incoming_message_size: DEFAULT_MAX_INCOMING,
            thread_count: 0,
            task_timeout: Duration::ZERO,
            task_hung_threshold: Duration::ZERO,
            name_service_provider: false,
        }
    }
}

struct InitiatorShared {
    core: ServiceCore,
    config: Mutex<TcpInitiatorConfig>,
    provider: Mutex<Option<Box<dyn AddressProvider>>>,
    subport: AtomicI32,
    channel: Arc<dyn Channel>,
    connection: Mutex<Option<Connection>>,
    /// Serialises concurrent `ensure_connection` callers without blocking
    /// the close path.
    ensure: Mutex<()>,
    connection_listeners: Listeners<dyn ConnectionListener>,
}

impl InitiatorShared {
    fn dispatch_connection_event(&self, id: ConnectionEventId, cause: Option<Arc<Error>>) {
        if self.connection_listeners.is_empty() {
            return;
        }
        let event = ConnectionEvent { id, cause };
        let listeners = self.connection_listeners.snapshot();
        self.core.dispatcher().post(DispatchEvent::new("connection-event", move || {
            for listener in listeners.iter() {
                event.dispatch(&**listener);
            }
        }));
    }
}

impl ConnectionOwner for InitiatorShared {
    fn connection_ended(&self, id: u64, cause: Option<Arc<Error>>) {
        {
            let mut slot = self.connection.lock();
            // a late close from a replaced connection must not evict the
            // current one
            match slot.as_ref() {
                Some(current) if current.id() == id => *slot = None,
                Some(_) => return,
                None => {}
            }
        }
        let id = match cause {
            None => ConnectionEventId::Closed,
            Some(_) => ConnectionEventId::Error,
        };
        self.dispatch_connection_event(id, cause);
    }
}

/// Connection initiator service. Clones share one initiator.
#[derive(Clone)]
pub struct TcpInitiator {
    shared: Arc<InitiatorShared>,
}

impl TcpInitiator {
    pub fn new(name: &str, channel: Arc<dyn Channel>) -> Self {
        Self {
            shared: Arc::new(InitiatorShared {
                core: ServiceCore::new(name),
                config: Mutex::new(TcpInitiatorConfig::default()),
                provider: Mutex::new(None),
                subport: AtomicI32::new(wire::NO_SUBPORT),
                channel,
                connection: Mutex::new(None),
                ensure: Mutex::new(()),
                connection_listeners: Listeners::new(),
            }),
        }
    }

    pub(crate) fn core(&self) -> &ServiceCore {
        &self.shared.core
    }

    pub fn name(&self) -> &str {
        self.shared.core.name()
    }

    pub fn channel(&self) -> Arc<dyn Channel> {
        self.shared.channel.clone()
    }

    pub fn config(&self) -> TcpInitiatorConfig {
        self.shared.config.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.core.is_running()
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.shared.connection_listeners.add(listener);
    }

    pub fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        self.shared.connection_listeners.remove(listener);
    }

    pub fn add_service_listener(&self, listener: Arc<dyn crate::event::ServiceListener>) {
        self.shared.core.add_listener(listener);
    }

    pub fn remove_service_listener(&self, listener: &Arc<dyn crate::event::ServiceListener>) {
        self.shared.core.remove_listener(listener);
    }

    /// The configuration element this initiator was configured from.
    pub fn config_xml(&self) -> Option<XmlElement> {
        self.shared.core.config()
    }

    pub fn subport(&self) -> i32 {
        self.shared.subport.load(Ordering::Acquire)
    }

    pub fn set_subport(&self, subport: i32) {
        self.shared.subport.store(subport, Ordering::Release);
    }

    pub fn is_name_service_provider(&self) -> bool {
        self.shared.config.lock().name_service_provider
    }

    /// Swaps the remote address provider; the name-service bootstrap uses
    /// this to install the looked-up proxy endpoint.
    pub fn set_remote_address_provider(&self, provider: Box<dyn AddressProvider>) {
        *self.shared.provider.lock() = Some(provider);
    }

    // ----- configuration --------------------------------------------------

    /// Parses an `initiator-config` element and builds the remote address
    /// provider. Legal only before the first start.
    pub fn configure(&self, xml: &XmlElement, context: &OperationalContext) -> Result<()> {
        if self.shared.core.state() != ServiceState::Initial {
            return Err(Error::illegal_state(format!(
                "initiator \"{}\" cannot be reconfigured once started",
                self.name()
            )));
        }
        let placeholder = XmlElement::new("tcp-initiator");
        let tcp = xml.element("tcp-initiator").unwrap_or(&placeholder);

        let mut config = TcpInitiatorConfig::default();

        if let Some(local) = tcp.element("local-address") {
            config.local_address = parse_local_address(local)?;
            config.local_address_reusable = local.bool_of("reusable", false)?;
        }

        let (addresses, name_service) = match tcp.element("name-service-addresses") {
            Some(el) => (Some(el), true),
            None => match tcp.element("remote-addresses") {
                Some(el) => (Some(el), false),
                // nothing configured: discover the cluster by name service
                None => (None, true),
            },
        };

        let factory: Arc<dyn AddressProviderFactory> = match addresses {
            Some(el) => match el.element("address-provider") {
                Some(provider_ref) if !provider_ref.text().is_empty() => {
                    named_factory(context, provider_ref.text())?
                }
                Some(provider_ref) if !provider_ref.is_empty() => {
                    Arc::new(ConfigurableAddressProviderFactory::new(provider_ref.clone()))
                }
                _ => Arc::new(ConfigurableAddressProviderFactory::new(el.clone())),
            },
            None => named_factory(context, CLUSTER_DISCOVERY)?,
        };
        *self.shared.provider.lock() = Some(factory.create_provider().map_err(Error::Config)?);

        config.name_service_provider = name_service;
        self.set_subport(if name_service { wire::NAME_SERVICE_SUBPORT } else { wire::NO_SUBPORT });

        config.keep_alive = tcp.bool_of("keep-alive-enabled", false)?;
        config.tcp_no_delay = !tcp.bool_of("tcp-delay-enabled", false)?;
        config.receive_buffer_size = tcp.memory_of("receive-buffer-size", 0)?.max(0) as usize;
        config.send_buffer_size = tcp.memory_of("send-buffer-size", 0)?.max(0) as usize;
        config.linger_millis = tcp.millis_of("linger-timeout", 0)?;

        if let Some(handler) = xml.element("incoming-message-handler") {
            config.request_timeout = Duration::from_millis(
                handler
                    .millis_of("request-timeout", DEFAULT_REQUEST_TIMEOUT.as_millis() as i64)?
                    .max(0) as u64,
            );
            config.thread_count = handler.i64_of("thread-count", 0)?;
            config.task_timeout =
                Duration::from_millis(handler.millis_of("task-timeout", 0)?.max(0) as u64);
            config.task_hung_threshold =
                Duration::from_millis(handler.millis_of("task-hung-threshold", 0)?.max(0) as u64);

            let dispatcher = self.shared.core.dispatcher();
            if handler.element("event-queue-clogged-count").is_some() {
                dispatcher.set_clogged_count(
                    handler.i64_of("event-queue-clogged-count", 0)?.max(0) as usize,
                );
            }
            if handler.element("event-queue-clogged-delay").is_some() {
                dispatcher.set_clogged_delay(Duration::from_millis(
                    handler.millis_of("event-queue-clogged-delay", 0)?.max(1) as u64,
                ));
            }
        }

        // connect timeout defaults to the request timeout; negatives clamp
        config.connect_timeout = Duration::from_millis(
            xml.millis_of("connect-timeout", config.request_timeout.as_millis() as i64)?.max(0)
                as u64,
        );
        config.max_incoming_message_size =
            xml.memory_of("max-incoming-message-size", DEFAULT_MAX_INCOMING)?;

        *self.shared.config.lock() = config;
        self.shared.core.store_config(xml.clone())
    }

    // ----- lifecycle ------------------------------------------------------

    pub fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        self.shared.core.begin_start()?;
        self.shared.core.complete_start();
        Ok(())
    }

    pub fn shutdown(&self) {
        // orderly drain and the hard form coincide: one connection, closed
        // either way
        self.stop();
    }

    pub fn stop(&self) {
        if !self.shared.core.begin_stop() {
            return;
        }
        let connection = self.shared.connection.lock().clone();
        if let Some(connection) = connection {
            connection.close(true, None, true);
        }
        self.shared.core.complete_stop();
    }

    /// The live connection, dialling one if needed. Callers racing the
    /// start-up wait for the service to begin accepting clients.
    pub fn ensure_connection(&self) -> Result<Connection> {
        if self.shared.core.state() == ServiceState::Starting {
            self.shared.core.wait_for_started(self.config().request_timeout);
        }
        if self.shared.core.state() != ServiceState::Started {
            return Err(Error::illegal_state(format!(
                "initiator \"{}\" is not running",
                self.name()
            )));
        }

        let _guard = self.shared.ensure.lock();
        if let Some(connection) = self.shared.connection.lock().clone()
            && connection.is_open()
        {
            return Ok(connection);
        }

        let connection = self.open_connection()?;
        *self.shared.connection.lock() = Some(connection.clone());
        self.shared.dispatch_connection_event(ConnectionEventId::Opened, None);
        Ok(connection)
    }

    pub fn current_connection(&self) -> Option<Connection> {
        self.shared.connection.lock().clone()
    }

    /// Establishes one live framed connection: walks the address provider,
    /// follows at most one level of redirect list and performs the subport
    /// handshake where configured.
    pub fn open_connection(&self) -> Result<Connection> {
        let config = self.config();
        let mut provider_slot = self.shared.provider.lock();
        let provider = provider_slot
            .as_mut()
            .ok_or_else(|| Error::illegal_state("initiator has not been configured"))?;

        let mut tried: Vec<String> = Vec::new();
        let mut last_cause: Option<Error> = None;
        let mut redirect: Option<std::vec::IntoIter<(String, i32)>> = None;

        loop {
            // the caller's cooperative budget bounds the whole walk
            if task::remaining_budget().is_some_and(|budget| budget.is_zero()) {
                return Err(gridlink_net::Error::SocketTimeout {
                    reason: "connect timeout budget exhausted",
                }
                .into());
            }

            let next_redirect = redirect.as_mut().and_then(|list| list.next());
            // an exhausted redirect list falls back to the provider, and
            // that attempt is an ordinary dial again
            let redirecting = next_redirect.is_some();
            let (addr, sub, label) = match next_redirect {
                Some((host, encoded)) => {
                    let base = wire::baseport(encoded);
                    let sub = wire::subport(encoded);
                    let label = endpoint_label(&host, base, sub);
                    match resolve_one(&host, base as u16) {
                        Ok(addr) => (addr, sub, label),
                        Err(err) => {
                            debug!(addr = %label, err = %err, "error resolving redirect address");
                            tried.push(label);
                            if redirect_spent(redirect.as_ref()) {
                                provider.reject(Some(&err as &dyn std::error::Error));
                            }
                            last_cause = Some(err.into());
                            continue;
                        }
                    }
                }
                None => {
                    redirect = None;
                    let sub = self.subport();
                    match provider.next_address()? {
                        Some(addr) => {
                            let label = endpoint_label(&addr.ip().to_string(), i32::from(addr.port()), sub);
                            (addr, sub, label)
                        }
                        None => break,
                    }
                }
            };
            tried.push(label.clone());

            // a fresh socket per attempt; sockets are never reused
            let socket = self.instantiate_socket(&addr, &config)?;

            if redirecting {
                debug!(addr = %label, "redirecting socket");
            } else {
                debug!(addr = %label, "connecting socket");
            }

            if let Err(err) = socket.connect(addr, config.connect_timeout) {
                debug!(addr = %label, err = %err, "error connecting socket");
                socket.close();
                // blame the provider's endpoint unless mid-redirect
                if !redirecting || redirect_spent(redirect.as_ref()) {
                    provider.reject(Some(&err as &dyn std::error::Error));
                }
                last_cause = Some(err.into());
                continue;
            }
            info!(addr = %label, "connected socket");

            if sub != wire::NO_SUBPORT
                && let Err(err) = socket.write(&wire::subport_prelude(sub))
            {
                debug!(addr = %label, err = %err, "error writing subport handshake");
                socket.close();
                if !redirecting || redirect_spent(redirect.as_ref()) {
                    provider.reject(Some(&err as &dyn std::error::Error));
                }
                last_cause = Some(err.into());
                continue;
            }

            let connection = Connection::new(
                self.name(),
                socket,
                self.shared.channel.clone(),
                Arc::downgrade(&self.shared) as Weak<dyn ConnectionOwner>,
                config.max_incoming_message_size,
            );

            match connection.open() {
                Ok(OpenOutcome::Accepted) => {
                    provider.accept();
                    return Ok(connection);
                }
                Ok(OpenOutcome::Redirect(list)) if !redirecting => {
                    debug!(addr = %label, targets = list.len(), "connection redirected");
                    connection.close(false, None, true);
                    redirect = Some(list.into_iter());
                }
                Ok(OpenOutcome::Redirect(_)) => {
                    // one redirect level only; a nested one is a failure
                    connection.close(false, None, true);
                    let err = Error::connection("redirected while following a redirect", None);
                    debug!(addr = %label, err = %err, "rejecting nested redirect");
                    if redirect_spent(redirect.as_ref()) {
                        provider.reject(Some(&err as &dyn std::error::Error));
                    }
                    last_cause = Some(err);
                }
                Err(err) => {
                    debug!(addr = %label, err = %err, "error establishing a connection");
                    if !redirecting || redirect_spent(redirect.as_ref()) {
                        provider.reject(Some(&err as &dyn std::error::Error));
                    }
                    last_cause = Some(err);
                }
            }
        }

        Err(Error::Connection {
            message: format!(
                "could not establish a connection to one of the following addresses: [{}]",
                tried.join(", ")
            ),
            source: last_cause.map(Box::new),
        })
    }

    /// A configured, bound, unconnected socket.
    fn instantiate_socket(&self, addr: &SocketAddr, config: &TcpInitiatorConfig) -> Result<TcpSocket> {
        let socket = TcpSocket::new(addr)?;
        self.configure_socket(&socket, config)
            .map_err(|err| Error::connection("error configuring socket", Some(err)))?;

        if let Some(local) = config.local_address {
            debug!(%local, "binding socket");
            socket.bind(local).map_err(|err| {
                Error::connection(
                    format!("error binding socket to {local}"),
                    Some(Error::Net(err)),
                )
            })?;
        }
        Ok(socket)
    }

    fn configure_socket(&self, socket: &TcpSocket, config: &TcpInitiatorConfig) -> Result<()> {
        socket.set_keep_alive(config.keep_alive)?;
        socket.set_reuse_address(config.local_address_reusable)?;
        socket.set_tcp_no_delay(config.tcp_no_delay)?;
        socket.set_receive_buffer_size(config.receive_buffer_size)?;
        socket.set_send_buffer_size(config.send_buffer_size)?;
        socket.set_linger(config.linger_millis)?;
        // a message send waits at most the request timeout; reads stay
        // unbounded, the reader parks between frames
        socket.set_send_timeout(config.request_timeout);
        Ok(())
    }
}

impl std::fmt::Display for TcpInitiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let config = self.shared.config.lock();
        write!(
            f,
            "TcpInitiator{{Name={}, KeepAlive={}, TcpNoDelay={}, ConnectTimeout={}ms, \
             RequestTimeout={}ms, Subport={}}}",
            self.shared.core.name(),
            config.keep_alive,
            config.tcp_no_delay,
            config.connect_timeout.as_millis(),
            config.request_timeout.as_millis(),
            self.subport(),
        )
    }
}

fn redirect_spent(redirect: Option<&std::vec::IntoIter<(String, i32)>>) -> bool {
    redirect.is_none_or(|list| list.len() == 0)
}

fn named_factory(
    context: &OperationalContext,
    name: &str,
) -> Result<Arc<dyn AddressProviderFactory>> {
    context.address_provider_factory(name).ok_or_else(|| {
        Error::illegal_argument(format!("address-provider name \"{name}\" is undefined"))
    })
}

fn parse_local_address(xml: &XmlElement) -> Result<Option<SocketAddr>> {
    if xml.element("address").is_none() && xml.element("port").is_none() {
        return Ok(None);
    }
    let host = xml.string_of("address", "localhost");
    let port = xml.i64_of("port", 0)?;
    if !(0..=0xFFFF).contains(&port) {
        return Err(Error::illegal_argument(format!(
            "the \"local-address\" configuration element contains an invalid \"port\" element: {port}"
        )));
    }
    resolve_one(&host, port as u16).map(Some).map_err(|_| {
        Error::illegal_argument(format!(
            "the \"local-address\" configuration element contains an invalid \"address\" element: \"{host}\""
        ))
    })
}

pub(crate) fn resolve_one(host: &str, port: u16) -> gridlink_net::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| gridlink_net::Error::UnknownHost(host.to_string()))
}

fn endpoint_label(host: &str, port: i32, subport: i32) -> String {
    if subport == wire::NO_SUBPORT {
        format!("{host}:{port}")
    } else {
        format!("{host}:{port}.{subport}")
    }
}
