mod support;

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use gridlink::{
    Error, RemoteService, ServiceKind, TcpInitiator,
    channel::OpenOutcome,
    config::{AddressProviderFactory, OperationalContext, XmlElement},
    net::provider::{AddressProvider, SingleAddressProvider},
    net::wire,
};
use support::{
    TestChannel, TestChannelFactory, socket_address_xml, spawn_echo_peer, spawn_idle_peer,
    wait_until,
};

/// Provider wrapper counting the accept/reject traffic it sees.
struct CountingProvider {
    inner: SingleAddressProvider,
    accepts: Arc<AtomicUsize>,
    rejects: Arc<AtomicUsize>,
}

impl AddressProvider for CountingProvider {
    fn next_address(&mut self) -> gridlink::net::Result<Option<SocketAddr>> {
        self.inner.next_address()
    }

    fn accept(&mut self) {
        self.accepts.fetch_add(1, Ordering::SeqCst);
        self.inner.accept();
    }

    fn reject(&mut self, cause: Option<&dyn std::error::Error>) {
        self.rejects.fetch_add(1, Ordering::SeqCst);
        self.inner.reject(cause);
    }
}

impl fmt::Display for CountingProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

struct CountingProviderFactory {
    addr: SocketAddr,
    accepts: Arc<AtomicUsize>,
    rejects: Arc<AtomicUsize>,
}

impl AddressProviderFactory for CountingProviderFactory {
    fn create_provider(&self) -> gridlink::config::Result<Box<dyn AddressProvider>> {
        Ok(Box::new(CountingProvider {
            inner: SingleAddressProvider::new(self.addr),
            accepts: self.accepts.clone(),
            rejects: self.rejects.clone(),
        }))
    }
}

#[test]
fn redirect_reconnects_without_blaming_the_provider() {
    let (first_addr, first_peer) = spawn_idle_peer(None);
    let (target_addr, target_peer) = spawn_echo_peer(Some(42));

    let accepts = Arc::new(AtomicUsize::new(0));
    let rejects = Arc::new(AtomicUsize::new(0));
    let mut context = OperationalContext::default();
    context.register_address_provider_factory(
        "counting",
        Arc::new(CountingProviderFactory {
            addr: first_addr,
            accepts: accepts.clone(),
            rejects: rejects.clone(),
        }),
    );

    let channel = Arc::new(TestChannel::default());
    channel.open_script.lock().unwrap().push_back(OpenOutcome::Redirect(vec![(
        target_addr.ip().to_string(),
        wire::encode_port(target_addr.port(), 42),
    )]));

    let initiator = TcpInitiator::new("Redirect:TcpInitiator", channel.clone());
    initiator
        .configure(
            &XmlElement::parse(
                "<initiator-config><tcp-initiator><remote-addresses>\
                 <address-provider>counting</address-provider>\
                 </remote-addresses></tcp-initiator></initiator-config>",
            )
            .unwrap(),
            &context,
        )
        .unwrap();
    initiator.start().unwrap();

    let connection = initiator.ensure_connection().unwrap();
    assert!(connection.is_open());
    assert_eq!(connection.peer_addr().unwrap(), target_addr);
    // both opens ran: the redirected one and the real one
    assert_eq!(channel.opens.load(Ordering::SeqCst), 2);
    // a redirect is not the endpoint's fault
    assert_eq!(rejects.load(Ordering::SeqCst), 0);
    assert_eq!(accepts.load(Ordering::SeqCst), 1);

    // the redirected connection still works end to end
    connection.send(b"after-redirect").unwrap();
    assert!(wait_until(Duration::from_secs(5), || channel.frame_count() == 1));

    initiator.stop();
    first_peer.join().unwrap();
    target_peer.join().unwrap();
}

#[test]
fn name_service_lookup_rewrites_the_initiator_target() {
    let (ns_addr, ns_peer) = spawn_idle_peer(Some(wire::NAME_SERVICE_SUBPORT));
    let (proxy_addr, proxy_peer) = spawn_echo_peer(Some(5));

    let factory = Arc::new(TestChannelFactory::default());
    *factory.lookup_answer.lock().unwrap() =
        Some(Some((proxy_addr.ip().to_string(), wire::encode_port(proxy_addr.port(), 5))));

    let service = RemoteService::new(
        ServiceKind::RemoteCache,
        "X",
        Arc::new(OperationalContext::default()),
        factory.clone(),
    );
    service
        .configure(
            &XmlElement::parse(&format!(
                "<remote-cache-scheme><initiator-config><tcp-initiator>\
                 <name-service-addresses>{}</name-service-addresses>\
                 </tcp-initiator></initiator-config>\
                 <cluster-name>C</cluster-name>\
                 <proxy-service-name>X</proxy-service-name>\
                 </remote-cache-scheme>",
                socket_address_xml(ns_addr)
            ))
            .unwrap(),
        )
        .unwrap();
    assert!(service.is_name_service_provider());

    service.start().unwrap();

    // the throwaway name service asked for the proxy by name, once
    let ns_channel = factory.channel_for(ServiceKind::RemoteNameService).unwrap();
    assert_eq!(*ns_channel.lookups.lock().unwrap(), vec!["X".to_string()]);

    // the data connection went to the looked-up endpoint
    let data_channel = factory.channel_for(ServiceKind::RemoteCache).unwrap();
    assert_eq!(data_channel.opens.load(Ordering::SeqCst), 1);

    service.stop();
    ns_peer.join().unwrap();
    proxy_peer.join().unwrap();
}

#[test]
fn missing_proxy_service_is_a_connection_error() {
    let (ns_addr, ns_peer) = spawn_idle_peer(Some(wire::NAME_SERVICE_SUBPORT));

    let factory = Arc::new(TestChannelFactory::default());
    *factory.lookup_answer.lock().unwrap() = Some(None);

    let service = RemoteService::new(
        ServiceKind::RemoteCache,
        "Missing",
        Arc::new(OperationalContext::default()),
        factory,
    );
    service
        .configure(
            &XmlElement::parse(&format!(
                "<remote-cache-scheme><initiator-config><tcp-initiator>\
                 <name-service-addresses>{}</name-service-addresses>\
                 </tcp-initiator></initiator-config>\
                 <cluster-name>C</cluster-name>\
                 <proxy-service-name>Missing</proxy-service-name>\
                 </remote-cache-scheme>",
                socket_address_xml(ns_addr)
            ))
            .unwrap(),
        )
        .unwrap();

    let err = service.start().unwrap_err();
    assert!(
        err.to_string().contains("unable to locate ProxyService 'Missing'"),
        "message was: {err}"
    );
    assert!(err.to_string().contains("cluster 'C'"), "message was: {err}");
    assert!(matches!(err, Error::Connection { .. }));

    ns_peer.join().unwrap();
}

#[test]
fn unreachable_name_service_names_the_cluster_in_the_error() {
    let factory = Arc::new(TestChannelFactory::default());
    let service = RemoteService::new(
        ServiceKind::RemoteCache,
        "Orphan",
        Arc::new(OperationalContext::default()),
        factory,
    );
    service
        .configure(
            &XmlElement::parse(
                "<remote-cache-scheme><initiator-config><tcp-initiator>\
                 <name-service-addresses>\
                 <socket-address><address>192.0.2.7</address><port>7574</port></socket-address>\
                 </name-service-addresses>\
                 </tcp-initiator><connect-timeout>200ms</connect-timeout></initiator-config>\
                 <cluster-name>C</cluster-name>\
                 <proxy-service-name>Orphan</proxy-service-name>\
                 </remote-cache-scheme>",
            )
            .unwrap(),
        )
        .unwrap();

    let err = service.start().unwrap_err();
    assert!(err.to_string().contains("unable to locate cluster 'C'"), "message was: {err}");
}
