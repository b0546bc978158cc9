mod support;

use std::{
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use gridlink::{Error, SafeService, SafeServiceState, ServiceKind, config::XmlElement};
use support::{
    CountingMemberListener, PeerCommand, TestChannelFactory, socket_address_xml,
    spawn_resettable_peer, wait_until,
};

fn cache_scheme(addresses: &str) -> XmlElement {
    XmlElement::parse(&format!(
        "<remote-cache-scheme><initiator-config><tcp-initiator>\
         <remote-addresses>{addresses}</remote-addresses>\
         </tcp-initiator></initiator-config></remote-cache-scheme>"
    ))
    .unwrap()
}

#[test]
fn severed_connection_yields_a_fresh_inner_service() {
    let (addr, peer_control, peer) = spawn_resettable_peer();

    let factory = Arc::new(TestChannelFactory::default());
    let service = SafeService::new("ReconnectService", ServiceKind::RemoteCache, factory);
    service.configure(cache_scheme(&socket_address_xml(addr))).unwrap();

    let members = Arc::new(CountingMemberListener::default());
    service.add_member_listener(members.clone());

    service.start().unwrap();
    let first = service.ensure_running_service().unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || members.joined.load(Ordering::SeqCst) == 1),
        "first incarnation never joined"
    );

    // sever the link; the inner notices, reports the member gone and stops
    peer_control.send(PeerCommand::DropConnection).unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || !first.is_running()),
        "inner service survived a dropped connection"
    );
    assert!(wait_until(Duration::from_secs(5), || {
        members.leaving.load(Ordering::SeqCst) == 1 && members.left.load(Ordering::SeqCst) == 1
    }));

    // next use transparently rebuilds and reconnects
    let second = service.ensure_running_service().unwrap();
    assert!(!Arc::ptr_eq(&first, &second), "expected a fresh inner service");
    assert_ne!(first.identity().instance(), second.identity().instance());
    assert!(second.is_running());
    assert!(
        wait_until(Duration::from_secs(5), || members.joined.load(Ordering::SeqCst) == 2),
        "second incarnation never joined"
    );
    assert_eq!(members.leaving.load(Ordering::SeqCst), 1);
    assert_eq!(members.left.load(Ordering::SeqCst), 1);

    // every event reached the application re-sourced to the wrapper
    let sources = members.sources.lock().unwrap();
    assert_eq!(sources.len(), 4);
    assert!(sources.iter().all(|instance| *instance == sources[0]));
    drop(sources);

    service.stop();
    let _ = peer_control.send(PeerCommand::Shutdown);
    peer.join().unwrap();
}

#[test]
fn stopped_wrapper_is_terminal() {
    let (addr, peer_control, peer) = spawn_resettable_peer();

    let factory = Arc::new(TestChannelFactory::default());
    let service = SafeService::new("TerminalService", ServiceKind::RemoteCache, factory);
    service.configure(cache_scheme(&socket_address_xml(addr))).unwrap();

    service.start().unwrap();
    assert_eq!(service.state(), SafeServiceState::Started);
    assert!(service.is_running());

    service.stop();
    assert_eq!(service.state(), SafeServiceState::Stopped);
    assert!(!service.is_running());

    assert!(matches!(service.ensure_running_service(), Err(Error::IllegalState(_))));
    assert!(matches!(service.start(), Err(Error::IllegalState(_))));

    let _ = peer_control.send(PeerCommand::Shutdown);
    peer.join().unwrap();
}

#[test]
fn wrapper_requires_configuration() {
    let factory = Arc::new(TestChannelFactory::default());
    let service = SafeService::new("Unconfigured", ServiceKind::RemoteInvocation, factory);
    assert!(matches!(service.ensure_running_service(), Err(Error::IllegalArgument(_))));
}

#[test]
fn failed_restart_leaves_the_wrapper_usable() {
    // a peer that only ever accepts one connection: the restart after the
    // drop fails, but the wrapper itself must survive to try again
    let (addr, peer_control, peer) = spawn_resettable_peer();

    let factory = Arc::new(TestChannelFactory::default());
    let service = SafeService::new("RetryService", ServiceKind::RemoteCache, factory);
    service
        .configure(
            XmlElement::parse(&format!(
                "<remote-cache-scheme><initiator-config><tcp-initiator>\
                 <remote-addresses>{}</remote-addresses>\
                 </tcp-initiator><connect-timeout>200ms</connect-timeout></initiator-config>\
                 </remote-cache-scheme>",
                socket_address_xml(addr)
            ))
            .unwrap(),
        )
        .unwrap();

    service.start().unwrap();
    let first = service.ensure_running_service().unwrap();

    // tear the peer down completely
    peer_control.send(PeerCommand::Shutdown).unwrap();
    peer.join().unwrap();
    assert!(wait_until(Duration::from_secs(5), || !first.is_running()));

    // no listener is reachable now; the restart must fail, not wedge
    let err = service.ensure_running_service().unwrap_err();
    assert!(matches!(err, Error::Connection { .. }), "got {err:?}");
    assert_eq!(service.state(), SafeServiceState::Started);
}
