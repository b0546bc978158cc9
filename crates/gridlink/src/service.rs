//! Lifecycle core shared by the controllable services: the state machine,
//! the service event fan-out and the owning event dispatcher.

use std::{sync::Arc, time::Duration};

use gridlink_config::XmlElement;
use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::{
    Error, Result,
    dispatch::{DispatchEvent, EventDispatcher},
    event::{Listeners, ServiceEvent, ServiceEventId, ServiceIdentity, ServiceListener},
};

/// Inner service lifecycle. Transitions are monotonic; restart means a new
/// service instance, never a state transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServiceState {
    Initial,
    Starting,
    Started,
    Stopping,
    Stopped,
}

/// The kinds of remote service a cluster proxy can host for a client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceKind {
    RemoteCache,
    RemoteInvocation,
    RemoteNameService,
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::RemoteCache => "RemoteCache",
            Self::RemoteInvocation => "RemoteInvocation",
            Self::RemoteNameService => "RemoteNameService",
        })
    }
}

pub(crate) struct ServiceCore {
    identity: Arc<ServiceIdentity>,
    state: Mutex<ServiceState>,
    changed: Condvar,
    dispatcher: EventDispatcher,
    listeners: Listeners<dyn ServiceListener>,
    config: Mutex<Option<XmlElement>>,
}

impl ServiceCore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            identity: ServiceIdentity::new(name),
            state: Mutex::new(ServiceState::Initial),
            changed: Condvar::new(),
            dispatcher: EventDispatcher::new(),
            listeners: Listeners::new(),
            config: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> Arc<ServiceIdentity> {
        self.identity.clone()
    }

    pub fn name(&self) -> &str {
        self.identity.name()
    }

    pub fn state(&self) -> ServiceState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), ServiceState::Starting | ServiceState::Started)
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn add_listener(&self, listener: Arc<dyn ServiceListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ServiceListener>) {
        self.listeners.remove(listener);
    }

    /// Stores validated configuration; legal only before the first start.
    pub fn store_config(&self, xml: XmlElement) -> Result<()> {
        let state = self.state.lock();
        if *state != ServiceState::Initial {
            return Err(Error::illegal_state(format!(
                "service \"{}\" cannot be configured while {:?}",
                self.identity, *state
            )));
        }
        *self.config.lock() = Some(xml);
        Ok(())
    }

    pub fn config(&self) -> Option<XmlElement> {
        self.config.lock().clone()
    }

    /// Enters `Starting` and brings the dispatcher up.
    pub fn begin_start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                ServiceState::Initial => {}
                ServiceState::Starting | ServiceState::Started => {
                    return Err(Error::illegal_state(format!(
                        "service \"{}\" is already running",
                        self.identity
                    )));
                }
                ServiceState::Stopping | ServiceState::Stopped => {
                    return Err(Error::illegal_state(format!(
                        "service \"{}\" cannot be restarted; a new instance is required",
                        self.identity
                    )));
                }
            }
            *state = ServiceState::Starting;
        }
        self.dispatcher.start(self.name())?;
        self.emit(ServiceEventId::Starting);
        Ok(())
    }

    pub fn complete_start(&self) {
        {
            let mut state = self.state.lock();
            *state = ServiceState::Started;
        }
        self.changed.notify_all();
        self.emit(ServiceEventId::Started);
    }

    /// Enters `Stopping`; false when the service already left the running
    /// states, making stop idempotent.
    pub fn begin_stop(&self) -> bool {
        {
            let mut state = self.state.lock();
            if matches!(*state, ServiceState::Stopping | ServiceState::Stopped) {
                return false;
            }
            *state = ServiceState::Stopping;
        }
        self.changed.notify_all();
        self.emit(ServiceEventId::Stopping);
        true
    }

    pub fn complete_stop(&self) {
        {
            let mut state = self.state.lock();
            *state = ServiceState::Stopped;
        }
        self.changed.notify_all();
        self.emit(ServiceEventId::Stopped);
        self.dispatcher.drain();
        self.dispatcher.stop();
    }

    /// Waits until the service leaves `Starting`, returning whether it is
    /// accepting clients.
    pub fn wait_for_started(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        while *state == ServiceState::Starting {
            if self.changed.wait_for(&mut state, timeout).timed_out() {
                break;
            }
        }
        *state == ServiceState::Started
    }

    /// Route for failures on service-owned threads.
    pub fn on_exception(&self, err: &Error) {
        warn!(service = %self.identity, err = %err, "unhandled service exception");
    }

    fn emit(&self, id: ServiceEventId) {
        if self.listeners.is_empty() {
            return;
        }
        let event = ServiceEvent { id, source: self.identity.clone() };
        let listeners = self.listeners.snapshot();
        self.dispatcher.post(DispatchEvent::new("service-event", move || {
            for listener in listeners.iter() {
                event.dispatch(&**listener);
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct CountingListener {
        starting: AtomicUsize,
        started: AtomicUsize,
        stopping: AtomicUsize,
        stopped: AtomicUsize,
    }

    impl ServiceListener for CountingListener {
        fn service_starting(&self, _event: &ServiceEvent) {
            self.starting.fetch_add(1, Ordering::Relaxed);
        }
        fn service_started(&self, _event: &ServiceEvent) {
            self.started.fetch_add(1, Ordering::Relaxed);
        }
        fn service_stopping(&self, _event: &ServiceEvent) {
            self.stopping.fetch_add(1, Ordering::Relaxed);
        }
        fn service_stopped(&self, _event: &ServiceEvent) {
            self.stopped.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn lifecycle_emits_one_event_per_transition() {
        let core = ServiceCore::new("svc");
        let listener = Arc::new(CountingListener::default());
        core.add_listener(listener.clone());

        core.begin_start().unwrap();
        core.complete_start();
        assert!(core.is_running());
        assert!(core.begin_stop());
        core.complete_stop();

        assert_eq!(listener.starting.load(Ordering::Relaxed), 1);
        assert_eq!(listener.started.load(Ordering::Relaxed), 1);
        assert_eq!(listener.stopping.load(Ordering::Relaxed), 1);
        assert_eq!(listener.stopped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn stop_is_idempotent() {
        let core = ServiceCore::new("svc");
        core.begin_start().unwrap();
        core.complete_start();
        assert!(core.begin_stop());
        core.complete_stop();
        assert!(!core.begin_stop());
        assert_eq!(core.state(), ServiceState::Stopped);
    }

    #[test]
    fn stopped_service_cannot_be_restarted() {
        let core = ServiceCore::new("svc");
        core.begin_start().unwrap();
        core.complete_start();
        core.begin_stop();
        core.complete_stop();
        assert!(matches!(core.begin_start(), Err(Error::IllegalState(_))));
    }

    #[test]
    fn configuration_is_frozen_once_started() {
        let core = ServiceCore::new("svc");
        core.store_config(XmlElement::new("cfg")).unwrap();
        core.begin_start().unwrap();
        let err = core.store_config(XmlElement::new("cfg")).unwrap_err();
        assert!(matches!(err, Error::IllegalState(_)));
        core.begin_stop();
        core.complete_stop();
    }
}
