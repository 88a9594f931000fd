use crate::filter::Filter;
use crate::negotiate::Capabilities;
use crate::session::Session;
use crate::status::{FallbackStatusError, IntoStatus, Status};
use crate::transport::Transport;
use log::info;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Connection lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    ConnectionEstablished,
    Finished,
}

type Listener = Arc<dyn Fn(u64) + Send + Sync>;

/// A registered filter type plus the settings every session starts with.
///
/// Cloning is cheap; the daemon hands one clone to each worker thread.
pub struct Client<F: Filter> {
    factory: Arc<dyn Fn() -> F + Send + Sync>,
    capabilities: Arc<Capabilities>,
    fallback_status: Status,
    listeners: Vec<(LifecycleEvent, Listener)>,
}

impl<F: Filter> Clone for Client<F> {
    fn clone(&self) -> Self {
        Client {
            factory: self.factory.clone(),
            capabilities: self.capabilities.clone(),
            fallback_status: self.fallback_status,
            listeners: self.listeners.clone(),
        }
    }
}

impl<F: Filter> Client<F> {
    /// Registers a filter type. `factory` builds one filter per connection;
    /// constructor arguments are whatever it captures.
    pub fn register<C>(factory: C) -> Self
    where
        C: Fn() -> F + Send + Sync + 'static,
    {
        Client {
            factory: Arc::new(factory),
            capabilities: Arc::new(Capabilities::of::<F>()),
            fallback_status: Status::Accept,
            listeners: Vec::new(),
        }
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn fallback_status(&self) -> Status {
        self.fallback_status
    }

    /// Status applied when a handler fails. Defaults to `accept`; only
    /// statuses that end the message are allowed.
    pub fn set_fallback_status<V: IntoStatus>(&mut self, value: V) -> Result<(), FallbackStatusError> {
        self.fallback_status = Status::fallback(value)?;
        Ok(())
    }

    /// Calls `callback` with the session id whenever `event` happens.
    pub fn connect<C>(&mut self, event: LifecycleEvent, callback: C)
    where
        C: Fn(u64) + Send + Sync + 'static,
    {
        self.listeners.push((event, Arc::new(callback)));
    }

    /// Creates the session for a freshly accepted connection.
    pub fn open_session(&self) -> Result<Session<F>, FallbackStatusError> {
        let id = SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let session = Session::new(id, (self.factory)(), self.fallback_status)?;
        info!("{id}: connection established");
        self.emit(LifecycleEvent::ConnectionEstablished, id);
        Ok(session)
    }

    /// Finishes a session whose connection is closing.
    pub fn close_session(&self, mut session: Session<F>, transport: &mut dyn Transport) {
        session.finish(transport);
        info!("{}: connection finished", session.id());
        self.emit(LifecycleEvent::Finished, session.id());
    }

    fn emit(&self, event: LifecycleEvent, id: u64) {
        for (_, listener) in self.listeners.iter().filter(|(e, _)| *e == event) {
            listener(id);
        }
    }
}
