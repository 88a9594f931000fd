//! The per-connection protocol engine.

use crate::context::Context;
use crate::filter::{Filter, HandlerError, HandlerResult};
use crate::macro_cache::MacroCache;
use crate::milter::Actions;
use crate::negotiate::{Capabilities, Events, NegotiateOption};
use crate::status::{FallbackStatusError, IntoStatus, Reply, Status};
use crate::transport::Transport;
use crate::watch::Watcher;
use log::{debug, error, warn};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Where in the protocol a session currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Start,
    Negotiate,
    Connect,
    Helo,
    EnvelopeFrom,
    EnvelopeRecipient,
    Data,
    Unknown,
    Header,
    EndOfHeader,
    Body,
    EndOfMessage,
    Abort,
    Finished,
}

impl State {
    pub fn name(self) -> &'static str {
        match self {
            State::Start => "start",
            State::Negotiate => "negotiate",
            State::Connect => "connect",
            State::Helo => "helo",
            State::EnvelopeFrom => "envelope_from",
            State::EnvelopeRecipient => "envelope_recipient",
            State::Data => "data",
            State::Unknown => "unknown",
            State::Header => "header",
            State::EndOfHeader => "end_of_header",
            State::Body => "body",
            State::EndOfMessage => "end_of_message",
            State::Abort => "abort",
            State::Finished => "finished",
        }
    }

    /// Position within a mail transaction, `None` outside of one.
    pub fn transaction_position(self) -> Option<u8> {
        match self {
            State::EnvelopeFrom => Some(1),
            State::EnvelopeRecipient => Some(2),
            State::Data => Some(3),
            State::Header => Some(4),
            State::EndOfHeader => Some(5),
            State::Body => Some(6),
            State::EndOfMessage => Some(7),
            _ => None,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Negotiate,
    Connect,
    Helo,
    EnvelopeFrom,
    EnvelopeRecipient,
    Data,
    Header,
    EndOfHeader,
    Body,
    EndOfMessage,
    Unknown,
    Abort,
    Finished,
}

impl EventKind {
    pub fn state(self) -> State {
        match self {
            EventKind::Negotiate => State::Negotiate,
            EventKind::Connect => State::Connect,
            EventKind::Helo => State::Helo,
            EventKind::EnvelopeFrom => State::EnvelopeFrom,
            EventKind::EnvelopeRecipient => State::EnvelopeRecipient,
            EventKind::Data => State::Data,
            EventKind::Header => State::Header,
            EventKind::EndOfHeader => State::EndOfHeader,
            EventKind::Body => State::Body,
            EventKind::EndOfMessage => State::EndOfMessage,
            EventKind::Unknown => State::Unknown,
            EventKind::Abort => State::Abort,
            EventKind::Finished => State::Finished,
        }
    }

    /// The capability a filter needs to receive this event, `None` for
    /// events that are always delivered.
    pub fn capability(self) -> Option<Events> {
        match self {
            EventKind::Connect => Some(Events::CONNECT),
            EventKind::Helo => Some(Events::HELO),
            EventKind::EnvelopeFrom => Some(Events::ENVELOPE_FROM),
            EventKind::EnvelopeRecipient => Some(Events::ENVELOPE_RECIPIENT),
            EventKind::Data => Some(Events::DATA),
            EventKind::Header => Some(Events::HEADER),
            EventKind::EndOfHeader => Some(Events::END_OF_HEADER),
            EventKind::Body => Some(Events::BODY),
            EventKind::Unknown => Some(Events::UNKNOWN),
            EventKind::Abort => Some(Events::ABORT),
            EventKind::Negotiate | EventKind::EndOfMessage | EventKind::Finished => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.state().name())
    }
}

/// Client address as reported in the connect event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectAddress {
    Inet(SocketAddr),
    Unix(PathBuf),
    Unknown,
}

/// A mail-transaction event delivered by the MTA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connect {
        hostname: String,
        address: ConnectAddress,
    },
    Helo {
        name: String,
    },
    EnvelopeFrom {
        address: String,
        parameters: Vec<String>,
    },
    EnvelopeRecipient {
        address: String,
        parameters: Vec<String>,
    },
    Data,
    Header {
        name: String,
        value: String,
    },
    EndOfHeader,
    Body(Vec<u8>),
    EndOfMessage,
    Unknown(String),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Connect { .. } => EventKind::Connect,
            Event::Helo { .. } => EventKind::Helo,
            Event::EnvelopeFrom { .. } => EventKind::EnvelopeFrom,
            Event::EnvelopeRecipient { .. } => EventKind::EnvelopeRecipient,
            Event::Data => EventKind::Data,
            Event::Header { .. } => EventKind::Header,
            Event::EndOfHeader => EventKind::EndOfHeader,
            Event::Body(_) => EventKind::Body,
            Event::EndOfMessage => EventKind::EndOfMessage,
            Event::Unknown(_) => EventKind::Unknown,
        }
    }
}

/// Engine-owned state of one session, shared with [`Context`] while a
/// handler runs.
#[derive(Debug)]
pub(crate) struct SessionState {
    pub id: u64,
    pub status: Status,
    pub reply: Option<Reply>,
    pub macros: MacroCache,
    pub state: State,
    pub actions: Actions,
    pub reset_requested: bool,
    pub watcher: Watcher,
}

impl SessionState {
    fn clear(&mut self) {
        self.status = Status::Default;
        self.reply = None;
        self.reset_requested = false;
        self.macros.invalidate();
    }
}

pub struct Session<F: Filter> {
    filter: F,
    fallback_status: Status,
    capabilities: Capabilities,
    inner: SessionState,
    pending: Option<EventKind>,
}

impl<F: Filter> Session<F> {
    /// Creates a session. `fallback_status` must be a final status.
    pub fn new<V: IntoStatus>(id: u64, filter: F, fallback_status: V) -> Result<Self, FallbackStatusError> {
        let fallback_status = Status::fallback(fallback_status)?;
        let capabilities = Capabilities::of::<F>();
        Ok(Session {
            filter,
            fallback_status,
            inner: SessionState {
                id,
                status: Status::Default,
                reply: None,
                macros: MacroCache::new(),
                state: State::Start,
                actions: capabilities.actions,
                reset_requested: false,
                watcher: Watcher::default(),
            },
            capabilities,
            pending: None,
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> State {
        self.inner.state
    }

    pub fn fallback_status(&self) -> Status {
        self.fallback_status
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn actions(&self) -> Actions {
        self.inner.actions
    }

    pub fn filter(&self) -> &F {
        &self.filter
    }

    pub fn filter_mut(&mut self) -> &mut F {
        &mut self.filter
    }

    /// Whether the macro cache currently holds a mapping fetched from the
    /// transport.
    pub fn macros_fetched(&self) -> bool {
        self.inner.macros.is_fetched()
    }

    /// Whether a delayed response is still outstanding.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Answers the MTA's option offer. Never rejects.
    pub fn negotiate(&mut self, offered: &NegotiateOption) -> (Status, NegotiateOption) {
        self.begin(EventKind::Negotiate);
        let resolved = self.capabilities.resolve(offered);
        self.inner.actions = resolved.actions;
        debug!(
            "{}: negotiated version {} actions {:?} steps {:?}",
            self.inner.id, resolved.version, resolved.actions, resolved.steps
        );
        self.inner.clear();
        (Status::Continue, resolved)
    }

    /// Delivers one event to the filter and returns the status for the MTA.
    pub fn dispatch(&mut self, transport: &mut dyn Transport, event: Event) -> Status {
        let kind = event.kind();
        if let Some(pending) = self.pending {
            warn!(
                "{}: {kind} delivered while the {pending} response is still pending",
                self.inner.id
            );
        }
        self.begin(kind);
        let wanted = kind
            .capability()
            .is_none_or(|events| self.capabilities.handles(events));
        if wanted {
            let result = {
                let mut ctx = Context::new(&mut self.inner, transport);
                invoke(&mut self.filter, &mut ctx, event)
            };
            if let Err(error) = result {
                self.recover(kind, error);
            }
        }
        self.finish_cycle(kind, transport)
    }

    /// Waits up to `timeout` for the completion a PROGRESS status is waiting
    /// for and returns the status it resolved to.
    pub fn complete_pending(&mut self, transport: &mut dyn Transport, timeout: Duration) -> Option<Status> {
        let kind = self.pending?;
        if !self.inner.watcher.has_active() {
            error!(
                "{}: {kind} response delayed without a watch, using fallback",
                self.inner.id
            );
            self.begin(kind);
            self.inner.status = self.fallback_status;
            return Some(self.finish_cycle(kind, transport));
        }
        let (handle, exit) = self.inner.watcher.wait(timeout)?;
        self.begin(kind);
        let result = {
            let mut ctx = Context::new(&mut self.inner, transport);
            self.filter.watch_completed(&mut ctx, handle, exit)
        };
        if let Err(error) = result {
            self.recover(kind, error);
        }
        Some(self.finish_cycle(kind, transport))
    }

    /// Handles SMFIC_ABORT: the filter's `abort`, then pending watches are
    /// cancelled, then `reset` runs no matter what happened before.
    pub fn abort(&mut self, transport: &mut dyn Transport) -> Status {
        self.begin(EventKind::Abort);
        if self.capabilities.handles(Events::ABORT) {
            let result = {
                let mut ctx = Context::new(&mut self.inner, transport);
                self.filter.abort(&mut ctx)
            };
            if let Err(error) = result {
                self.recover(EventKind::Abort, error);
            }
        }
        let cancelled = self.inner.watcher.cancel_all();
        if cancelled > 0 {
            debug!("{}: abort cancelled {cancelled} watch(es)", self.inner.id);
        }
        self.pending = None;
        if let Err(e) = self.filter.reset() {
            error!("{}: reset after abort failed: {e}", self.inner.id);
            self.inner.status = self.fallback_status;
            self.inner.reply = None;
        }
        let status = self.inner.status.resolved();
        self.inner.clear();
        debug!("{}: abort -> {status}", self.inner.id);
        status
    }

    /// The connection is closing.
    pub fn finish(&mut self, transport: &mut dyn Transport) -> Status {
        self.begin(EventKind::Finished);
        self.inner.watcher.cancel_all();
        self.pending = None;
        let result = {
            let mut ctx = Context::new(&mut self.inner, transport);
            self.filter.finished(&mut ctx)
        };
        if let Err(error) = result {
            self.recover(EventKind::Finished, error);
        }
        let status = self.inner.status.resolved();
        self.inner.clear();
        status
    }

    fn begin(&mut self, kind: EventKind) {
        self.inner.macros.invalidate();
        self.inner.state = kind.state();
    }

    fn recover(&mut self, kind: EventKind, error: HandlerError) {
        error!("{}: {kind} failed: {error}", self.inner.id);
        if let Err(e) = self.filter.on_error(kind, &*error) {
            error!("{}: on_error for {kind} failed: {e}", self.inner.id);
        }
        self.inner.status = self.fallback_status;
        self.inner.reply = None;
    }

    fn finish_cycle(&mut self, kind: EventKind, transport: &mut dyn Transport) -> Status {
        let requested = std::mem::take(&mut self.inner.reset_requested);
        let delayed = self.inner.status == Status::Progress;
        let transaction_done = kind == EventKind::EndOfMessage && !delayed;
        if requested || transaction_done {
            if let Err(error) = self.filter.reset() {
                self.recover(kind, error);
            }
        }

        let status = self.inner.status.resolved();
        self.pending = if status == Status::Progress {
            Some(kind)
        } else {
            None
        };
        if let Some(reply) = self.inner.reply.take()
            && matches!(status, Status::Reject | Status::TemporaryFailure)
            && let Err(e) = transport.set_reply(&reply)
        {
            warn!("{}: reply {} not recorded: {e}", self.inner.id, reply.format());
        }
        self.inner.clear();
        debug!("{}: {kind} -> {status}", self.inner.id);
        status
    }
}

fn invoke<F: Filter>(filter: &mut F, ctx: &mut Context<'_>, event: Event) -> HandlerResult {
    match event {
        Event::Connect { hostname, address } => filter.connect(ctx, &hostname, &address),
        Event::Helo { name } => filter.helo(ctx, &name),
        Event::EnvelopeFrom {
            address,
            parameters,
        } => filter.envelope_from(ctx, &address, &parameters),
        Event::EnvelopeRecipient {
            address,
            parameters,
        } => filter.envelope_recipient(ctx, &address, &parameters),
        Event::Data => filter.data(ctx),
        Event::Header { name, value } => filter.header(ctx, &name, &value),
        Event::EndOfHeader => filter.end_of_header(ctx),
        Event::Body(chunk) => filter.body(ctx, &chunk),
        Event::EndOfMessage => filter.end_of_message(ctx),
        Event::Unknown(command) => filter.unknown(ctx, &command),
    }
}
