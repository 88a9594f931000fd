//! Session engine for writing milters, the mail filters Sendmail and
//! Postfix talk to over the milter protocol.
//!
//! A filter implements [`Filter`], declaring in associated constants which
//! events it handles and which modifications it wants to make. A
//! [`Client`] builds one [`Session`] per MTA connection; the session
//! negotiates options, dispatches events to the filter with a [`Context`],
//! enforces which modifications are legal when, and turns handler failures
//! into a configurable fallback status.
//!
//! The [`wire`] module speaks the milter protocol on a socket and
//! [`cli::cli`] wraps it in a daemon:
//!
//! ```no_run
//! use milter_session::{Client, Filter};
//!
//! #[derive(Default)]
//! struct Nothing;
//! impl Filter for Nothing {}
//!
//! fn main() -> std::process::ExitCode {
//!     milter_session::cli::cli(Client::register(Nothing::default))
//! }
//! ```

pub mod cli;
pub mod client;
pub mod codec;
pub mod context;
pub mod daemon;
pub mod filter;
pub mod macro_cache;
pub mod milter;
pub mod mutation;
pub mod negotiate;
pub mod session;
pub mod status;
pub mod transport;
pub mod watch;
pub mod wire;

pub use client::{Client, LifecycleEvent};
pub use context::Context;
pub use filter::{Filter, HandlerError, HandlerResult};
pub use macro_cache::MacroCache;
pub use milter::{Actions, StepFlags};
pub use mutation::{Modification, MutationError};
pub use negotiate::{Capabilities, Events, MacroStage, NegotiateOption};
pub use session::{ConnectAddress, Event, EventKind, Session, State};
pub use status::{FallbackStatusError, IntoStatus, InvalidStatusError, Reply, ReplyError, Status};
pub use transport::Transport;
pub use watch::{ChildExit, WatchHandle};
pub use wire::{WireTransport, serve_connection};
