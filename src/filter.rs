use crate::context::Context;
use crate::milter::Actions;
use crate::negotiate::{Events, MacroStage};
use crate::session::{ConnectAddress, EventKind};
use crate::watch::{ChildExit, WatchHandle};
use std::error::Error;

pub type HandlerError = Box<dyn Error + Send + Sync>;
pub type HandlerResult = Result<(), HandlerError>;

/// A mail filter. One value is created per MTA connection.
///
/// Every handler has a default that does nothing, which leaves the event at
/// `Continue`. Handlers for optional events are only called, and only
/// requested from the MTA, if they are listed in [`Filter::EVENTS`].
/// `end_of_message`, `reset` and `finished` are always called.
///
/// ```no_run
/// use milter_session::{Context, Events, Filter, HandlerResult};
///
/// #[derive(Default)]
/// struct NoSpam;
///
/// impl Filter for NoSpam {
///     const EVENTS: Events = Events::HEADER;
///
///     fn header(&mut self, ctx: &mut Context<'_>, name: &str, value: &str) -> HandlerResult {
///         if name.eq_ignore_ascii_case("Subject") && value.contains("SPAM") {
///             ctx.reject_with(Some(550), Some("5.7.1"), Some("no spam"))?;
///         }
///         Ok(())
///     }
/// }
/// ```
#[allow(unused_variables)]
pub trait Filter: Send + 'static {
    /// Optional events this filter handles.
    const EVENTS: Events = Events::empty();
    /// Ask the MTA to keep the leading space of header values.
    const HEADER_VALUE_WITH_LEADING_SPACE: bool = false;
    /// Modifications this filter wants to be able to make.
    const ACTIONS: Actions = Actions::all();
    /// Macros to request from the MTA per stage, names separated by spaces.
    const MACRO_REQUESTS: &'static [(MacroStage, &'static str)] = &[];

    fn connect(&mut self, ctx: &mut Context<'_>, hostname: &str, address: &ConnectAddress) -> HandlerResult {
        Ok(())
    }

    fn helo(&mut self, ctx: &mut Context<'_>, name: &str) -> HandlerResult {
        Ok(())
    }

    fn envelope_from(&mut self, ctx: &mut Context<'_>, address: &str, parameters: &[String]) -> HandlerResult {
        Ok(())
    }

    fn envelope_recipient(
        &mut self,
        ctx: &mut Context<'_>,
        address: &str,
        parameters: &[String],
    ) -> HandlerResult {
        Ok(())
    }

    fn data(&mut self, ctx: &mut Context<'_>) -> HandlerResult {
        Ok(())
    }

    fn header(&mut self, ctx: &mut Context<'_>, name: &str, value: &str) -> HandlerResult {
        Ok(())
    }

    fn end_of_header(&mut self, ctx: &mut Context<'_>) -> HandlerResult {
        Ok(())
    }

    fn body(&mut self, ctx: &mut Context<'_>, chunk: &[u8]) -> HandlerResult {
        Ok(())
    }

    /// The message is complete. This is where modifications belong.
    fn end_of_message(&mut self, ctx: &mut Context<'_>) -> HandlerResult {
        Ok(())
    }

    fn unknown(&mut self, ctx: &mut Context<'_>, command: &str) -> HandlerResult {
        Ok(())
    }

    /// The MTA aborted the transaction. [`Filter::reset`] follows regardless
    /// of the outcome.
    fn abort(&mut self, ctx: &mut Context<'_>) -> HandlerResult {
        Ok(())
    }

    /// Clears per-transaction state.
    fn reset(&mut self) -> HandlerResult {
        Ok(())
    }

    /// The connection is closing.
    fn finished(&mut self, ctx: &mut Context<'_>) -> HandlerResult {
        Ok(())
    }

    /// A child registered with [`Context::watch_child`] has exited.
    fn watch_completed(&mut self, ctx: &mut Context<'_>, handle: WatchHandle, exit: ChildExit) -> HandlerResult {
        Ok(())
    }

    /// Called after a handler failed, before the fallback status is applied.
    fn on_error(&mut self, event: EventKind, error: &(dyn Error + Send + Sync)) -> HandlerResult {
        Ok(())
    }
}
