use crate::mutation::{Modification, MutationError};
use crate::session::{SessionState, State};
use crate::status::{IntoStatus, InvalidStatusError, Reply, ReplyError, Status};
use crate::transport::Transport;
use crate::watch::WatchHandle;
use log::{debug, warn};
use std::process::Child;

/// What a filter handler sees of its session while it runs.
///
/// A context only lives for the duration of one handler call, so neither
/// status changes nor modifications can leak past the event they belong to.
pub struct Context<'a> {
    inner: &'a mut SessionState,
    transport: &'a mut dyn Transport,
}

impl<'a> Context<'a> {
    pub(crate) fn new(inner: &'a mut SessionState, transport: &'a mut dyn Transport) -> Self {
        Context { inner, transport }
    }

    pub fn session_id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> State {
        self.inner.state
    }

    pub fn status(&self) -> Status {
        self.inner.status
    }

    /// The reply that will accompany a reject/tempfail, if one was set.
    pub fn reply(&self) -> Option<&Reply> {
        self.inner.reply.as_ref()
    }

    /// Sets the status directly, by value or by name. Clears a pending reply.
    pub fn set_status<V: IntoStatus>(&mut self, value: V) -> Result<(), InvalidStatusError> {
        let status = Status::normalize(value)?;
        self.inner.reply = None;
        self.apply_status(status);
        Ok(())
    }

    pub fn accept(&mut self) {
        self.inner.reply = None;
        self.apply_status(Status::Accept);
    }

    pub fn discard(&mut self) {
        self.inner.reply = None;
        self.apply_status(Status::Discard);
    }

    pub fn continue_processing(&mut self) {
        self.inner.reply = None;
        self.apply_status(Status::Continue);
    }

    /// Skips the rest of the body chunks.
    pub fn skip(&mut self) {
        self.inner.reply = None;
        self.apply_status(Status::Skip);
    }

    /// Tells the MTA the answer is pending; the real status is set later
    /// from [`crate::Filter::watch_completed`].
    pub fn delay_response(&mut self) {
        self.inner.reply = None;
        self.apply_status(Status::Progress);
    }

    pub fn reject(&mut self) {
        self.inner.reply = None;
        self.apply_status(Status::Reject);
    }

    pub fn temporary_failure(&mut self) {
        self.inner.reply = None;
        self.apply_status(Status::TemporaryFailure);
    }

    /// Rejects with an explicit reply. Missing parts default to
    /// `550 5.7.1 Command rejected`; with no parts at all this is a plain
    /// [`Context::reject`].
    pub fn reject_with(
        &mut self,
        code: Option<u16>,
        extended_code: Option<&str>,
        reason: Option<&str>,
    ) -> Result<(), ReplyError> {
        if code.is_none() && extended_code.is_none() && reason.is_none() {
            self.reject();
            return Ok(());
        }
        self.set_reply(
            code.unwrap_or(550),
            Some(extended_code.unwrap_or("5.7.1")),
            reason.unwrap_or("Command rejected"),
        )?;
        Ok(())
    }

    /// Like [`Context::reject_with`], defaulting to
    /// `451 4.7.1 Service unavailable - try again later`.
    pub fn temporary_failure_with(
        &mut self,
        code: Option<u16>,
        extended_code: Option<&str>,
        reason: Option<&str>,
    ) -> Result<(), ReplyError> {
        if code.is_none() && extended_code.is_none() && reason.is_none() {
            self.temporary_failure();
            return Ok(());
        }
        self.set_reply(
            code.unwrap_or(451),
            Some(extended_code.unwrap_or("4.7.1")),
            reason.unwrap_or("Service unavailable - try again later"),
        )?;
        Ok(())
    }

    /// Sets an SMTP reply and the status its code implies.
    pub fn set_reply(
        &mut self,
        code: u16,
        extended_code: Option<&str>,
        reason: &str,
    ) -> Result<Status, ReplyError> {
        let (status, reply) = Status::from_reply_code(code, extended_code, reason)?;
        self.apply_status(status);
        self.inner.reply = Some(reply);
        Ok(status)
    }

    fn apply_status(&mut self, status: Status) {
        self.inner.status = status;
        if status.ends_transaction(self.inner.state == State::EnvelopeRecipient) {
            self.inner.reset_requested = true;
        }
    }

    /// Value of an MTA macro for the current event.
    pub fn macro_value(&mut self, name: &str) -> Option<&str> {
        self.inner.macros.get(&mut *self.transport, name)
    }

    pub fn add_header(&mut self, name: &str, value: &str) -> Result<(), MutationError> {
        self.modify(Modification::AddHeader {
            name: name.to_string(),
            value: value.to_string(),
        })
    }

    pub fn insert_header(&mut self, index: u32, name: &str, value: &str) -> Result<(), MutationError> {
        self.modify(Modification::InsertHeader {
            index,
            name: name.to_string(),
            value: value.to_string(),
        })
    }

    /// Changes the `index`th (1-based) occurrence of header `name`.
    pub fn change_header(&mut self, name: &str, index: u32, value: &str) -> Result<(), MutationError> {
        self.modify(Modification::ChangeHeader {
            name: name.to_string(),
            index,
            value: value.to_string(),
        })
    }

    pub fn delete_header(&mut self, name: &str, index: u32) -> Result<(), MutationError> {
        self.modify(Modification::DeleteHeader {
            name: name.to_string(),
            index,
        })
    }

    /// Replaces the body. Text is sent as UTF-8.
    pub fn replace_body<B: AsRef<[u8]>>(&mut self, body: B) -> Result<(), MutationError> {
        self.modify(Modification::ReplaceBody(body.as_ref().to_vec()))
    }

    pub fn change_from(&mut self, address: &str, parameters: Option<&str>) -> Result<(), MutationError> {
        self.modify(Modification::ChangeFrom {
            address: address.to_string(),
            parameters: parameters.map(str::to_string),
        })
    }

    pub fn add_recipient(&mut self, address: &str, parameters: Option<&str>) -> Result<(), MutationError> {
        self.modify(Modification::AddRecipient {
            address: address.to_string(),
            parameters: parameters.map(str::to_string),
        })
    }

    pub fn delete_recipient(&mut self, address: &str) -> Result<(), MutationError> {
        self.modify(Modification::DeleteRecipient {
            address: address.to_string(),
        })
    }

    /// Quarantines the message. On success the message is accepted into the
    /// quarantine and `true` is returned; on failure the status is left alone.
    pub fn quarantine(&mut self, reason: &str) -> bool {
        match self.modify(Modification::Quarantine {
            reason: reason.to_string(),
        }) {
            Ok(()) => {
                self.accept();
                true
            }
            Err(e) => {
                warn!("{}: quarantine refused: {e}", self.inner.id);
                false
            }
        }
    }

    /// Watches `child` until it exits. Pair with [`Context::delay_response`].
    pub fn watch_child(&mut self, child: Child) -> WatchHandle {
        let pid = child.id();
        let handle = self.inner.watcher.watch_child(child);
        debug!("{}: watching pid {pid} as {}", self.inner.id, handle.id());
        handle
    }

    pub fn cancel_watch(&mut self, handle: WatchHandle) -> bool {
        self.inner.watcher.cancel(handle)
    }

    fn modify(&mut self, modification: Modification) -> Result<(), MutationError> {
        modification.validate(self.inner.state, self.inner.actions)?;
        debug!("{}: {}", self.inner.id, modification.operation());
        self.transport.apply(modification)
    }
}
