use crate::mutation::{Modification, MutationError};
use crate::status::Reply;
use std::collections::HashMap;

/// What the session engine needs from whoever talks to the MTA.
///
/// The engine never touches the wire itself. [`crate::wire::WireTransport`]
/// is the implementation used by the daemon; tests use recording fakes.
pub trait Transport {
    /// All macros the MTA has supplied for the current event, if any.
    fn available_macros(&mut self) -> Option<HashMap<String, String>>;

    /// Records the SMTP reply to send along with a reject/tempfail status.
    fn set_reply(&mut self, reply: &Reply) -> Result<(), MutationError>;

    /// Forwards a header, body or envelope modification.
    ///
    /// The engine has already checked that the modification is legal in the
    /// current state; the transport may still refuse it.
    fn apply(&mut self, modification: Modification) -> Result<(), MutationError>;
}
