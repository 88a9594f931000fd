//! Header, body and envelope modifications and when they are allowed.

use crate::milter::Actions;
use crate::session::State;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modification {
    AddHeader {
        name: String,
        value: String,
    },
    InsertHeader {
        index: u32,
        name: String,
        value: String,
    },
    /// `index` is the 1-based occurrence of `name`.
    ChangeHeader {
        name: String,
        index: u32,
        value: String,
    },
    DeleteHeader {
        name: String,
        index: u32,
    },
    ReplaceBody(Vec<u8>),
    ChangeFrom {
        address: String,
        parameters: Option<String>,
    },
    AddRecipient {
        address: String,
        parameters: Option<String>,
    },
    DeleteRecipient {
        address: String,
    },
    Quarantine {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MutationError {
    #[error("{operation} is not allowed in state {state}")]
    IllegalState {
        operation: &'static str,
        state: State,
    },
    #[error("{operation} was not negotiated with the MTA")]
    NotNegotiated { operation: &'static str },
    #[error("{operation}: header occurrence index must be 1 or greater")]
    InvalidIndex { operation: &'static str },
    #[error("{operation}: header name is empty")]
    EmptyHeaderName { operation: &'static str },
    #[error("{operation} refused by transport: {reason}")]
    Refused {
        operation: &'static str,
        reason: String,
    },
}

impl Modification {
    pub fn operation(&self) -> &'static str {
        match self {
            Modification::AddHeader { .. } => "add_header",
            Modification::InsertHeader { .. } => "insert_header",
            Modification::ChangeHeader { .. } => "change_header",
            Modification::DeleteHeader { .. } => "delete_header",
            Modification::ReplaceBody(_) => "replace_body",
            Modification::ChangeFrom { .. } => "change_from",
            Modification::AddRecipient { .. } => "add_recipient",
            Modification::DeleteRecipient { .. } => "delete_recipient",
            Modification::Quarantine { .. } => "quarantine",
        }
    }

    pub fn required_action(&self) -> Actions {
        match self {
            Modification::AddHeader { .. } | Modification::InsertHeader { .. } => {
                Actions::ADD_HEADERS
            }
            Modification::ChangeHeader { .. } | Modification::DeleteHeader { .. } => {
                Actions::CHANGE_HEADERS
            }
            Modification::ReplaceBody(_) => Actions::CHANGE_BODY,
            Modification::ChangeFrom { .. } => Actions::CHANGE_FROM,
            Modification::AddRecipient {
                parameters: Some(_),
                ..
            } => Actions::ADD_RECIPIENT_WITH_PARAMETERS,
            Modification::AddRecipient { .. } => Actions::ADD_RECIPIENT,
            Modification::DeleteRecipient { .. } => Actions::DELETE_RECIPIENT,
            Modification::Quarantine { .. } => Actions::QUARANTINE,
        }
    }

    /// First transaction state in which the modification may be issued.
    /// Every modification stays legal up to and including end-of-message.
    pub fn earliest_state(&self) -> State {
        match self {
            Modification::AddRecipient { .. } | Modification::DeleteRecipient { .. } => {
                State::EnvelopeRecipient
            }
            _ => State::EnvelopeFrom,
        }
    }

    pub fn validate(&self, state: State, actions: Actions) -> Result<(), MutationError> {
        let operation = self.operation();
        match self {
            Modification::AddHeader { name, .. }
            | Modification::InsertHeader { name, .. }
            | Modification::ChangeHeader { name, .. }
            | Modification::DeleteHeader { name, .. }
                if name.is_empty() =>
            {
                return Err(MutationError::EmptyHeaderName { operation });
            }
            Modification::ChangeHeader { index: 0, .. } | Modification::DeleteHeader { index: 0, .. } => {
                return Err(MutationError::InvalidIndex { operation });
            }
            _ => (),
        }
        let legal = match (
            state.transaction_position(),
            self.earliest_state().transaction_position(),
        ) {
            (Some(current), Some(earliest)) => current >= earliest,
            _ => false,
        };
        if !legal {
            return Err(MutationError::IllegalState { operation, state });
        }
        if !actions.contains(self.required_action()) {
            return Err(MutationError::NotNegotiated { operation });
        }
        Ok(())
    }
}

#[test]
fn test_recipient_edits_start_at_envelope_recipient() {
    let add = Modification::AddRecipient {
        address: "b@y".into(),
        parameters: None,
    };
    assert!(matches!(
        add.validate(State::EnvelopeFrom, Actions::all()),
        Err(MutationError::IllegalState { .. })
    ));
    add.validate(State::EnvelopeRecipient, Actions::all()).unwrap();
    add.validate(State::EndOfMessage, Actions::all()).unwrap();
}

#[test]
fn test_nothing_is_legal_outside_a_transaction() {
    let body = Modification::ReplaceBody(b"x".to_vec());
    for state in [
        State::Start,
        State::Negotiate,
        State::Connect,
        State::Helo,
        State::Unknown,
        State::Abort,
        State::Finished,
    ] {
        assert!(body.validate(state, Actions::all()).is_err(), "{state}");
    }
    body.validate(State::Body, Actions::all()).unwrap();
}

#[test]
fn test_header_index_and_actions() {
    let change = Modification::ChangeHeader {
        name: "Subject".into(),
        index: 0,
        value: "x".into(),
    };
    assert_eq!(
        change.validate(State::EndOfMessage, Actions::all()),
        Err(MutationError::InvalidIndex {
            operation: "change_header"
        })
    );
    let delete = Modification::DeleteHeader {
        name: "Subject".into(),
        index: 1,
    };
    assert_eq!(
        delete.validate(State::EndOfMessage, Actions::ADD_HEADERS),
        Err(MutationError::NotNegotiated {
            operation: "delete_header"
        })
    );
    let with_params = Modification::AddRecipient {
        address: "c@z".into(),
        parameters: Some("NOTIFY=NEVER".into()),
    };
    assert!(
        with_params
            .validate(State::EndOfMessage, Actions::ADD_RECIPIENT)
            .is_err()
    );
}
