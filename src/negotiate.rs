//! Option negotiation: which steps the MTA should skip and which actions
//! the filter may use.

use crate::filter::Filter;
use crate::milter::constants::SMFIF_VERSION;
use crate::milter::{Actions, StepFlags};
use bitflags::bitflags;

bitflags! {
    /// Optional event handlers a filter implements.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Events: u32 {
        const CONNECT = 1 << 0;
        const HELO = 1 << 1;
        const ENVELOPE_FROM = 1 << 2;
        const ENVELOPE_RECIPIENT = 1 << 3;
        const DATA = 1 << 4;
        const HEADER = 1 << 5;
        const END_OF_HEADER = 1 << 6;
        const BODY = 1 << 7;
        const UNKNOWN = 1 << 8;
        const ABORT = 1 << 9;
    }
}

// events the MTA can be told not to send, with the step bit that does it
const SKIPPABLE: [(Events, StepFlags); 9] = [
    (Events::CONNECT, StepFlags::NO_CONNECT),
    (Events::HELO, StepFlags::NO_HELO),
    (Events::ENVELOPE_FROM, StepFlags::NO_ENVELOPE_FROM),
    (Events::ENVELOPE_RECIPIENT, StepFlags::NO_ENVELOPE_RECIPIENT),
    (Events::DATA, StepFlags::NO_DATA),
    (Events::HEADER, StepFlags::NO_HEADERS),
    (Events::END_OF_HEADER, StepFlags::NO_END_OF_HEADER),
    (Events::BODY, StepFlags::NO_BODY),
    (Events::UNKNOWN, StepFlags::NO_UNKNOWN),
];

/// Protocol stage a macro list applies to (SMFIM_*).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MacroStage {
    Connect = 0,
    Helo = 1,
    EnvelopeFrom = 2,
    EnvelopeRecipient = 3,
    Data = 4,
    EndOfMessage = 5,
    EndOfHeader = 6,
}

/// The three numbers exchanged in SMFIC_OPTNEG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiateOption {
    pub version: u32,
    pub actions: Actions,
    pub steps: StepFlags,
}

impl NegotiateOption {
    pub fn new(version: u32, actions: Actions, steps: StepFlags) -> Self {
        NegotiateOption {
            version,
            actions,
            steps,
        }
    }
}

/// What a registered filter type declares about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub events: Events,
    pub header_value_with_leading_space: bool,
    pub actions: Actions,
    pub macro_requests: Vec<(MacroStage, String)>,
}

impl Capabilities {
    pub fn of<F: Filter>() -> Self {
        Capabilities {
            events: F::EVENTS,
            header_value_with_leading_space: F::HEADER_VALUE_WITH_LEADING_SPACE,
            actions: F::ACTIONS,
            macro_requests: F::MACRO_REQUESTS
                .iter()
                .map(|(stage, names)| (*stage, names.to_string()))
                .collect(),
        }
    }

    pub fn handles(&self, events: Events) -> bool {
        self.events.contains(events)
    }

    /// Computes the answer to the MTA's offer.
    pub fn resolve(&self, offered: &NegotiateOption) -> NegotiateOption {
        // skip bits of undefined events are kept as far as the MTA offered them
        let mut steps = offered.steps;
        for (event, step) in SKIPPABLE {
            if self.events.contains(event) {
                steps.remove(step);
            }
        }
        // a reply turn for every event, always
        steps.remove(StepFlags::NO_REPLY_MASK);
        if self.header_value_with_leading_space {
            steps.remove(StepFlags::HEADER_VALUE_WITH_LEADING_SPACE);
        }

        let mut actions = offered.actions & self.actions;
        if self.macro_requests.is_empty() {
            actions.remove(Actions::SET_SYMBOL_LIST);
        } else if offered.actions.contains(Actions::SET_SYMBOL_LIST) {
            actions.insert(Actions::SET_SYMBOL_LIST);
        }

        NegotiateOption {
            version: offered.version.min(SMFIF_VERSION),
            actions,
            steps,
        }
    }

    /// Macro requests grouped per stage, names space separated, as they go
    /// on the wire after the option reply.
    pub fn macro_lists(&self) -> Vec<(MacroStage, String)> {
        let mut lists: Vec<(MacroStage, String)> = Vec::new();
        for (stage, names) in &self.macro_requests {
            match lists.iter_mut().find(|(s, _)| s == stage) {
                Some((_, list)) => {
                    list.push(' ');
                    list.push_str(names);
                }
                None => lists.push((*stage, names.clone())),
            }
        }
        lists.sort_by_key(|(stage, _)| *stage);
        lists
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(events: Events) -> Capabilities {
        Capabilities {
            events,
            header_value_with_leading_space: false,
            actions: Actions::all(),
            macro_requests: Vec::new(),
        }
    }

    fn full_offer() -> NegotiateOption {
        NegotiateOption::new(6, Actions::all(), StepFlags::all())
    }

    #[test]
    fn end_of_message_only_skips_every_optional_event() {
        let resolved = caps(Events::empty()).resolve(&full_offer());
        for (_, step) in SKIPPABLE {
            assert!(resolved.steps.contains(step), "{step:?}");
        }
        assert!(resolved.steps.intersection(StepFlags::NO_REPLY_MASK).is_empty());
        assert_eq!(resolved.version, 6);
    }

    #[test]
    fn defined_events_are_delivered() {
        let offer = NegotiateOption::new(6, Actions::all(), StepFlags::NO_HEADERS | StepFlags::NO_BODY);
        let resolved = caps(Events::HEADER | Events::BODY).resolve(&offer);
        assert!(!resolved.steps.contains(StepFlags::NO_HEADERS));
        assert!(!resolved.steps.contains(StepFlags::NO_BODY));
    }

    #[test]
    fn unoffered_skip_bits_are_not_set() {
        let offer = NegotiateOption::new(2, Actions::ADD_HEADERS, StepFlags::NO_CONNECT);
        let resolved = caps(Events::empty()).resolve(&offer);
        assert_eq!(resolved.steps, StepFlags::NO_CONNECT);
        assert_eq!(resolved.version, 2);
        assert_eq!(resolved.actions, Actions::ADD_HEADERS);
    }

    #[test]
    fn feature_bits_survive_and_leading_space_is_cleared_on_request() {
        let offer = NegotiateOption::new(
            6,
            Actions::all(),
            StepFlags::SKIP | StepFlags::HEADER_VALUE_WITH_LEADING_SPACE | StepFlags::NO_REPLY_BODY,
        );
        let mut capabilities = caps(Events::all());
        let resolved = capabilities.resolve(&offer);
        assert_eq!(
            resolved.steps,
            StepFlags::SKIP | StepFlags::HEADER_VALUE_WITH_LEADING_SPACE
        );
        capabilities.header_value_with_leading_space = true;
        assert_eq!(capabilities.resolve(&offer).steps, StepFlags::SKIP);
    }

    #[test]
    fn macro_requests_need_symbol_list_action() {
        let mut capabilities = caps(Events::all());
        assert!(
            !capabilities
                .resolve(&full_offer())
                .actions
                .contains(Actions::SET_SYMBOL_LIST)
        );
        capabilities.macro_requests = vec![
            (MacroStage::EndOfMessage, "i".into()),
            (MacroStage::Connect, "{client_addr}".into()),
            (MacroStage::EndOfMessage, "{auth_authen}".into()),
        ];
        assert!(
            capabilities
                .resolve(&full_offer())
                .actions
                .contains(Actions::SET_SYMBOL_LIST)
        );
        assert_eq!(
            capabilities.macro_lists(),
            vec![
                (MacroStage::Connect, "{client_addr}".to_string()),
                (MacroStage::EndOfMessage, "i {auth_authen}".to_string()),
            ]
        );
    }
}
