use milter_session::{
    Actions, ChildExit, Client, ConnectAddress, Context, Event, EventKind, Events,
    FallbackStatusError, Filter, HandlerResult, LifecycleEvent, Modification, MutationError,
    NegotiateOption, Reply, ReplyError, Session, State, Status, StepFlags, Transport, WatchHandle,
};
use std::collections::HashMap;
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
struct RecordingTransport {
    macros: Option<HashMap<String, String>>,
    fetches: usize,
    replies: Vec<Reply>,
    applied: Vec<Modification>,
}

impl Transport for RecordingTransport {
    fn available_macros(&mut self) -> Option<HashMap<String, String>> {
        self.fetches += 1;
        self.macros.clone()
    }

    fn set_reply(&mut self, reply: &Reply) -> Result<(), MutationError> {
        self.replies.push(reply.clone());
        Ok(())
    }

    fn apply(&mut self, modification: Modification) -> Result<(), MutationError> {
        self.applied.push(modification);
        Ok(())
    }
}

type Action = Box<dyn FnMut(EventKind, &mut Context<'_>) -> HandlerResult + Send>;

/// Handles every event by running `action` and records what the engine did.
struct Probe {
    action: Action,
    resets: usize,
    errors: Vec<EventKind>,
    completed: Vec<WatchHandle>,
    fail_reset: bool,
}

fn probe<A>(action: A) -> Probe
where
    A: FnMut(EventKind, &mut Context<'_>) -> HandlerResult + Send + 'static,
{
    Probe {
        action: Box::new(action),
        resets: 0,
        errors: Vec::new(),
        completed: Vec::new(),
        fail_reset: false,
    }
}

impl Probe {
    fn run(&mut self, kind: EventKind, ctx: &mut Context<'_>) -> HandlerResult {
        (self.action)(kind, ctx)
    }
}

impl Filter for Probe {
    const EVENTS: Events = Events::all();

    fn connect(&mut self, ctx: &mut Context<'_>, _hostname: &str, _address: &ConnectAddress) -> HandlerResult {
        self.run(EventKind::Connect, ctx)
    }

    fn helo(&mut self, ctx: &mut Context<'_>, _name: &str) -> HandlerResult {
        self.run(EventKind::Helo, ctx)
    }

    fn envelope_from(&mut self, ctx: &mut Context<'_>, _address: &str, _parameters: &[String]) -> HandlerResult {
        self.run(EventKind::EnvelopeFrom, ctx)
    }

    fn envelope_recipient(
        &mut self,
        ctx: &mut Context<'_>,
        _address: &str,
        _parameters: &[String],
    ) -> HandlerResult {
        self.run(EventKind::EnvelopeRecipient, ctx)
    }

    fn header(&mut self, ctx: &mut Context<'_>, _name: &str, _value: &str) -> HandlerResult {
        self.run(EventKind::Header, ctx)
    }

    fn end_of_message(&mut self, ctx: &mut Context<'_>) -> HandlerResult {
        self.run(EventKind::EndOfMessage, ctx)
    }

    fn abort(&mut self, ctx: &mut Context<'_>) -> HandlerResult {
        self.run(EventKind::Abort, ctx)
    }

    fn reset(&mut self) -> HandlerResult {
        self.resets += 1;
        if self.fail_reset {
            return Err("reset failed".into());
        }
        Ok(())
    }

    fn watch_completed(&mut self, ctx: &mut Context<'_>, handle: WatchHandle, exit: ChildExit) -> HandlerResult {
        self.completed.push(handle);
        if exit?.success() {
            ctx.continue_processing();
        } else {
            ctx.reject();
        }
        Ok(())
    }

    fn on_error(&mut self, event: EventKind, _error: &(dyn std::error::Error + Send + Sync)) -> HandlerResult {
        self.errors.push(event);
        Ok(())
    }
}

fn session(filter: Probe, fallback: Status) -> Session<Probe> {
    Session::new(1, filter, fallback).unwrap()
}

fn helo() -> Event {
    Event::Helo {
        name: "mx.example.org".into(),
    }
}

fn mail_from() -> Event {
    Event::EnvelopeFrom {
        address: "sender@example.org".into(),
        parameters: vec!["SIZE=100".into()],
    }
}

fn rcpt_to(address: &str) -> Event {
    Event::EnvelopeRecipient {
        address: address.into(),
        parameters: Vec::new(),
    }
}

#[test]
fn no_decision_is_sent_as_continue() {
    let mut transport = RecordingTransport::default();
    let mut session = session(probe(|_, _| Ok(())), Status::Accept);
    assert_eq!(session.dispatch(&mut transport, helo()), Status::Continue);
    assert_eq!(session.state(), State::Helo);
    assert_eq!(session.filter().resets, 0);
}

#[test]
fn handler_error_uses_fallback_status() {
    let mut transport = RecordingTransport::default();
    let mut session = session(
        probe(|kind, ctx| {
            if kind == EventKind::Helo {
                ctx.reject();
                return Err("boom".into());
            }
            Ok(())
        }),
        Status::TemporaryFailure,
    );
    assert_eq!(session.dispatch(&mut transport, helo()), Status::TemporaryFailure);
    assert_eq!(session.filter().errors, [EventKind::Helo]);
    assert!(transport.replies.is_empty());
    // the next event starts from scratch
    assert_eq!(session.dispatch(&mut transport, mail_from()), Status::Continue);
}

#[test]
fn status_can_be_set_by_name() {
    let mut transport = RecordingTransport::default();
    let mut session = session(
        probe(|kind, ctx| {
            if kind == EventKind::Helo {
                assert!(ctx.set_status("maybe").is_err());
                ctx.set_status("Temporary-Failure")?;
            }
            Ok(())
        }),
        Status::Accept,
    );
    assert_eq!(session.dispatch(&mut transport, helo()), Status::TemporaryFailure);
}

#[test]
fn rejected_recipient_keeps_the_transaction() {
    let mut transport = RecordingTransport::default();
    let mut session = session(
        probe(|kind, ctx| {
            if kind == EventKind::EnvelopeRecipient {
                ctx.reject();
            }
            Ok(())
        }),
        Status::Accept,
    );
    session.dispatch(&mut transport, mail_from());
    assert_eq!(session.dispatch(&mut transport, rcpt_to("a@example.org")), Status::Reject);
    assert_eq!(session.dispatch(&mut transport, rcpt_to("b@example.org")), Status::Reject);
    assert_eq!(session.filter().resets, 0);
}

#[test]
fn temporary_failure_elsewhere_resets() {
    let mut transport = RecordingTransport::default();
    let mut session = session(
        probe(|kind, ctx| {
            if kind == EventKind::EnvelopeFrom {
                ctx.temporary_failure();
            }
            Ok(())
        }),
        Status::Accept,
    );
    assert_eq!(session.dispatch(&mut transport, mail_from()), Status::TemporaryFailure);
    assert_eq!(session.filter().resets, 1);
}

#[test]
fn reject_outside_recipient_resets_once() {
    let mut transport = RecordingTransport::default();
    let mut session = session(
        probe(|kind, ctx| {
            if kind == EventKind::Helo {
                ctx.reject();
            }
            Ok(())
        }),
        Status::Accept,
    );
    assert_eq!(session.dispatch(&mut transport, helo()), Status::Reject);
    assert_eq!(session.filter().resets, 1);
    assert_eq!(session.dispatch(&mut transport, mail_from()), Status::Continue);
    assert_eq!(session.filter().resets, 1);
}

#[test]
fn quarantine_status_resets() {
    let mut transport = RecordingTransport::default();
    let mut session = session(
        probe(|kind, ctx| {
            if kind == EventKind::Header {
                ctx.set_status(Status::Quarantine)?;
            }
            Ok(())
        }),
        Status::Accept,
    );
    let header = Event::Header {
        name: "Subject".into(),
        value: "hello".into(),
    };
    assert_eq!(session.dispatch(&mut transport, header), Status::Quarantine);
    assert_eq!(session.filter().resets, 1);
}

#[test]
fn fallback_status_must_end_the_message() {
    for name in ["progress", "default", "skip", "continue"] {
        assert!(matches!(
            Session::new(1, probe(|_, _| Ok(())), name),
            Err(FallbackStatusError::NotFinal(_))
        ));
    }
    assert!(matches!(
        Session::new(1, probe(|_, _| Ok(())), "sometimes"),
        Err(FallbackStatusError::Invalid(_))
    ));

    let mut client = Client::register(|| probe(|_, _| Err("boom".into())));
    assert_eq!(
        client.set_fallback_status("progress"),
        Err(FallbackStatusError::NotFinal(Status::Progress))
    );
    assert_eq!(client.fallback_status(), Status::Accept);
    let mut transport = RecordingTransport::default();
    let mut session = client.open_session().unwrap();
    assert_eq!(session.dispatch(&mut transport, helo()), Status::Accept);
    assert!(!session.is_pending());
}

#[test]
fn failing_handler_leaves_no_macros_behind() {
    let mut transport = RecordingTransport {
        macros: Some(HashMap::from([("j".to_string(), "mx.example.org".to_string())])),
        ..Default::default()
    };
    let mut session = session(
        probe(|kind, ctx| {
            if kind == EventKind::Helo {
                assert_eq!(ctx.macro_value("j"), Some("mx.example.org"));
                return Err("boom".into());
            }
            Ok(())
        }),
        Status::TemporaryFailure,
    );
    assert_eq!(session.dispatch(&mut transport, helo()), Status::TemporaryFailure);
    assert_eq!(transport.fetches, 1);
    assert!(!session.macros_fetched());
}

#[test]
fn discard_at_recipient_resets() {
    let mut transport = RecordingTransport::default();
    let mut session = session(
        probe(|kind, ctx| {
            if kind == EventKind::EnvelopeRecipient {
                ctx.discard();
            }
            Ok(())
        }),
        Status::Accept,
    );
    assert_eq!(session.dispatch(&mut transport, rcpt_to("a@example.org")), Status::Discard);
    assert_eq!(session.filter().resets, 1);
}

#[test]
fn reply_is_handed_to_the_transport() {
    let mut transport = RecordingTransport::default();
    let mut session = session(
        probe(|kind, ctx| {
            if kind == EventKind::EnvelopeFrom {
                ctx.reject_with(Some(554), None, Some("go away"))?;
            }
            Ok(())
        }),
        Status::Accept,
    );
    assert_eq!(session.dispatch(&mut transport, mail_from()), Status::Reject);
    assert_eq!(transport.replies.len(), 1);
    assert_eq!(transport.replies[0].format(), "554 5.7.1 go away");
}

#[test]
fn invalid_reply_leaves_status_alone() {
    let mut transport = RecordingTransport::default();
    let mut session = session(
        probe(|kind, ctx| {
            if kind == EventKind::Helo {
                assert_eq!(ctx.set_reply(250, None, "ok"), Err(ReplyError::InvalidCode(250)));
                assert!(matches!(
                    ctx.set_reply(451, Some("5.7.1"), "later"),
                    Err(ReplyError::ClassMismatch { .. })
                ));
                assert_eq!(ctx.status(), Status::Default);
            }
            Ok(())
        }),
        Status::Accept,
    );
    assert_eq!(session.dispatch(&mut transport, helo()), Status::Continue);
    assert!(transport.replies.is_empty());
}

#[test]
fn end_of_message_resets_once() {
    let mut transport = RecordingTransport::default();
    let mut session = session(
        probe(|kind, ctx| {
            if kind == EventKind::EndOfMessage {
                ctx.accept();
            }
            Ok(())
        }),
        Status::Reject,
    );
    assert_eq!(session.dispatch(&mut transport, Event::EndOfMessage), Status::Accept);
    assert_eq!(session.filter().resets, 1);

    let mut session = Session::new(2, probe(|_, _| Ok(())), Status::Reject).unwrap();
    assert_eq!(session.dispatch(&mut transport, Event::EndOfMessage), Status::Continue);
    assert_eq!(session.filter().resets, 1);
}

#[test]
fn abort_resets_exactly_once() {
    let mut transport = RecordingTransport::default();
    let mut session = session(probe(|_, _| Ok(())), Status::TemporaryFailure);
    session.dispatch(&mut transport, mail_from());
    assert_eq!(session.abort(&mut transport), Status::Continue);
    assert_eq!(session.filter().resets, 1);
}

#[test]
fn abort_resets_even_when_abort_handler_fails() {
    let mut transport = RecordingTransport::default();
    let mut session = session(
        probe(|kind, _| match kind {
            EventKind::Abort => Err("abort failed".into()),
            _ => Ok(()),
        }),
        Status::TemporaryFailure,
    );
    assert_eq!(session.abort(&mut transport), Status::TemporaryFailure);
    assert_eq!(session.filter().resets, 1);
    assert_eq!(session.filter().errors, [EventKind::Abort]);
}

#[test]
fn failing_reset_after_abort_uses_fallback() {
    let mut transport = RecordingTransport::default();
    let mut filter = probe(|_, _| Ok(()));
    filter.fail_reset = true;
    let mut session = session(filter, Status::TemporaryFailure);
    assert_eq!(session.abort(&mut transport), Status::TemporaryFailure);
    assert_eq!(session.filter().resets, 1);
}

/// Handles helo only; `abort` is not one of its events.
#[derive(Default)]
struct HeloOnly {
    aborts: usize,
    resets: usize,
}

impl Filter for HeloOnly {
    const EVENTS: Events = Events::HELO;

    fn abort(&mut self, _ctx: &mut Context<'_>) -> HandlerResult {
        self.aborts += 1;
        Ok(())
    }

    fn reset(&mut self) -> HandlerResult {
        self.resets += 1;
        Err("reset failed".into())
    }
}

#[test]
fn abort_without_handler_still_resets() {
    let mut transport = RecordingTransport::default();
    let mut session = Session::new(1, HeloOnly::default(), Status::TemporaryFailure).unwrap();
    assert_eq!(session.abort(&mut transport), Status::TemporaryFailure);
    assert_eq!(session.filter().aborts, 0);
    assert_eq!(session.filter().resets, 1);
}

#[test]
fn modifications_are_checked_against_state() {
    let mut transport = RecordingTransport::default();
    let mut session = session(
        probe(|kind, ctx| {
            match kind {
                EventKind::Helo => {
                    assert_eq!(
                        ctx.add_header("X-Test", "1"),
                        Err(MutationError::IllegalState {
                            operation: "add_header",
                            state: State::Helo
                        })
                    );
                }
                EventKind::EnvelopeFrom => {
                    assert!(ctx.add_recipient("c@example.org", None).is_err());
                    ctx.change_from("other@example.org", None)?;
                }
                EventKind::EndOfMessage => {
                    assert!(matches!(
                        ctx.delete_header("Received", 0),
                        Err(MutationError::InvalidIndex { .. })
                    ));
                    assert!(matches!(
                        ctx.add_header("", "x"),
                        Err(MutationError::EmptyHeaderName { .. })
                    ));
                    ctx.add_recipient("c@example.org", Some("NOTIFY=NEVER"))?;
                    ctx.replace_body("new body")?;
                }
                _ => (),
            }
            Ok(())
        }),
        Status::Accept,
    );
    session.dispatch(&mut transport, helo());
    session.dispatch(&mut transport, mail_from());
    assert_eq!(session.dispatch(&mut transport, Event::EndOfMessage), Status::Continue);
    assert_eq!(
        transport.applied,
        [
            Modification::ChangeFrom {
                address: "other@example.org".into(),
                parameters: None
            },
            Modification::AddRecipient {
                address: "c@example.org".into(),
                parameters: Some("NOTIFY=NEVER".into())
            },
            Modification::ReplaceBody(b"new body".to_vec()),
        ]
    );
    assert!(session.filter().errors.is_empty());
}

#[test]
fn quarantine_needs_the_negotiated_action() {
    let offered = |actions| NegotiateOption::new(6, actions, StepFlags::empty());
    let quarantine = |kind: EventKind, ctx: &mut Context<'_>| -> HandlerResult {
        if kind == EventKind::EndOfMessage {
            let quarantined = ctx.quarantine("suspicious");
            assert_eq!(quarantined, ctx.status() == Status::Accept);
        }
        Ok(())
    };

    let mut transport = RecordingTransport::default();
    let mut session = session(probe(quarantine), Status::Reject);
    session.negotiate(&offered(Actions::ADD_HEADERS));
    assert_eq!(session.dispatch(&mut transport, Event::EndOfMessage), Status::Continue);
    assert!(transport.applied.is_empty());

    let mut session = Session::new(2, probe(quarantine), Status::Reject).unwrap();
    session.negotiate(&offered(Actions::all()));
    assert_eq!(session.dispatch(&mut transport, Event::EndOfMessage), Status::Accept);
    assert_eq!(
        transport.applied,
        [Modification::Quarantine {
            reason: "suspicious".into()
        }]
    );
}

#[test]
fn macros_are_fetched_once_per_event() {
    let mut transport = RecordingTransport {
        macros: Some(HashMap::from([
            ("{mail_addr}".to_string(), "sender@example.org".to_string()),
            ("i".to_string(), "4AbCdE".to_string()),
        ])),
        ..Default::default()
    };
    let mut session = session(
        probe(|kind, ctx| {
            if matches!(kind, EventKind::EnvelopeFrom | EventKind::EnvelopeRecipient) {
                assert_eq!(ctx.macro_value("mail_addr"), Some("sender@example.org"));
                assert_eq!(ctx.macro_value("{i}"), Some("4AbCdE"));
                assert_eq!(ctx.macro_value("rcpt_addr"), None);
            }
            Ok(())
        }),
        Status::Accept,
    );
    session.dispatch(&mut transport, helo());
    assert_eq!(transport.fetches, 0);
    session.dispatch(&mut transport, mail_from());
    assert_eq!(transport.fetches, 1);
    session.dispatch(&mut transport, rcpt_to("a@example.org"));
    assert_eq!(transport.fetches, 2);
}

#[test]
fn delayed_response_resolves_when_child_exits() {
    let mut transport = RecordingTransport::default();
    let mut session = session(
        probe(|kind, ctx| {
            if kind == EventKind::EnvelopeRecipient {
                let child = Command::new("true").spawn()?;
                ctx.watch_child(child);
                ctx.delay_response();
            }
            Ok(())
        }),
        Status::TemporaryFailure,
    );
    assert_eq!(session.dispatch(&mut transport, rcpt_to("a@example.org")), Status::Progress);
    assert!(session.is_pending());
    let status = session.complete_pending(&mut transport, Duration::from_secs(10));
    assert_eq!(status, Some(Status::Continue));
    assert!(!session.is_pending());
    assert_eq!(session.filter().completed.len(), 1);
}

#[test]
fn delayed_response_without_watch_uses_fallback() {
    let mut transport = RecordingTransport::default();
    let mut session = session(
        probe(|kind, ctx| {
            if kind == EventKind::EnvelopeRecipient {
                ctx.delay_response();
            }
            Ok(())
        }),
        Status::TemporaryFailure,
    );
    assert_eq!(session.dispatch(&mut transport, rcpt_to("a@example.org")), Status::Progress);
    assert_eq!(
        session.complete_pending(&mut transport, Duration::from_millis(10)),
        Some(Status::TemporaryFailure)
    );
    assert!(!session.is_pending());
}

#[test]
fn abort_cancels_pending_watch() {
    let mut transport = RecordingTransport::default();
    let mut session = session(
        probe(|kind, ctx| {
            if kind == EventKind::EnvelopeRecipient {
                let child = Command::new("sleep").arg("1").spawn()?;
                ctx.watch_child(child);
                ctx.delay_response();
            }
            Ok(())
        }),
        Status::Accept,
    );
    assert_eq!(session.dispatch(&mut transport, rcpt_to("a@example.org")), Status::Progress);
    assert_eq!(session.abort(&mut transport), Status::Continue);
    assert!(!session.is_pending());
    assert_eq!(session.complete_pending(&mut transport, Duration::from_millis(10)), None);
    assert!(session.filter().completed.is_empty());
    assert_eq!(session.filter().resets, 1);
}

/// Prefixes the subject of every message.
#[derive(Default)]
struct SubjectTag {
    subject: Option<String>,
}

impl Filter for SubjectTag {
    const EVENTS: Events = Events::HEADER;
    const ACTIONS: Actions = Actions::CHANGE_HEADERS;

    fn header(&mut self, _ctx: &mut Context<'_>, name: &str, value: &str) -> HandlerResult {
        if name.eq_ignore_ascii_case("Subject") && self.subject.is_none() {
            self.subject = Some(value.to_string());
        }
        Ok(())
    }

    fn end_of_message(&mut self, ctx: &mut Context<'_>) -> HandlerResult {
        if let Some(subject) = &self.subject {
            ctx.change_header("Subject", 1, &format!("[checked] {subject}"))?;
        }
        ctx.accept();
        Ok(())
    }

    fn reset(&mut self) -> HandlerResult {
        self.subject = None;
        Ok(())
    }
}

#[test]
fn subject_is_rewritten_end_to_end() {
    let mut transport = RecordingTransport::default();
    let client = Client::register(SubjectTag::default);
    let mut session = client.open_session().unwrap();
    let offered = NegotiateOption::new(6, Actions::all(), StepFlags::all());
    let (status, resolved) = session.negotiate(&offered);
    assert_eq!(status, Status::Continue);
    assert_eq!(resolved.actions, Actions::CHANGE_HEADERS);
    assert!(resolved.steps.contains(StepFlags::NO_HELO));
    assert!(!resolved.steps.contains(StepFlags::NO_HEADERS));

    let events = [
        Event::Connect {
            hostname: "client.example.org".into(),
            address: ConnectAddress::Inet("192.0.2.1:2525".parse().unwrap()),
        },
        helo(),
        mail_from(),
        rcpt_to("a@example.org"),
        Event::Data,
        Event::Header {
            name: "From".into(),
            value: "sender@example.org".into(),
        },
        Event::Header {
            name: "Subject".into(),
            value: "hello".into(),
        },
        Event::EndOfHeader,
        Event::Body(b"hi\r\n".to_vec()),
    ];
    for event in events {
        assert_eq!(session.dispatch(&mut transport, event), Status::Continue);
    }
    assert_eq!(session.dispatch(&mut transport, Event::EndOfMessage), Status::Accept);
    assert_eq!(
        transport.applied,
        [Modification::ChangeHeader {
            name: "Subject".into(),
            index: 1,
            value: "[checked] hello".into()
        }]
    );
    assert!(session.filter().subject.is_none());
    client.close_session(session, &mut transport);
}

#[test]
fn lifecycle_listeners_are_called() {
    let established = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let mut client = Client::register(SubjectTag::default);
    client.set_fallback_status("temporary-failure").unwrap();
    assert!(client.set_fallback_status("sometimes").is_err());
    let counter = established.clone();
    client.connect(LifecycleEvent::ConnectionEstablished, move |_| {
        counter.fetch_add(1, Ordering::Relaxed);
    });
    let counter = finished.clone();
    client.connect(LifecycleEvent::Finished, move |_| {
        counter.fetch_add(1, Ordering::Relaxed);
    });

    let mut transport = RecordingTransport::default();
    let first = client.open_session().unwrap();
    let second = client.open_session().unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(first.fallback_status(), Status::TemporaryFailure);
    client.close_session(first, &mut transport);
    assert_eq!(established.load(Ordering::Relaxed), 2);
    assert_eq!(finished.load(Ordering::Relaxed), 1);
}
