//! Milter wire transport: decodes MTA packets into session events and
//! encodes the session's answers.

// https://www.postfix.org/MILTER_README.html
// https://github.com/emersion/go-milter/blob/master/milter-protocol.txt
// https://github.com/emersion/go-milter/blob/master/milter-protocol-extras.txt

use crate::client::Client;
use crate::codec::{BufReadExt as _, MAX_BODY_CHUNK, MAX_PACKET_LEN, Packet, ReadExt as _};
use crate::filter::Filter;
use crate::milter::constants::*;
use crate::milter::{Actions, StepFlags};
use crate::mutation::{Modification, MutationError};
use crate::negotiate::NegotiateOption;
use crate::session::{ConnectAddress, Event, EventKind, Session};
use crate::status::{Reply, Status};
use crate::transport::Transport;
use log::{debug, warn};
use std::collections::HashMap;
use std::error::Error;
use std::io::{self, BufRead, Cursor, ErrorKind, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// How long to wait for a delayed response before telling the MTA again
/// that we are still working.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

// macros of these stages stay valid for the whole connection
const CONNECTION_MACRO_STAGES: [u8; 2] = [SMFIC_CONNECT, SMFIC_HELO];

/// Transport state of one MTA connection.
///
/// Modifications are queued and sent right before the end-of-message
/// response, the only point where the MTA accepts them.
#[derive(Debug, Default)]
pub struct WireTransport {
    macros: Vec<(u8, HashMap<String, String>)>,
    modifications: Vec<Modification>,
    reply: Option<Reply>,
    negotiated: Option<NegotiateOption>,
}

impl WireTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the macros sent ahead of `command`, replacing older ones for
    /// the same command.
    pub fn define_macros(&mut self, command: u8, macros: HashMap<String, String>) {
        self.macros.retain(|(c, _)| *c != command);
        self.macros.push((command, macros));
    }

    pub fn set_negotiated(&mut self, option: NegotiateOption) {
        self.negotiated = Some(option);
    }

    pub fn modifications(&self) -> &[Modification] {
        &self.modifications
    }

    pub fn take_modifications(&mut self) -> Vec<Modification> {
        std::mem::take(&mut self.modifications)
    }

    pub fn take_reply(&mut self) -> Option<Reply> {
        self.reply.take()
    }

    /// Forgets everything that belonged to the finished transaction.
    pub fn end_transaction(&mut self) {
        self.macros
            .retain(|(c, _)| CONNECTION_MACRO_STAGES.contains(c));
        self.modifications.clear();
        self.reply = None;
    }

    fn skip_allowed(&self) -> bool {
        self.negotiated
            .is_some_and(|o| o.steps.contains(StepFlags::SKIP))
    }

    fn actions(&self) -> Actions {
        self.negotiated.map_or(Actions::all(), |o| o.actions)
    }
}

impl Transport for WireTransport {
    fn available_macros(&mut self) -> Option<HashMap<String, String>> {
        if self.macros.is_empty() {
            return None;
        }
        let mut merged = HashMap::new();
        for (_, macros) in &self.macros {
            merged.extend(macros.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Some(merged)
    }

    fn set_reply(&mut self, reply: &Reply) -> Result<(), MutationError> {
        self.reply = Some(reply.clone());
        Ok(())
    }

    fn apply(&mut self, modification: Modification) -> Result<(), MutationError> {
        if !self.actions().contains(modification.required_action()) {
            return Err(MutationError::NotNegotiated {
                operation: modification.operation(),
            });
        }
        self.modifications.push(modification);
        Ok(())
    }
}

/// Runs one MTA connection to completion.
pub fn serve_connection<F: Filter>(
    client: &Client<F>,
    mut reader: impl BufRead,
    mut writer: impl Write,
) -> Result<(), Box<dyn Error>> {
    let mut transport = WireTransport::new();
    let mut session = client.open_session()?;
    let result = process(client, &mut session, &mut transport, &mut reader, &mut writer);
    client.close_session(session, &mut transport);
    result
}

fn process<F: Filter>(
    client: &Client<F>,
    session: &mut Session<F>,
    transport: &mut WireTransport,
    reader: &mut impl BufRead,
    writer: &mut impl Write,
) -> Result<(), Box<dyn Error>> {
    let mut packet: Vec<u8> = Vec::with_capacity(4096);
    let mut strings = Vec::<u8>::new();

    loop {
        let len = match reader.read_u32_be() {
            Ok(len) => len,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                debug!("{}: connection closed by MTA", session.id());
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if len == 0 || len > MAX_PACKET_LEN {
            return Err(format!("invalid packet length {len}").into());
        }
        reader.read_bytes(len as usize, &mut packet)?;
        let mut data = Cursor::new(&packet[..]);
        let command = data.read_u8()?;
        let event = match command {
            SMFIC_OPTNEG => {
                let version = data.read_u32_be()?;
                let actions = data.read_u32_be()?;
                let steps = data.read_u32_be()?;
                let offered = NegotiateOption::new(
                    version,
                    Actions::from_bits_truncate(actions),
                    StepFlags::from_bits_truncate(steps),
                );
                let (_, resolved) = session.negotiate(&offered);
                transport.set_negotiated(resolved);
                let mut reply = Packet::new(SMFIC_OPTNEG)
                    .u32(resolved.version)
                    .u32(resolved.actions.bits())
                    .u32(resolved.steps.bits());
                if resolved.actions.contains(Actions::SET_SYMBOL_LIST) {
                    for (stage, names) in session.capabilities().macro_lists() {
                        reply = reply.u32(stage as u32).zstring(&names);
                    }
                }
                reply.write_to(writer)?;
                writer.flush()?;
                continue;
            }
            SMFIC_MACRO => {
                let for_command = data.read_u8()?;
                let mut macros = HashMap::new();
                loop {
                    let name = data.read_zstring(&mut strings)?;
                    if name.is_empty() {
                        break;
                    }
                    let value = data.read_zstring(&mut strings)?;
                    macros.insert(name, value);
                }
                transport.define_macros(for_command, macros);
                // no reply to SMFIC_MACRO
                continue;
            }
            SMFIC_CONNECT => {
                let hostname = data.read_zstring(&mut strings)?;
                let address = read_connect_address(&mut data, &mut strings)?;
                Event::Connect { hostname, address }
            }
            SMFIC_HELO => Event::Helo {
                name: data.read_zstring(&mut strings)?,
            },
            SMFIC_MAIL => Event::EnvelopeFrom {
                address: data.read_zstring_anglestripped(&mut strings)?,
                parameters: data.read_zstrings(&mut strings)?,
            },
            SMFIC_RCPT => Event::EnvelopeRecipient {
                address: data.read_zstring_anglestripped(&mut strings)?,
                parameters: data.read_zstrings(&mut strings)?,
            },
            SMFIC_DATA => Event::Data,
            SMFIC_HEADER => Event::Header {
                name: data.read_zstring(&mut strings)?,
                value: data.read_zstring(&mut strings)?,
            },
            SMFIC_EOH => Event::EndOfHeader,
            SMFIC_BODY => Event::Body(remaining(&data).to_vec()),
            SMFIC_BODYEOB => {
                // the final body chunk may ride along with end-of-message
                let rest = remaining(&data);
                if !rest.is_empty() {
                    let status = session.dispatch(transport, Event::Body(rest.to_vec()));
                    let status = settle(session, transport, writer, status)?;
                    if status.is_final() {
                        respond(session, transport, writer, EventKind::EndOfMessage, status)?;
                        continue;
                    }
                }
                Event::EndOfMessage
            }
            SMFIC_UNKNOWN => Event::Unknown(data.read_zstring(&mut strings)?),
            SMFIC_ABORT => {
                session.abort(transport);
                transport.end_transaction();
                // no reply to SMFIC_ABORT
                continue;
            }
            SMFIC_QUIT => return Ok(()),
            SMFIC_QUIT_NC => {
                let finished = std::mem::replace(session, client.open_session()?);
                client.close_session(finished, transport);
                *transport = WireTransport::new();
                continue;
            }
            _ => {
                let rest = String::from_utf8_lossy(remaining(&data));
                return Err(format!(
                    "unimplemented milter command {} rest {rest}",
                    command as char
                )
                .into());
            }
        };
        let kind = event.kind();
        let status = session.dispatch(transport, event);
        respond(session, transport, writer, kind, status)?;
    }
}

fn remaining<'a>(data: &Cursor<&'a [u8]>) -> &'a [u8] {
    let bytes: &'a [u8] = *data.get_ref();
    &bytes[data.position() as usize..]
}

fn read_connect_address(
    data: &mut Cursor<&[u8]>,
    strings: &mut Vec<u8>,
) -> io::Result<ConnectAddress> {
    let family = match data.read_u8() {
        Ok(family) => family,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(ConnectAddress::Unknown),
        Err(e) => return Err(e),
    };
    match family {
        SMFIA_UNIX => {
            let _port = data.read_u16_be()?;
            Ok(ConnectAddress::Unix(PathBuf::from(data.read_zstring(strings)?)))
        }
        SMFIA_INET | SMFIA_INET6 => {
            let port = data.read_u16_be()?;
            let address = data.read_zstring(strings)?;
            let bare = address.strip_prefix("IPv6:").unwrap_or(&address);
            match bare.parse::<IpAddr>() {
                Ok(ip) => Ok(ConnectAddress::Inet(SocketAddr::new(ip, port))),
                Err(_) => {
                    warn!("unparsable connect address {address}");
                    Ok(ConnectAddress::Unknown)
                }
            }
        }
        _ => Ok(ConnectAddress::Unknown),
    }
}

fn respond<F: Filter>(
    session: &mut Session<F>,
    transport: &mut WireTransport,
    writer: &mut impl Write,
    kind: EventKind,
    status: Status,
) -> Result<(), Box<dyn Error>> {
    let status = settle(session, transport, writer, status)?;
    if kind == EventKind::EndOfMessage {
        for modification in transport.take_modifications() {
            for packet in modification_packets(&modification) {
                packet.write_to(writer)?;
            }
        }
    }
    let reply = transport.take_reply();
    for packet in status_packets(status, reply.as_ref(), transport.skip_allowed()) {
        packet.write_to(writer)?;
    }
    writer.flush()?;
    // modifications queued by a transaction that ended early must not reach
    // the next message
    if kind == EventKind::EndOfMessage
        || status.ends_transaction(kind == EventKind::EnvelopeRecipient)
    {
        transport.end_transaction();
    }
    Ok(())
}

/// Keeps the MTA waiting with progress packets until a delayed response
/// has resolved.
fn settle<F: Filter>(
    session: &mut Session<F>,
    transport: &mut WireTransport,
    writer: &mut impl Write,
    mut status: Status,
) -> io::Result<Status> {
    while status == Status::Progress {
        Packet::new(SMFIR_PROGRESS).write_to(writer)?;
        writer.flush()?;
        if let Some(resolved) = session.complete_pending(transport, PROGRESS_INTERVAL) {
            status = resolved;
        }
    }
    Ok(status)
}

fn status_packets(status: Status, reply: Option<&Reply>, skip_allowed: bool) -> Vec<Packet> {
    let reply_packet = |fallback: u8| match reply {
        Some(reply) => Packet::new(SMFIR_REPLYCODE).zstring(&reply.format()),
        None => Packet::new(fallback),
    };
    match status {
        Status::Default | Status::Continue => vec![Packet::new(SMFIR_CONTINUE)],
        Status::Accept => vec![Packet::new(SMFIR_ACCEPT)],
        Status::Discard => vec![Packet::new(SMFIR_DISCARD)],
        Status::Reject => vec![reply_packet(SMFIR_REJECT)],
        Status::TemporaryFailure => vec![reply_packet(SMFIR_TEMPFAIL)],
        Status::Skip if skip_allowed => vec![Packet::new(SMFIR_SKIP)],
        Status::Skip => vec![Packet::new(SMFIR_CONTINUE)],
        Status::Progress => vec![Packet::new(SMFIR_PROGRESS)],
        Status::Quarantine => vec![
            Packet::new(SMFIR_QUARANTINE).zstring("milter"),
            Packet::new(SMFIR_ACCEPT),
        ],
    }
}

fn modification_packets(modification: &Modification) -> Vec<Packet> {
    match modification {
        Modification::AddHeader { name, value } => {
            vec![Packet::new(SMFIR_ADDHEADER).zstring(name).zstring(value)]
        }
        Modification::InsertHeader { index, name, value } => vec![
            Packet::new(SMFIR_INSHEADER)
                .u32(*index)
                .zstring(name)
                .zstring(value),
        ],
        Modification::ChangeHeader { name, index, value } => vec![
            Packet::new(SMFIR_CHGHEADER)
                .u32(*index)
                .zstring(name)
                .zstring(value),
        ],
        Modification::DeleteHeader { name, index } => vec![
            Packet::new(SMFIR_CHGHEADER)
                .u32(*index)
                .zstring(name)
                .zstring(""),
        ],
        Modification::ReplaceBody(body) if body.is_empty() => vec![Packet::new(SMFIR_REPLBODY)],
        Modification::ReplaceBody(body) => body
            .chunks(MAX_BODY_CHUNK)
            .map(|chunk| Packet::new(SMFIR_REPLBODY).bytes(chunk))
            .collect(),
        Modification::ChangeFrom {
            address,
            parameters,
        } => {
            let mut packet = Packet::new(SMFIR_CHGFROM).zstring(address);
            if let Some(parameters) = parameters {
                packet = packet.zstring(parameters);
            }
            vec![packet]
        }
        Modification::AddRecipient {
            address,
            parameters: Some(parameters),
        } => vec![
            Packet::new(SMFIR_ADDRCPT_PAR)
                .zstring(address)
                .zstring(parameters),
        ],
        Modification::AddRecipient { address, .. } => {
            vec![Packet::new(SMFIR_ADDRCPT).zstring(address)]
        }
        Modification::DeleteRecipient { address } => {
            vec![Packet::new(SMFIR_DELRCPT).zstring(address)]
        }
        Modification::Quarantine { reason } => {
            vec![Packet::new(SMFIR_QUARANTINE).zstring(reason)]
        }
    }
}
