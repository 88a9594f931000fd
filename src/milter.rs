//! Protocol constants and the flag sets exchanged during option negotiation.

use bitflags::bitflags;

#[allow(dead_code)]
pub mod constants {
    pub const SMFIF_VERSION: u32 = 6;

    // commands (MTA -> filter)
    pub const SMFIC_ABORT: u8 = b'A';
    pub const SMFIC_BODY: u8 = b'B';
    pub const SMFIC_CONNECT: u8 = b'C';
    pub const SMFIC_MACRO: u8 = b'D';
    pub const SMFIC_BODYEOB: u8 = b'E';
    pub const SMFIC_HELO: u8 = b'H';
    pub const SMFIC_QUIT_NC: u8 = b'K';
    pub const SMFIC_HEADER: u8 = b'L';
    pub const SMFIC_MAIL: u8 = b'M';
    pub const SMFIC_EOH: u8 = b'N';
    pub const SMFIC_OPTNEG: u8 = b'O';
    pub const SMFIC_QUIT: u8 = b'Q';
    pub const SMFIC_RCPT: u8 = b'R';
    pub const SMFIC_DATA: u8 = b'T';
    pub const SMFIC_UNKNOWN: u8 = b'U';

    // replies and modifications (filter -> MTA)
    pub const SMFIR_ADDRCPT: u8 = b'+';
    pub const SMFIR_DELRCPT: u8 = b'-';
    pub const SMFIR_ADDRCPT_PAR: u8 = b'2';
    pub const SMFIR_ACCEPT: u8 = b'a';
    pub const SMFIR_REPLBODY: u8 = b'b';
    pub const SMFIR_CONTINUE: u8 = b'c';
    pub const SMFIR_DISCARD: u8 = b'd';
    pub const SMFIR_CHGFROM: u8 = b'e';
    pub const SMFIR_ADDHEADER: u8 = b'h';
    pub const SMFIR_INSHEADER: u8 = b'i';
    pub const SMFIR_CHGHEADER: u8 = b'm';
    pub const SMFIR_PROGRESS: u8 = b'p';
    pub const SMFIR_QUARANTINE: u8 = b'q';
    pub const SMFIR_REJECT: u8 = b'r';
    pub const SMFIR_SKIP: u8 = b's';
    pub const SMFIR_TEMPFAIL: u8 = b't';
    pub const SMFIR_REPLYCODE: u8 = b'y';

    // connect address families
    pub const SMFIA_UNKNOWN: u8 = b'U';
    pub const SMFIA_UNIX: u8 = b'L';
    pub const SMFIA_INET: u8 = b'4';
    pub const SMFIA_INET6: u8 = b'6';

    // actions
    pub const SMFIF_ADDHDRS: u32 = 0x00000001;
    pub const SMFIF_CHGBODY: u32 = 0x00000002;
    pub const SMFIF_ADDRCPT: u32 = 0x00000004;
    pub const SMFIF_DELRCPT: u32 = 0x00000008;
    pub const SMFIF_CHGHDRS: u32 = 0x00000010;
    pub const SMFIF_QUARANTINE: u32 = 0x00000020;
    pub const SMFIF_CHGFROM: u32 = 0x00000040;
    pub const SMFIF_ADDRCPT_PAR: u32 = 0x00000080;
    pub const SMFIF_SETSYMLIST: u32 = 0x00000100;

    // protocol flags
    pub const SMFIP_NOCONNECT: u32 = 0x00000001;
    pub const SMFIP_NOHELO: u32 = 0x00000002;
    pub const SMFIP_NOMAIL: u32 = 0x00000004;
    pub const SMFIP_NORCPT: u32 = 0x00000008;
    pub const SMFIP_NOBODY: u32 = 0x00000010;
    pub const SMFIP_NOHDRS: u32 = 0x00000020;
    pub const SMFIP_NOEOH: u32 = 0x00000040;
    pub const SMFIP_NR_HDR: u32 = 0x00000080;
    pub const SMFIP_NOUNKNOWN: u32 = 0x00000100;
    pub const SMFIP_NODATA: u32 = 0x00000200;
    pub const SMFIP_SKIP: u32 = 0x00000400;
    pub const SMFIP_RCPT_REJ: u32 = 0x00000800;
    pub const SMFIP_NR_CONN: u32 = 0x00001000;
    pub const SMFIP_NR_HELO: u32 = 0x00002000;
    pub const SMFIP_NR_MAIL: u32 = 0x00004000;
    pub const SMFIP_NR_RCPT: u32 = 0x00008000;
    pub const SMFIP_NR_DATA: u32 = 0x00010000;
    pub const SMFIP_NR_UNKN: u32 = 0x00020000;
    pub const SMFIP_NR_EOH: u32 = 0x00040000;
    pub const SMFIP_NR_BODY: u32 = 0x00080000;
    pub const SMFIP_HDR_LEADSPC: u32 = 0x00100000;
    pub const SMFIP_MDS_256K: u32 = 0x10000000;
    pub const SMFIP_MDS_1M: u32 = 0x20000000;
}

use constants::*;

bitflags! {
    /// Protocol steps, as offered by the MTA and answered by the filter.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StepFlags: u32 {
        const NO_CONNECT = SMFIP_NOCONNECT;
        const NO_HELO = SMFIP_NOHELO;
        const NO_ENVELOPE_FROM = SMFIP_NOMAIL;
        const NO_ENVELOPE_RECIPIENT = SMFIP_NORCPT;
        const NO_BODY = SMFIP_NOBODY;
        const NO_HEADERS = SMFIP_NOHDRS;
        const NO_END_OF_HEADER = SMFIP_NOEOH;
        const NO_REPLY_HEADER = SMFIP_NR_HDR;
        const NO_UNKNOWN = SMFIP_NOUNKNOWN;
        const NO_DATA = SMFIP_NODATA;
        const SKIP = SMFIP_SKIP;
        const ENVELOPE_RECIPIENT_REJECTED = SMFIP_RCPT_REJ;
        const NO_REPLY_CONNECT = SMFIP_NR_CONN;
        const NO_REPLY_HELO = SMFIP_NR_HELO;
        const NO_REPLY_ENVELOPE_FROM = SMFIP_NR_MAIL;
        const NO_REPLY_ENVELOPE_RECIPIENT = SMFIP_NR_RCPT;
        const NO_REPLY_DATA = SMFIP_NR_DATA;
        const NO_REPLY_UNKNOWN = SMFIP_NR_UNKN;
        const NO_REPLY_END_OF_HEADER = SMFIP_NR_EOH;
        const NO_REPLY_BODY = SMFIP_NR_BODY;
        const HEADER_VALUE_WITH_LEADING_SPACE = SMFIP_HDR_LEADSPC;
        const MAX_DATA_SIZE_256K = SMFIP_MDS_256K;
        const MAX_DATA_SIZE_1M = SMFIP_MDS_1M;

        const NO_REPLY_MASK = Self::NO_REPLY_CONNECT.bits()
            | Self::NO_REPLY_HELO.bits()
            | Self::NO_REPLY_ENVELOPE_FROM.bits()
            | Self::NO_REPLY_ENVELOPE_RECIPIENT.bits()
            | Self::NO_REPLY_DATA.bits()
            | Self::NO_REPLY_HEADER.bits()
            | Self::NO_REPLY_UNKNOWN.bits()
            | Self::NO_REPLY_END_OF_HEADER.bits()
            | Self::NO_REPLY_BODY.bits();
    }
}

bitflags! {
    /// Modification capabilities a filter may use after negotiation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Actions: u32 {
        const ADD_HEADERS = SMFIF_ADDHDRS;
        const CHANGE_BODY = SMFIF_CHGBODY;
        const ADD_RECIPIENT = SMFIF_ADDRCPT;
        const DELETE_RECIPIENT = SMFIF_DELRCPT;
        const CHANGE_HEADERS = SMFIF_CHGHDRS;
        const QUARANTINE = SMFIF_QUARANTINE;
        const CHANGE_FROM = SMFIF_CHGFROM;
        const ADD_RECIPIENT_WITH_PARAMETERS = SMFIF_ADDRCPT_PAR;
        const SET_SYMBOL_LIST = SMFIF_SETSYMLIST;
    }
}

#[test]
fn test_no_reply_mask_covers_every_nr_bit() {
    let mask = StepFlags::NO_REPLY_MASK.bits();
    for bit in [
        SMFIP_NR_HDR,
        SMFIP_NR_CONN,
        SMFIP_NR_HELO,
        SMFIP_NR_MAIL,
        SMFIP_NR_RCPT,
        SMFIP_NR_DATA,
        SMFIP_NR_UNKN,
        SMFIP_NR_EOH,
        SMFIP_NR_BODY,
    ] {
        assert_eq!(mask & bit, bit);
    }
    assert_eq!(mask & SMFIP_HDR_LEADSPC, 0);
    assert_eq!(mask & SMFIP_SKIP, 0);
}
