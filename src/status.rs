//! Filter responses and SMTP reply codes.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The disposition a filter gives to the current event.
///
/// `Default` means "no decision yet" and is sent to the MTA as `Continue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Status {
    #[default]
    Default,
    Continue,
    Accept,
    Reject,
    Discard,
    TemporaryFailure,
    Progress,
    Quarantine,
    Skip,
}

impl Status {
    pub const ALL: [Status; 9] = [
        Status::Default,
        Status::Continue,
        Status::Accept,
        Status::Reject,
        Status::Discard,
        Status::TemporaryFailure,
        Status::Progress,
        Status::Quarantine,
        Status::Skip,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Status::Default => "default",
            Status::Continue => "continue",
            Status::Accept => "accept",
            Status::Reject => "reject",
            Status::Discard => "discard",
            Status::TemporaryFailure => "temporary_failure",
            Status::Progress => "progress",
            Status::Quarantine => "quarantine",
            Status::Skip => "skip",
        }
    }

    /// Converts a status or a status name into a `Status`.
    ///
    /// Names are matched ignoring case, and `-` and `_` are interchangeable,
    /// so `"temporary-failure"` and `"TEMPORARY_FAILURE"` are the same.
    pub fn normalize<V: IntoStatus>(value: V) -> Result<Status, InvalidStatusError> {
        value.into_status()
    }

    /// Normalizes a status used when a handler fails. It has to end the
    /// message, otherwise the MTA would never get an answer.
    pub fn fallback<V: IntoStatus>(value: V) -> Result<Status, FallbackStatusError> {
        let status = value.into_status()?;
        if !status.is_final() {
            return Err(FallbackStatusError::NotFinal(status));
        }
        Ok(status)
    }

    /// Maps an SMTP reply to the status it implies.
    ///
    /// 4xx is a temporary failure, 5xx a rejection. Nothing else can be
    /// expressed with a reply code, and a reason is mandatory.
    pub fn from_reply_code(
        code: u16,
        extended_code: Option<&str>,
        reason: &str,
    ) -> Result<(Status, Reply), ReplyError> {
        let reply = Reply::new(code, extended_code, reason)?;
        Ok((reply.status(), reply))
    }

    /// The status the MTA actually receives.
    pub fn resolved(self) -> Status {
        match self {
            Status::Default => Status::Continue,
            status => status,
        }
    }

    /// Whether this status ends the mail transaction. A rejected recipient
    /// leaves the rest of the envelope alone.
    pub fn ends_transaction(self, at_recipient: bool) -> bool {
        match self {
            Status::Accept | Status::Discard | Status::Quarantine => true,
            Status::Reject | Status::TemporaryFailure => !at_recipient,
            _ => false,
        }
    }

    /// Whether this status ends the current message for the MTA.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            Status::Accept
                | Status::Reject
                | Status::Discard
                | Status::TemporaryFailure
                | Status::Quarantine
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Status {
    type Err = InvalidStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().replace('-', "_").to_ascii_lowercase();
        Status::ALL
            .into_iter()
            .find(|status| status.name() == key)
            .ok_or_else(|| InvalidStatusError(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid status: <{0}>")]
pub struct InvalidStatusError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FallbackStatusError {
    #[error(transparent)]
    Invalid(#[from] InvalidStatusError),
    #[error("fallback status must end the message: <{0}>")]
    NotFinal(Status),
}

/// Anything that can be turned into a [`Status`].
pub trait IntoStatus {
    fn into_status(self) -> Result<Status, InvalidStatusError>;
}

impl IntoStatus for Status {
    fn into_status(self) -> Result<Status, InvalidStatusError> {
        Ok(self)
    }
}

impl IntoStatus for &str {
    fn into_status(self) -> Result<Status, InvalidStatusError> {
        self.parse()
    }
}

impl IntoStatus for String {
    fn into_status(self) -> Result<Status, InvalidStatusError> {
        self.parse()
    }
}

impl IntoStatus for &String {
    fn into_status(self) -> Result<Status, InvalidStatusError> {
        self.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplyError {
    #[error("return code should be 4XX or 5XX: <{0}>")]
    InvalidCode(u16),
    #[error("invalid extended status code <{extended_code}>: {detail}")]
    InvalidExtendedCode {
        extended_code: String,
        detail: &'static str,
    },
    #[error("extended code should use the same class of status code: <{code}>:<{extended_code}>")]
    ClassMismatch { code: u16, extended_code: String },
    #[error("reply reason is missing for <{0}>")]
    MissingReason(u16),
}

/// An explicit SMTP reply sent instead of a plain reject/tempfail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    code: u16,
    extended_code: Option<String>,
    reason: String,
}

impl Reply {
    pub fn new(code: u16, extended_code: Option<&str>, reason: &str) -> Result<Self, ReplyError> {
        if !(400..600).contains(&code) {
            return Err(ReplyError::InvalidCode(code));
        }
        if reason.trim().is_empty() {
            return Err(ReplyError::MissingReason(code));
        }
        if let Some(extended_code) = extended_code {
            let class = parse_extended_code(extended_code)?;
            if u16::from(class) != code / 100 {
                return Err(ReplyError::ClassMismatch {
                    code,
                    extended_code: extended_code.to_string(),
                });
            }
        }
        Ok(Reply {
            code,
            extended_code: extended_code.map(str::to_string),
            reason: reason.to_string(),
        })
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn extended_code(&self) -> Option<&str> {
        self.extended_code.as_deref()
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn status(&self) -> Status {
        if self.code < 500 {
            Status::TemporaryFailure
        } else {
            Status::Reject
        }
    }

    /// Renders the reply as sent in SMFIR_REPLYCODE, one line per reason line.
    pub fn format(&self) -> String {
        self.reason
            .split('\n')
            .map(|line| {
                let line = line.strip_suffix('\r').unwrap_or(line);
                let mut out = format!("{:3}", self.code);
                if let Some(extended_code) = &self.extended_code {
                    out.push(' ');
                    out.push_str(extended_code);
                }
                if !line.is_empty() {
                    out.push(' ');
                    out.push_str(line);
                }
                out
            })
            .collect::<Vec<_>>()
            .join("\r\n")
    }
}

// class.subject.detail, class in {2,4,5}, subject and detail 1-3 digits
fn parse_extended_code(extended_code: &str) -> Result<u8, ReplyError> {
    let invalid = |detail| ReplyError::InvalidExtendedCode {
        extended_code: extended_code.to_string(),
        detail,
    };
    let mut parts = extended_code.split('.');
    let class = match parts.next() {
        Some("2") => 2,
        Some("4") => 4,
        Some("5") => 5,
        Some("") | None => return Err(invalid("class is missing")),
        Some(_) => return Err(invalid("class should be '2', '4' or '5'")),
    };
    for (what, part) in [("subject", parts.next()), ("detail", parts.next())] {
        match part {
            None | Some("") => {
                return Err(invalid(if what == "subject" {
                    "subject is missing"
                } else {
                    "detail is missing"
                }));
            }
            Some(p) if p.len() > 3 => return Err(invalid("component should be less than 1000")),
            Some(p) if !p.bytes().all(|b| b.is_ascii_digit()) => {
                return Err(invalid("component should be digits"));
            }
            Some(_) => (),
        }
    }
    if parts.next().is_some() {
        return Err(invalid("too many components"));
    }
    Ok(class)
}

#[test]
fn test_normalize_names() {
    assert_eq!(Status::normalize("accept").unwrap(), Status::Accept);
    assert_eq!(Status::normalize("ACCEPT").unwrap(), Status::Accept);
    assert_eq!(
        Status::normalize("temporary-failure").unwrap(),
        Status::TemporaryFailure
    );
    assert_eq!(
        Status::normalize("Temporary_Failure").unwrap(),
        Status::TemporaryFailure
    );
    assert_eq!(Status::normalize(Status::Discard).unwrap(), Status::Discard);
    assert_eq!(
        Status::normalize("accepted"),
        Err(InvalidStatusError("accepted".to_string()))
    );
}

#[test]
fn test_ends_transaction() {
    assert!(Status::Quarantine.ends_transaction(false));
    assert!(Status::Discard.ends_transaction(true));
    assert!(Status::Reject.ends_transaction(false));
    assert!(!Status::Reject.ends_transaction(true));
    assert!(!Status::TemporaryFailure.ends_transaction(true));
    assert!(!Status::Continue.ends_transaction(false));
    assert!(!Status::Progress.ends_transaction(false));
}

#[test]
fn test_fallback_must_be_final() {
    assert_eq!(Status::fallback("tempfail"), Err(InvalidStatusError("tempfail".into()).into()));
    assert_eq!(Status::fallback("temporary-failure").unwrap(), Status::TemporaryFailure);
    assert_eq!(Status::fallback(Status::Quarantine).unwrap(), Status::Quarantine);
    for status in [Status::Default, Status::Continue, Status::Progress, Status::Skip] {
        assert_eq!(Status::fallback(status), Err(FallbackStatusError::NotFinal(status)));
    }
}

#[test]
fn test_display_round_trips_through_from_str() {
    for status in Status::ALL {
        assert_eq!(status.to_string().parse::<Status>().unwrap(), status);
    }
}

#[test]
fn test_from_reply_code() {
    let (status, reply) = Status::from_reply_code(550, Some("5.7.1"), "spam").unwrap();
    assert_eq!(status, Status::Reject);
    assert_eq!(reply.code(), 550);
    assert_eq!(reply.format(), "550 5.7.1 spam");

    let (status, _) = Status::from_reply_code(451, Some("4.7.1"), "try later").unwrap();
    assert_eq!(status, Status::TemporaryFailure);

    assert_eq!(
        Status::from_reply_code(250, None, "ok"),
        Err(ReplyError::InvalidCode(250))
    );
    assert_eq!(
        Status::from_reply_code(550, None, ""),
        Err(ReplyError::MissingReason(550))
    );
}

#[test]
fn test_extended_code_validation() {
    assert!(Reply::new(550, Some("5.7.1"), "x").is_ok());
    assert!(Reply::new(550, Some("5.123.999"), "x").is_ok());
    assert!(matches!(
        Reply::new(550, Some("4.7.1"), "x"),
        Err(ReplyError::ClassMismatch { .. })
    ));
    for bad in ["", "3.7.1", "5", "5.", "5.7", "5.7.", "5.1000.1", "5.a.1", "55.7.1"] {
        assert!(
            matches!(
                Reply::new(550, Some(bad), "x"),
                Err(ReplyError::InvalidExtendedCode { .. })
            ),
            "{bad}"
        );
    }
}

#[test]
fn test_reply_format_multiline() {
    let reply = Reply::new(451, Some("4.7.1"), "first\r\nsecond").unwrap();
    assert_eq!(reply.format(), "451 4.7.1 first\r\n451 4.7.1 second");
    let reply = Reply::new(554, None, "no").unwrap();
    assert_eq!(reply.format(), "554 no");
}
