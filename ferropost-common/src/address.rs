//! Envelope address handling.
//!
//! SMTP hands us addresses inside command lines (`MAIL FROM:<user@host>`),
//! so the parser here works on whole command lines and produces a
//! [`Mailbox`]: a validated, lower-cased `local@domain` string. Everything
//! downstream (spool naming, DKIM domain selection, MX resolution) operates
//! on `Mailbox` values and never re-validates.

use std::fmt::{self, Display};

use mailparse::MailAddr;
use thiserror::Error;

/// Errors produced while extracting an address from an SMTP command line.
#[derive(Debug, Error)]
pub enum AddressError {
    /// The command line itself is malformed (missing separator, stray
    /// CR/LF, empty address region).
    #[error("invalid SMTP command: {0}")]
    InvalidCommand(&'static str),

    /// The address region does not parse as an RFC 5322 mailbox, or the
    /// domain portion fails validation.
    #[error("invalid email address: {0}")]
    InvalidAddress(String),
}

/// A validated, normalised `local@domain` mailbox.
///
/// Construction goes through [`Mailbox::parse_command`] (or
/// [`Mailbox::parse`] for a bare address), which lower-cases the accepted
/// form. The inner string is immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Mailbox(String);

impl Mailbox {
    /// Extract and normalise the address portion of an SMTP command line
    /// such as `MAIL FROM:<User@Example.com>` or `RCPT TO:<user@host>`.
    ///
    /// # Errors
    /// Returns [`AddressError::InvalidCommand`] when the line contains a
    /// CR or LF or lacks a `:` separator, and
    /// [`AddressError::InvalidAddress`] when the extracted region fails
    /// mailbox validation.
    pub fn parse_command(line: &str) -> Result<Self, AddressError> {
        if line.contains(['\r', '\n']) {
            return Err(AddressError::InvalidCommand("unexpected newline"));
        }

        let (_, region) = line
            .split_once(':')
            .ok_or(AddressError::InvalidCommand("missing ':' separator"))?;

        let mut addr = region.trim();
        if let Some(stripped) = addr.strip_prefix('<').and_then(|a| a.strip_suffix('>')) {
            addr = stripped;
        }
        if addr.is_empty() {
            return Err(AddressError::InvalidAddress("empty address".into()));
        }

        Self::parse(addr)
    }

    /// Validate a bare address and normalise it to lower case.
    ///
    /// # Errors
    /// Returns [`AddressError::InvalidAddress`] unless the input is a
    /// single RFC 5322 mailbox.
    pub fn parse(addr: &str) -> Result<Self, AddressError> {
        let parsed = mailparse::addrparse(addr)
            .map_err(|err| AddressError::InvalidAddress(err.to_string()))?;

        let single = match parsed.as_slice() {
            [MailAddr::Single(single)] => single,
            [] => return Err(AddressError::InvalidAddress("empty address".into())),
            _ => {
                return Err(AddressError::InvalidAddress(
                    "expected exactly one mailbox".into(),
                ));
            }
        };

        // Whatever the parser tolerated, the accepted form must be a plain
        // local@domain with no whitespace.
        let addr = single.addr.to_lowercase();
        let shaped = addr
            .rfind('@')
            .is_some_and(|at| at > 0 && at + 1 < addr.len());
        if !shaped || addr.contains(char::is_whitespace) {
            return Err(AddressError::InvalidAddress(format!(
                "not a mailbox: {addr}"
            )));
        }

        Ok(Self(addr))
    }

    /// The domain portion: everything after the last `@`, with a single
    /// trailing `.` stripped.
    ///
    /// # Errors
    /// Returns [`AddressError::InvalidAddress`] when the domain is
    /// missing, empty after trimming, or contains whitespace.
    pub fn domain(&self) -> Result<&str, AddressError> {
        let at = self
            .0
            .rfind('@')
            .filter(|at| at + 1 < self.0.len())
            .ok_or_else(|| AddressError::InvalidAddress("missing domain".into()))?;

        let raw = &self.0[at + 1..];
        let domain = raw.strip_suffix('.').unwrap_or(raw).trim();
        if domain.is_empty() {
            return Err(AddressError::InvalidAddress("empty domain".into()));
        }
        if domain.contains([' ', '\t']) {
            return Err(AddressError::InvalidAddress("whitespace in domain".into()));
        }

        Ok(domain)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Mailbox {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
