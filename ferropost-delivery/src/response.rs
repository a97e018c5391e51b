//! SMTP reply parsing for the client side of a delivery.

/// A complete (possibly multi-line) SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn message(&self) -> String {
        self.lines.join(" / ")
    }

    /// 2xx completion reply.
    pub fn is_positive(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// 3xx intermediate reply (DATA's `354`).
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    /// Whether an EHLO reply advertises the given extension keyword.
    pub fn advertises(&self, extension: &str) -> bool {
        self.lines.iter().any(|line| {
            let keyword = line.split_whitespace().next().unwrap_or("");
            keyword.eq_ignore_ascii_case(extension)
        })
    }

    /// Parse one reply from the front of `buffer`. Returns the reply and
    /// the number of bytes consumed, or `None` when more data is needed.
    ///
    /// # Errors
    /// Returns a description of the malformation when the buffered bytes
    /// cannot be an SMTP reply.
    pub fn parse(buffer: &[u8]) -> Result<Option<(Self, usize)>, String> {
        let mut lines = Vec::new();
        let mut code = None;
        let mut offset = 0;

        loop {
            let rest = &buffer[offset..];
            let Some(newline) = rest.iter().position(|&b| b == b'\n') else {
                return Ok(None);
            };
            let raw = &rest[..newline];
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            let text = std::str::from_utf8(raw).map_err(|err| err.to_string())?;
            offset += newline + 1;

            if text.len() < 3 {
                return Err(format!("reply line too short: {text:?}"));
            }
            let line_code: u16 = text[..3]
                .parse()
                .map_err(|_| format!("invalid reply code in {text:?}"))?;
            match code {
                None => code = Some(line_code),
                Some(first) if first != line_code => {
                    return Err(format!(
                        "reply code changed mid-reply: {first} then {line_code}"
                    ));
                }
                Some(_) => {}
            }

            let (last, message) = match text.as_bytes().get(3) {
                None => (true, ""),
                Some(b' ') => (true, &text[4..]),
                Some(b'-') => (false, &text[4..]),
                Some(other) => {
                    return Err(format!("invalid reply separator {:?}", *other as char));
                }
            };
            lines.push(message.to_string());

            if last {
                let code = code.unwrap_or_default();
                return Ok(Some((Self { code, lines }, offset)));
            }
        }
    }
}
