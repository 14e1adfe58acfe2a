use core::fmt::{self, Display, Formatter};

/// ESMTP parameters following the path in `MAIL FROM`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MailParameters {
    params: Vec<(String, Option<String>)>,
}

impl MailParameters {
    fn parse(raw: &str) -> Self {
        Self {
            params: raw
                .split_whitespace()
                .map(|token| match token.split_once('=') {
                    Some((key, value)) => (key.to_ascii_uppercase(), Some(value.to_string())),
                    None => (token.to_ascii_uppercase(), None),
                })
                .collect(),
        }
    }

    /// Gets a parameter value by key (case-insensitive).
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .and_then(|(_, value)| value.as_deref())
    }

    /// The declared `SIZE=`, if present and numeric
    pub fn size(&self) -> Option<usize> {
        self.get("SIZE")?.parse().ok()
    }

    pub const fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Helo(String),
    Ehlo(String),
    MailFrom {
        address: String,
        params: MailParameters,
    },
    RcptTo(String),
    Data,
    Rset,
    Noop,
    Quit,
    StartTls,
    Auth {
        mechanism: String,
        initial: Option<String>,
    },
    Help,
    Vrfy(String),
    Invalid(String),
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(id) => write!(f, "HELO {id}"),
            Self::Ehlo(id) => write!(f, "EHLO {id}"),
            Self::MailFrom { address, .. } => write!(f, "MAIL FROM:<{address}>"),
            Self::RcptTo(address) => write!(f, "RCPT TO:<{address}>"),
            Self::Data => f.write_str("DATA"),
            Self::Rset => f.write_str("RSET"),
            Self::Noop => f.write_str("NOOP"),
            Self::Quit => f.write_str("QUIT"),
            Self::StartTls => f.write_str("STARTTLS"),
            // Never log credentials
            Self::Auth { mechanism, .. } => write!(f, "AUTH {mechanism}"),
            Self::Help => f.write_str("HELP"),
            Self::Vrfy(target) => write!(f, "VRFY {target}"),
            Self::Invalid(command) => write!(f, "{command}"),
        }
    }
}

/// Strip `<...>` from a reverse or forward path, leaving whatever follows
fn split_path(rest: &str) -> Option<(&str, &str)> {
    let rest = rest.trim_start();

    if let Some(inner) = rest.strip_prefix('<') {
        let (path, tail) = inner.split_once('>')?;
        Some((path.trim(), tail))
    } else {
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        Some(rest.split_at(end))
    }
}

fn strip_prefix_ignore_case<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &line[prefix.len()..])
}

impl TryFrom<&str> for Command {
    type Error = Self;

    fn try_from(line: &str) -> Result<Self, Self::Error> {
        let line = line.trim_end_matches(['\r', '\n']);
        let invalid = || Self::Invalid(line.to_string());

        if let Some(rest) = strip_prefix_ignore_case(line, "MAIL FROM:") {
            let (address, params) = split_path(rest).ok_or_else(invalid)?;
            return Ok(Self::MailFrom {
                address: address.to_string(),
                params: MailParameters::parse(params),
            });
        }

        if let Some(rest) = strip_prefix_ignore_case(line, "RCPT TO:") {
            let (address, _) = split_path(rest).ok_or_else(invalid)?;
            if address.is_empty() {
                return Err(invalid());
            }
            return Ok(Self::RcptTo(address.to_string()));
        }

        let (verb, argument) = line
            .split_once(' ')
            .map_or((line, ""), |(verb, argument)| (verb, argument.trim()));

        match verb.to_ascii_uppercase().as_str() {
            "HELO" if !argument.is_empty() => Ok(Self::Helo(argument.to_string())),
            "EHLO" if !argument.is_empty() => Ok(Self::Ehlo(argument.to_string())),
            "DATA" if argument.is_empty() => Ok(Self::Data),
            "RSET" if argument.is_empty() => Ok(Self::Rset),
            "NOOP" => Ok(Self::Noop),
            "QUIT" if argument.is_empty() => Ok(Self::Quit),
            "STARTTLS" if argument.is_empty() => Ok(Self::StartTls),
            "HELP" => Ok(Self::Help),
            "VRFY" if !argument.is_empty() => Ok(Self::Vrfy(argument.to_string())),
            "AUTH" if !argument.is_empty() => {
                let mut parts = argument.split_whitespace();
                let mechanism = parts.next().ok_or_else(invalid)?.to_ascii_uppercase();
                let initial = parts.next().map(str::to_string);

                if parts.next().is_some() {
                    return Err(invalid());
                }

                Ok(Self::Auth { mechanism, initial })
            }
            _ => Err(invalid()),
        }
    }
}

impl TryFrom<&[u8]> for Command {
    type Error = Self;

    fn try_from(line: &[u8]) -> Result<Self, Self::Error> {
        std::str::from_utf8(line).map_or_else(
            |_| Err(Self::Invalid(String::from_utf8_lossy(line).into_owned())),
            Self::try_from,
        )
    }
}
