//! SMTP replies.
//!
//! A [`Reply`] is a basic status code, an optional enhanced status code
//! (RFC 3463) and one or more lines of text. Rendering joins multiple lines
//! with the `code-text` continuation form required by RFC 5321 4.2.1; the
//! final line uses `code text`. No trailing CRLF is written, the connection
//! layer adds it.

use core::fmt::{self, Display, Formatter};
use std::borrow::Cow;

use crate::status::Status;

/// RFC 3463 `class.subject.detail`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnhancedCode(pub u8, pub u16, pub u16);

impl Display for EnhancedCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    status: Status,
    enhanced: Option<EnhancedCode>,
    lines: Vec<Cow<'static, str>>,
}

impl Reply {
    pub fn new(status: Status, text: impl Into<Cow<'static, str>>) -> Self {
        Self {
            status,
            enhanced: None,
            lines: vec![text.into()],
        }
    }

    pub fn enhanced(
        status: Status,
        code: EnhancedCode,
        text: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            status,
            enhanced: Some(code),
            lines: vec![text.into()],
        }
    }

    /// A reply spanning several lines, such as the EHLO capability list
    pub fn multiline<I, T>(status: Status, lines: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Cow<'static, str>>,
    {
        let mut lines: Vec<_> = lines.into_iter().map(Into::into).collect();
        if lines.is_empty() {
            lines.push(Cow::Borrowed(""));
        }

        Self {
            status,
            enhanced: None,
            lines,
        }
    }

    pub const fn status(&self) -> Status {
        self.status
    }

    pub const fn enhanced_code(&self) -> Option<EnhancedCode> {
        self.enhanced
    }

    pub fn lines(&self) -> &[Cow<'static, str>] {
        &self.lines
    }

    /// The text of every line joined by a space, without codes
    pub fn text(&self) -> String {
        self.lines.join(" ")
    }
}

impl Display for Reply {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let last = self.lines.len().saturating_sub(1);

        for (index, line) in self.lines.iter().enumerate() {
            let separator = if index == last { ' ' } else { '-' };
            write!(f, "{}{separator}", self.status)?;

            if let Some(code) = self.enhanced {
                write!(f, "{code} ")?;
            }

            f.write_str(line)?;

            if index != last {
                f.write_str("\r\n")?;
            }
        }

        Ok(())
    }
}
