//! The outbound message handed to the directory API.

use std::{fmt, io::Read};

use base64::{Engine, engine::general_purpose::STANDARD};
use mailparse::{MailHeaderMap, ParsedMail};

use crate::{
    address::parse_address_list,
    error::ParseError,
    mime::{Attachment, extract_body, file_attachments},
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ContentKind {
    #[default]
    PlainText,
    Html,
}

/// Body content together with how it should be rendered
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Body {
    pub content: String,
    pub kind: ContentKind,
}

impl Body {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind: ContentKind::PlainText,
        }
    }

    pub fn html(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind: ContentKind::Html,
        }
    }
}

/// A fully assembled message, ready to send
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    pub from: String,
    pub to: Vec<String>,
    /// `None` when the message has no Cc recipients at all
    pub cc: Option<Vec<String>>,
    pub bcc: Option<Vec<String>>,
    pub subject: String,
    pub body: Body,
    pub attachments: Vec<Attachment>,
    pub save_to_sent_items: bool,
}

impl OutboundMessage {
    /// Every header recipient, To then Cc then Bcc
    pub fn recipients(&self) -> impl Iterator<Item = &str> {
        self.to
            .iter()
            .chain(self.cc.iter().flatten())
            .chain(self.bcc.iter().flatten())
            .map(String::as_str)
    }
}

/// Where an attachment's content comes from
pub enum AttachmentSource {
    /// Already decoded out of the submitted message
    Decoded(Attachment),
    /// Read to the end when the message is built
    Reader {
        name: String,
        content_type: String,
        reader: Box<dyn Read + Send>,
    },
}

impl From<Attachment> for AttachmentSource {
    fn from(attachment: Attachment) -> Self {
        Self::Decoded(attachment)
    }
}

impl fmt::Debug for AttachmentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decoded(attachment) => f.debug_tuple("Decoded").field(attachment).finish(),
            Self::Reader {
                name, content_type, ..
            } => f
                .debug_struct("Reader")
                .field("name", name)
                .field("content_type", content_type)
                .finish_non_exhaustive(),
        }
    }
}

impl AttachmentSource {
    fn into_attachment(self) -> Result<Attachment, ParseError> {
        match self {
            Self::Decoded(attachment) => Ok(attachment),
            Self::Reader {
                name,
                content_type,
                mut reader,
            } => {
                let mut content = Vec::new();
                if let Err(err) = reader.read_to_end(&mut content) {
                    return Err(ParseError::AttachmentRead {
                        name,
                        reason: err.to_string(),
                    });
                }

                Ok(Attachment {
                    name,
                    content_type,
                    content_bytes: STANDARD.encode(content),
                })
            }
        }
    }
}

/// Builder for [`OutboundMessage`]
///
/// The body and its kind are set together so the order in which options
/// are applied never matters.
#[derive(Debug)]
pub struct MessageBuilder {
    from: String,
    to: Vec<String>,
    subject: String,
    cc: Option<Vec<String>>,
    bcc: Option<Vec<String>>,
    body: Body,
    attachments: Vec<AttachmentSource>,
    save_to_sent_items: bool,
}

impl MessageBuilder {
    /// Start a message. `to` is a raw header value and is split like any
    /// other address list.
    pub fn new(from: impl Into<String>, to: &str, subject: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: parse_address_list(to),
            subject: subject.into(),
            cc: None,
            bcc: None,
            body: Body::default(),
            attachments: Vec::new(),
            save_to_sent_items: false,
        }
    }

    /// Start a message from a parsed RFC 5322 message: recipients and subject
    /// from its headers, the extracted body, and every part that is not the
    /// body as an attachment.
    ///
    /// # Errors
    /// [`ParseError`] if the MIME structure cannot be decoded.
    pub fn from_mail(sender: impl Into<String>, mail: &ParsedMail<'_>) -> Result<Self, ParseError> {
        let header = |name: &str| mail.headers.get_first_value(name).unwrap_or_default();

        let body = extract_body(mail)?;
        let attachments = file_attachments(mail)?;

        Ok(Self::new(sender, &header("To"), header("Subject"))
            .cc(&header("Cc"))
            .bcc(&header("Bcc"))
            .body(body)
            .attachments(attachments))
    }

    #[must_use]
    pub fn cc(mut self, raw: &str) -> Self {
        self.cc = non_empty(parse_address_list(raw));
        self
    }

    #[must_use]
    pub fn bcc(mut self, raw: &str) -> Self {
        self.bcc = non_empty(parse_address_list(raw));
        self
    }

    #[must_use]
    pub fn body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    #[must_use]
    pub fn attachments<I>(mut self, attachments: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<AttachmentSource>,
    {
        self.attachments
            .extend(attachments.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub const fn save_to_sent_items(mut self, save: bool) -> Self {
        self.save_to_sent_items = save;
        self
    }

    /// Drain every attachment source and produce the message.
    ///
    /// # Errors
    /// [`ParseError::AttachmentRead`] if an attachment reader fails. Nothing
    /// is sent in that case.
    pub fn build(self) -> Result<OutboundMessage, ParseError> {
        let attachments = self
            .attachments
            .into_iter()
            .map(AttachmentSource::into_attachment)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(OutboundMessage {
            from: self.from,
            to: self.to,
            cc: self.cc,
            bcc: self.bcc,
            subject: self.subject,
            body: self.body,
            attachments,
            save_to_sent_items: self.save_to_sent_items,
        })
    }
}

fn non_empty(list: Vec<String>) -> Option<Vec<String>> {
    if list.is_empty() { None } else { Some(list) }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Cursor};

    use pretty_assertions::assert_eq;

    use super::*;

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))
        }
    }

    #[test]
    fn from_parsed_mail() {
        let raw = b"From: alice@co.com\r\n\
To: bob@co.com, carol@co.com\r\n\
Cc: dave@co.com\r\n\
Subject: Report\r\n\
Content-Type: multipart/mixed; boundary=\"b\"\r\n\
\r\n\
--b\r\n\
Content-Type: text/html\r\n\
\r\n\
<p>hi</p>\r\n\
--b\r\n\
Content-Type: text/csv\r\n\
Content-Disposition: attachment; filename=\"data.csv\"\r\n\
\r\n\
a,b\r\n\
--b--\r\n";
        let mail = mailparse::parse_mail(raw).expect("parse");

        let message = MessageBuilder::from_mail("alice@co.com", &mail)
            .expect("compose")
            .build()
            .expect("build");

        assert_eq!(message.to, vec!["bob@co.com", "carol@co.com"]);
        assert_eq!(message.cc, Some(vec!["dave@co.com".to_string()]));
        assert_eq!(message.bcc, None);
        assert_eq!(message.subject, "Report");
        assert_eq!(message.body.kind, ContentKind::Html);
        assert_eq!(message.attachments.len(), 1);
        assert_eq!(message.attachments[0].name, "data.csv");
    }

    #[test]
    fn defaults() {
        let message = MessageBuilder::new("alice@co.com", "bob@co.com", "Hi")
            .build()
            .expect("build");

        assert_eq!(
            message,
            OutboundMessage {
                from: "alice@co.com".into(),
                to: vec!["bob@co.com".into()],
                cc: None,
                bcc: None,
                subject: "Hi".into(),
                body: Body::default(),
                attachments: Vec::new(),
                save_to_sent_items: false,
            }
        );
    }

    #[test]
    fn empty_cc_is_absent() {
        let message = MessageBuilder::new("alice@co.com", "bob@co.com", "Hi")
            .cc("  ")
            .bcc("carol@co.com, dave@co.com")
            .build()
            .expect("build");

        assert_eq!(message.cc, None);
        assert_eq!(
            message.bcc,
            Some(vec!["carol@co.com".into(), "dave@co.com".into()])
        );
        assert_eq!(
            message.recipients().collect::<Vec<_>>(),
            vec!["bob@co.com", "carol@co.com", "dave@co.com"]
        );
    }

    #[test]
    fn option_order_does_not_matter() {
        let a = MessageBuilder::new("a@x.com", "b@y.com", "s")
            .body(Body::html("<p>x</p>"))
            .save_to_sent_items(true)
            .cc("c@z.com")
            .build()
            .expect("build");
        let b = MessageBuilder::new("a@x.com", "b@y.com", "s")
            .cc("c@z.com")
            .save_to_sent_items(true)
            .body(Body::html("<p>x</p>"))
            .build()
            .expect("build");

        assert_eq!(a, b);
        assert_eq!(a.body.kind, ContentKind::Html);
    }

    #[test]
    fn reader_attachments_are_encoded() {
        let message = MessageBuilder::new("a@x.com", "b@y.com", "s")
            .attachments([AttachmentSource::Reader {
                name: "hello.txt".into(),
                content_type: "text/plain".into(),
                reader: Box::new(Cursor::new(b"hello".to_vec())),
            }])
            .build()
            .expect("build");

        assert_eq!(
            message.attachments,
            vec![Attachment {
                name: "hello.txt".into(),
                content_type: "text/plain".into(),
                content_bytes: "aGVsbG8=".into(),
            }]
        );
    }

    #[test]
    fn failing_reader_is_a_parse_error() {
        let result = MessageBuilder::new("a@x.com", "b@y.com", "s")
            .attachments([AttachmentSource::Reader {
                name: "broken.bin".into(),
                content_type: "application/octet-stream".into(),
                reader: Box::new(FailingReader),
            }])
            .build();

        assert_eq!(
            result,
            Err(ParseError::AttachmentRead {
                name: "broken.bin".into(),
                reason: "pipe closed".into(),
            })
        );
    }
}
