//! MIME decomposition of submitted messages.
//!
//! Only the top level of a `multipart/*` message is walked for attachments.
//! Every part becomes an [`Attachment`] whose content is the part body,
//! decoded from its declared transfer encoding and re-encoded as base64.
//!
//! Quoted-printable is decoded leniently: lowercase hex, long lines and bare
//! LF line endings are accepted. An `=` that starts neither a hex escape nor
//! a soft line break is still an error.

use base64::{Engine, engine::general_purpose::STANDARD};
use mailparse::{DispositionType, MailHeaderMap, ParsedMail, body::Body as EncodedBody};
use quoted_printable::ParseMode;

use crate::{
    error::ParseError,
    message::{Body, ContentKind},
};

/// A single attachment as the directory API expects it
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Attachment {
    /// The filename from `Content-Disposition`, unmodified and possibly empty
    pub name: String,
    /// The part's `Content-Type` header exactly as declared
    pub content_type: String,
    /// Base64 of the decoded part body
    pub content_bytes: String,
}

impl Attachment {
    /// Decoded bytes of the attachment content
    ///
    /// # Errors
    /// If `content_bytes` is not valid base64, which can only happen when the
    /// record was built by hand.
    pub fn decoded(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.content_bytes)
    }

    /// Checks if this record is a message body rather than a file
    ///
    /// Unnamed `text/plain`, `text/html` and nested `multipart/*` parts are
    /// what mail clients produce for the body and its alternatives.
    pub fn is_body_part(&self) -> bool {
        let mimetype = mailparse::parse_content_type(&self.content_type).mimetype;
        is_body(&self.name, &mimetype)
    }
}

fn is_body(name: &str, mimetype: &str) -> bool {
    name.is_empty()
        && (mimetype == "text/plain" || mimetype == "text/html" || mimetype.starts_with("multipart/"))
}

/// Decompose a message's top-level MIME parts into attachment records.
///
/// A message that is not `multipart/*` has no attachments and yields an
/// empty list.
///
/// # Errors
/// - [`ParseError::MissingBoundary`] if a multipart message has no boundary
/// - [`ParseError::Multipart`] if no parts could be read from the body
/// - [`ParseError::Base64`] / [`ParseError::QuotedPrintable`] if a part's
///   body does not match its declared transfer encoding
pub fn decompose_attachments(mail: &ParsedMail<'_>) -> Result<Vec<Attachment>, ParseError> {
    decompose(mail, |_| true)
}

/// Like [`decompose_attachments`], but body parts (see
/// [`Attachment::is_body_part`]) are skipped before their content is
/// decoded, so a sloppily encoded body never fails the message.
///
/// # Errors
/// As [`decompose_attachments`], for the parts that are kept.
pub fn file_attachments(mail: &ParsedMail<'_>) -> Result<Vec<Attachment>, ParseError> {
    decompose(mail, |part| {
        !is_body(
            filename(part).as_deref().unwrap_or_default(),
            &part.ctype.mimetype,
        )
    })
}

fn decompose(
    mail: &ParsedMail<'_>,
    keep: impl Fn(&ParsedMail<'_>) -> bool,
) -> Result<Vec<Attachment>, ParseError> {
    if !mail.ctype.mimetype.starts_with("multipart/") {
        return Ok(Vec::new());
    }

    if !mail.ctype.params.contains_key("boundary") {
        return Err(ParseError::MissingBoundary);
    }

    if mail.subparts.is_empty() {
        return Err(ParseError::Multipart(format!(
            "no parts found in {} body",
            mail.ctype.mimetype
        )));
    }

    mail.subparts
        .iter()
        .enumerate()
        .filter(|&(_, part)| keep(part))
        .map(|(index, part)| {
            let decoded = decode_part(index, part)?;

            Ok(Attachment {
                name: filename(part).unwrap_or_default(),
                content_type: part
                    .headers
                    .get_first_value("Content-Type")
                    .unwrap_or_default(),
                content_bytes: STANDARD.encode(decoded),
            })
        })
        .collect()
}

/// Pick the message body.
///
/// For a single-part message this is the whole decoded body. For multipart
/// messages it is the first `text/plain` or `text/html` part, depth first,
/// that is not itself an attachment. A multipart message without one has an
/// empty plain-text body.
///
/// # Errors
/// If the chosen part's content cannot be decoded.
pub fn extract_body(mail: &ParsedMail<'_>) -> Result<Body, ParseError> {
    if !mail.ctype.mimetype.starts_with("multipart/") {
        return Ok(Body {
            content: mail.get_body()?,
            kind: content_kind(mail),
        });
    }

    match find_body_part(mail) {
        Some(part) => Ok(Body {
            content: part.get_body()?,
            kind: content_kind(part),
        }),
        None => Ok(Body::default()),
    }
}

fn find_body_part<'a, 'b>(mail: &'a ParsedMail<'b>) -> Option<&'a ParsedMail<'b>> {
    mail.subparts.iter().find_map(|part| {
        if part.ctype.mimetype.starts_with("multipart/") {
            find_body_part(part)
        } else if is_inline_text(part) {
            Some(part)
        } else {
            None
        }
    })
}

fn is_inline_text(part: &ParsedMail<'_>) -> bool {
    let mimetype = part.ctype.mimetype.as_str();

    (mimetype == "text/plain" || mimetype == "text/html")
        && filename(part).is_none()
        && !matches!(
            part.get_content_disposition().disposition,
            DispositionType::Attachment
        )
}

fn content_kind(mail: &ParsedMail<'_>) -> ContentKind {
    if mail.ctype.mimetype == "text/html" {
        ContentKind::Html
    } else {
        ContentKind::PlainText
    }
}

fn filename(part: &ParsedMail<'_>) -> Option<String> {
    part.get_content_disposition().params.get("filename").cloned()
}

fn decode_part(index: usize, part: &ParsedMail<'_>) -> Result<Vec<u8>, ParseError> {
    match part.get_body_encoded() {
        EncodedBody::Base64(body) => {
            let compact: Vec<u8> = body
                .get_raw()
                .iter()
                .copied()
                .filter(|byte| !byte.is_ascii_whitespace())
                .collect();

            STANDARD.decode(compact).map_err(|err| ParseError::Base64 {
                part: index,
                reason: err.to_string(),
            })
        }
        EncodedBody::QuotedPrintable(body) => {
            let raw = body.get_raw();

            if let Some(offset) = malformed_escape(raw) {
                return Err(ParseError::QuotedPrintable {
                    part: index,
                    reason: format!("invalid escape at byte {offset}"),
                });
            }

            quoted_printable::decode(raw, ParseMode::Robust).map_err(|err| {
                ParseError::QuotedPrintable {
                    part: index,
                    reason: err.to_string(),
                }
            })
        }
        EncodedBody::SevenBit(body) | EncodedBody::EightBit(body) => Ok(body.get_raw().to_vec()),
        EncodedBody::Binary(body) => Ok(body.get_raw().to_vec()),
    }
}

/// Offset of the first `=` that is neither followed by two hex digits nor
/// ends the line, trailing whitespace allowed.
fn malformed_escape(raw: &[u8]) -> Option<usize> {
    raw.iter()
        .enumerate()
        .filter(|(_, byte)| **byte == b'=')
        .map(|(offset, _)| offset)
        .find(|&offset| {
            let rest = &raw[offset + 1..];

            let escape = rest.len() >= 2 && rest[0].is_ascii_hexdigit() && rest[1].is_ascii_hexdigit();
            let soft_break = rest
                .iter()
                .find(|byte| !matches!(byte, b' ' | b'\t'))
                .is_none_or(|byte| matches!(byte, b'\r' | b'\n'));

            !escape && !soft_break
        })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const PDF_BYTES: &[u8] = b"%PDF-1.4\n%\xe2\xe3\xcf\xd3\n1 0 obj\n<< /Type /Catalog >>\nendobj\n";

    fn mixed(parts: &str) -> String {
        format!(
            "From: alice@co.com\r\n\
             To: bob@co.com\r\n\
             Subject: Hi\r\n\
             MIME-Version: 1.0\r\n\
             Content-Type: multipart/mixed; boundary=\"XYZ\"\r\n\
             \r\n\
             {parts}--XYZ--\r\n"
        )
    }

    #[test]
    fn non_multipart_has_no_attachments() {
        let raw = b"From: alice@co.com\r\nSubject: Hi\r\n\r\nhello\r\n";
        let mail = mailparse::parse_mail(raw).expect("parse");

        assert_eq!(decompose_attachments(&mail), Ok(Vec::new()));
    }

    #[test]
    fn base64_attachment_round_trips() {
        let encoded = STANDARD.encode(PDF_BYTES);
        let raw = mixed(&format!(
            "--XYZ\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             hello\r\n\
             --XYZ\r\n\
             Content-Type: application/pdf\r\n\
             Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
             Content-Transfer-Encoding: base64\r\n\
             \r\n\
             {}\r\n\
             {}\r\n",
            &encoded[..20],
            &encoded[20..]
        ));
        let mail = mailparse::parse_mail(raw.as_bytes()).expect("parse");

        let attachments = decompose_attachments(&mail).expect("decompose");
        assert_eq!(attachments.len(), 2);

        let pdf = &attachments[1];
        assert_eq!(pdf.name, "report.pdf");
        assert_eq!(pdf.content_type, "application/pdf");
        assert_eq!(pdf.content_bytes, encoded);
        assert_eq!(pdf.decoded().expect("base64"), PDF_BYTES);
        assert!(!pdf.is_body_part());
    }

    #[test]
    fn quoted_printable_is_decoded() {
        let raw = mixed(
            "--XYZ\r\n\
             Content-Type: text/csv; name=\"data.csv\"\r\n\
             Content-Disposition: attachment; filename=\"data.csv\"\r\n\
             Content-Transfer-Encoding: Quoted-Printable\r\n\
             \r\n\
             caf=C3=A9,1\r\n",
        );
        let mail = mailparse::parse_mail(raw.as_bytes()).expect("parse");

        let attachments = decompose_attachments(&mail).expect("decompose");
        let decoded = attachments[0].decoded().expect("base64");
        assert!(decoded.starts_with("café,1".as_bytes()));
        assert_eq!(attachments[0].content_type, "text/csv; name=\"data.csv\"");
    }

    #[test]
    fn identity_parts_keep_their_bytes() {
        let raw = mixed(
            "--XYZ\r\n\
             Content-Type: application/octet-stream\r\n\
             Content-Disposition: attachment\r\n\
             \r\n\
             raw-bytes\r\n",
        );
        let mail = mailparse::parse_mail(raw.as_bytes()).expect("parse");

        let attachments = decompose_attachments(&mail).expect("decompose");
        assert_eq!(attachments[0].name, "");
        assert!(
            attachments[0]
                .decoded()
                .expect("base64")
                .starts_with(b"raw-bytes")
        );
    }

    #[test]
    fn malformed_base64_fails() {
        let raw = mixed(
            "--XYZ\r\n\
             Content-Type: application/pdf\r\n\
             Content-Transfer-Encoding: BASE64\r\n\
             \r\n\
             !!!not base64!!!\r\n",
        );
        let mail = mailparse::parse_mail(raw.as_bytes()).expect("parse");

        assert!(matches!(
            decompose_attachments(&mail),
            Err(ParseError::Base64 { part: 0, .. })
        ));
    }

    #[test]
    fn malformed_quoted_printable_fails() {
        let raw = mixed(
            "--XYZ\r\n\
             Content-Type: text/plain; name=\"a.txt\"\r\n\
             Content-Transfer-Encoding: quoted-printable\r\n\
             \r\n\
             bad =ZZ escape\r\n",
        );
        let mail = mailparse::parse_mail(raw.as_bytes()).expect("parse");

        assert!(matches!(
            decompose_attachments(&mail),
            Err(ParseError::QuotedPrintable { part: 0, .. })
        ));
    }

    #[test]
    fn lenient_quoted_printable() {
        let long_line = "x".repeat(200);
        let raw = mixed(&format!(
            "--XYZ\r\n\
             Content-Type: text/csv\r\n\
             Content-Disposition: attachment; filename=\"data.csv\"\r\n\
             Content-Transfer-Encoding: quoted-printable\r\n\
             \r\n\
             caf=c3=a9 {long_line} soft=\r\n\
             break =  \r\n\
             done\r\n"
        ));
        let mail = mailparse::parse_mail(raw.as_bytes()).expect("parse");

        let attachments = decompose_attachments(&mail).expect("decompose");
        let decoded = String::from_utf8(attachments[0].decoded().expect("base64")).expect("utf-8");
        assert!(decoded.starts_with(&format!("café {long_line} softbreak done")), "{decoded}");
    }

    #[test]
    fn quoted_printable_with_bare_lf() {
        let raw = "From: alice@co.com\n\
                   Content-Type: multipart/mixed; boundary=\"XYZ\"\n\
                   \n\
                   --XYZ\n\
                   Content-Type: text/plain\n\
                   Content-Disposition: attachment; filename=\"a.txt\"\n\
                   Content-Transfer-Encoding: quoted-printable\n\
                   \n\
                   line one=\n\
                   \x20continued=3D\n\
                   line two\n\
                   --XYZ--\n";
        let mail = mailparse::parse_mail(raw.as_bytes()).expect("parse");

        let attachments = decompose_attachments(&mail).expect("decompose");
        let decoded = String::from_utf8(attachments[0].decoded().expect("base64")).expect("utf-8");
        assert!(decoded.starts_with("line one continued=\r\nline two"), "{decoded:?}");
    }

    #[test]
    fn escape_check() {
        assert_eq!(malformed_escape(b"plain"), None);
        assert_eq!(malformed_escape(b"a=3db=3D"), None);
        assert_eq!(malformed_escape(b"soft=\r\nnext=\nlast="), None);
        assert_eq!(malformed_escape(b"trailing= \t\r\n"), None);
        assert_eq!(malformed_escape(b"bad =ZZ"), Some(4));
        assert_eq!(malformed_escape(b"short =A"), Some(6));
        assert_eq!(malformed_escape(b"=G1"), Some(0));
    }

    #[test]
    fn body_parts_are_skipped_before_decoding() {
        let raw = mixed(
            "--XYZ\r\n\
             Content-Type: text/plain\r\n\
             Content-Transfer-Encoding: quoted-printable\r\n\
             \r\n\
             sloppy =ZZ body\r\n\
             --XYZ\r\n\
             Content-Type: application/pdf\r\n\
             Content-Disposition: attachment; filename=\"a.pdf\"\r\n\
             Content-Transfer-Encoding: base64\r\n\
             \r\n\
             JVBERg==\r\n",
        );
        let mail = mailparse::parse_mail(raw.as_bytes()).expect("parse");

        assert!(matches!(
            decompose_attachments(&mail),
            Err(ParseError::QuotedPrintable { part: 0, .. })
        ));

        let files = file_attachments(&mail).expect("files");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "a.pdf");
        assert_eq!(files[0].decoded().expect("base64"), b"%PDF");
    }

    #[test]
    fn missing_boundary_fails() {
        let raw = b"Content-Type: multipart/mixed\r\n\r\nwhatever\r\n";
        let mail = mailparse::parse_mail(raw).expect("parse");

        assert_eq!(
            decompose_attachments(&mail),
            Err(ParseError::MissingBoundary)
        );
    }

    #[test]
    fn plain_body() {
        let raw = b"Subject: Hi\r\n\r\nhello";
        let mail = mailparse::parse_mail(raw).expect("parse");

        assert_eq!(
            extract_body(&mail),
            Ok(Body {
                content: "hello".into(),
                kind: ContentKind::PlainText,
            })
        );
    }

    #[test]
    fn html_body() {
        let raw = b"Content-Type: text/html; charset=utf-8\r\n\r\n<p>hello</p>";
        let mail = mailparse::parse_mail(raw).expect("parse");

        let body = extract_body(&mail).expect("body");
        assert_eq!(body.kind, ContentKind::Html);
        assert_eq!(body.content, "<p>hello</p>");
    }

    #[test]
    fn nested_alternative_body() {
        let raw = mixed(
            "--XYZ\r\n\
             Content-Type: multipart/alternative; boundary=\"ALT\"\r\n\
             \r\n\
             --ALT\r\n\
             Content-Type: text/html\r\n\
             \r\n\
             <b>hi</b>\r\n\
             --ALT\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             hi\r\n\
             --ALT--\r\n\
             --XYZ\r\n\
             Content-Type: text/plain\r\n\
             Content-Disposition: attachment; filename=\"notes.txt\"\r\n\
             \r\n\
             notes\r\n",
        );
        let mail = mailparse::parse_mail(raw.as_bytes()).expect("parse");

        let body = extract_body(&mail).expect("body");
        assert_eq!(body.kind, ContentKind::Html);
        assert!(body.content.starts_with("<b>hi</b>"));

        let attachments = decompose_attachments(&mail).expect("decompose");
        let files: Vec<_> = attachments
            .iter()
            .filter(|attachment| !attachment.is_body_part())
            .map(|attachment| attachment.name.as_str())
            .collect();
        assert_eq!(files, vec!["notes.txt"]);
    }

    #[test]
    fn multipart_without_text_has_empty_body() {
        let raw = mixed(
            "--XYZ\r\n\
             Content-Type: image/png\r\n\
             Content-Disposition: attachment; filename=\"a.png\"\r\n\
             \r\n\
             png\r\n",
        );
        let mail = mailparse::parse_mail(raw.as_bytes()).expect("parse");

        assert_eq!(extract_body(&mail), Ok(Body::default()));
    }
}
