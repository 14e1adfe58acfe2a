//! Graph JSON wire types.

use graph_smtpd_core::{ContentKind, OutboundMessage, mime::Attachment};
use serde::{Deserialize, Serialize};

pub const FILE_ATTACHMENT: &str = "#microsoft.graph.fileAttachment";

/// Body of `POST /users/{id}/sendMail`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMailRequest<'a> {
    pub message: Message<'a>,
    pub save_to_sent_items: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message<'a> {
    pub subject: &'a str,
    pub body: ItemBody<'a>,
    pub from: Recipient<'a>,
    pub to_recipients: Vec<Recipient<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cc_recipients: Option<Vec<Recipient<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bcc_recipients: Option<Vec<Recipient<'a>>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<FileAttachment<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemBody<'a> {
    pub content_type: BodyType,
    pub content: &'a str,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BodyType {
    Text,
    Html,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient<'a> {
    pub email_address: EmailAddress<'a>,
}

#[derive(Debug, Serialize)]
pub struct EmailAddress<'a> {
    pub address: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAttachment<'a> {
    #[serde(rename = "@odata.type")]
    pub odata_type: &'static str,
    pub name: &'a str,
    pub content_type: &'a str,
    pub content_bytes: &'a str,
}

/// The subset of a `user` resource we ask for with `$select=id`
#[derive(Debug, Deserialize)]
pub struct User {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: u64,
}

/// Graph's error envelope, `{"error": {"code": ..., "message": ...}}`
#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl<'a> Recipient<'a> {
    const fn new(address: &'a str) -> Self {
        Self {
            email_address: EmailAddress { address },
        }
    }
}

fn recipients(addresses: &[String]) -> Vec<Recipient<'_>> {
    addresses
        .iter()
        .map(|address| Recipient::new(address))
        .collect()
}

impl<'a> From<&'a Attachment> for FileAttachment<'a> {
    fn from(attachment: &'a Attachment) -> Self {
        Self {
            odata_type: FILE_ATTACHMENT,
            name: &attachment.name,
            content_type: &attachment.content_type,
            content_bytes: &attachment.content_bytes,
        }
    }
}

impl<'a> From<&'a OutboundMessage> for SendMailRequest<'a> {
    fn from(message: &'a OutboundMessage) -> Self {
        Self {
            message: Message {
                subject: &message.subject,
                body: ItemBody {
                    content_type: match message.body.kind {
                        ContentKind::PlainText => BodyType::Text,
                        ContentKind::Html => BodyType::Html,
                    },
                    content: &message.body.content,
                },
                from: Recipient::new(&message.from),
                to_recipients: recipients(&message.to),
                cc_recipients: message.cc.as_deref().map(recipients),
                bcc_recipients: message.bcc.as_deref().map(recipients),
                attachments: message.attachments.iter().map(Into::into).collect(),
            },
            save_to_sent_items: message.save_to_sent_items,
        }
    }
}

#[cfg(test)]
mod tests {
    use graph_smtpd_core::{Body, MessageBuilder};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn plain_message_without_cc() {
        let message = MessageBuilder::new("alice@co.com", "bob@co.com", "Hi")
            .body(Body::text("hello"))
            .build()
            .expect("build");

        let value = serde_json::to_value(SendMailRequest::from(&message)).expect("serialize");
        assert_eq!(
            value,
            json!({
                "message": {
                    "subject": "Hi",
                    "body": { "contentType": "text", "content": "hello" },
                    "from": { "emailAddress": { "address": "alice@co.com" } },
                    "toRecipients": [
                        { "emailAddress": { "address": "bob@co.com" } }
                    ]
                },
                "saveToSentItems": false
            })
        );
    }

    #[test]
    fn html_with_recipients_and_attachment() {
        let message = MessageBuilder::new("alice@co.com", "bob@co.com", "Report")
            .cc("carol@co.com")
            .bcc("dave@co.com")
            .body(Body::html("<p>see attached</p>"))
            .attachments([Attachment {
                name: "report.pdf".into(),
                content_type: "application/pdf".into(),
                content_bytes: "JVBERi0=".into(),
            }])
            .save_to_sent_items(true)
            .build()
            .expect("build");

        let value = serde_json::to_value(SendMailRequest::from(&message)).expect("serialize");
        assert_eq!(value["message"]["body"]["contentType"], "html");
        assert_eq!(
            value["message"]["ccRecipients"],
            json!([{ "emailAddress": { "address": "carol@co.com" } }])
        );
        assert_eq!(
            value["message"]["bccRecipients"],
            json!([{ "emailAddress": { "address": "dave@co.com" } }])
        );
        assert_eq!(
            value["message"]["attachments"],
            json!([{
                "@odata.type": "#microsoft.graph.fileAttachment",
                "name": "report.pdf",
                "contentType": "application/pdf",
                "contentBytes": "JVBERi0="
            }])
        );
        assert_eq!(value["saveToSentItems"], true);
    }
}
