//! RFC 5322 message parsing.
//!
//! Converts raw message bytes into the normalized [`InboundMessage`]
//! shape using mail-parser.

use chrono::{DateTime, Utc};
use mail_parser::{HeaderValue, MessageParser, MimeHeaders, PartType};

use super::error::{ProviderError, Result};
use super::{InboundMessage, MessageAttachment};

/// Parses a raw RFC 5322 message into an [`InboundMessage`].
pub fn parse_raw(raw: &[u8]) -> Result<InboundMessage> {
    let message = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| ProviderError::ParseError("Failed to parse email message".to_string()))?;

    let (sender, sender_name) = message
        .from()
        .and_then(|addr| addr.first())
        .map(|addr| {
            (
                addr.address().unwrap_or_default().to_lowercase(),
                addr.name().map(|n| n.to_string()),
            )
        })
        .unwrap_or_default();

    let recipients: Vec<String> = message
        .to()
        .map(|addrs| {
            addrs
                .iter()
                .filter_map(|a| a.address())
                .map(|a| a.to_lowercase())
                .collect()
        })
        .unwrap_or_default();

    let mut headers = std::collections::HashMap::new();
    for header in message.headers() {
        if let Some(text) = header.value.as_text() {
            headers.insert(header.name.as_str().to_lowercase(), text.to_string());
        }
    }

    let in_reply_to = header_text(&message, "In-Reply-To");
    let references = header_list(&message, "References");

    let priority_hint = header_text(&message, "X-Priority")
        .and_then(|v| v.chars().find(|c| c.is_ascii_digit()))
        .and_then(|c| c.to_digit(10))
        .map(|d| d as u8);

    let received_at: Option<DateTime<Utc>> = message
        .date()
        .and_then(|d| DateTime::parse_from_rfc3339(&d.to_rfc3339()).ok())
        .map(|d| d.with_timezone(&Utc));

    let mut attachments = Vec::new();
    for part in message.parts.iter() {
        if !is_attachment(part) {
            continue;
        }
        let content = match &part.body {
            PartType::Binary(data) | PartType::InlineBinary(data) => data.to_vec(),
            PartType::Text(text) => text.as_bytes().to_vec(),
            PartType::Html(html) => html.as_bytes().to_vec(),
            _ => continue,
        };
        let filename = part
            .attachment_name()
            .or_else(|| part.content_type().and_then(|ct| ct.attribute("name")))
            .unwrap_or("attachment")
            .to_string();
        let mime_type = part
            .content_type()
            .map(|ct| {
                if let Some(subtype) = ct.subtype() {
                    format!("{}/{}", ct.ctype(), subtype)
                } else {
                    ct.ctype().to_string()
                }
            })
            .unwrap_or_else(|| guess_mime(&filename));
        let is_inline = part
            .content_disposition()
            .map(|d| d.ctype() == "inline")
            .unwrap_or(false);

        attachments.push(MessageAttachment {
            filename,
            mime_type,
            size: content.len() as u64,
            is_inline,
            content,
        });
    }

    Ok(InboundMessage {
        message_id: message
            .message_id()
            .map(|s| s.to_string())
            .unwrap_or_default(),
        sender,
        sender_name,
        recipients,
        subject: message.subject().unwrap_or_default().to_string(),
        text_body: message.body_text(0).map(|b| b.to_string()),
        html_body: message.body_html(0).map(|b| b.to_string()),
        headers,
        in_reply_to,
        references,
        provider_thread_id: None,
        priority_hint,
        received_at,
        attachments,
    })
}

fn header_text(message: &mail_parser::Message<'_>, name: &str) -> Option<String> {
    message
        .header(name)
        .and_then(|v| v.as_text())
        .map(|s| s.to_string())
}

fn header_list(message: &mail_parser::Message<'_>, name: &str) -> Vec<String> {
    match message.header(name) {
        Some(HeaderValue::Text(t)) => vec![t.to_string()],
        Some(HeaderValue::TextList(list)) => list.iter().map(|t| t.to_string()).collect(),
        _ => Vec::new(),
    }
}

fn is_attachment(part: &mail_parser::MessagePart<'_>) -> bool {
    if let Some(disposition) = part.content_disposition() {
        if disposition.ctype() == "attachment" {
            return true;
        }
    }
    if part.attachment_name().is_some() {
        return true;
    }
    false
}

/// MIME type fallback when the part declares none.
fn guess_mime(filename: &str) -> String {
    mime_guess::from_path(filename)
        .first_raw()
        .unwrap_or("application/octet-stream")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = "Message-ID: <abc@example.com>\r\n\
        From: Jo Smith <jo@acmecorp.com>\r\n\
        To: support@helpdesk.example\r\n\
        Subject: Login broken\r\n\
        Date: Mon, 2 Mar 2026 10:00:00 +0000\r\n\
        Content-Type: text/plain\r\n\
        \r\n\
        I cannot log in since this morning.\r\n";

    const REPLY: &str = "Message-ID: <def@example.com>\r\n\
        From: jo@acmecorp.com\r\n\
        To: support@helpdesk.example\r\n\
        Subject: Re: Login broken\r\n\
        In-Reply-To: <abc@example.com>\r\n\
        References: <root@example.com> <abc@example.com>\r\n\
        X-Priority: 2\r\n\
        Content-Type: text/plain\r\n\
        \r\n\
        Still broken.\r\n";

    #[test]
    fn test_parse_simple_message() {
        let msg = parse_raw(SIMPLE.as_bytes()).unwrap();
        assert_eq!(msg.message_id, "abc@example.com");
        assert_eq!(msg.sender, "jo@acmecorp.com");
        assert_eq!(msg.sender_name.as_deref(), Some("Jo Smith"));
        assert_eq!(msg.recipients, vec!["support@helpdesk.example"]);
        assert_eq!(msg.subject, "Login broken");
        assert!(msg.body().contains("cannot log in"));
        assert!(msg.in_reply_to.is_none());
        assert!(msg.attachments.is_empty());
    }

    #[test]
    fn test_parse_reply_headers() {
        let msg = parse_raw(REPLY.as_bytes()).unwrap();
        assert_eq!(msg.in_reply_to.as_deref(), Some("abc@example.com"));
        assert_eq!(msg.references.len(), 2);
        assert_eq!(msg.references[0], "root@example.com");
        assert_eq!(msg.priority_hint, Some(2));
    }

    #[test]
    fn test_parse_junk_does_not_panic() {
        // mail-parser is lenient; junk either errors or yields an empty
        // message, but must never panic.
        if let Ok(msg) = parse_raw(&[0xff, 0xfe, 0x00]) {
            assert!(msg.sender.is_empty());
        }
        let _ = parse_raw(b"");
    }

    #[test]
    fn test_guess_mime_fallback() {
        assert_eq!(guess_mime("report.pdf"), "application/pdf");
        assert_eq!(guess_mime("noext"), "application/octet-stream");
    }
}
