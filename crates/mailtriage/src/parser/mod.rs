//! Structured-data extraction from inbound messages.
//!
//! Pure function of the parser configuration and the message. No I/O:
//! the workflow feeds the result into mapping, threading and ticket
//! creation.

use std::collections::HashMap;

use glob::Pattern;
use log::debug;
use regex::Regex;

use crate::config::schema::ParserConfig;
use crate::error::ConfigError;
use crate::provider::{InboundMessage, MessageAttachment};

/// Ticket priority, ordered by urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Medium => "MEDIUM",
            Priority::High => "HIGH",
            Priority::Critical => "CRITICAL",
        }
    }
}

/// Extraction method recorded on the ticket for provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionMethod {
    TextBody,
    HtmlBody,
    SubjectFallback,
}

impl ExtractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionMethod::TextBody => "text_body",
            ExtractionMethod::HtmlBody => "html_body",
            ExtractionMethod::SubjectFallback => "subject_fallback",
        }
    }
}

/// The parser's output for one message.
#[derive(Debug, Clone)]
pub struct ParsedTicketData {
    pub subject: String,
    pub description: String,
    pub priority: Priority,
    pub category: Option<String>,
    /// 0-100. Gated by the workflow's minimum-confidence threshold.
    pub confidence: u32,
    pub extraction_method: ExtractionMethod,
    pub is_reply: bool,
    /// Ticket number referenced in the subject or body, if any.
    pub referenced_ticket: Option<String>,
    pub custom_fields: HashMap<String, String>,
    /// Attachments that survived the parser's filter.
    pub attachments: Vec<MessageAttachment>,
}

/// Extensions that make a double-extension filename suspicious.
const DANGEROUS_EXTENSIONS: &[&str] = &[
    "exe", "scr", "bat", "cmd", "com", "pif", "vbs", "js", "jar", "msi", "dll", "ps1",
];

pub struct EmailParser {
    config: ParserConfig,
    ticket_patterns: Vec<Regex>,
    custom_field_patterns: Vec<(String, Regex)>,
    blocked_filename_patterns: Vec<Pattern>,
}

impl EmailParser {
    /// Compiles all configured patterns up front so `parse` never fails.
    pub fn new(config: &ParserConfig) -> Result<Self, ConfigError> {
        let ticket_patterns = config
            .ticket_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| ConfigError::InvalidPattern {
                    name: "ticket_patterns".to_string(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let custom_field_patterns = config
            .custom_fields
            .iter()
            .map(|f| {
                Regex::new(&f.pattern)
                    .map(|re| (f.name.clone(), re))
                    .map_err(|e| ConfigError::InvalidPattern {
                        name: f.name.clone(),
                        reason: e.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let blocked_filename_patterns = config
            .attachments
            .blocked_filename_patterns
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|e| ConfigError::InvalidPattern {
                    name: "blocked_filename_patterns".to_string(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            config: config.clone(),
            ticket_patterns,
            custom_field_patterns,
            blocked_filename_patterns,
        })
    }

    /// Extracts structured ticket data from a message.
    pub fn parse(&self, message: &InboundMessage) -> ParsedTicketData {
        let body = message.body();
        let searchable = format!("{}\n{}", message.subject, body);

        let referenced_ticket = self.find_ticket_number(&searchable);
        let is_reply = self.has_reply_prefix(&message.subject)
            || referenced_ticket.is_some()
            || message.in_reply_to.is_some();

        let subject = self.clean_subject(&message.subject);
        let (description, extraction_method) = self.extract_description(message);
        let (priority, priority_matched) = self.detect_priority(&searchable, message.priority_hint);
        let category = self.detect_category(&searchable);
        let attachments = self.filter_attachments(&message.attachments);
        let custom_fields = self.extract_custom_fields(&searchable);

        let confidence = self.score_confidence(
            message,
            &description,
            is_reply,
            !attachments.is_empty(),
            priority_matched,
            category.is_some(),
        );

        debug!(
            "Parsed message {}: priority={} confidence={} reply={}",
            message.message_id,
            priority.as_str(),
            confidence,
            is_reply
        );

        ParsedTicketData {
            subject,
            description,
            priority,
            category,
            confidence,
            extraction_method,
            is_reply,
            referenced_ticket,
            custom_fields,
            attachments,
        }
    }

    /// Removes all ticket-number references from a string. Used when a
    /// referenced ticket cannot be resolved and the message is handled
    /// as a fresh request.
    pub fn strip_ticket_numbers(&self, text: &str) -> String {
        let mut out = text.to_string();
        for pattern in &self.ticket_patterns {
            out = pattern.replace_all(&out, "").to_string();
        }
        collapse_whitespace(&out)
    }

    fn has_reply_prefix(&self, subject: &str) -> bool {
        let lower = subject.trim().to_lowercase();
        self.config
            .reply_prefixes
            .iter()
            .any(|p| lower.starts_with(&p.to_lowercase()))
    }

    /// First ticket number found, patterns tried in configured order.
    fn find_ticket_number(&self, text: &str) -> Option<String> {
        for pattern in &self.ticket_patterns {
            if let Some(captures) = pattern.captures(text) {
                if let Some(number) = captures.get(1) {
                    return Some(number.as_str().to_string());
                }
            }
        }
        None
    }

    /// Strips reply/forward/type prefixes (one pass each, first match),
    /// collapses whitespace and leading punctuation.
    fn clean_subject(&self, subject: &str) -> String {
        let mut cleaned = subject.trim().to_string();

        for prefixes in [
            &self.config.reply_prefixes,
            &self.config.forward_prefixes,
            &self.config.ticket_type_prefixes,
        ] {
            cleaned = cleaned.trim_start().to_string();
            for prefix in prefixes.iter() {
                if let Some(rest) = strip_prefix_ignore_case(&cleaned, prefix) {
                    cleaned = rest.trim_start().to_string();
                    break;
                }
            }
        }

        let cleaned = collapse_whitespace(&cleaned);
        let cleaned = cleaned
            .trim_start_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace())
            .to_string();

        if cleaned.is_empty() {
            "No Subject".to_string()
        } else {
            cleaned
        }
    }

    fn extract_description(&self, message: &InboundMessage) -> (String, ExtractionMethod) {
        let (raw, method) = match (&message.text_body, &message.html_body) {
            (Some(text), _) if !text.trim().is_empty() => {
                (text.clone(), ExtractionMethod::TextBody)
            }
            (_, Some(html)) if !html.trim().is_empty() => {
                (strip_html(html), ExtractionMethod::HtmlBody)
            }
            _ => (message.subject.clone(), ExtractionMethod::SubjectFallback),
        };

        let cleaned = strip_quoted_lines(&strip_signature(&raw));
        let cleaned = collapse_blank_lines(&cleaned);
        let cleaned = cleaned.trim().to_string();

        (
            truncate_with_ellipsis(&cleaned, self.config.max_description_length),
            method,
        )
    }

    /// Keyword scan, most urgent list first, then provider hint, then MEDIUM.
    /// Returns the priority and whether a keyword matched.
    fn detect_priority(&self, text: &str, hint: Option<u8>) -> (Priority, bool) {
        let lower = text.to_lowercase();
        let keywords = &self.config.priority_keywords;
        for (list, priority) in [
            (&keywords.critical, Priority::Critical),
            (&keywords.high, Priority::High),
            (&keywords.medium, Priority::Medium),
            (&keywords.low, Priority::Low),
        ] {
            if list.iter().any(|k| lower.contains(&k.to_lowercase())) {
                return (priority, true);
            }
        }

        let priority = match hint {
            Some(h) if h <= 2 => Priority::Critical,
            Some(h) if h <= 3 => Priority::High,
            Some(h) if h >= 7 => Priority::Low,
            _ => Priority::Medium,
        };
        (priority, false)
    }

    fn detect_category(&self, text: &str) -> Option<String> {
        let lower = text.to_lowercase();
        self.config
            .categories
            .iter()
            .find(|c| c.keywords.iter().any(|k| lower.contains(&k.to_lowercase())))
            .map(|c| c.category.clone())
    }

    fn filter_attachments(&self, attachments: &[MessageAttachment]) -> Vec<MessageAttachment> {
        attachments
            .iter()
            .filter(|a| {
                if a.size > self.config.attachments.max_size_bytes {
                    debug!("Attachment '{}' dropped: too large", a.filename);
                    return false;
                }
                if !self.mime_allowed(&a.mime_type) {
                    debug!("Attachment '{}' dropped: type {}", a.filename, a.mime_type);
                    return false;
                }
                let lower = a.filename.to_lowercase();
                if self
                    .blocked_filename_patterns
                    .iter()
                    .any(|p| p.matches(&lower))
                {
                    debug!("Attachment '{}' dropped: blocked filename", a.filename);
                    return false;
                }
                if has_double_extension(&lower) {
                    debug!("Attachment '{}' dropped: double extension", a.filename);
                    return false;
                }
                true
            })
            .cloned()
            .collect()
    }

    fn mime_allowed(&self, mime_type: &str) -> bool {
        self.config
            .attachments
            .allowed_types
            .iter()
            .any(|pattern| mime_matches(mime_type, pattern))
    }

    fn extract_custom_fields(&self, text: &str) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        for (name, pattern) in &self.custom_field_patterns {
            if let Some(captures) = pattern.captures(text) {
                if let Some(value) = captures.get(1) {
                    fields.insert(name.clone(), value.as_str().trim().to_string());
                }
            }
        }
        fields
    }

    fn score_confidence(
        &self,
        message: &InboundMessage,
        description: &str,
        is_reply: bool,
        has_attachments: bool,
        priority_matched: bool,
        has_category: bool,
    ) -> u32 {
        let has_subject = !message.subject.trim().is_empty();
        let has_sender = is_valid_email(&message.sender);

        let mut score = 0u32;
        if has_subject {
            score += 20;
        }
        if !description.is_empty() {
            score += 25;
        }
        if has_sender {
            score += 20;
        }
        if is_reply {
            score += 10;
        }
        if has_attachments {
            score += 5;
        }
        if priority_matched {
            score += 10;
        }
        if has_category {
            score += 10;
        }

        let score = score.min(100);
        if has_subject && has_sender {
            score.max(50)
        } else {
            score
        }
    }
}

fn is_valid_email(address: &str) -> bool {
    match address.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.'),
        None => false,
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Case-insensitive prefix strip that never slices inside a character.
/// Lowercasing can change byte lengths, so the remainder offset is
/// computed from the matched characters, not from `prefix.len()`.
fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let mut offset = 0;
    let mut text_chars = text.chars();
    for pc in prefix.chars() {
        let tc = text_chars.next()?;
        if !tc.to_lowercase().eq(pc.to_lowercase()) {
            return None;
        }
        offset += tc.len_utf8();
    }
    Some(&text[offset..])
}

/// Minimal HTML-to-text conversion: drop tags, decode common entities.
fn strip_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}

/// Cuts everything from the first signature marker onward.
fn strip_signature(text: &str) -> String {
    let markers = ["\n-- \n", "\n--\n", "\nSent from my ", "\nGet Outlook for "];
    let mut cut = text.len();
    for marker in markers {
        if let Some(pos) = text.find(marker) {
            cut = cut.min(pos);
        }
    }
    text[..cut].to_string()
}

fn strip_quoted_lines(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with('>'))
        .collect::<Vec<_>>()
        .join("\n")
}

fn collapse_blank_lines(text: &str) -> String {
    let mut out = Vec::new();
    let mut blank = false;
    for line in text.lines() {
        if line.trim().is_empty() {
            if !blank {
                out.push("");
            }
            blank = true;
        } else {
            out.push(line);
            blank = false;
        }
    }
    out.join("\n")
}

fn truncate_with_ellipsis(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_len.saturating_sub(3)).collect();
    format!("{}...", truncated)
}

/// `invoice.pdf.exe` style disguises: more than one extension with a
/// dangerous final one.
fn has_double_extension(filename: &str) -> bool {
    let parts: Vec<&str> = filename.split('.').collect();
    if parts.len() < 3 {
        return false;
    }
    parts
        .last()
        .map(|ext| DANGEROUS_EXTENSIONS.contains(ext))
        .unwrap_or(false)
}

/// MIME pattern match, supporting "image/*" style wildcards.
fn mime_matches(mime_type: &str, pattern: &str) -> bool {
    if pattern == "*/*" {
        return true;
    }
    let (mtype, msub) = match mime_type.split_once('/') {
        Some(parts) => parts,
        None => return false,
    };
    let (ptype, psub) = match pattern.split_once('/') {
        Some(parts) => parts,
        None => return false,
    };
    (ptype == "*" || ptype.eq_ignore_ascii_case(mtype))
        && (psub == "*" || psub.eq_ignore_ascii_case(msub))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> EmailParser {
        EmailParser::new(&ParserConfig::default()).unwrap()
    }

    fn message(subject: &str, body: &str) -> InboundMessage {
        InboundMessage {
            message_id: "m1".to_string(),
            sender: "jo@acmecorp.com".to_string(),
            subject: subject.to_string(),
            text_body: Some(body.to_string()),
            ..Default::default()
        }
    }

    fn attachment(filename: &str, mime_type: &str, size: u64) -> MessageAttachment {
        MessageAttachment {
            filename: filename.to_string(),
            mime_type: mime_type.to_string(),
            size,
            is_inline: false,
            content: Vec::new(),
        }
    }

    #[test]
    fn test_reply_detection_by_prefix() {
        let p = parser();
        assert!(p.parse(&message("Re: Login broken", "still broken")).is_reply);
        assert!(p.parse(&message("RE: anything", "x")).is_reply);
        assert!(p.parse(&message("AW: anything", "x")).is_reply);
        assert!(!p.parse(&message("Login broken", "fresh report")).is_reply);
    }

    #[test]
    fn test_reply_detection_by_ticket_number() {
        let p = parser();
        let parsed = p.parse(&message("Update on [ACME-2026-0042]", "see above"));
        assert!(parsed.is_reply);
        assert_eq!(parsed.referenced_ticket.as_deref(), Some("ACME-2026-0042"));
    }

    #[test]
    fn test_reply_detection_by_header() {
        let p = parser();
        let mut msg = message("Anything", "body");
        msg.in_reply_to = Some("abc@example.com".to_string());
        assert!(p.parse(&msg).is_reply);
    }

    #[test]
    fn test_subject_cleaning() {
        let p = parser();
        assert_eq!(
            p.parse(&message("Re: bug:  Login   broken", "x")).subject,
            "Login broken"
        );
        assert_eq!(p.parse(&message("Re:", "x")).subject, "No Subject");
        assert_eq!(p.parse(&message("   ", "x")).subject, "No Subject");
    }

    #[test]
    fn test_subject_cleaning_with_multibyte_prefixes() {
        let mut config = ParserConfig::default();
        config.reply_prefixes.push("İleti:".to_string());
        let p = EmailParser::new(&config).unwrap();

        // 'İ' lowercases to two characters; the strip must stay on
        // character boundaries in both the prefix and the subject.
        assert_eq!(
            p.parse(&message("İleti: Yazıcı bozuk", "x")).subject,
            "Yazıcı bozuk"
        );
        assert_eq!(
            p.parse(&message("i\u{0307}leti broken", "x")).subject,
            "i\u{0307}leti broken"
        );
    }

    #[test]
    fn test_description_strips_quotes_and_signature() {
        let p = parser();
        let body = "The app crashes on save.\n\n> old quoted text\n> more quote\n-- \nJo Smith\nAcme Corp";
        let parsed = p.parse(&message("Crash", body));
        assert!(parsed.description.contains("crashes on save"));
        assert!(!parsed.description.contains("quoted text"));
        assert!(!parsed.description.contains("Jo Smith"));
        assert_eq!(parsed.extraction_method, ExtractionMethod::TextBody);
    }

    #[test]
    fn test_description_from_html() {
        let p = parser();
        let mut msg = message("Crash", "");
        msg.text_body = None;
        msg.html_body = Some("<p>Hello &amp; <b>goodbye</b></p>".to_string());
        let parsed = p.parse(&msg);
        assert!(parsed.description.contains("Hello & "));
        assert!(!parsed.description.contains('<'));
        assert_eq!(parsed.extraction_method, ExtractionMethod::HtmlBody);
    }

    #[test]
    fn test_description_truncation() {
        let config = ParserConfig {
            max_description_length: 20,
            ..Default::default()
        };
        let p = EmailParser::new(&config).unwrap();
        let parsed = p.parse(&message("Long", &"a".repeat(100)));
        assert_eq!(parsed.description.chars().count(), 20);
        assert!(parsed.description.ends_with("..."));
    }

    #[test]
    fn test_priority_keyword_order() {
        let p = parser();
        // "urgent" (critical) beats "broken" (high).
        let parsed = p.parse(&message("Urgent: login broken", "x"));
        assert_eq!(parsed.priority, Priority::Critical);

        let parsed = p.parse(&message("Something broken", "x"));
        assert_eq!(parsed.priority, Priority::High);
    }

    #[test]
    fn test_priority_hint_fallback() {
        let p = parser();
        let mut msg = message("Hello", "nothing notable");
        msg.priority_hint = Some(1);
        assert_eq!(p.parse(&msg).priority, Priority::Critical);
        msg.priority_hint = Some(3);
        assert_eq!(p.parse(&msg).priority, Priority::High);
        msg.priority_hint = Some(9);
        assert_eq!(p.parse(&msg).priority, Priority::Low);
        msg.priority_hint = None;
        assert_eq!(p.parse(&msg).priority, Priority::Medium);
    }

    #[test]
    fn test_category_first_match_wins() {
        let p = parser();
        // "invoice" hits billing before "error" hits bug.
        let parsed = p.parse(&message("Invoice error", "x"));
        assert_eq!(parsed.category.as_deref(), Some("billing"));

        let parsed = p.parse(&message("Hello there", "nothing relevant"));
        assert!(parsed.category.is_none());
    }

    #[test]
    fn test_attachment_filtering() {
        let p = parser();
        let mut msg = message("Files", "see attached");
        msg.attachments = vec![
            attachment("report.pdf", "application/pdf", 1024),
            attachment("huge.pdf", "application/pdf", 100 * 1024 * 1024),
            attachment("virus.exe", "application/octet-stream", 10),
            attachment("invoice.pdf.exe", "application/pdf", 10),
            attachment("photo.png", "image/png", 2048),
        ];
        let parsed = p.parse(&msg);
        let kept: Vec<&str> = parsed.attachments.iter().map(|a| a.filename.as_str()).collect();
        assert_eq!(kept, vec!["report.pdf", "photo.png"]);
    }

    #[test]
    fn test_custom_field_extraction() {
        let p = parser();
        let parsed = p.parse(&message(
            "Order issue",
            "My order number: ORD-12345. Phone: +41 44 123 45 67. Version: 2.4.1",
        ));
        assert_eq!(parsed.custom_fields.get("order_number").unwrap(), "ORD-12345");
        assert!(parsed.custom_fields.contains_key("phone"));
        assert_eq!(parsed.custom_fields.get("product_version").unwrap(), "2.4.1");
    }

    #[test]
    fn test_confidence_floor_with_sender_and_subject() {
        let p = parser();
        let mut msg = message("Hi", "");
        msg.text_body = None;
        // Subject fallback yields a description, so the raw score is
        // 20 + 25 + 20 = 65; strip the body path to get near the floor.
        let parsed = p.parse(&msg);
        assert!(parsed.confidence >= 50);
    }

    #[test]
    fn test_confidence_low_without_sender() {
        let p = parser();
        let mut msg = message("", "");
        msg.sender = "not-an-address".to_string();
        msg.text_body = None;
        let parsed = p.parse(&msg);
        assert!(parsed.confidence < 50);
    }

    #[test]
    fn test_confidence_is_capped() {
        let p = parser();
        let mut msg = message("Urgent invoice problem [ACME-2026-0001]", "urgent invoice issue");
        msg.attachments = vec![attachment("a.pdf", "application/pdf", 10)];
        let parsed = p.parse(&msg);
        assert_eq!(parsed.confidence, 100);
    }

    #[test]
    fn test_strip_ticket_numbers() {
        let p = parser();
        assert_eq!(
            p.strip_ticket_numbers("Update on [ACME-2026-0042] please"),
            "Update on please"
        );
    }

    #[test]
    fn test_mime_matches() {
        assert!(mime_matches("image/png", "image/*"));
        assert!(mime_matches("application/pdf", "application/pdf"));
        assert!(mime_matches("anything/else", "*/*"));
        assert!(!mime_matches("application/pdf", "image/*"));
    }
}
