//! Risk scoring for inbound messages.
//!
//! Scoring is additive across independent checks. The spam verdict
//! (`is_secure`) and the risk-level bucket use different cutoffs and
//! are kept separate.

use chrono::{Duration, Utc};
use log::debug;
use regex::Regex;

use crate::audit::EmailAuditService;
use crate::config::schema::SecurityConfig;
use crate::db::{message_repo, Database, DatabaseError};
use crate::error::ConfigError;
use crate::provider::{InboundMessage, MessageAttachment};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        }
    }

    fn from_score(score: u32) -> Self {
        match score {
            s if s >= 80 => RiskLevel::Critical,
            s if s >= 60 => RiskLevel::High,
            s if s >= 30 => RiskLevel::Medium,
            _ => RiskLevel::Low,
        }
    }
}

/// What to do with an individual attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentVerdict {
    Allow,
    Quarantine,
    Block,
}

#[derive(Debug, Clone)]
pub struct SecurityCheckResult {
    /// Score below the spam threshold. Independent of `risk_level`.
    pub is_secure: bool,
    pub risk_level: RiskLevel,
    pub score: u32,
    pub threats: Vec<String>,
    pub warnings: Vec<String>,
    /// Body copy with active content removed.
    pub sanitized_body: String,
}

pub struct EmailSecurityService {
    config: SecurityConfig,
    db: Database,
    audit: EmailAuditService,
    suspicious_patterns: Vec<Regex>,
    suspicious_subject_patterns: Vec<Regex>,
    malicious_url_patterns: Vec<Regex>,
}

fn compile_all(name: &str, patterns: &[String]) -> Result<Vec<Regex>, ConfigError> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|e| ConfigError::InvalidPattern {
                name: name.to_string(),
                reason: e.to_string(),
            })
        })
        .collect()
}

impl EmailSecurityService {
    pub fn new(
        config: &SecurityConfig,
        db: Database,
        audit: EmailAuditService,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            suspicious_patterns: compile_all("suspicious_patterns", &config.suspicious_patterns)?,
            suspicious_subject_patterns: compile_all(
                "suspicious_subject_patterns",
                &config.suspicious_subject_patterns,
            )?,
            malicious_url_patterns: compile_all(
                "malicious_url_patterns",
                &config.malicious_url_patterns,
            )?,
            config: config.clone(),
            db,
            audit,
        })
    }

    /// Scores a message. Always logs the outcome to the security log.
    pub fn check(&self, message: &InboundMessage) -> Result<SecurityCheckResult, DatabaseError> {
        let sender = message.sender.to_lowercase();
        let domain = sender.split('@').nth(1).unwrap_or("").to_string();

        if self.is_whitelisted(&sender, &domain) {
            let result = SecurityCheckResult {
                is_secure: true,
                risk_level: RiskLevel::Low,
                score: 0,
                threats: Vec::new(),
                warnings: vec![format!("Sender {} is whitelisted", sender)],
                sanitized_body: sanitize_content(message.body()),
            };
            self.log_result(message, &result);
            return Ok(result);
        }

        let mut score = 0u32;
        let mut threats = Vec::new();
        let mut warnings = Vec::new();
        let mut risk_floor = RiskLevel::Low;

        if self.is_blacklisted(&sender, &domain) {
            score += 50;
            threats.push(format!("Sender {} is blacklisted", sender));
        }

        score += self.spam_score(message, &mut warnings);
        score += self.content_score(message, &mut threats, &mut warnings);
        score += self.url_score(message.body(), &mut threats, &mut warnings);
        score += self.reputation_score(&sender, &mut warnings)?;

        for attachment in &message.attachments {
            let (verdict, level, note) = self.scan_attachment(attachment);
            match verdict {
                AttachmentVerdict::Block => threats.push(note),
                AttachmentVerdict::Quarantine => warnings.push(note),
                AttachmentVerdict::Allow => continue,
            }
            risk_floor = risk_floor.max(level);
        }

        let risk_level = RiskLevel::from_score(score).max(risk_floor);
        let result = SecurityCheckResult {
            is_secure: score < self.config.spam_threshold,
            risk_level,
            score,
            threats,
            warnings,
            sanitized_body: sanitize_content(message.body()),
        };

        debug!(
            "Security check for {}: score={} risk={} secure={}",
            message.message_id,
            result.score,
            result.risk_level.as_str(),
            result.is_secure
        );
        self.log_result(message, &result);
        Ok(result)
    }

    fn log_result(&self, message: &InboundMessage, result: &SecurityCheckResult) {
        self.audit.log_security_event(
            &message.message_id,
            &message.sender,
            result.risk_level.as_str(),
            result.score,
            &result.threats,
            &result.warnings,
        );
    }

    fn is_whitelisted(&self, sender: &str, domain: &str) -> bool {
        self.config
            .whitelisted_senders
            .iter()
            .any(|s| s.eq_ignore_ascii_case(sender))
            || self
                .config
                .whitelisted_domains
                .iter()
                .any(|d| d.eq_ignore_ascii_case(domain))
    }

    fn is_blacklisted(&self, sender: &str, domain: &str) -> bool {
        self.config
            .blacklisted_senders
            .iter()
            .any(|s| s.eq_ignore_ascii_case(sender))
            || self
                .config
                .blacklisted_domains
                .iter()
                .any(|d| d.eq_ignore_ascii_case(domain))
    }

    fn spam_score(&self, message: &InboundMessage, warnings: &mut Vec<String>) -> u32 {
        let mut score = 0;
        let text = format!("{}\n{}", message.subject, message.body());

        for pattern in &self.suspicious_patterns {
            if pattern.is_match(&text) {
                score += 15;
                warnings.push(format!("Suspicious content pattern: {}", pattern.as_str()));
            }
        }

        if caps_ratio(&text) > 0.3 {
            score += 20;
            warnings.push("Excessive capitalization".to_string());
        }

        if has_punctuation_runs(&text) {
            score += 15;
            warnings.push("Excessive punctuation".to_string());
        }

        for pattern in &self.suspicious_subject_patterns {
            if pattern.is_match(&message.subject) {
                score += 10;
                warnings.push(format!("Suspicious subject pattern: {}", pattern.as_str()));
            }
        }

        if message.sender_name.as_deref().unwrap_or("").is_empty() {
            score += 5;
            warnings.push("Missing sender display name".to_string());
        }

        score
    }

    fn content_score(
        &self,
        message: &InboundMessage,
        threats: &mut Vec<String>,
        warnings: &mut Vec<String>,
    ) -> u32 {
        let html = match &message.html_body {
            Some(html) => html.to_lowercase(),
            None => return 0,
        };
        let mut score = 0;

        if html.contains("<script")
            || html.contains("javascript:")
            || EVENT_HANDLER_RE.is_match(&html)
        {
            score += 25;
            threats.push("Embedded script content".to_string());
        }

        if html.contains("display:none")
            || html.contains("display: none")
            || html.contains("opacity:0")
            || html.contains("opacity: 0")
        {
            score += 15;
            warnings.push("Hidden content".to_string());
        }

        if html.contains("data:") && html.contains(";base64,") {
            score += 15;
            warnings.push("Base64 data URI".to_string());
        }

        score
    }

    fn url_score(&self, body: &str, threats: &mut Vec<String>, warnings: &mut Vec<String>) -> u32 {
        let mut score = 0;
        for url in URL_RE.find_iter(body) {
            let url = url.as_str();
            let host = url_host(url);

            if self
                .config
                .shortener_domains
                .iter()
                .any(|d| host == *d || host.ends_with(&format!(".{}", d)))
            {
                score += 15;
                warnings.push(format!("Shortened URL: {}", url));
            }

            for pattern in &self.malicious_url_patterns {
                if pattern.is_match(url) {
                    score += 30;
                    threats.push(format!("Malicious URL: {}", url));
                    break;
                }
            }
        }
        score
    }

    /// Sender history over the configured window. New senders get a
    /// small caution score; repeat offenders a large one.
    fn reputation_score(
        &self,
        sender: &str,
        warnings: &mut Vec<String>,
    ) -> Result<u32, DatabaseError> {
        let since = (Utc::now() - Duration::days(self.config.history_days as i64)).to_rfc3339();
        let history = message_repo::sender_history(&self.db, sender, &since)?;

        if history.total == 0 {
            warnings.push(format!("First message from {}", sender));
            return Ok(10);
        }

        let rate = history.failure_rate();
        if rate > 0.5 {
            warnings.push(format!(
                "Sender {} has {:.0}% flagged history",
                sender,
                rate * 100.0
            ));
            Ok(30)
        } else if rate > 0.2 {
            warnings.push(format!(
                "Sender {} has {:.0}% flagged history",
                sender,
                rate * 100.0
            ));
            Ok(15)
        } else {
            Ok(0)
        }
    }

    /// Per-attachment verdict. Does not feed the additive score;
    /// instead it floors the overall risk level.
    pub fn scan_attachment(
        &self,
        attachment: &MessageAttachment,
    ) -> (AttachmentVerdict, RiskLevel, String) {
        let filename = attachment.filename.to_lowercase();
        let extension = filename.rsplit('.').next().unwrap_or("").to_string();

        if attachment.size > self.config.attachments.max_size_bytes {
            return (
                AttachmentVerdict::Block,
                RiskLevel::High,
                format!("Attachment '{}' exceeds size limit", attachment.filename),
            );
        }

        if self.config.attachments.blocked_extensions.contains(&extension) {
            return (
                AttachmentVerdict::Block,
                RiskLevel::Critical,
                format!("Attachment '{}' has blocked extension", attachment.filename),
            );
        }

        // invoice.pdf.exe style disguise: an executable-looking final
        // extension hiding behind a document extension.
        let parts: Vec<&str> = filename.split('.').collect();
        if parts.len() >= 3 {
            let decoy = parts[parts.len() - 2];
            if SAFE_DECOY_EXTENSIONS.contains(&decoy) {
                return (
                    AttachmentVerdict::Block,
                    RiskLevel::High,
                    format!("Attachment '{}' has disguised extension", attachment.filename),
                );
            }
        }

        if self
            .config
            .attachments
            .quarantine_extensions
            .contains(&extension)
        {
            return (
                AttachmentVerdict::Quarantine,
                RiskLevel::Medium,
                format!("Attachment '{}' held for review", attachment.filename),
            );
        }

        (AttachmentVerdict::Allow, RiskLevel::Low, String::new())
    }
}

/// Document extensions commonly used as decoys in disguised filenames.
const SAFE_DECOY_EXTENSIONS: &[&str] = &[
    "pdf", "doc", "docx", "xls", "xlsx", "txt", "jpg", "jpeg", "png", "csv",
];

lazy_static::lazy_static! {
    static ref URL_RE: Regex = Regex::new(r#"https?://[^\s<>"']+"#).unwrap();
    static ref EVENT_HANDLER_RE: Regex = Regex::new(r"\bon\w+\s*=").unwrap();
    static ref SCRIPT_TAG_RE: Regex = Regex::new(r"(?is)<script.*?</script>|<script[^>]*>").unwrap();
}

/// Ratio of uppercase letters among alphabetic characters. Short texts
/// are exempt.
fn caps_ratio(text: &str) -> f64 {
    let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.len() < 20 {
        return 0.0;
    }
    let upper = letters.iter().filter(|c| c.is_uppercase()).count();
    upper as f64 / letters.len() as f64
}

fn has_punctuation_runs(text: &str) -> bool {
    let mut run = 0;
    for c in text.chars() {
        if c == '!' || c == '?' {
            run += 1;
            if run >= 3 {
                return true;
            }
        } else {
            run = 0;
        }
    }
    false
}

/// Removes active content from a body copy.
fn sanitize_content(body: &str) -> String {
    let without_scripts = SCRIPT_TAG_RE.replace_all(body, "");
    let without_handlers = EVENT_HANDLER_RE.replace_all(&without_scripts, "data-removed=");
    without_handlers.replace("javascript:", "")
}

fn url_host(url: &str) -> String {
    url.trim_start_matches("https://")
        .trim_start_matches("http://")
        .split(['/', '?', '#'])
        .next()
        .unwrap_or("")
        .split('@')
        .last()
        .unwrap_or("")
        .split(':')
        .next()
        .unwrap_or("")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_with(config: SecurityConfig) -> (EmailSecurityService, Database) {
        let db = Database::open_in_memory().unwrap();
        let audit = EmailAuditService::new(db.clone());
        (
            EmailSecurityService::new(&config, db.clone(), audit).unwrap(),
            db,
        )
    }

    fn service() -> (EmailSecurityService, Database) {
        service_with(SecurityConfig::default())
    }

    fn message(sender: &str, subject: &str, body: &str) -> InboundMessage {
        InboundMessage {
            message_id: "m1".to_string(),
            sender: sender.to_string(),
            sender_name: Some("Some Name".to_string()),
            subject: subject.to_string(),
            text_body: Some(body.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_whitelist_bypasses_all_checks() {
        let config = SecurityConfig {
            whitelisted_domains: vec!["trusted.com".into()],
            ..Default::default()
        };
        let (service, _db) = service_with(config);
        // Content that would otherwise score heavily.
        let result = service
            .check(&message(
                "spam@trusted.com",
                "FREE WINNER",
                "you have won a prize!!! click here now",
            ))
            .unwrap();
        assert!(result.is_secure);
        assert_eq!(result.score, 0);
        assert_eq!(result.risk_level, RiskLevel::Low);
    }

    #[test]
    fn test_blacklist_adds_major_threat() {
        let config = SecurityConfig {
            blacklisted_senders: vec!["bad@evil.com".into()],
            ..Default::default()
        };
        let (service, _db) = service_with(config);
        let result = service
            .check(&message("bad@evil.com", "Hello", "ordinary content"))
            .unwrap();
        assert!(result.score >= 50);
        assert!(!result.threats.is_empty());
    }

    #[test]
    fn test_spam_heuristics_accumulate() {
        let (service, _db) = service();
        let result = service
            .check(&message(
                "x@unknown.com",
                "Congratulations you are a winner",
                "You have won a prize!!! Claim your reward now.",
            ))
            .unwrap();
        // Two suspicious patterns (+30), punctuation (+15), subject
        // pattern (+10), new sender (+10).
        assert!(result.score >= 60, "score was {}", result.score);
        assert_eq!(result.risk_level, RiskLevel::High);
    }

    #[test]
    fn test_caps_ratio_scoring() {
        let (service, _db) = service();
        let shouting = service
            .check(&message(
                "x@unknown.com",
                "PLEASE HELP ME RIGHT NOW",
                "EVERYTHING IS COMPLETELY ON FIRE HERE",
            ))
            .unwrap();
        let calm = service
            .check(&message(
                "x@unknown.com",
                "Please help me",
                "Something is wrong with my account settings.",
            ))
            .unwrap();
        assert!(shouting.score > calm.score);
    }

    #[test]
    fn test_script_content_is_a_threat() {
        let (service, _db) = service();
        let mut msg = message("x@unknown.com", "Update", "see html");
        msg.html_body = Some("<p onclick=steal()>hi</p><script>steal()</script>".to_string());
        let result = service.check(&msg).unwrap();
        assert!(result.threats.iter().any(|t| t.contains("script")));
        assert!(result.score >= 25);
    }

    #[test]
    fn test_url_scanning() {
        let (service, _db) = service();
        let result = service
            .check(&message(
                "x@unknown.com",
                "Link",
                "visit http://bit.ly/abc and http://192.168.1.1/login",
            ))
            .unwrap();
        assert!(result.warnings.iter().any(|w| w.contains("bit.ly")));
        assert!(result.threats.iter().any(|t| t.contains("192.168.1.1")));
    }

    #[test]
    fn test_sender_reputation() {
        let (service, db) = service();
        let now = Utc::now().to_rfc3339();
        for (id, disp) in [
            ("h1", message_repo::disposition::BLOCKED),
            ("h2", message_repo::disposition::BLOCKED),
            ("h3", message_repo::disposition::PROCESSED),
        ] {
            message_repo::insert(
                &db,
                &message_repo::MessageRow {
                    message_id: id.to_string(),
                    thread_id: None,
                    parent_message_id: None,
                    depth: 0,
                    provider_thread_id: None,
                    sender: "repeat@offender.com".to_string(),
                    sender_name: None,
                    subject: "x".to_string(),
                    disposition: disp.to_string(),
                    ticket_id: None,
                    received_at: now.clone(),
                },
            )
            .unwrap();
        }

        let result = service
            .check(&message("repeat@offender.com", "Hi", "ordinary text"))
            .unwrap();
        // 66% failure rate -> +30, no new-sender caution.
        assert!(result.score >= 30);
        assert!(result.warnings.iter().any(|w| w.contains("flagged history")));
    }

    #[test]
    fn test_new_sender_gets_small_caution() {
        let (service, _db) = service();
        let result = service
            .check(&message("never@seen.com", "Hi", "ordinary text"))
            .unwrap();
        assert!(result.warnings.iter().any(|w| w.contains("First message")));
    }

    #[test]
    fn test_attachment_verdicts() {
        let (service, _db) = service();
        let attach = |name: &str, size: u64| MessageAttachment {
            filename: name.to_string(),
            mime_type: "application/octet-stream".to_string(),
            size,
            is_inline: false,
            content: Vec::new(),
        };

        let (verdict, level, _) = service.scan_attachment(&attach("setup.exe", 100));
        assert_eq!(verdict, AttachmentVerdict::Block);
        assert_eq!(level, RiskLevel::Critical);

        // Final extension is blocked outright, so the stricter verdict wins.
        let (verdict, level, _) = service.scan_attachment(&attach("invoice.pdf.exe", 100));
        assert_eq!(verdict, AttachmentVerdict::Block);
        assert_eq!(level, RiskLevel::Critical);

        // Disguise with a final extension that is not on the blocked list.
        let (verdict, level, _) = service.scan_attachment(&attach("payload.pdf.js", 100));
        assert_eq!(verdict, AttachmentVerdict::Block);
        assert_eq!(level, RiskLevel::High);

        let (verdict, level, _) = service.scan_attachment(&attach("archive.zip", 100));
        assert_eq!(verdict, AttachmentVerdict::Quarantine);
        assert_eq!(level, RiskLevel::Medium);

        let (verdict, _, _) = service.scan_attachment(&attach("report.pdf", 100));
        assert_eq!(verdict, AttachmentVerdict::Allow);

        let (verdict, level, _) =
            service.scan_attachment(&attach("report.pdf", 100 * 1024 * 1024));
        assert_eq!(verdict, AttachmentVerdict::Block);
        assert_eq!(level, RiskLevel::High);
    }

    #[test]
    fn test_secure_flag_independent_of_risk_level() {
        let config = SecurityConfig {
            spam_threshold: 40,
            ..Default::default()
        };
        let (service, _db) = service_with(config);
        let result = service
            .check(&message(
                "x@unknown.com",
                "Claim your prize",
                "you have won, claim your reward",
            ))
            .unwrap();
        // Above the (lowered) spam threshold but only MEDIUM risk.
        assert!(!result.is_secure);
        assert!(result.risk_level <= RiskLevel::High);
    }

    #[test]
    fn test_sanitized_body() {
        let (service, _db) = service();
        let result = service
            .check(&message(
                "x@unknown.com",
                "Hi",
                "hello <script>evil()</script> click javascript:run()",
            ))
            .unwrap();
        assert!(!result.sanitized_body.contains("<script>"));
        assert!(!result.sanitized_body.contains("javascript:"));
    }

    #[test]
    fn test_every_check_is_logged() {
        let (service, db) = service();
        service
            .check(&message("x@unknown.com", "Hi", "body"))
            .unwrap();
        let events =
            crate::db::audit_repo::query_security_by_sender(&db, "x@unknown.com", 10).unwrap();
        assert_eq!(events.len(), 1);
    }
}
