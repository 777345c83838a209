use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Path to the SQLite database. Defaults to the platform data dir.
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default)]
    pub parser: ParserConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub mapping: MappingConfig,
    #[serde(default)]
    pub threading: ThreadingConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub manager: ManagerConfig,
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

/// Settings for structured-data extraction from inbound messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserConfig {
    /// Subject prefixes that mark a reply, matched case-insensitively.
    #[serde(default = "default_reply_prefixes")]
    pub reply_prefixes: Vec<String>,
    /// Subject prefixes that mark a forward.
    #[serde(default = "default_forward_prefixes")]
    pub forward_prefixes: Vec<String>,
    /// Ticket-number patterns, tried in order. The first capture group
    /// must yield the ticket number.
    #[serde(default = "default_ticket_patterns")]
    pub ticket_patterns: Vec<String>,
    /// Prefixes like "bug:" stripped from subjects during cleaning.
    #[serde(default = "default_ticket_type_prefixes")]
    pub ticket_type_prefixes: Vec<String>,
    #[serde(default = "default_max_description_length")]
    pub max_description_length: usize,
    #[serde(default)]
    pub priority_keywords: PriorityKeywords,
    /// Category rules, first match wins.
    #[serde(default = "default_categories")]
    pub categories: Vec<CategoryKeywords>,
    /// Custom field extraction patterns. Each pattern needs one capture group.
    #[serde(default = "default_custom_fields")]
    pub custom_fields: Vec<CustomFieldPattern>,
    #[serde(default)]
    pub attachments: AttachmentPolicy,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            reply_prefixes: default_reply_prefixes(),
            forward_prefixes: default_forward_prefixes(),
            ticket_patterns: default_ticket_patterns(),
            ticket_type_prefixes: default_ticket_type_prefixes(),
            max_description_length: default_max_description_length(),
            priority_keywords: PriorityKeywords::default(),
            categories: default_categories(),
            custom_fields: default_custom_fields(),
            attachments: AttachmentPolicy::default(),
        }
    }
}

fn default_reply_prefixes() -> Vec<String> {
    vec!["re:".into(), "aw:".into(), "antw:".into(), "sv:".into()]
}

fn default_forward_prefixes() -> Vec<String> {
    vec!["fwd:".into(), "fw:".into(), "wg:".into()]
}

fn default_ticket_patterns() -> Vec<String> {
    vec![
        r"\[#?([A-Z0-9]{2,6}-\d{4}-\d{3,6})\]".into(),
        r"\b([A-Z0-9]{2,6}-\d{4}-\d{3,6})\b".into(),
        r"(?i)ticket\s*#\s*([A-Z0-9-]{4,})".into(),
    ]
}

fn default_ticket_type_prefixes() -> Vec<String> {
    vec![
        "bug:".into(),
        "issue:".into(),
        "support:".into(),
        "request:".into(),
        "help:".into(),
    ]
}

fn default_max_description_length() -> usize {
    5000
}

/// Keyword lists scanned in priority order: critical, high, medium, low.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityKeywords {
    #[serde(default = "default_critical_keywords")]
    pub critical: Vec<String>,
    #[serde(default = "default_high_keywords")]
    pub high: Vec<String>,
    #[serde(default = "default_medium_keywords")]
    pub medium: Vec<String>,
    #[serde(default = "default_low_keywords")]
    pub low: Vec<String>,
}

impl Default for PriorityKeywords {
    fn default() -> Self {
        Self {
            critical: default_critical_keywords(),
            high: default_high_keywords(),
            medium: default_medium_keywords(),
            low: default_low_keywords(),
        }
    }
}

fn default_critical_keywords() -> Vec<String> {
    vec![
        "urgent".into(),
        "critical".into(),
        "emergency".into(),
        "outage".into(),
        "down".into(),
        "data loss".into(),
    ]
}

fn default_high_keywords() -> Vec<String> {
    vec![
        "important".into(),
        "asap".into(),
        "high priority".into(),
        "blocked".into(),
        "broken".into(),
    ]
}

fn default_medium_keywords() -> Vec<String> {
    vec!["question".into(), "issue".into(), "problem".into()]
}

fn default_low_keywords() -> Vec<String> {
    vec![
        "minor".into(),
        "whenever".into(),
        "low priority".into(),
        "suggestion".into(),
        "feature request".into(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryKeywords {
    pub category: String,
    pub keywords: Vec<String>,
}

fn default_categories() -> Vec<CategoryKeywords> {
    vec![
        CategoryKeywords {
            category: "billing".into(),
            keywords: vec![
                "invoice".into(),
                "payment".into(),
                "billing".into(),
                "refund".into(),
            ],
        },
        CategoryKeywords {
            category: "bug".into(),
            keywords: vec![
                "bug".into(),
                "error".into(),
                "crash".into(),
                "broken".into(),
            ],
        },
        CategoryKeywords {
            category: "account".into(),
            keywords: vec![
                "login".into(),
                "password".into(),
                "account".into(),
                "access".into(),
            ],
        },
        CategoryKeywords {
            category: "feature".into(),
            keywords: vec!["feature".into(), "enhancement".into(), "request".into()],
        },
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomFieldPattern {
    pub name: String,
    pub pattern: String,
}

fn default_custom_fields() -> Vec<CustomFieldPattern> {
    vec![
        CustomFieldPattern {
            name: "phone".into(),
            pattern: r"(?i)(?:phone|tel)[:\s]+(\+?[\d\s().-]{7,20})".into(),
        },
        CustomFieldPattern {
            name: "order_number".into(),
            pattern: r"(?i)order\s*(?:no\.?|number|#)[:\s]*([A-Z0-9-]{4,20})".into(),
        },
        CustomFieldPattern {
            name: "product_version".into(),
            pattern: r"(?i)version[:\s]+(\d+(?:\.\d+){1,3})".into(),
        },
    ]
}

/// Which attachments the parser keeps on a ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentPolicy {
    #[serde(default = "default_parser_attachment_size")]
    pub max_size_bytes: u64,
    /// MIME type allow-list. Supports wildcards like "image/*".
    #[serde(default = "default_allowed_types")]
    pub allowed_types: Vec<String>,
    /// Glob patterns for filenames that are never kept.
    #[serde(default = "default_blocked_filename_patterns")]
    pub blocked_filename_patterns: Vec<String>,
}

impl Default for AttachmentPolicy {
    fn default() -> Self {
        Self {
            max_size_bytes: default_parser_attachment_size(),
            allowed_types: default_allowed_types(),
            blocked_filename_patterns: default_blocked_filename_patterns(),
        }
    }
}

fn default_parser_attachment_size() -> u64 {
    10 * 1024 * 1024
}

fn default_allowed_types() -> Vec<String> {
    vec![
        "image/*".into(),
        "text/*".into(),
        "application/pdf".into(),
        "application/json".into(),
        "application/zip".into(),
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document".into(),
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet".into(),
    ]
}

fn default_blocked_filename_patterns() -> Vec<String> {
    vec![
        "*.exe".into(),
        "*.scr".into(),
        "*.bat".into(),
        "*.cmd".into(),
        "*.vbs".into(),
        "*.ps1".into(),
        "*.jar".into(),
        "*.msi".into(),
    ]
}

/// Risk scoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// A total score at or above this is a spam verdict and makes the
    /// message insecure. Independent of the workflow block threshold.
    #[serde(default = "default_spam_threshold")]
    pub spam_threshold: u32,
    #[serde(default)]
    pub blacklisted_senders: Vec<String>,
    #[serde(default)]
    pub blacklisted_domains: Vec<String>,
    #[serde(default)]
    pub whitelisted_senders: Vec<String>,
    #[serde(default)]
    pub whitelisted_domains: Vec<String>,
    /// Regexes scored against subject + body (+15 each).
    #[serde(default = "default_suspicious_patterns")]
    pub suspicious_patterns: Vec<String>,
    /// Regexes scored against the subject only (+10 each).
    #[serde(default = "default_suspicious_subject_patterns")]
    pub suspicious_subject_patterns: Vec<String>,
    /// URL patterns treated as malicious (+30 each, threat).
    #[serde(default = "default_malicious_url_patterns")]
    pub malicious_url_patterns: Vec<String>,
    /// Known URL-shortener domains (+15 each, warning).
    #[serde(default = "default_shortener_domains")]
    pub shortener_domains: Vec<String>,
    /// Days of sender history consulted for reputation.
    #[serde(default = "default_history_days")]
    pub history_days: u32,
    #[serde(default)]
    pub attachments: SecurityAttachmentPolicy,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            spam_threshold: default_spam_threshold(),
            blacklisted_senders: Vec::new(),
            blacklisted_domains: Vec::new(),
            whitelisted_senders: Vec::new(),
            whitelisted_domains: Vec::new(),
            suspicious_patterns: default_suspicious_patterns(),
            suspicious_subject_patterns: default_suspicious_subject_patterns(),
            malicious_url_patterns: default_malicious_url_patterns(),
            shortener_domains: default_shortener_domains(),
            history_days: default_history_days(),
            attachments: SecurityAttachmentPolicy::default(),
        }
    }
}

fn default_spam_threshold() -> u32 {
    75
}

fn default_suspicious_patterns() -> Vec<String> {
    vec![
        r"(?i)you\s+have\s+won".into(),
        r"(?i)claim\s+your\s+(?:prize|reward)".into(),
        r"(?i)nigerian\s+prince".into(),
        r"(?i)wire\s+transfer\s+urgent".into(),
        r"(?i)verify\s+your\s+account\s+immediately".into(),
        r"(?i)click\s+here\s+now".into(),
        r"\$\s?\d{1,3}(?:,\d{3})+(?:\.\d{2})?".into(),
    ]
}

fn default_suspicious_subject_patterns() -> Vec<String> {
    vec![
        r"(?i)^(?:free|winner|congratulations)\b".into(),
        r"(?i)act\s+now".into(),
        r"(?i)limited\s+time\s+offer".into(),
    ]
}

fn default_malicious_url_patterns() -> Vec<String> {
    vec![
        r"(?i)https?://[^\s]*(?:phish|malware|credential)".into(),
        r"(?i)https?://\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}".into(),
        r"(?i)https?://[^\s]*\.(?:tk|ml|ga|cf|gq)(?:/|\s|$)".into(),
    ]
}

fn default_shortener_domains() -> Vec<String> {
    vec![
        "bit.ly".into(),
        "tinyurl.com".into(),
        "t.co".into(),
        "goo.gl".into(),
        "is.gd".into(),
        "ow.ly".into(),
    ]
}

fn default_history_days() -> u32 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityAttachmentPolicy {
    #[serde(default = "default_security_attachment_size")]
    pub max_size_bytes: u64,
    /// Extensions blocked outright (CRITICAL).
    #[serde(default = "default_blocked_extensions")]
    pub blocked_extensions: Vec<String>,
    /// Extensions held for review (MEDIUM, quarantine).
    #[serde(default = "default_quarantine_extensions")]
    pub quarantine_extensions: Vec<String>,
}

impl Default for SecurityAttachmentPolicy {
    fn default() -> Self {
        Self {
            max_size_bytes: default_security_attachment_size(),
            blocked_extensions: default_blocked_extensions(),
            quarantine_extensions: default_quarantine_extensions(),
        }
    }
}

fn default_security_attachment_size() -> u64 {
    25 * 1024 * 1024
}

fn default_blocked_extensions() -> Vec<String> {
    vec![
        "exe".into(),
        "scr".into(),
        "bat".into(),
        "cmd".into(),
        "com".into(),
        "pif".into(),
        "vbs".into(),
        "jar".into(),
        "msi".into(),
        "dll".into(),
    ]
}

fn default_quarantine_extensions() -> Vec<String> {
    vec![
        "zip".into(),
        "rar".into(),
        "7z".into(),
        "docm".into(),
        "xlsm".into(),
        "iso".into(),
    ]
}

/// Account resolution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingConfig {
    /// Sender domains that never map to an account (consumer mail, etc.).
    #[serde(default)]
    pub ignored_domains: Vec<String>,
    /// Custom rules evaluated by descending priority before domain matching.
    #[serde(default)]
    pub rules: Vec<MappingRule>,
    /// How many labels may be dropped while walking up a domain.
    #[serde(default = "default_max_hierarchy_depth")]
    pub max_hierarchy_depth: u32,
    /// When a parent ORGANIZATION is found for a subdomain, create a
    /// SUBSIDIARY account for the subdomain instead of mapping directly.
    #[serde(default)]
    pub create_subsidiaries: bool,
    #[serde(default)]
    pub default_account_id: Option<String>,
    /// Auto-create an account named after an unknown sender domain.
    #[serde(default)]
    pub auto_create_accounts: bool,
    #[serde(default = "default_mapping_cache_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_member_role")]
    pub default_member_role: String,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            ignored_domains: Vec::new(),
            rules: Vec::new(),
            max_hierarchy_depth: default_max_hierarchy_depth(),
            create_subsidiaries: false,
            default_account_id: None,
            auto_create_accounts: false,
            cache_ttl_secs: default_mapping_cache_ttl(),
            default_member_role: default_member_role(),
        }
    }
}

fn default_max_hierarchy_depth() -> u32 {
    3
}

fn default_mapping_cache_ttl() -> u64 {
    300
}

fn default_member_role() -> String {
    "Account User".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingRule {
    pub id: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(rename = "match")]
    pub condition: RuleCondition,
    pub account_id: String,
}

/// One condition per rule. Exactly one field must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleCondition {
    #[serde(default)]
    pub sender_domain: Option<String>,
    #[serde(default)]
    pub sender_email: Option<String>,
    #[serde(default)]
    pub subject_contains: Option<String>,
    #[serde(default)]
    pub body_contains: Option<String>,
}

impl RuleCondition {
    pub fn field_count(&self) -> usize {
        [
            self.sender_domain.is_some(),
            self.sender_email.is_some(),
            self.subject_contains.is_some(),
            self.body_contains.is_some(),
        ]
        .iter()
        .filter(|b| **b)
        .count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadingConfig {
    /// Window for subject-based thread matching.
    #[serde(default = "default_subject_window_hours")]
    pub subject_window_hours: u32,
    #[serde(default = "default_thread_cache_ttl")]
    pub cache_ttl_secs: u64,
    /// Depth bound for the reply tree.
    #[serde(default = "default_max_thread_depth")]
    pub max_depth: u32,
}

impl Default for ThreadingConfig {
    fn default() -> Self {
        Self {
            subject_window_hours: default_subject_window_hours(),
            cache_ttl_secs: default_thread_cache_ttl(),
            max_depth: default_max_thread_depth(),
        }
    }
}

fn default_subject_window_hours() -> u32 {
    24
}

fn default_thread_cache_ttl() -> u64 {
    1800
}

fn default_max_thread_depth() -> u32 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Risk score at or above this rejects the message outright.
    #[serde(default = "default_block_threshold")]
    pub block_threshold: u32,
    /// Risk score at or above this (but below block) flags the ticket
    /// for review. Must not exceed `block_threshold`.
    #[serde(default = "default_quarantine_threshold")]
    pub quarantine_threshold: u32,
    #[serde(default = "default_minimum_confidence")]
    pub minimum_confidence: u32,
    #[serde(default)]
    pub allow_duplicates: bool,
    #[serde(default = "default_duplicate_window_hours")]
    pub duplicate_window_hours: u32,
    #[serde(default)]
    pub skip_permission_check: bool,
    /// Run every gate but persist nothing.
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_system_actor")]
    pub system_actor: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            block_threshold: default_block_threshold(),
            quarantine_threshold: default_quarantine_threshold(),
            minimum_confidence: default_minimum_confidence(),
            allow_duplicates: false,
            duplicate_window_hours: default_duplicate_window_hours(),
            skip_permission_check: false,
            dry_run: false,
            system_actor: default_system_actor(),
        }
    }
}

fn default_block_threshold() -> u32 {
    80
}

fn default_quarantine_threshold() -> u32 {
    60
}

fn default_minimum_confidence() -> u32 {
    40
}

fn default_duplicate_window_hours() -> u32 {
    24
}

fn default_system_actor() -> String {
    "mailtriage".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_retry_delay")]
    pub base_retry_delay_secs: u64,
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_secs: u64,
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,
    /// Fallback poll interval when no submission notification arrives.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// PENDING + PROCESSING jobs above this fail fast on submit.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: u64,
    #[serde(default = "default_stalled_check_interval")]
    pub stalled_check_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_retry_delay_secs: default_base_retry_delay(),
            max_retry_delay_secs: default_max_retry_delay(),
            job_timeout_secs: default_job_timeout(),
            poll_interval_secs: default_poll_interval(),
            max_queue_size: default_max_queue_size(),
            stalled_check_interval_secs: default_stalled_check_interval(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_retry_delay() -> u64 {
    60
}

fn default_max_retry_delay() -> u64 {
    3600
}

fn default_job_timeout() -> u64 {
    300
}

fn default_poll_interval() -> u64 {
    5
}

fn default_max_queue_size() -> u64 {
    1000
}

fn default_stalled_check_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_audit_retention")]
    pub audit_days: u32,
    #[serde(default = "default_thread_retention")]
    pub thread_days: u32,
    #[serde(default = "default_job_retention")]
    pub job_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            audit_days: default_audit_retention(),
            thread_days: default_thread_retention(),
            job_days: default_job_retention(),
        }
    }
}

fn default_audit_retention() -> u32 {
    90
}

fn default_thread_retention() -> u32 {
    180
}

fn default_job_retention() -> u32 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    #[serde(default = "default_provider_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_token_refresh_interval")]
    pub token_refresh_interval_secs: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    /// Pending-job count past which the health check warns.
    #[serde(default = "default_queue_warn_pending")]
    pub queue_warn_pending: u64,
    /// Job success rate below which the health check warns.
    #[serde(default = "default_min_success_rate")]
    pub min_success_rate: f64,
    #[serde(default = "default_fetch_batch_size")]
    pub fetch_batch_size: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_provider_poll_interval(),
            health_check_interval_secs: default_health_interval(),
            token_refresh_interval_secs: default_token_refresh_interval(),
            cleanup_interval_secs: default_cleanup_interval(),
            queue_warn_pending: default_queue_warn_pending(),
            min_success_rate: default_min_success_rate(),
            fetch_batch_size: default_fetch_batch_size(),
        }
    }
}

fn default_provider_poll_interval() -> u64 {
    300
}

fn default_health_interval() -> u64 {
    60
}

fn default_token_refresh_interval() -> u64 {
    1800
}

fn default_cleanup_interval() -> u64 {
    86_400
}

fn default_queue_warn_pending() -> u64 {
    500
}

fn default_min_success_rate() -> f64 {
    0.8
}

fn default_fetch_batch_size() -> usize {
    50
}
