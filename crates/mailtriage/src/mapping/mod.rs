//! Account resolution for inbound messages.
//!
//! Resolves which organizational account owns a message, in order:
//! ignored-domain short-circuit, custom rules, domain matching,
//! hierarchy walk, configured fallback. Per-domain candidate lists are
//! cached with a short TTL.

use chrono::Utc;
use log::{debug, warn};
use moka::sync::Cache;

use crate::config::schema::{MappingConfig, MappingRule};
use crate::db::account_repo::{self, AccountRow, MembershipRow, UserRow};
use crate::db::{Database, DatabaseError};
use crate::provider::InboundMessage;
use crate::sanitize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingMethod {
    DomainMatch,
    HierarchyRule,
    ManualAssignment,
    FallbackDefault,
}

impl MappingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingMethod::DomainMatch => "DOMAIN_MATCH",
            MappingMethod::HierarchyRule => "HIERARCHY_RULE",
            MappingMethod::ManualAssignment => "MANUAL_ASSIGNMENT",
            MappingMethod::FallbackDefault => "FALLBACK_DEFAULT",
        }
    }
}

/// A resolved account for one message.
#[derive(Debug, Clone)]
pub struct AccountMapping {
    pub account_id: String,
    pub account_name: String,
    /// Membership of the sender within the account, when provisioned.
    pub member_id: Option<String>,
    pub method: MappingMethod,
    pub confidence: u32,
    pub reason: String,
}

pub struct AccountMappingService {
    config: MappingConfig,
    db: Database,
    /// Candidate accounts per sender domain.
    domain_cache: Cache<String, Vec<AccountRow>>,
}

impl AccountMappingService {
    pub fn new(config: &MappingConfig, db: Database) -> Self {
        let domain_cache = Cache::builder()
            .time_to_live(std::time::Duration::from_secs(config.cache_ttl_secs))
            .max_capacity(10_000)
            .build();
        Self {
            config: config.clone(),
            db,
            domain_cache,
        }
    }

    /// Drops all cached domain lookups. Must be called whenever the
    /// account directory or mapping configuration changes.
    pub fn invalidate_cache(&self) {
        self.domain_cache.invalidate_all();
    }

    /// Resolves the owning account for a message, or None when nothing
    /// matches and no fallback is configured. May provision the sender's
    /// membership and create accounts (subsidiary spawn, auto-create).
    pub fn map(&self, message: &InboundMessage) -> Result<Option<AccountMapping>, DatabaseError> {
        self.resolve(message, true)
    }

    /// Read-only resolution: reports whether `map` would find an account
    /// without provisioning users, memberships or accounts. Used by the
    /// workflow's dry-run mode.
    pub fn preview(
        &self,
        message: &InboundMessage,
    ) -> Result<Option<AccountMapping>, DatabaseError> {
        self.resolve(message, false)
    }

    fn resolve(
        &self,
        message: &InboundMessage,
        persist: bool,
    ) -> Result<Option<AccountMapping>, DatabaseError> {
        let sender = message.sender.to_lowercase();
        let domain = match sender.split('@').nth(1) {
            Some(d) if !d.is_empty() => d.to_string(),
            _ => return Ok(None),
        };

        if self
            .config
            .ignored_domains
            .iter()
            .any(|d| d.eq_ignore_ascii_case(&domain))
        {
            debug!("Domain {} is ignored, using fallback", domain);
            return self.map_fallback(&sender, message, &domain, persist);
        }

        if let Some(mapping) = self.match_rules(&sender, &domain, message, persist)? {
            return Ok(Some(mapping));
        }

        if let Some(mapping) = self.match_domain(&sender, message, &domain, persist)? {
            return Ok(Some(mapping));
        }

        if let Some(mapping) = self.match_hierarchy(&sender, message, &domain, persist)? {
            return Ok(Some(mapping));
        }

        self.map_fallback(&sender, message, &domain, persist)
    }

    /// Custom rules by descending priority, first matching condition wins.
    fn match_rules(
        &self,
        sender: &str,
        domain: &str,
        message: &InboundMessage,
        persist: bool,
    ) -> Result<Option<AccountMapping>, DatabaseError> {
        let mut rules: Vec<&MappingRule> = self.config.rules.iter().collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));

        for rule in rules {
            if !rule_matches(rule, sender, domain, message) {
                continue;
            }
            let account = match account_repo::find_by_id(&self.db, &rule.account_id)? {
                Some(a) if a.is_active => a,
                _ => {
                    warn!(
                        "Mapping rule '{}' points at missing or inactive account {}",
                        rule.id, rule.account_id
                    );
                    continue;
                }
            };
            let member_id =
                self.ensure_member_if(persist, &account.id, sender, message.sender_name.as_deref())?;
            return Ok(Some(AccountMapping {
                account_id: account.id,
                account_name: account.name,
                member_id,
                method: MappingMethod::ManualAssignment,
                confidence: 95,
                reason: format!("Matched rule '{}'", rule.id),
            }));
        }
        Ok(None)
    }

    fn match_domain(
        &self,
        sender: &str,
        message: &InboundMessage,
        domain: &str,
        persist: bool,
    ) -> Result<Option<AccountMapping>, DatabaseError> {
        let candidates = self.candidates_for(domain)?;
        if candidates.is_empty() {
            return Ok(None);
        }

        let exact: Vec<&AccountRow> = candidates
            .iter()
            .filter(|a| a.domains.iter().any(|d| d.eq_ignore_ascii_case(domain)))
            .collect();

        let (account, confidence, note) = if exact.len() == 1 {
            (exact[0], 90, "unique domain match")
        } else if exact.len() > 1 {
            match exact.iter().find(|a| a.account_type == "ORGANIZATION") {
                Some(org) => (*org, 85, "organization preferred among domain matches"),
                None => (exact[0], 70, "first of several domain matches"),
            }
        } else if candidates.len() == 1 {
            (&candidates[0], 85, "single partial domain match")
        } else {
            (&candidates[0], 70, "first of several partial matches")
        };

        let member_id =
            self.ensure_member_if(persist, &account.id, sender, message.sender_name.as_deref())?;
        Ok(Some(AccountMapping {
            account_id: account.id.clone(),
            account_name: account.name.clone(),
            member_id,
            method: MappingMethod::DomainMatch,
            confidence,
            reason: format!("Domain {}: {}", domain, note),
        }))
    }

    /// Walks up the domain labels looking for a parent account:
    /// mail.eu.acme.com -> eu.acme.com -> acme.com.
    fn match_hierarchy(
        &self,
        sender: &str,
        message: &InboundMessage,
        domain: &str,
        persist: bool,
    ) -> Result<Option<AccountMapping>, DatabaseError> {
        let mut parent = domain.to_string();
        for _ in 0..self.config.max_hierarchy_depth {
            parent = match parent.split_once('.') {
                // Stop at bare TLDs.
                Some((_, rest)) if rest.contains('.') => rest.to_string(),
                _ => return Ok(None),
            };

            let candidates = self.candidates_for(&parent)?;
            let account = candidates
                .iter()
                .find(|a| a.domains.iter().any(|d| d.eq_ignore_ascii_case(&parent)));
            let account = match account {
                Some(a) => a,
                None => continue,
            };

            // Read-only resolution reports the parent mapping instead of
            // spawning a subsidiary.
            if account.account_type == "ORGANIZATION" && self.config.create_subsidiaries && persist
            {
                let subsidiary = AccountRow {
                    id: uuid::Uuid::new_v4().to_string(),
                    name: domain.to_string(),
                    account_type: "SUBSIDIARY".to_string(),
                    parent_id: Some(account.id.clone()),
                    domains: vec![domain.to_string()],
                    is_active: true,
                    created_at: Utc::now().to_rfc3339(),
                };
                account_repo::insert(&self.db, &subsidiary)?;
                self.domain_cache.invalidate(domain);
                debug!(
                    "Created subsidiary {} under {} for domain {}",
                    subsidiary.id, account.id, domain
                );

                let member_id =
                    self.ensure_member(&subsidiary.id, sender, message.sender_name.as_deref())?;
                return Ok(Some(AccountMapping {
                    account_id: subsidiary.id,
                    account_name: subsidiary.name,
                    member_id,
                    method: MappingMethod::HierarchyRule,
                    confidence: 75,
                    reason: format!("Subsidiary of {} via parent domain {}", account.name, parent),
                }));
            }

            let member_id =
                self.ensure_member_if(persist, &account.id, sender, message.sender_name.as_deref())?;
            return Ok(Some(AccountMapping {
                account_id: account.id.clone(),
                account_name: account.name.clone(),
                member_id,
                method: MappingMethod::HierarchyRule,
                confidence: 60,
                reason: format!("Parent domain {} owns subdomain {}", parent, domain),
            }));
        }
        Ok(None)
    }

    fn map_fallback(
        &self,
        sender: &str,
        message: &InboundMessage,
        domain: &str,
        persist: bool,
    ) -> Result<Option<AccountMapping>, DatabaseError> {
        if let Some(default_id) = &self.config.default_account_id {
            if let Some(account) = account_repo::find_by_id(&self.db, default_id)? {
                let member_id = self.ensure_member_if(
                    persist,
                    &account.id,
                    sender,
                    message.sender_name.as_deref(),
                )?;
                return Ok(Some(AccountMapping {
                    account_id: account.id,
                    account_name: account.name,
                    member_id,
                    method: MappingMethod::FallbackDefault,
                    confidence: 30,
                    reason: "Configured default account".to_string(),
                }));
            }
            warn!("Default account {} not found", default_id);
        }

        if self.config.auto_create_accounts {
            let account = AccountRow {
                id: uuid::Uuid::new_v4().to_string(),
                name: domain.to_string(),
                account_type: "ORGANIZATION".to_string(),
                parent_id: None,
                domains: vec![domain.to_string()],
                is_active: true,
                created_at: Utc::now().to_rfc3339(),
            };
            if persist {
                account_repo::insert(&self.db, &account)?;
                self.domain_cache.invalidate(domain);
                debug!("Auto-created account {} for domain {}", account.id, domain);
            }

            let member_id =
                self.ensure_member_if(persist, &account.id, sender, message.sender_name.as_deref())?;
            return Ok(Some(AccountMapping {
                account_id: account.id,
                account_name: account.name,
                member_id,
                method: MappingMethod::FallbackDefault,
                confidence: 50,
                reason: format!("Auto-created account for domain {}", domain),
            }));
        }

        Ok(None)
    }

    /// Active accounts related to a domain (exact or partial match),
    /// read through the TTL cache.
    fn candidates_for(&self, domain: &str) -> Result<Vec<AccountRow>, DatabaseError> {
        if let Some(hit) = self.domain_cache.get(domain) {
            return Ok(hit);
        }
        let accounts = account_repo::list_active(&self.db)?;
        let candidates: Vec<AccountRow> = accounts
            .into_iter()
            .filter(|a| {
                a.domains.iter().any(|d| {
                    let d = d.to_lowercase();
                    // Exact, or the account lists a subdomain of the
                    // sender domain. Sender subdomains of an account
                    // domain are resolved by the hierarchy walk instead.
                    d == domain || d.ends_with(&format!(".{}", domain))
                })
            })
            .collect();
        self.domain_cache
            .insert(domain.to_string(), candidates.clone());
        Ok(candidates)
    }

    fn ensure_member_if(
        &self,
        persist: bool,
        account_id: &str,
        sender: &str,
        display_name: Option<&str>,
    ) -> Result<Option<String>, DatabaseError> {
        if !persist {
            return Ok(None);
        }
        self.ensure_member(account_id, sender, display_name)
    }

    /// Provisions a User + verified AccountMembership for the sender.
    /// Role assignment failure is non-fatal.
    fn ensure_member(
        &self,
        account_id: &str,
        sender: &str,
        display_name: Option<&str>,
    ) -> Result<Option<String>, DatabaseError> {
        let now = Utc::now().to_rfc3339();

        let user = match account_repo::find_user_by_email(&self.db, sender)? {
            Some(user) => user,
            None => {
                let user = UserRow {
                    id: uuid::Uuid::new_v4().to_string(),
                    email: sender.to_string(),
                    display_name: display_name.map(|n| n.to_string()),
                    created_at: now.clone(),
                };
                account_repo::insert_user(&self.db, &user)?;
                user
            }
        };

        if let Some(existing) = account_repo::find_membership(&self.db, account_id, &user.id)? {
            return Ok(Some(existing.id));
        }

        let membership = MembershipRow {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            user_id: user.id,
            role: Some(self.config.default_member_role.clone()),
            verified: true,
            created_at: now,
        };
        match account_repo::insert_membership(&self.db, &membership) {
            Ok(()) => Ok(Some(membership.id)),
            Err(e) => {
                warn!(
                    "Failed to create membership for {}: {}",
                    sanitize::redact_email(sender),
                    e
                );
                Ok(None)
            }
        }
    }
}

fn rule_matches(rule: &MappingRule, sender: &str, domain: &str, message: &InboundMessage) -> bool {
    let condition = &rule.condition;
    if let Some(d) = &condition.sender_domain {
        return d.eq_ignore_ascii_case(domain);
    }
    if let Some(e) = &condition.sender_email {
        return e.eq_ignore_ascii_case(sender);
    }
    if let Some(s) = &condition.subject_contains {
        return message.subject.to_lowercase().contains(&s.to_lowercase());
    }
    if let Some(b) = &condition.body_contains {
        return message.body().to_lowercase().contains(&b.to_lowercase());
    }
    false
}
