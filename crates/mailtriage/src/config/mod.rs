pub mod loader;
pub mod schema;

pub use loader::{load_config, load_config_from_str};
pub use schema::{
    AttachmentPolicy, CategoryKeywords, Config, CustomFieldPattern, ManagerConfig, MappingConfig,
    MappingRule, ParserConfig, PriorityKeywords, QueueConfig, RetentionConfig, RuleCondition,
    SecurityAttachmentPolicy, SecurityConfig, ThreadingConfig, WorkflowConfig,
};
