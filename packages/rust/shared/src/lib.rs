//! Shared types, error model, and configuration for amlflow.
//!
//! This crate is the foundation depended on by all other amlflow crates.
//! It provides:
//! - [`AmlFlowError`], the unified error type
//! - Domain types ([`TransactionId`], [`EntityKey`], [`EnrichmentResult`], [`RiskAssessment`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, GraphConfig, NotifyConfig, ProvidersConfig, ReasoningConfig,
    config_dir, config_file_path, expand_home, init_config, load_config, load_config_from,
    reasoning_api_keys, validate_api_key,
};
pub use error::{AmlFlowError, Result};
pub use types::{
    CURRENT_LAYOUT_VERSION, DEGRADED_RISK_SCORE, EnrichmentResult, EnrichmentStatus, Entity,
    EntityKey, EntityKind, ExtractedEntities, Organization, Person, RiskAssessment, RunMetadata,
    TransactionId, TransactionState, entity_types,
};
