//! Configuration Module
//! 
//! Handles settings loading and validation, and the forwarding rule file.

pub mod manager;
pub mod rules;
pub mod types;

pub use manager::{CliOverrides, ConfigManager};
pub use rules::{load_rules, parse_rules, ForwardRule, ParsedRules, RejectedLine, ResolvedRule};
pub use types::*;
