use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::error::{ErrorContext, TagResult, TaggedError};
use crate::ports::KeyValueStore;
use crate::safety::{self, PatternError};

pub const OPTIONS_KEY: &str = "formatOptions";
pub const DEFAULT_TEMPLATE: &str = "{{quote}}\n>\n> [{{title}}]({{url}})";
pub const MAX_RULES: usize = 100;
pub const MAX_TEMPLATE_LENGTH: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplacementRule {
    pub pattern: String,

    #[serde(default)]
    pub replacement: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ReplacementRule {
    pub fn new(pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            replacement: replacement.into(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FormatOptions {
    #[serde(default = "default_template")]
    pub template: String,

    #[serde(default)]
    pub rules: Vec<ReplacementRule>,

    #[serde(default = "default_enabled")]
    pub rules_enabled: bool,
}

fn default_template() -> String {
    DEFAULT_TEMPLATE.to_string()
}

fn default_enabled() -> bool {
    true
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            template: default_template(),
            rules: Vec::new(),
            rules_enabled: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("options payload is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("template is empty")]
    EmptyTemplate,
    #[error("template is {0} characters long (limit {MAX_TEMPLATE_LENGTH})")]
    TemplateTooLong(usize),
    #[error("{0} rules configured (limit {MAX_RULES})")]
    TooManyRules(usize),
    #[error("rule {index}: {source}")]
    Rule {
        index: usize,
        #[source]
        source: PatternError,
    },
}

impl FormatOptions {
    /// Parses and validates an options payload arriving from outside the
    /// options surface. Unknown fields are ignored; every rule pattern must
    /// pass the safety gate, enabled or not.
    pub fn from_payload(payload: Value) -> Result<Self, OptionsError> {
        let options: FormatOptions = serde_json::from_value(payload)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.template.trim().is_empty() {
            return Err(OptionsError::EmptyTemplate);
        }
        let template_len = self.template.chars().count();
        if template_len > MAX_TEMPLATE_LENGTH {
            return Err(OptionsError::TemplateTooLong(template_len));
        }
        if self.rules.len() > MAX_RULES {
            return Err(OptionsError::TooManyRules(self.rules.len()));
        }

        for (index, rule) in self.rules.iter().enumerate() {
            let mut failure = None;
            if safety::compile(&rule.pattern, |err| failure = Some(err)).is_none() {
                let source = failure.unwrap_or(PatternError::Empty);
                return Err(OptionsError::Rule { index, source });
            }
        }

        Ok(())
    }

    /// Enabled rules in order, each with its position in `rules`.
    pub fn active_rules(&self) -> impl Iterator<Item = (usize, &ReplacementRule)> {
        self.rules
            .iter()
            .enumerate()
            .filter(move |(_, rule)| self.rules_enabled && rule.enabled)
    }
}

/// Read-through access to the persisted [`FormatOptions`].
#[derive(Clone)]
pub struct OptionsStore {
    store: Arc<dyn KeyValueStore>,
}

impl OptionsStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Missing options resolve to defaults. Stored options that fail to
    /// deserialize are an error; rule patterns are not checked here because
    /// the formatter re-validates each one at use.
    pub async fn load(&self) -> Result<FormatOptions, TaggedError> {
        let value = self
            .store
            .get(OPTIONS_KEY)
            .await
            .tag(ErrorContext::LoadOptions)?;

        match value {
            Some(value) => serde_json::from_value(value).tag(ErrorContext::LoadOptions),
            None => {
                debug!("No stored format options; using defaults");
                Ok(FormatOptions::default())
            }
        }
    }

    pub async fn save(&self, options: &FormatOptions) -> Result<(), TaggedError> {
        let value = serde_json::to_value(options).tag(ErrorContext::SaveOptions)?;
        self.store
            .set(OPTIONS_KEY, value)
            .await
            .tag(ErrorContext::SaveOptions)?;
        info!(
            "Saved format options ({} rules, rules {})",
            options.rules.len(),
            if options.rules_enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }
}
