//! Transaction options and the metadata that governs them.
//!
//! Options are plain key/value pairs attached to a transaction when it is
//! opened. What a key *means* (its type, default, and whether nested
//! transactions inherit it) is described by an [`OptionDescriptor`] held in
//! the coordinator's [`OptionRegistry`].

use std::collections::BTreeMap;

use ahash::AHashMap as HashMap;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, StrandError};

/// Keys of the options every registry knows about.
pub mod keys {
    /// Skip trigger hooks at commit.
    pub const NO_TRIGGERS: &str = "no_triggers";
    /// Ignore failure statuses reported by pre-commit hooks.
    pub const NO_VALIDATION: &str = "no_validation";
    /// Keep the committed changes out of the undo history.
    pub const NO_UNDO: &str = "no_undo";
    /// Do not dispatch post-commit events.
    pub const NO_NOTIFICATIONS: &str = "no_notifications";
    /// Marks a transaction replaying the undo history.
    pub const UNDO_REDO: &str = "undo_redo";
    /// Marks a transaction executing trigger commands.
    pub const TRIGGER: &str = "trigger";
    /// Human-readable name, used in log output.
    pub const LABEL: &str = "label";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Text(String),
    /// Presence-only marker.
    Tag,
}

impl OptionValue {
    pub fn kind(&self) -> OptionKind {
        match self {
            OptionValue::Bool(_) => OptionKind::Bool,
            OptionValue::Int(_) => OptionKind::Int,
            OptionValue::Text(_) => OptionKind::Text,
            OptionValue::Tag => OptionKind::Tag,
        }
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        OptionValue::Bool(value)
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        OptionValue::Int(value)
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::Text(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        OptionValue::Text(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Bool,
    Int,
    Text,
    Tag,
}

pub type Equivalence = fn(&OptionValue, &OptionValue) -> bool;

fn equal(a: &OptionValue, b: &OptionValue) -> bool {
    a == b
}

/// Describes one option key.
#[derive(Debug, Clone)]
pub struct OptionDescriptor {
    key: String,
    kind: OptionKind,
    default: OptionValue,
    hereditary: bool,
    equivalence: Equivalence,
}

impl OptionDescriptor {
    pub fn new(key: impl Into<String>, default: OptionValue, hereditary: bool) -> Self {
        Self {
            key: key.into(),
            kind: default.kind(),
            default,
            hereditary,
            equivalence: equal,
        }
    }

    /// A boolean option that defaults to `false`.
    pub fn flag(key: impl Into<String>, hereditary: bool) -> Self {
        Self::new(key, OptionValue::Bool(false), hereditary)
    }

    pub fn tag(key: impl Into<String>, hereditary: bool) -> Self {
        Self::new(key, OptionValue::Tag, hereditary)
    }

    /// Replaces plain equality when deciding whether a value differs from
    /// the default.
    pub fn with_equivalence(mut self, equivalence: Equivalence) -> Self {
        self.equivalence = equivalence;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn kind(&self) -> OptionKind {
        self.kind
    }

    pub fn default_value(&self) -> &OptionValue {
        &self.default
    }

    pub fn is_hereditary(&self) -> bool {
        self.hereditary
    }

    pub fn is_tag(&self) -> bool {
        self.kind == OptionKind::Tag
    }

    pub fn is_default(&self, value: &OptionValue) -> bool {
        (self.equivalence)(value, &self.default)
    }
}

/// The set of option keys a coordinator understands.
#[derive(Debug, Clone)]
pub struct OptionRegistry {
    descriptors: HashMap<String, OptionDescriptor>,
}

impl Default for OptionRegistry {
    fn default() -> Self {
        let mut descriptors = HashMap::new();
        for descriptor in [
            OptionDescriptor::flag(keys::NO_TRIGGERS, true),
            OptionDescriptor::flag(keys::NO_VALIDATION, true),
            OptionDescriptor::flag(keys::NO_UNDO, true),
            OptionDescriptor::flag(keys::NO_NOTIFICATIONS, true),
            OptionDescriptor::tag(keys::UNDO_REDO, true),
            OptionDescriptor::tag(keys::TRIGGER, false),
            OptionDescriptor::new(keys::LABEL, OptionValue::Text(String::new()), false),
        ] {
            descriptors.insert(descriptor.key.clone(), descriptor);
        }
        Self { descriptors }
    }
}

impl OptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: OptionDescriptor) -> Result<()> {
        if self.descriptors.contains_key(descriptor.key()) {
            return Err(StrandError::InvalidArgument(format!(
                "option '{}' is already registered",
                descriptor.key()
            )));
        }
        self.descriptors.insert(descriptor.key.clone(), descriptor);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&OptionDescriptor> {
        self.descriptors.get(key)
    }

    pub fn is_hereditary(&self, key: &str) -> bool {
        self.get(key).is_some_and(OptionDescriptor::is_hereditary)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// The options a transaction was opened with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionOptions {
    values: BTreeMap<String, OptionValue>,
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Sets a boolean option to `true`.
    pub fn with_flag(self, key: impl Into<String>) -> Self {
        self.with(key, true)
    }

    pub fn with_tag(mut self, key: impl Into<String>) -> Self {
        self.values.insert(key.into(), OptionValue::Tag);
        self
    }

    pub fn with_label(self, label: impl Into<String>) -> Self {
        self.with(keys::LABEL, label.into())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<OptionValue>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<OptionValue> {
        self.values.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn label(&self) -> Option<&str> {
        match self.values.get(keys::LABEL) {
            Some(OptionValue::Text(label)) => Some(label),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OptionValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether `key` is in effect: present and, unless it is a tag, not
    /// equivalent to its registered default. Unregistered keys are in effect
    /// when they hold `true` or a tag.
    pub fn is_set(&self, key: &str, registry: &OptionRegistry) -> bool {
        let Some(value) = self.values.get(key) else {
            return false;
        };
        match registry.get(key) {
            Some(descriptor) if descriptor.is_tag() => true,
            Some(descriptor) => !descriptor.is_default(value),
            None => matches!(value, OptionValue::Bool(true) | OptionValue::Tag),
        }
    }

    /// Rejects values whose type does not match their registered kind.
    pub fn validate(&self, registry: &OptionRegistry) -> Result<()> {
        for (key, value) in &self.values {
            if let Some(descriptor) = registry.get(key) {
                if descriptor.kind() != value.kind() {
                    return Err(StrandError::InvalidArgument(format!(
                        "option '{}' expects {:?}, got {:?}",
                        key,
                        descriptor.kind(),
                        value
                    )));
                }
            }
        }
        Ok(())
    }

    /// The options a child opened with `self` actually carries: its own,
    /// plus every hereditary option of `parent` it does not set itself.
    pub fn inherit(&self, parent: &TransactionOptions, registry: &OptionRegistry) -> Self {
        let mut merged = self.clone();
        for (key, value) in &parent.values {
            if registry.is_hereditary(key) && !merged.values.contains_key(key) {
                merged.values.insert(key.clone(), value.clone());
            }
        }
        merged
    }

    /// Fills in every key of `defaults` this set does not mention.
    pub fn with_defaults(&self, defaults: &TransactionOptions) -> Self {
        let mut merged = self.clone();
        for (key, value) in &defaults.values {
            merged
                .values
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hereditary_options_flow_to_children() {
        let registry = OptionRegistry::default();
        let parent = TransactionOptions::new()
            .with_flag(keys::NO_UNDO)
            .with_tag(keys::TRIGGER)
            .with_label("outer");

        let child = TransactionOptions::new().inherit(&parent, &registry);
        assert!(child.is_set(keys::NO_UNDO, &registry));
        assert!(!child.contains(keys::TRIGGER));
        assert_eq!(child.label(), None);
    }

    #[test]
    fn child_overrides_parent() {
        let registry = OptionRegistry::default();
        let parent = TransactionOptions::new().with_flag(keys::NO_TRIGGERS);
        let child = TransactionOptions::new()
            .with(keys::NO_TRIGGERS, false)
            .inherit(&parent, &registry);
        assert!(!child.is_set(keys::NO_TRIGGERS, &registry));
    }

    #[test]
    fn custom_equivalence_decides_is_set() {
        fn case_insensitive(a: &OptionValue, b: &OptionValue) -> bool {
            match (a, b) {
                (OptionValue::Text(a), OptionValue::Text(b)) => a.eq_ignore_ascii_case(b),
                _ => a == b,
            }
        }

        let mut registry = OptionRegistry::default();
        registry
            .register(
                OptionDescriptor::new("origin", OptionValue::Text("user".into()), false)
                    .with_equivalence(case_insensitive),
            )
            .unwrap();

        let options = TransactionOptions::new().with("origin", "USER");
        assert!(!options.is_set("origin", &registry));
        let options = TransactionOptions::new().with("origin", "script");
        assert!(options.is_set("origin", &registry));
    }

    #[test]
    fn validate_rejects_mistyped_values() {
        let registry = OptionRegistry::default();
        let options = TransactionOptions::new().with(keys::NO_UNDO, 3i64);
        assert!(matches!(
            options.validate(&registry),
            Err(StrandError::InvalidArgument(_))
        ));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = OptionRegistry::default();
        assert!(registry.register(OptionDescriptor::flag(keys::NO_UNDO, false)).is_err());
    }

    #[test]
    fn deserializes_from_plain_json() {
        let options: TransactionOptions =
            serde_json::from_str(r#"{"no_undo": true, "label": "import", "retries": 3}"#).unwrap();
        assert_eq!(options.get(keys::NO_UNDO), Some(&OptionValue::Bool(true)));
        assert_eq!(options.label(), Some("import"));
        assert_eq!(options.get("retries"), Some(&OptionValue::Int(3)));
    }
}
