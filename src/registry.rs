//! Bounded registries for functions, variables, files, subscriptions, and
//! owners (spec.md §3 "Registries"). Plain owned `HashMap`s: the
//! single-threaded event loop is the only task that ever touches one.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::coap::CoapCode;

pub const MAX_NAME_LEN: usize = 64;
pub const FUNCTION_CAPACITY: usize = 10;
pub const VARIABLE_CAPACITY: usize = 10;
pub const FILE_CAPACITY: usize = 4;
pub const SUBSCRIPTION_CAPACITY: usize = 4;
pub const MAX_ARGS_LEN: usize = 622;
pub const MAX_ENCODED_VALUE_LEN: usize = 622;

/// A user-registered function callback. `args` is the raw comma-joined
/// argument string the cloud sent; the return value is the 32-bit signed
/// integer result, per spec.md §4.4.1.
#[async_trait]
pub trait FunctionHandler: Send + Sync {
    async fn call(&self, args: String) -> std::result::Result<i32, String>;
}

/// Registration-time metadata for a function (spec.md §4.4.1 and open
/// question 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionFlags {
    pub owner_only: bool,
    /// Response code used when the callback returns an error. Defaults to
    /// 5.00 (current revision); callers that need the historical 4.00 can
    /// set it explicitly at registration time.
    pub error_response_code: CoapCode,
}

impl Default for FunctionFlags {
    fn default() -> Self {
        Self {
            owner_only: false,
            error_response_code: CoapCode::INTERNAL_SERVER_ERROR,
        }
    }
}

struct FunctionEntry {
    flags: FunctionFlags,
    handler: Arc<dyn FunctionHandler>,
}

#[derive(Default)]
pub struct FunctionRegistry {
    entries: HashMap<String, FunctionEntry>,
}

impl FunctionRegistry {
    pub fn register(
        &mut self,
        name: &str,
        flags: FunctionFlags,
        handler: Arc<dyn FunctionHandler>,
    ) -> bool {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return false;
        }
        if !self.entries.contains_key(name) && self.entries.len() >= FUNCTION_CAPACITY {
            return false;
        }
        self.entries
            .insert(name.to_string(), FunctionEntry { flags, handler });
        true
    }

    pub fn get(&self, name: &str) -> Option<(FunctionFlags, Arc<dyn FunctionHandler>)> {
        self.entries
            .get(name)
            .map(|e| (e.flags, Arc::clone(&e.handler)))
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Declared scalar type for a registered variable (spec.md §6 "Variable
/// encoding by declared type").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclaredType {
    Bool,
    Int,
    Double,
    String,
    Json,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VariableValue {
    Bool(bool),
    Int(i32),
    Double(f64),
    String(String),
    Json(Value),
}

#[async_trait]
pub trait VariableHandler: Send + Sync {
    async fn read(&self) -> std::result::Result<VariableValue, String>;
}

struct VariableEntry {
    declared_type: DeclaredType,
    handler: Arc<dyn VariableHandler>,
}

#[derive(Default)]
pub struct VariableRegistry {
    entries: HashMap<String, VariableEntry>,
}

impl VariableRegistry {
    pub fn register(
        &mut self,
        name: &str,
        declared_type: DeclaredType,
        handler: Arc<dyn VariableHandler>,
    ) -> bool {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return false;
        }
        if !self.entries.contains_key(name) && self.entries.len() >= VARIABLE_CAPACITY {
            return false;
        }
        self.entries.insert(
            name.to_string(),
            VariableEntry {
                declared_type,
                handler,
            },
        );
        true
    }

    pub fn get(&self, name: &str) -> Option<(DeclaredType, Arc<dyn VariableHandler>)> {
        self.entries
            .get(name)
            .map(|e| (e.declared_type, Arc::clone(&e.handler)))
    }

    pub fn declared_types(&self) -> HashMap<String, DeclaredType> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.declared_type))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[async_trait]
pub trait FileHandler: Send + Sync {
    async fn read(&self) -> std::result::Result<Vec<u8>, String>;
}

struct FileEntry {
    mime_type: String,
    handler: Arc<dyn FileHandler>,
}

#[derive(Default)]
pub struct FileRegistry {
    entries: HashMap<String, FileEntry>,
}

impl FileRegistry {
    pub fn register(&mut self, name: &str, mime_type: &str, handler: Arc<dyn FileHandler>) -> bool {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return false;
        }
        if !self.entries.contains_key(name) && self.entries.len() >= FILE_CAPACITY {
            return false;
        }
        self.entries.insert(
            name.to_string(),
            FileEntry {
                mime_type: mime_type.to_string(),
                handler,
            },
        );
        true
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn FileHandler>> {
        self.entries.get(name).map(|e| Arc::clone(&e.handler))
    }

    pub fn descriptors(&self) -> HashMap<String, String> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.mime_type.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Subscription scope (spec.md §6 `subscribe`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionScope {
    AllDevices,
    MyDevices,
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event_name: &str, payload: &[u8]);
}

struct SubscriptionEntry {
    scope: SubscriptionScope,
    handler: Arc<dyn EventHandler>,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<String, SubscriptionEntry>,
}

impl SubscriptionRegistry {
    pub fn register(
        &mut self,
        name_prefix: &str,
        scope: SubscriptionScope,
        handler: Arc<dyn EventHandler>,
    ) -> bool {
        if name_prefix.is_empty() {
            return false;
        }
        if !self.entries.contains_key(name_prefix) && self.entries.len() >= SUBSCRIPTION_CAPACITY {
            return false;
        }
        self.entries
            .insert(name_prefix.to_string(), SubscriptionEntry { scope, handler });
        true
    }

    pub fn unregister(&mut self, name_prefix: &str) -> bool {
        self.entries.remove(name_prefix).is_some()
    }

    /// All registered subscriptions whose name is a prefix of
    /// `event_name` (spec.md §4.6 "Prefix-matched subscriber dispatch").
    pub fn matching(&self, event_name: &str) -> Vec<(&str, Arc<dyn EventHandler>)> {
        self.entries
            .iter()
            .filter(|(prefix, _)| event_name.starts_with(prefix.as_str()))
            .map(|(prefix, entry)| (prefix.as_str(), Arc::clone(&entry.handler)))
            .collect()
    }

    pub fn scope_of(&self, name_prefix: &str) -> Option<SubscriptionScope> {
        self.entries.get(name_prefix).map(|e| e.scope)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Owner identifiers asserted by the cloud (spec.md §3, §4.7
/// `iotready/device/owners`). Mutated only by that system event.
#[derive(Debug, Clone, Default)]
pub struct OwnerList {
    owners: Vec<String>,
}

impl OwnerList {
    pub fn replace(&mut self, owners: Vec<String>) {
        self.owners = owners;
    }

    pub fn contains(&self, owner: &str) -> bool {
        self.owners.iter().any(|o| o == owner)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.owners
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopFunction;
    #[async_trait]
    impl FunctionHandler for NoopFunction {
        async fn call(&self, _args: String) -> std::result::Result<i32, String> {
            Ok(0)
        }
    }

    #[test]
    fn function_registry_enforces_capacity() {
        let mut registry = FunctionRegistry::default();
        for i in 0..FUNCTION_CAPACITY {
            assert!(registry.register(&format!("f{i}"), FunctionFlags::default(), Arc::new(NoopFunction)));
        }
        assert!(!registry.register("overflow", FunctionFlags::default(), Arc::new(NoopFunction)));
        assert_eq!(registry.len(), FUNCTION_CAPACITY);
    }

    #[test]
    fn re_registration_by_same_name_overwrites_without_growing() {
        let mut registry = FunctionRegistry::default();
        assert!(registry.register("add", FunctionFlags::default(), Arc::new(NoopFunction)));
        assert!(registry.register("add", FunctionFlags::default(), Arc::new(NoopFunction)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn rejects_name_over_64_chars() {
        let mut registry = FunctionRegistry::default();
        let long_name = "a".repeat(65);
        assert!(!registry.register(&long_name, FunctionFlags::default(), Arc::new(NoopFunction)));
    }

    #[test]
    fn subscription_prefix_matching() {
        struct NoopEvent;
        #[async_trait]
        impl EventHandler for NoopEvent {
            async fn handle(&self, _event_name: &str, _payload: &[u8]) {}
        }
        let mut registry = SubscriptionRegistry::default();
        registry.register("a/b", SubscriptionScope::AllDevices, Arc::new(NoopEvent));
        registry.register("a", SubscriptionScope::AllDevices, Arc::new(NoopEvent));
        let matches = registry.matching("a/b/c");
        assert_eq!(matches.len(), 2);
    }

    #[test]
    fn owners_list_replace_and_contains() {
        let mut owners = OwnerList::default();
        owners.replace(vec!["owner1".to_string(), "owner2".to_string()]);
        assert!(owners.contains("owner1"));
        assert!(!owners.contains("owner3"));
    }
}
