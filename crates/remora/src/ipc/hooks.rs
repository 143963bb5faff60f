use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, FromRepr, IntoStaticStr};

use crate::error::{Error, Result};

/// Wrapper hooks are called by the host; interceptor hooks call back into it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, FromRepr,
    IntoStaticStr,
)]
#[repr(u8)]
#[strum(serialize_all = "lowercase")]
pub enum HookType {
    Wrapper = 0,
    Interceptor = 1,
}

/// When an interceptor runs relative to the original function.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, FromRepr,
    IntoStaticStr,
)]
#[repr(u8)]
#[strum(serialize_all = "lowercase")]
pub enum HookBehavior {
    Before = 0,
    After = 1,
}

/// Callback for intercepted calls: argument bytes in, return bytes out.
pub type HookHandler = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Local view of registered hooks. Key and handler maps change together.
#[derive(Default)]
pub(crate) struct HookTable {
    handlers: HashMap<u32, Option<HookHandler>>,
    key_to_id: HashMap<String, u32>,
    pending_keys: HashSet<String>,
}

impl HookTable {
    /// Claim `key` for an in-flight registration.
    pub fn reserve(&mut self, key: &str) -> Result<()> {
        if self.key_to_id.contains_key(key) {
            return Err(Error::rejected(key, "hook already registered"));
        }
        if !self.pending_keys.insert(key.to_string()) {
            return Err(Error::rejected(key, "registration already in progress"));
        }
        Ok(())
    }

    pub fn abandon(&mut self, key: &str) {
        self.pending_keys.remove(key);
    }

    pub fn commit(&mut self, key: &str, hook_id: u32, handler: Option<HookHandler>) -> Result<()> {
        self.pending_keys.remove(key);
        if self.handlers.contains_key(&hook_id) {
            return Err(Error::rejected(
                key,
                format!("hook id {hook_id} is already in use"),
            ));
        }
        self.handlers.insert(hook_id, handler);
        self.key_to_id.insert(key.to_string(), hook_id);
        Ok(())
    }

    /// Drop a hook; returns its key when it was registered.
    pub fn remove(&mut self, hook_id: u32) -> Option<String> {
        self.handlers.remove(&hook_id)?;
        let key = self
            .key_to_id
            .iter()
            .find(|(_, id)| **id == hook_id)
            .map(|(k, _)| k.clone())?;
        self.key_to_id.remove(&key);
        Some(key)
    }

    pub fn contains(&self, hook_id: u32) -> bool {
        self.handlers.contains_key(&hook_id)
    }

    /// Registered without a handler, so the host calls it.
    pub fn is_wrapper(&self, hook_id: u32) -> bool {
        matches!(self.handlers.get(&hook_id), Some(None))
    }

    pub fn handler(&self, hook_id: u32) -> Option<HookHandler> {
        self.handlers.get(&hook_id).cloned().flatten()
    }

    pub fn hook_id(&self, key: &str) -> Option<u32> {
        self.key_to_id.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }
}
