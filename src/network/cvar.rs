//! Replicated Settings (Cvars)
//!
//! Process settings flagged `replicate` travel to newly-joined peers in full,
//! then as a dirty subset once per tick in both directions. A received value
//! is applied only if the setting exists locally and carries the replicate
//! flag, which blunts spoofed or unknown names.

use std::collections::BTreeMap;

struct Cvar {
    value: String,
    replicated: bool,
    dirty: bool,
}

/// Named setting table with replicate flags and dirty tracking.
#[derive(Default)]
pub struct CvarRegistry {
    vars: BTreeMap<String, Cvar>,
}

impl CvarRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a setting. Defined values start clean.
    pub fn define(&mut self, name: &str, value: &str, replicated: bool) {
        self.vars.insert(
            name.to_string(),
            Cvar {
                value: value.to_string(),
                replicated,
                dirty: false,
            },
        );
    }

    /// Local mutation. Marks replicated settings dirty for the next flush.
    /// Returns false for undefined names.
    pub fn set(&mut self, name: &str, value: &str) -> bool {
        match self.vars.get_mut(name) {
            Some(var) => {
                var.value = value.to_string();
                if var.replicated {
                    var.dirty = true;
                }
                true
            }
            None => false,
        }
    }

    /// Current value of a setting.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(|v| v.value.as_str())
    }

    /// True if the setting exists and carries the replicate flag.
    pub fn is_replicated(&self, name: &str) -> bool {
        self.vars.get(name).map(|v| v.replicated).unwrap_or(false)
    }

    /// Apply a value received over the wire. Rejected (returns false) unless
    /// the setting is locally defined and replicated. Never re-dirties.
    pub fn apply_remote(&mut self, name: &str, value: &str) -> bool {
        match self.vars.get_mut(name) {
            Some(var) if var.replicated => {
                var.value = value.to_string();
                var.dirty = false;
                true
            }
            _ => false,
        }
    }

    /// Drain the changed replicated subset, clearing dirty flags.
    pub fn take_dirty(&mut self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for (name, var) in self.vars.iter_mut() {
            if var.replicated && var.dirty {
                var.dirty = false;
                out.push((name.clone(), var.value.clone()));
            }
        }
        out
    }

    /// Every replicated setting, for a new peer's full snapshot.
    pub fn replicated_snapshot(&self) -> Vec<(String, String)> {
        self.vars
            .iter()
            .filter(|(_, var)| var.replicated)
            .map(|(name, var)| (name.clone(), var.value.clone()))
            .collect()
    }
}
