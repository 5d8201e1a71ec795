//! Reusable query scopes.
//!
//! A scope is a callback that appends operations to a builder. Global scopes
//! are registered per model and applied exactly once, on first compilation;
//! local scopes are applied immediately when invoked by name.

use crate::QueryBuilder;
use indexmap::IndexSet;
use std::sync::Arc;

/// A scope callback. Shared between a builder and its clones.
pub type ScopeCallback = Arc<dyn Fn(&mut QueryBuilder) + Send + Sync>;

/// Whether a global scope's operations run before or after the user's own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeTiming {
    Before,
    After,
}

#[derive(Clone)]
pub struct GlobalScope {
    pub callback: ScopeCallback,
    pub timing: ScopeTiming,
}

/// Which registered global scopes are disabled for this builder.
#[derive(Clone, Debug, Default)]
pub enum DisabledScopes {
    #[default]
    None,
    All,
    Named(IndexSet<String>),
}

impl DisabledScopes {
    pub fn disable(&mut self, name: &str) {
        match self {
            DisabledScopes::All => {}
            DisabledScopes::Named(names) => {
                names.insert(name.to_owned());
            }
            DisabledScopes::None => {
                let mut names = IndexSet::new();
                names.insert(name.to_owned());
                *self = DisabledScopes::Named(names);
            }
        }
    }

    pub fn disable_all(&mut self) {
        *self = DisabledScopes::All;
    }

    pub fn is_disabled(&self, name: &str) -> bool {
        match self {
            DisabledScopes::None => false,
            DisabledScopes::All => true,
            DisabledScopes::Named(names) => names.contains(name),
        }
    }
}
