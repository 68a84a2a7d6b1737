// Profile store
// Named profile definitions and source-profile chain construction

mod chain;
mod types;

use std::collections::HashMap;

pub use chain::{build_chain, ResolutionChain};
pub use types::{BackendType, IdentityProviderSettings, ProfileDefinition, SsoSettings};

use crate::error::Result;

/// Mapping of profile name to definition, built once per invocation
#[derive(Debug, Clone, Default)]
pub struct ProfileStore {
    profiles: HashMap<String, ProfileDefinition>,
}

impl ProfileStore {
    /// Build a store from definitions; a later duplicate name replaces an earlier one
    pub fn new(profiles: impl IntoIterator<Item = ProfileDefinition>) -> Self {
        let mut store = Self::default();
        for profile in profiles {
            store.insert(profile);
        }
        store
    }

    /// Build a store from a name-keyed table, filling each definition's name from its key
    pub fn from_map(profiles: HashMap<String, ProfileDefinition>) -> Self {
        let profiles = profiles
            .into_iter()
            .map(|(name, mut profile)| {
                profile.name = name.clone();
                (name, profile)
            })
            .collect();
        Self { profiles }
    }

    pub fn insert(&mut self, profile: ProfileDefinition) {
        self.profiles.insert(profile.name.clone(), profile);
    }

    pub fn get(&self, name: &str) -> Option<&ProfileDefinition> {
        self.profiles.get(name)
    }

    /// Profile names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Build the root-to-leaf chain for `leaf`
    pub fn chain(&self, leaf: &str) -> Result<ResolutionChain<'_>> {
        build_chain(self, leaf)
    }

    /// Check that every profile resolves to an acyclic chain of defined profiles
    pub fn validate_graph(&self) -> Result<()> {
        for name in self.names() {
            self.chain(name)?;
        }
        Ok(())
    }
}
