// Resolution chain construction

use std::collections::HashSet;

use super::types::ProfileDefinition;
use super::ProfileStore;
use crate::error::{AssumeError, ConfigurationKind, Result};

/// Ordered hops from the root profile (no source) down to the requested leaf
#[derive(Debug, Clone)]
pub struct ResolutionChain<'a> {
    hops: Vec<&'a ProfileDefinition>,
}

impl<'a> ResolutionChain<'a> {
    /// Hops in root-to-leaf order
    pub fn hops(&self) -> &[&'a ProfileDefinition] {
        &self.hops
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// Profile authenticated directly, without parent credentials
    pub fn root(&self) -> &'a ProfileDefinition {
        self.hops[0]
    }

    /// The requested profile
    pub fn leaf(&self) -> &'a ProfileDefinition {
        self.hops[self.hops.len() - 1]
    }

    /// Names in root-to-leaf order
    pub fn names(&self) -> Vec<&'a str> {
        self.hops.iter().map(|p| p.name.as_str()).collect()
    }
}

/// Walk `source_profile` references upward from `leaf`
///
/// Fails on the first repeated name, so a cycle is reported before any hop runs.
pub fn build_chain<'a>(store: &'a ProfileStore, leaf: &str) -> Result<ResolutionChain<'a>> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut walked: Vec<&'a ProfileDefinition> = Vec::new();
    let mut current = leaf;
    let mut referenced_by: Option<&str> = None;

    loop {
        if !seen.insert(current) {
            let mut path: Vec<&str> = walked.iter().map(|p| p.name.as_str()).collect();
            path.push(current);
            return Err(AssumeError::configuration(
                ConfigurationKind::CyclicProfileChain,
                current,
                format!("source_profile loop: {}", path.join(" -> ")),
            ));
        }

        let profile = store.get(current).ok_or_else(|| {
            let message = match referenced_by {
                Some(parent) => format!(
                    "profile '{}' referenced as source_profile by '{}' is not defined",
                    current, parent
                ),
                None => format!("profile '{}' is not defined", current),
            };
            AssumeError::configuration(ConfigurationKind::UnknownProfile, current, message)
        })?;
        walked.push(profile);

        match profile.source_profile.as_deref() {
            Some(source) => {
                referenced_by = Some(profile.name.as_str());
                current = source;
            }
            None => break,
        }
    }

    walked.reverse();
    Ok(ResolutionChain { hops: walked })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::BackendType;
    use proptest::prelude::*;

    fn iam(name: &str) -> ProfileDefinition {
        ProfileDefinition::new(name, BackendType::IamRoleChain)
            .with_role_arn(format!("arn:aws:iam::111122223333:role/{}", name))
    }

    #[test]
    fn test_single_root_profile() {
        let store = ProfileStore::new(vec![iam("root")]);
        let chain = build_chain(&store, "root").unwrap();
        assert_eq!(chain.names(), vec!["root"]);
        assert_eq!(chain.root().name, "root");
        assert_eq!(chain.leaf().name, "root");
    }

    #[test]
    fn test_chain_is_root_to_leaf() {
        let store = ProfileStore::new(vec![
            iam("prod").with_source("staging"),
            iam("staging").with_source("base"),
            ProfileDefinition::new("base", BackendType::CredentialProcess)
                .with_credential_process("echo"),
        ]);
        let chain = build_chain(&store, "prod").unwrap();
        assert_eq!(chain.names(), vec!["base", "staging", "prod"]);
    }

    #[test]
    fn test_self_reference_is_cycle() {
        let store = ProfileStore::new(vec![iam("loop").with_source("loop")]);
        let err = build_chain(&store, "loop").unwrap_err();
        assert_eq!(
            err.configuration_kind(),
            Some(ConfigurationKind::CyclicProfileChain)
        );
        assert!(err.to_string().contains("loop -> loop"));
    }

    #[test]
    fn test_cycle_below_leaf() {
        let store = ProfileStore::new(vec![
            iam("leaf").with_source("a"),
            iam("a").with_source("b"),
            iam("b").with_source("a"),
        ]);
        let err = build_chain(&store, "leaf").unwrap_err();
        assert_eq!(
            err.configuration_kind(),
            Some(ConfigurationKind::CyclicProfileChain)
        );
        assert!(err.to_string().contains("leaf -> a -> b -> a"));
    }

    #[test]
    fn test_unknown_source_profile() {
        let store = ProfileStore::new(vec![iam("dev").with_source("missing")]);
        let err = build_chain(&store, "dev").unwrap_err();
        assert_eq!(err.configuration_kind(), Some(ConfigurationKind::UnknownProfile));
        assert!(err.to_string().contains("referenced as source_profile by 'dev'"));
    }

    #[test]
    fn test_unknown_requested_profile() {
        let store = ProfileStore::new(vec![]);
        let err = build_chain(&store, "nope").unwrap_err();
        assert_eq!(err.configuration_kind(), Some(ConfigurationKind::UnknownProfile));
    }

    fn linear_store(len: usize) -> ProfileStore {
        let profiles = (0..len).map(|i| {
            let p = iam(&format!("p{}", i));
            if i == 0 {
                p
            } else {
                p.with_source(format!("p{}", i - 1))
            }
        });
        ProfileStore::new(profiles)
    }

    proptest! {
        #[test]
        fn prop_linear_chain_visits_every_hop_once(len in 1usize..24) {
            let store = linear_store(len);
            let leaf = format!("p{}", len - 1);
            let chain = build_chain(&store, &leaf).unwrap();
            let expected: Vec<String> = (0..len).map(|i| format!("p{}", i)).collect();
            prop_assert_eq!(chain.names(), expected.iter().map(String::as_str).collect::<Vec<_>>());
        }

        #[test]
        fn prop_any_back_edge_is_a_cycle(len in 1usize..24, back in 0usize..24) {
            let back = back % len;
            let mut store = linear_store(len);
            // Point the root at a later profile, closing a loop
            let root = store.get("p0").cloned().unwrap().with_source(format!("p{}", back));
            store.insert(root);
            let leaf = format!("p{}", len - 1);
            let err = build_chain(&store, &leaf).unwrap_err();
            prop_assert_eq!(err.configuration_kind(), Some(ConfigurationKind::CyclicProfileChain));
        }
    }
}
