use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};
use crate::persistence::PersistenceLayer;

/// A flattened view of the role hierarchy: for each role, all of its
/// descendant roles. A role inherits the capabilities of all of its
/// descendants; roles without descendants do not appear.
#[derive(Debug, Clone, Default)]
pub struct RoleHierarchy {
    descendants: HashMap<String, Vec<String>>,
}

impl RoleHierarchy {
    /// Loads the child-to-parent mapping from the backend's
    /// [`role_hierarchy`](PersistenceLayer::role_hierarchy) and flattens it.
    pub async fn load(backend: &dyn PersistenceLayer) -> Result<Self> {
        let hierarchy = backend.role_hierarchy().await.map_err(Error::Backend)?;
        Ok(Self::from_parents(&hierarchy))
    }

    /// Flattens a child-to-parent mapping into the descendant lists. Roles
    /// not contained as a child have no parent.
    pub fn from_parents(hierarchy: &HashMap<String, String>) -> Self {
        let mut descendants: HashMap<String, Vec<String>> = HashMap::new();
        let mut touched: HashSet<String> = HashSet::new();
        for start in hierarchy.keys() {
            // Walk upwards, carrying every newly-seen role to each ancestor.
            // The walk is bounded so a cyclic mapping cannot loop forever.
            let mut carried: Vec<String> = Vec::new();
            let mut child = start.clone();
            for _ in 0..=hierarchy.len() {
                let Some(parent) = hierarchy.get(&child) else {
                    break;
                };
                if touched.insert(child.clone()) {
                    carried.push(child.clone());
                }
                if !carried.is_empty() {
                    descendants
                        .entry(parent.clone())
                        .or_default()
                        .extend(carried.iter().cloned());
                }
                child = parent.clone();
            }
        }
        Self { descendants }
    }

    /// All descendant roles of the given role, excluding the role itself.
    pub fn descendants(&self, role: &str) -> &[String] {
        self.descendants
            .get(role)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}
