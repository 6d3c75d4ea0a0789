//! Nested catalog of bundles, as delivered by a bundle index.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::bundle::{Bundle, BundleId};

/// A node of the catalog tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CatalogNode {
    /// A named grouping of further nodes.
    Group {
        /// Display name.
        name: String,
        /// Child nodes.
        #[serde(default)]
        children: Vec<CatalogNode>,
    },
    /// A downloadable bundle.
    Bundle(Bundle),
}

/// Every file name referenced anywhere in `roots`, de-duplicated.
#[must_use]
pub fn required_file_names(roots: &[CatalogNode]) -> HashSet<String> {
    bundles(roots)
        .into_iter()
        .flat_map(Bundle::file_names)
        .map(str::to_string)
        .collect()
}

/// All bundles in depth-first pre-order.
#[must_use]
pub fn bundles(roots: &[CatalogNode]) -> Vec<&Bundle> {
    let mut found = Vec::new();
    let mut stack: Vec<&CatalogNode> = roots.iter().rev().collect();
    while let Some(node) = stack.pop() {
        match node {
            CatalogNode::Group { children, .. } => stack.extend(children.iter().rev()),
            CatalogNode::Bundle(bundle) => found.push(bundle),
        }
    }
    found
}

/// The first bundle with `id`, in depth-first pre-order.
#[must_use]
pub fn find_bundle(roots: &[CatalogNode], id: BundleId) -> Option<&Bundle> {
    bundles(roots).into_iter().find(|bundle| bundle.id == id)
}
