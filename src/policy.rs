// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Configured per-domain rate-limit policy: a longest-prefix-match tree
//! over DNS labels, loaded once at startup (or `adjust`) and read-only
//! thereafter. Built as an arena of nodes addressed by index rather than
//! by parent pointer, so ancestor walks need no shared ownership.

use std::collections::HashMap;

use crate::key::ZoneName;

type NodeId = u32;

const ROOT: NodeId = 0;
const UNSET: i32 = -1;

struct Node {
    parent: Option<NodeId>,
    children: HashMap<Box<[u8]>, NodeId>,
    exact_limit: i32,
    below_limit: i32,
}

impl Node {
    fn new(parent: Option<NodeId>) -> Self {
        Self {
            parent,
            children: HashMap::new(),
            exact_limit: UNSET,
            below_limit: UNSET,
        }
    }
}

/// The configured rate-limit policy, keyed by DNS name.
pub struct DomainLimitTree {
    nodes: Vec<Node>,
    default_limit: i32,
}

impl std::fmt::Debug for DomainLimitTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainLimitTree")
            .field("nodes", &self.nodes.len())
            .field("default_limit", &self.default_limit)
            .finish_non_exhaustive()
    }
}

impl DomainLimitTree {
    #[must_use]
    pub fn new(default_limit: i32) -> Self {
        Self {
            nodes: vec![Node::new(None)],
            default_limit,
        }
    }

    fn ensure_path(&mut self, zone: &ZoneName) -> NodeId {
        let mut current = ROOT;
        for label in zone.labels_root_first() {
            let key: Box<[u8]> = label.into();
            current = match self.nodes[current as usize].children.get(key.as_ref()) {
                Some(&child) => child,
                None => {
                    let new_id = self.nodes.len() as NodeId;
                    self.nodes.push(Node::new(Some(current)));
                    self.nodes[current as usize].children.insert(key, new_id);
                    new_id
                }
            };
        }
        current
    }

    /// Sets the exact-match limit for `zone`.
    pub fn insert_exact(&mut self, zone: &ZoneName, limit: i32) {
        let id = self.ensure_path(zone);
        self.nodes[id as usize].exact_limit = limit;
    }

    /// Sets the limit that applies to `zone` and everything below it,
    /// unless a more specific exact or below-limit match exists.
    pub fn insert_below(&mut self, zone: &ZoneName, limit: i32) {
        let id = self.ensure_path(zone);
        self.nodes[id as usize].below_limit = limit;
    }

    /// Longest-prefix-match lookup: an exact match on the full name wins
    /// first, then the nearest ancestor carrying a below-limit, then the
    /// global default.
    #[must_use]
    pub fn find_ratelimit(&self, zone: &ZoneName) -> i32 {
        let labels = zone.labels_root_first();
        let mut current = ROOT;
        let mut matched_depth = 0usize;
        for label in &labels {
            match self.nodes[current as usize].children.get(*label) {
                Some(&child) => {
                    current = child;
                    matched_depth += 1;
                }
                None => break,
            }
        }

        if matched_depth == labels.len() && self.nodes[current as usize].exact_limit != UNSET {
            return self.nodes[current as usize].exact_limit;
        }

        // A below-limit applies to descendants only, never to the node it
        // was configured on, so a full-label match starts the ancestor walk
        // at its parent rather than at itself.
        let start = if matched_depth == labels.len() {
            self.nodes[current as usize].parent
        } else {
            Some(current)
        };

        let mut node = match start {
            Some(node) => node,
            None => return self.default_limit,
        };
        loop {
            if self.nodes[node as usize].below_limit != UNSET {
                return self.nodes[node as usize].below_limit;
            }
            match self.nodes[node as usize].parent {
                Some(parent) => node = parent,
                None => break,
            }
        }

        self.default_limit
    }
}
