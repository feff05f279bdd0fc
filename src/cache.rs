// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Process-local store of issued tokens, keyed by binding.
//!
//! The pull secret is the durable record; this cache only saves authority calls when a
//! binding is reconciled again for reasons unrelated to its token.

use crate::types::{BindingKey, IssuedToken};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Thread-safe token cache, cheap to clone
#[derive(Clone, Default)]
pub struct CredentialCache {
    tokens: Arc<DashMap<BindingKey, IssuedToken>>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &BindingKey) -> Option<IssuedToken> {
        self.tokens.get(key).map(|t| t.value().clone())
    }

    /// Store a token for a binding. A token issued before the one already held is
    /// ignored; returns whether the cache now holds `token`.
    pub fn put(&self, key: BindingKey, token: IssuedToken) -> bool {
        match self.tokens.entry(key) {
            Entry::Occupied(held) if held.get().issued_at > token.issued_at => {
                debug!(binding = %held.key(), "Ignoring token older than the cached one");
                false
            }
            Entry::Occupied(mut held) => {
                held.insert(token);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(token);
                true
            }
        }
    }

    pub fn invalidate(&self, key: &BindingKey) -> Option<IssuedToken> {
        self.tokens.remove(key).map(|(_, token)| token)
    }
}
