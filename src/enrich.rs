//! Context enrichment between agents.
//!
//! When a handoff occurs, the declaring agent's payload is folded into the
//! session context that every subsequent invocation receives. The merge is
//! subject to two byte ceilings: a per-payload cap and a cumulative
//! per-session cap. When the cumulative ceiling would be exceeded the oldest
//! entries are evicted first (FIFO); the incoming handoff's context is never
//! dropped in favor of stale data.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::session::ContextEntry;

/// Byte ceilings for context enrichment. Defaults: 8 KB per payload,
/// 32 KB cumulative per session. A `payload_bytes` larger than
/// `total_bytes` is clamped down during merging.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContextCaps {
    pub payload_bytes: usize,
    pub total_bytes: usize,
}

impl Default for ContextCaps {
    fn default() -> Self {
        Self {
            payload_bytes: 8 * 1024,
            total_bytes: 32 * 1024,
        }
    }
}

/// Merges handoff payloads into session context under the configured caps.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextEnricher {
    caps: ContextCaps,
}

impl ContextEnricher {
    pub fn new(caps: ContextCaps) -> Self {
        Self { caps }
    }

    /// Fold `payload` into `context`, returning the number of entries added.
    ///
    /// Object payloads contribute one entry per top-level key; any other
    /// payload shape is stored under the `"payload"` key. A key already
    /// present is replaced and moves to the newest position. Entries are
    /// admitted in key order until the per-payload cap is reached; the
    /// remainder is dropped with a warning.
    pub fn merge(&self, context: &mut Vec<ContextEntry>, payload: &Value) -> usize {
        if payload.is_null() {
            return 0;
        }

        let candidates: Vec<ContextEntry> = match payload {
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| ContextEntry::new(k.clone(), v.clone()))
                .collect(),
            other => vec![ContextEntry::new("payload", other.clone())],
        };

        // Admit entries up to the per-payload cap. The effective cap never
        // exceeds the cumulative cap, so a single payload can never push the
        // context over the session ceiling.
        let payload_cap = self.caps.payload_bytes.min(self.caps.total_bytes);
        let mut incoming: Vec<ContextEntry> = Vec::with_capacity(candidates.len());
        let mut incoming_bytes = 0usize;
        for entry in candidates {
            let size = entry.size_bytes();
            if incoming_bytes + size > payload_cap {
                warn!(
                    key = %entry.key,
                    cap = payload_cap,
                    "handoff payload exceeds per-payload cap; dropping remainder"
                );
                break;
            }
            incoming_bytes += size;
            incoming.push(entry);
        }
        if incoming.is_empty() {
            return 0;
        }

        // Replaced keys move to the newest position.
        context.retain(|e| !incoming.iter().any(|n| n.key == e.key));

        // Evict oldest existing entries until the new payload fits.
        let mut existing_bytes: usize = context.iter().map(ContextEntry::size_bytes).sum();
        while !context.is_empty() && existing_bytes + incoming_bytes > self.caps.total_bytes {
            let evicted = context.remove(0);
            existing_bytes -= evicted.size_bytes();
            warn!(key = %evicted.key, "evicting oldest context entry to respect byte cap");
        }

        let added = incoming.len();
        context.extend(incoming);
        added
    }
}
