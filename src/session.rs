//! The persisted session record.
//!
//! One [`Session`] exists per conversation. It carries the currently active
//! agent, the ordered chain of agents that have held responsibility, the
//! last classification result, and the enrichment context handed to agents
//! on invocation.
//!
//! The record is versioned: readers reject anything that does not validate
//! against the current schema and recover with a fresh session rather than
//! attempting partial repair.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::classify::SwitchReason;

/// Current session schema version. Bumped on any incompatible change;
/// mismatched records are rejected on load, never migrated.
pub const SESSION_SCHEMA_VERSION: u32 = 1;

/// Session identifier newtype, stable for the conversation lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One enrichment entry. Context is kept as an insertion-ordered vector so
/// that FIFO eviction is well-defined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub key: String,
    pub value: Value,
}

impl ContextEntry {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }

    /// Approximate serialized size, used for the context byte caps.
    pub fn size_bytes(&self) -> usize {
        let value_len = serde_json::to_vec(&self.value).map(|b| b.len()).unwrap_or(0);
        self.key.len() + value_len
    }
}

/// Persisted state of one ongoing conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub schema_version: u32,
    pub session_id: SessionId,

    /// Agent presently holding responsibility, if any. Always equal to the
    /// last element of `handoff_chain`.
    #[serde(default)]
    pub current_agent: Option<String>,

    /// Ordered list of agents visited this session; may repeat.
    #[serde(default)]
    pub handoff_chain: Vec<String>,

    /// Last-classified domain label.
    #[serde(default)]
    pub domain: Option<String>,

    /// Last classification confidence.
    #[serde(default)]
    pub last_confidence: Option<f64>,

    /// Why the most recent agent switch happened, kept for downstream
    /// routing-accuracy analysis.
    #[serde(default)]
    pub last_switch_reason: Option<SwitchReason>,

    /// Enrichment context, oldest entries first.
    #[serde(default)]
    pub context: Vec<ContextEntry>,

    /// Sessions are archived when the conversation ends, never deleted.
    #[serde(default)]
    pub archived: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(session_id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SESSION_SCHEMA_VERSION,
            session_id,
            current_agent: None,
            handoff_chain: Vec::new(),
            domain: None,
            last_confidence: None,
            last_switch_reason: None,
            context: Vec::new(),
            archived: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Schema validation applied on load. A failing record is treated by
    /// stores exactly like a missing one.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.schema_version != SESSION_SCHEMA_VERSION {
            return Err(format!(
                "schema version mismatch: got {}, want {}",
                self.schema_version, SESSION_SCHEMA_VERSION
            ));
        }
        if self.session_id.0.is_empty() {
            return Err("empty session_id".to_string());
        }
        match (&self.current_agent, self.handoff_chain.last()) {
            (None, None) => Ok(()),
            (Some(current), Some(last)) if current == last => Ok(()),
            _ => Err(format!(
                "current_agent {:?} does not match chain tail {:?}",
                self.current_agent,
                self.handoff_chain.last()
            )),
        }
    }

    /// Append an agent to the chain and make it current.
    pub fn push_agent(&mut self, name: impl Into<String>) {
        let name = name.into();
        self.handoff_chain.push(name.clone());
        self.current_agent = Some(name);
        self.touch();
    }

    /// Total serialized size of the context entries.
    pub fn context_bytes(&self) -> usize {
        self.context.iter().map(ContextEntry::size_bytes).sum()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_session_is_valid_and_empty() {
        let s = Session::new(SessionId::from("conv-1"));
        assert!(s.validate().is_ok());
        assert!(s.current_agent.is_none());
        assert!(s.handoff_chain.is_empty());
        assert!(!s.archived);
    }

    #[test]
    fn push_agent_keeps_current_equal_to_chain_tail() {
        let mut s = Session::new(SessionId::from("conv-2"));
        s.push_agent("triage");
        s.push_agent("security_specialist");
        assert_eq!(s.current_agent.as_deref(), Some("security_specialist"));
        assert_eq!(
            s.handoff_chain,
            vec!["triage".to_string(), "security_specialist".to_string()]
        );
        assert!(s.validate().is_ok());
    }

    #[test]
    fn validate_rejects_version_mismatch() {
        let mut s = Session::new(SessionId::from("conv-3"));
        s.schema_version = 99;
        assert!(s.validate().is_err());
    }

    #[test]
    fn validate_rejects_incoherent_current_agent() {
        let mut s = Session::new(SessionId::from("conv-4"));
        s.current_agent = Some("ghost".to_string());
        assert!(s.validate().is_err());

        s.current_agent = None;
        s.handoff_chain = vec!["triage".to_string()];
        assert!(s.validate().is_err());
    }

    #[test]
    fn roundtrips_through_json() {
        let mut s = Session::new(SessionId::from("conv-5"));
        s.push_agent("finops_agent");
        s.domain = Some("finops".to_string());
        s.last_confidence = Some(0.82);
        s.context
            .push(ContextEntry::new("budget", json!({"usd": 1200})));

        let text = serde_json::to_string(&s).unwrap();
        let back: Session = serde_json::from_str(&text).unwrap();
        assert!(back.validate().is_ok());
        assert_eq!(back.handoff_chain, s.handoff_chain);
        assert_eq!(back.context, s.context);
    }

    #[test]
    fn context_bytes_counts_keys_and_values() {
        let entry = ContextEntry::new("k", json!("v"));
        // key (1) + serialized value "\"v\"" (3)
        assert_eq!(entry.size_bytes(), 4);
    }
}
