//! Agent registry: name-based lookup over registered agent services.
//!
//! Registration order is preserved so that domain resolution is
//! deterministic when several agents advertise the same capability.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::agent::AgentSvc;

/// Static metadata describing a registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub name: String,
    pub version: String,
    /// Domain labels this agent serves; matched against classification
    /// domains during routing.
    pub capabilities: Vec<String>,
}

impl AgentDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "0.1.0".to_string(),
            capabilities: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }
}

/// A registered agent: descriptor plus its boxed service.
#[derive(Clone)]
pub struct AgentEntry {
    pub descriptor: AgentDescriptor,
    pub service: AgentSvc,
}

/// Name-indexed registry of agents.
///
/// Lookups clone the boxed service; registrations after construction are
/// not supported, so the registry can be shared behind an `Arc` without
/// locking.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    name_to_index: HashMap<String, usize>,
    entries: Vec<AgentEntry>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent. A duplicate name replaces the earlier service but
    /// keeps its position in registration order.
    pub fn register(&mut self, descriptor: AgentDescriptor, service: AgentSvc) {
        let name = descriptor.name.clone();
        let entry = AgentEntry {
            descriptor,
            service,
        };
        match self.name_to_index.get(&name) {
            Some(&idx) => {
                debug!(agent = %name, "replacing registered agent");
                self.entries[idx] = entry;
            }
            None => {
                self.name_to_index.insert(name, self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    pub fn with_agent(mut self, descriptor: AgentDescriptor, service: AgentSvc) -> Self {
        self.register(descriptor, service);
        self
    }

    /// Look up an agent by exact name.
    pub fn resolve(&self, name: &str) -> Option<&AgentEntry> {
        self.name_to_index.get(name).map(|&idx| &self.entries[idx])
    }

    /// Look up by name, cloning out the service for invocation.
    pub fn resolve_svc(&self, name: &str) -> Option<(AgentDescriptor, AgentSvc)> {
        self.resolve(name)
            .map(|e| (e.descriptor.clone(), e.service.clone()))
    }

    /// First agent (in registration order) advertising `domain` among its
    /// capabilities.
    pub fn agent_for_domain(&self, domain: &str) -> Option<&AgentDescriptor> {
        self.entries
            .iter()
            .find(|e| e.descriptor.capabilities.iter().any(|c| c == domain))
            .map(|e| &e.descriptor)
    }

    /// Registered agent names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.entries
            .iter()
            .map(|e| e.descriptor.name.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
