use figlink_core::{RelayError, Role};
use std::collections::{HashMap, HashSet};

pub const DEFAULT_STATE_TYPES: &[&str] = &["state", "selection_changed", "document_changed"];
pub const DEFAULT_PULL_TYPES: &[&str] = &["pull", "get_selection", "get_document_info", "get_node_info"];
pub const DEFAULT_PUSH_TYPES: &[&str] = &["push", "result", "pull_response", "code_result", "html_result"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    StateAnnouncement,
    Pull,
    Push,
}

impl MessageClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageClass::StateAnnouncement => "state",
            MessageClass::Pull => "pull",
            MessageClass::Push => "push",
        }
    }
}

/// Message type sets that decide which routing policy applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTable {
    state: HashSet<String>,
    pull: HashSet<String>,
    push: HashSet<String>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new(DEFAULT_STATE_TYPES, DEFAULT_PULL_TYPES, DEFAULT_PUSH_TYPES)
    }
}

impl RouteTable {
    pub fn new<S: AsRef<str>>(state: &[S], pull: &[S], push: &[S]) -> Self {
        fn collect<S: AsRef<str>>(items: &[S]) -> HashSet<String> {
            items
                .iter()
                .map(|item| item.as_ref().trim().to_string())
                .filter(|item| !item.is_empty())
                .collect()
        }
        Self {
            state: collect(state),
            pull: collect(pull),
            push: collect(push),
        }
    }

    /// A type listed in several sets resolves in state, pull, push order.
    pub fn classify(&self, kind: &str) -> Option<MessageClass> {
        if self.state.contains(kind) {
            Some(MessageClass::StateAnnouncement)
        } else if self.pull.contains(kind) {
            Some(MessageClass::Pull)
        } else if self.push.contains(kind) {
            Some(MessageClass::Push)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteBinding {
    pub mcp: Option<String>,
    pub last_active: Option<String>,
}

impl RouteBinding {
    fn is_empty(&self) -> bool {
        self.mcp.is_none() && self.last_active.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    Recorded,
    Forward(String),
    Ignored,
}

/// Per-token bindings. Only this type reads or writes them.
#[derive(Debug, Default)]
pub struct RouteResolver {
    bindings: HashMap<String, RouteBinding>,
}

impl RouteResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_mcp(&mut self, token: &str, connection_id: &str) {
        self.bindings.entry(token.to_string()).or_default().mcp = Some(connection_id.to_string());
    }

    pub fn record_active(&mut self, token: &str, connection_id: &str) {
        self.bindings.entry(token.to_string()).or_default().last_active =
            Some(connection_id.to_string());
    }

    pub fn resolve_pull(&self, token: &str) -> Option<&str> {
        self.bindings
            .get(token)
            .and_then(|binding| binding.last_active.as_deref())
    }

    pub fn resolve_push(&self, token: &str) -> Option<&str> {
        self.bindings
            .get(token)
            .and_then(|binding| binding.mcp.as_deref())
    }

    /// Clears whichever slots of `token` point at `connection_id`. Returns
    /// true when something was cleared.
    pub fn clear(&mut self, token: &str, connection_id: &str) -> bool {
        let Some(binding) = self.bindings.get_mut(token) else {
            return false;
        };
        let mut cleared = false;
        if binding.mcp.as_deref() == Some(connection_id) {
            binding.mcp = None;
            cleared = true;
        }
        if binding.last_active.as_deref() == Some(connection_id) {
            binding.last_active = None;
            cleared = true;
        }
        if binding.is_empty() {
            self.bindings.remove(token);
        }
        cleared
    }

    pub fn binding(&self, token: &str) -> Option<&RouteBinding> {
        self.bindings.get(token)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn route(
        &mut self,
        token: &str,
        sender_id: &str,
        sender_role: Role,
        class: MessageClass,
        kind: &str,
    ) -> Result<RouteDecision, RelayError> {
        let target = match class {
            MessageClass::StateAnnouncement => {
                if sender_role == Role::Mcp {
                    return Ok(RouteDecision::Ignored);
                }
                self.record_active(token, sender_id);
                return Ok(RouteDecision::Recorded);
            }
            MessageClass::Pull => self.resolve_pull(token),
            MessageClass::Push => self.resolve_push(token),
        };
        match target {
            Some(id) if id != sender_id => Ok(RouteDecision::Forward(id.to_string())),
            Some(_) => Ok(RouteDecision::Ignored),
            None => Err(RelayError::RouteNotFound {
                token: token.to_string(),
                kind: kind.to_string(),
            }),
        }
    }
}
