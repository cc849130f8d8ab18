//! In-memory node/hook topology of the loopback engine.
//!
//! Node 1 is the client's socket node (`.`). Every other node is a `hub`,
//! which copies each frame arriving on one hook to all of its other hooks.

use std::collections::BTreeMap;

use crate::types::{EngineErrno, HookName, NodeName, TypeName};
use crate::wire::ControlCommand;

pub type NodeId = u32;

/// Id of the client's socket node.
pub const CLIENT: NodeId = 1;

/// Hub-to-hub forwarding depth after which frames are dropped.
const MAX_HOPS: usize = 16;

type EngineResult<T> = std::result::Result<T, EngineErrno>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Socket,
    Hub,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Peer {
    node: NodeId,
    hook: HookName,
}

#[derive(Debug)]
struct Node {
    name: Option<NodeName>,
    kind: NodeKind,
    hooks: BTreeMap<HookName, Peer>,
    persistent: bool,
}

impl Node {
    fn new(kind: NodeKind) -> Self {
        Self {
            name: None,
            kind,
            hooks: BTreeMap::new(),
            persistent: false,
        }
    }
}

#[derive(Debug)]
pub struct Graph {
    nodes: BTreeMap<NodeId, Node>,
    next_id: NodeId,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(CLIENT, Node::new(NodeKind::Socket));
        Self {
            nodes,
            next_id: CLIENT + 1,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn kind(&self, id: NodeId) -> Option<NodeKind> {
        self.nodes.get(&id).map(|n| n.kind)
    }

    /// Printable absolute path of a node: `name:` or `[id]:`.
    pub fn display_path(&self, id: NodeId) -> String {
        match self.nodes.get(&id).and_then(|n| n.name.as_ref()) {
            Some(name) => format!("{}:", name),
            None => format!("[{:x}]:", id),
        }
    }

    /// Resolve `path` as seen from `origin`.
    ///
    /// `.` is the origin, `name:` and `[id]:` are absolute, and whatever
    /// follows (or a path without `:`) is a `.`-separated list of hooks to
    /// traverse.
    pub fn resolve_from(&self, origin: NodeId, path: &str) -> EngineResult<NodeId> {
        let (mut node, rest) = match path.split_once(':') {
            Some((base, rest)) => (self.resolve_base(origin, base)?, rest),
            None => (origin, path),
        };
        for hop in rest.split('.').filter(|s| !s.is_empty()) {
            node = self
                .nodes
                .get(&node)
                .and_then(|n| n.hooks.get(hop))
                .map(|peer| peer.node)
                .ok_or(EngineErrno::NotFound)?;
        }
        Ok(node)
    }

    fn resolve_base(&self, origin: NodeId, base: &str) -> EngineResult<NodeId> {
        if base == "." || base.is_empty() {
            return Ok(origin);
        }
        if let Some(hex) = base.strip_prefix('[').and_then(|b| b.strip_suffix(']')) {
            let id = NodeId::from_str_radix(hex, 16).map_err(|_| EngineErrno::InvalidArgument)?;
            return if self.nodes.contains_key(&id) {
                Ok(id)
            } else {
                Err(EngineErrno::NotFound)
            };
        }
        self.nodes
            .iter()
            .find(|(_, n)| n.name.as_ref().is_some_and(|name| name.as_str() == base))
            .map(|(id, _)| *id)
            .ok_or(EngineErrno::NotFound)
    }

    /// Apply a control command addressed to `path` (relative to the client).
    pub fn apply(&mut self, path: &str, command: &ControlCommand) -> EngineResult<()> {
        let node = self.resolve_from(CLIENT, path)?;
        match command {
            ControlCommand::Connect {
                our_hook,
                peer_path,
                peer_hook,
            } => {
                let peer = self.resolve_from(node, peer_path.as_str())?;
                self.link(node, our_hook, peer, peer_hook)
            }
            ControlCommand::MkPeer {
                our_hook,
                peer_type,
                peer_hook,
            } => self.mkpeer(node, our_hook, peer_type, peer_hook),
            ControlCommand::RmHook { our_hook } => {
                self.rmhook(node, our_hook.as_str());
                Ok(())
            }
            ControlCommand::Name { name } => self.name(node, name),
            ControlCommand::Shutdown => {
                self.shutdown(node);
                Ok(())
            }
        }
    }

    fn has_hook(&self, node: NodeId, hook: &str) -> bool {
        self.nodes
            .get(&node)
            .is_some_and(|n| n.hooks.contains_key(hook))
    }

    fn link(
        &mut self,
        a: NodeId,
        a_hook: &HookName,
        b: NodeId,
        b_hook: &HookName,
    ) -> EngineResult<()> {
        if self.has_hook(a, a_hook.as_str())
            || self.has_hook(b, b_hook.as_str())
            || (a == b && a_hook == b_hook)
        {
            return Err(EngineErrno::AlreadyExists);
        }
        let a_node = self.nodes.get_mut(&a).ok_or(EngineErrno::NotFound)?;
        a_node.hooks.insert(
            a_hook.clone(),
            Peer {
                node: b,
                hook: b_hook.clone(),
            },
        );
        let b_node = self.nodes.get_mut(&b).ok_or(EngineErrno::NotFound)?;
        b_node.hooks.insert(
            b_hook.clone(),
            Peer {
                node: a,
                hook: a_hook.clone(),
            },
        );
        Ok(())
    }

    fn mkpeer(
        &mut self,
        node: NodeId,
        our_hook: &HookName,
        peer_type: &TypeName,
        peer_hook: &HookName,
    ) -> EngineResult<()> {
        if peer_type.as_str() != "hub" {
            return Err(EngineErrno::NoSuchType);
        }
        if self.has_hook(node, our_hook.as_str()) {
            return Err(EngineErrno::AlreadyExists);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.nodes.insert(id, Node::new(NodeKind::Hub));
        self.link(node, our_hook, id, peer_hook)
    }

    fn name(&mut self, node: NodeId, name: &NodeName) -> EngineResult<()> {
        let taken = self
            .nodes
            .iter()
            .any(|(id, n)| *id != node && n.name.as_ref() == Some(name));
        if taken {
            return Err(EngineErrno::AddressInUse);
        }
        let n = self.nodes.get_mut(&node).ok_or(EngineErrno::NotFound)?;
        n.name = Some(name.clone());
        Ok(())
    }

    /// Disconnect `hook` on `node`; missing hooks are ignored.
    fn rmhook(&mut self, node: NodeId, hook: &str) {
        let Some(peer) = self.nodes.get_mut(&node).and_then(|n| n.hooks.remove(hook)) else {
            return;
        };
        if let Some(p) = self.nodes.get_mut(&peer.node) {
            p.hooks.remove(&peer.hook);
        }
        self.reap(node);
        self.reap(peer.node);
    }

    /// Hubs without hooks go away unless marked persistent.
    fn reap(&mut self, node: NodeId) {
        let idle = self
            .nodes
            .get(&node)
            .is_some_and(|n| n.kind == NodeKind::Hub && n.hooks.is_empty() && !n.persistent);
        if idle {
            tracing::debug!("Hub {} lost its last hook, shutting down", self.display_path(node));
            self.nodes.remove(&node);
        }
    }

    fn shutdown(&mut self, node: NodeId) {
        let hooks: Vec<HookName> = match self.nodes.get(&node) {
            Some(n) => n.hooks.keys().cloned().collect(),
            None => return,
        };
        if node != CLIENT {
            // Keep the hub from reaping itself halfway through.
            if let Some(n) = self.nodes.get_mut(&node) {
                n.persistent = true;
            }
        }
        for hook in hooks {
            self.rmhook(node, hook.as_str());
        }
        if node != CLIENT {
            self.nodes.remove(&node);
        }
    }

    /// Interpret a text command; only hubs understand `setpersistent`.
    pub fn text(&mut self, path: &str, text: &str) -> EngineResult<NodeId> {
        let node = self.resolve_from(CLIENT, path)?;
        let n = self.nodes.get_mut(&node).ok_or(EngineErrno::NotFound)?;
        match (n.kind, text.trim()) {
            (NodeKind::Hub, "setpersistent") => {
                n.persistent = true;
                Ok(node)
            }
            _ => Err(EngineErrno::InvalidArgument),
        }
    }

    /// Client hooks a frame sent out of client hook `hook` arrives on.
    pub fn route(&self, hook: &str) -> EngineResult<Vec<HookName>> {
        let peer = self
            .nodes
            .get(&CLIENT)
            .and_then(|n| n.hooks.get(hook))
            .ok_or(EngineErrno::NotConnected)?;
        let mut out = Vec::new();
        self.deliver(peer, 0, &mut out);
        Ok(out)
    }

    fn deliver(&self, at: &Peer, hops: usize, out: &mut Vec<HookName>) {
        let Some(node) = self.nodes.get(&at.node) else {
            return;
        };
        match node.kind {
            NodeKind::Socket => out.push(at.hook.clone()),
            NodeKind::Hub => {
                if hops >= MAX_HOPS {
                    tracing::warn!("Dropping frame after {} hub hops", hops);
                    return;
                }
                for (hook, next) in &node.hooks {
                    if *hook != at.hook {
                        self.deliver(next, hops + 1, out);
                    }
                }
            }
        }
    }
}
