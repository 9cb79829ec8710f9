//! Explicit module tree with path-addressed mutation.
//!
//! Paths are dot-separated child names, so `layers.0.self_attn` names the
//! `self_attn` child of the `0` child of the `layers` container. The root
//! itself has the empty path. Enumeration is a plain depth-first walk in
//! insertion order; replacement resolves the parent container from the path
//! prefix and swaps a single child in place.

use attention::FusedSelfAttention;
use quant::QuantLinear;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TreeError {
    #[error("no module at path `{0}`")]
    PathNotFound(String),
    #[error("module at `{0}` is not a container")]
    NotAContainer(String),
    #[error("container already has a child named `{0}`")]
    DuplicateChild(String),
}

/// Unfused attention weights as discovered in a loaded checkpoint.
///
/// This node is a holder for the pieces the fusion pass consumes: the three
/// separate projections, the output projection, the rotary provider, and
/// the geometry. Fusion replaces it with a [`FusedSelfAttention`].
#[derive(Debug, Clone)]
pub struct SelfAttention {
    pub config: attention::AttentionConfig,
    pub q_proj: QuantLinear,
    pub k_proj: QuantLinear,
    pub v_proj: QuantLinear,
    pub o_proj: QuantLinear,
    pub rotary: rotary::RotaryEmbedding,
}

/// One node of the model tree.
#[derive(Debug)]
pub enum Module {
    /// Interior node holding named children.
    Container(Container),
    /// Unfused attention weights, a candidate for the fusion pass.
    Attention(Box<SelfAttention>),
    /// Fused attention operator produced by the fusion pass.
    FusedAttention(Box<FusedSelfAttention>),
    /// Any other projection the fusion pass must leave untouched.
    Linear(QuantLinear),
}

/// Interior tree node with ordered, named children.
#[derive(Debug, Default)]
pub struct Container {
    children: Vec<(String, Module)>,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a child, rejecting duplicate names.
    pub fn insert(&mut self, name: impl Into<String>, module: Module) -> Result<(), TreeError> {
        let name = name.into();
        if self.children.iter().any(|(existing, _)| *existing == name) {
            return Err(TreeError::DuplicateChild(name));
        }
        self.children.push((name, module));
        Ok(())
    }

    pub fn child(&self, name: &str) -> Option<&Module> {
        self.children
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, module)| module)
    }

    fn child_mut(&mut self, name: &str) -> Option<&mut Module> {
        self.children
            .iter_mut()
            .find(|(existing, _)| existing == name)
            .map(|(_, module)| module)
    }

    /// Swap the named child, returning the previous module.
    pub fn replace_child(&mut self, name: &str, module: Module) -> Result<Module, TreeError> {
        let slot = self
            .children
            .iter_mut()
            .find(|(existing, _)| existing == name)
            .map(|(_, module)| module)
            .ok_or_else(|| TreeError::PathNotFound(name.to_string()))?;
        Ok(std::mem::replace(slot, module))
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Module)> {
        self.children
            .iter()
            .map(|(name, module)| (name.as_str(), module))
    }
}

impl Module {
    /// Depth-first enumeration of `(path, module)` pairs, the root first
    /// with an empty path, children in insertion order.
    pub fn named_modules(&self) -> Vec<(String, &Module)> {
        let mut out = Vec::new();
        self.collect("", &mut out);
        out
    }

    fn collect<'a>(&'a self, path: &str, out: &mut Vec<(String, &'a Module)>) {
        out.push((path.to_string(), self));
        if let Module::Container(container) = self {
            for (name, child) in container.iter() {
                let child_path = if path.is_empty() {
                    name.to_string()
                } else {
                    format!("{path}.{name}")
                };
                child.collect(&child_path, out);
            }
        }
    }

    /// Resolve a path to a node. The empty path is the root.
    pub fn get(&self, path: &str) -> Option<&Module> {
        if path.is_empty() {
            return Some(self);
        }
        let mut node = self;
        for segment in path.split('.') {
            match node {
                Module::Container(container) => node = container.child(segment)?,
                _ => return None,
            }
        }
        Some(node)
    }

    fn get_mut(&mut self, path: &str) -> Option<&mut Module> {
        if path.is_empty() {
            return Some(self);
        }
        let mut node = self;
        for segment in path.split('.') {
            match node {
                Module::Container(container) => node = container.child_mut(segment)?,
                _ => return None,
            }
        }
        Some(node)
    }

    /// Replace the node at `path`, returning the module it displaced.
    ///
    /// The last path component names the child to swap; everything before
    /// the final separator names the parent, and an empty prefix means the
    /// child hangs directly off the root.
    pub fn replace(&mut self, path: &str, module: Module) -> Result<Module, TreeError> {
        if path.is_empty() {
            return Err(TreeError::PathNotFound(String::new()));
        }
        let (parent_path, child_name) = match path.rsplit_once('.') {
            Some((parent, child)) => (parent, child),
            None => ("", path),
        };
        let parent = self
            .get_mut(parent_path)
            .ok_or_else(|| TreeError::PathNotFound(parent_path.to_string()))?;
        match parent {
            Module::Container(container) => container
                .replace_child(child_name, module)
                .map_err(|_| TreeError::PathNotFound(path.to_string())),
            _ => Err(TreeError::NotAContainer(parent_path.to_string())),
        }
    }
}
