//! Hierarchical resource addresses.
//!
//! A [`Path`] is an optional context (the owning node) plus a list of
//! components. Two components have special meaning: [`WILDCARD`] matches any
//! single component, and [`WILDCARD_RECURSIVE`], which may only appear last,
//! matches any number of trailing components (including none).
//!
//! ```text
//! 0190c1d2...://players/alice/inventory
//! /players/*
//! /players/**
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TypeError;
use crate::node::NodeId;

/// Matches exactly one component.
pub const WILDCARD: &str = "*";

/// Matches every remaining component. Must be the final component.
pub const WILDCARD_RECURSIVE: &str = "**";

/// Separates the context from the components in the string form.
pub const CONTEXT_SEPARATOR: &str = "://";

/// Separates components in the string form.
pub const SEPARATOR: char = '/';

/// A hierarchical, optionally wildcarded address scoped to a node.
///
/// Equality, ordering and hashing are exact (wildcards compare literally);
/// use [`Path::matches`] and [`Path::covers`] for pattern semantics.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Path {
    context: Option<String>,
    components: Vec<String>,
}

impl Path {
    /// The root path: no context, no components.
    pub fn root() -> Self {
        Self {
            context: None,
            components: Vec::new(),
        }
    }

    /// Build a validated path from a context and components.
    pub fn new<I, S>(context: Option<String>, components: I) -> Result<Self, TypeError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let path = Self {
            context: context
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty()),
            components: components.into_iter().map(Into::into).collect(),
        };
        path.validate()?;
        Ok(path)
    }

    /// Build a context-free path from components.
    pub fn from_components<I, S>(components: I) -> Result<Self, TypeError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(None, components)
    }

    fn validate(&self) -> Result<(), TypeError> {
        let invalid = |reason: String| TypeError::InvalidPath {
            path: self.to_string(),
            reason,
        };

        if let Some(context) = &self.context {
            if context == WILDCARD_RECURSIVE {
                return Err(invalid("context cannot be a recursive wildcard".into()));
            }
            if context.contains(SEPARATOR) || context.chars().any(char::is_control) {
                return Err(invalid(format!("invalid context {context:?}")));
            }
        }

        let last = self.components.len().saturating_sub(1);
        for (index, component) in self.components.iter().enumerate() {
            if component.is_empty() {
                return Err(invalid("empty component".into()));
            }
            if component.contains(SEPARATOR) {
                return Err(invalid(format!("{component:?} contains a separator")));
            }
            if component.chars().any(char::is_control) {
                return Err(invalid(format!("{component:?} has invalid characters")));
            }
            if component == WILDCARD_RECURSIVE && index != last {
                return Err(invalid("recursive wildcard must be the last component".into()));
            }
        }

        Ok(())
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn has_context(&self) -> bool {
        self.context.is_some()
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// True if any component is a wildcard of either kind.
    pub fn is_wildcard(&self) -> bool {
        self.components
            .iter()
            .any(|c| c == WILDCARD || c == WILDCARD_RECURSIVE)
    }

    /// True if the last component is a single wildcard.
    pub fn is_wildcard_terminated(&self) -> bool {
        self.components.last().is_some_and(|c| c == WILDCARD)
    }

    pub fn is_wildcard_recursive(&self) -> bool {
        self.components.last().is_some_and(|c| c == WILDCARD_RECURSIVE)
    }

    /// The context parsed as a [`NodeId`], if present.
    pub fn node_id(&self) -> Result<Option<NodeId>, TypeError> {
        self.context.as_deref().map(str::parse).transpose()
    }

    /// Append one concrete or wildcard component.
    pub fn append_component(&self, component: impl Into<String>) -> Result<Path, TypeError> {
        let mut components = self.components.clone();
        components.push(component.into());
        Self::new(self.context.clone(), components)
    }

    /// Index of the last wildcard component, if any.
    fn last_wildcard_index(&self) -> Option<usize> {
        self.components
            .iter()
            .rposition(|c| c == WILDCARD || c == WILDCARD_RECURSIVE)
    }

    fn truncated(&self, len: usize) -> Path {
        Path {
            context: self.context.clone(),
            components: self.components[..len].to_vec(),
        }
    }

    /// Replace a trailing wildcard with a random UUID component.
    ///
    /// Paths that do not end in a wildcard are returned unchanged. Everything
    /// from the last wildcard onwards is dropped before the UUID is appended.
    pub fn append_uuid_if_wildcard(&self) -> Path {
        if !self.is_wildcard_terminated() && !self.is_wildcard_recursive() {
            return self.clone();
        }
        let mut path = self.truncated(self.last_wildcard_index().unwrap_or(self.len()));
        path.components.push(Uuid::now_v7().simple().to_string());
        path
    }

    /// The parent path, keeping the context. The root is its own parent.
    pub fn parent(&self) -> Path {
        self.truncated(self.len().saturating_sub(1))
    }

    /// The recursive form of this path: everything up to the last wildcard,
    /// followed by [`WILDCARD_RECURSIVE`].
    ///
    /// `/a/b` becomes `/a/b/**` and `/a/*/c` becomes `/a/**`. This is the
    /// canonical form used for locking since it covers every descendant.
    pub fn to_wildcard_recursive(&self) -> Path {
        if self.is_wildcard_recursive() {
            return self.clone();
        }
        let mut path = self.truncated(self.last_wildcard_index().unwrap_or(self.len()));
        path.components.push(WILDCARD_RECURSIVE.to_string());
        path
    }

    /// Drop a trailing [`WILDCARD_RECURSIVE`], if present.
    pub fn strip_wildcard_recursive(&self) -> Path {
        if self.is_wildcard_recursive() {
            self.parent()
        } else {
            self.clone()
        }
    }

    /// Return this path with the supplied context.
    ///
    /// Fails if the path already carries a different context.
    pub fn with_context(&self, context: &str) -> Result<Path, TypeError> {
        match self.context.as_deref() {
            Some(existing) if existing != context => Err(TypeError::InvalidPath {
                path: self.to_string(),
                reason: format!("context mismatch: expected {context}"),
            }),
            _ => Self::new(Some(context.to_string()), self.components.clone()),
        }
    }

    /// Return this path scoped to `node` unless it already has a context.
    pub fn with_node_if_absent(&self, node: &NodeId) -> Result<Path, TypeError> {
        match self.context {
            Some(_) => Ok(self.clone()),
            None => self.with_context(&node.to_string()),
        }
    }

    pub fn without_context(&self) -> Path {
        Path {
            context: None,
            components: self.components.clone(),
        }
    }

    /// Symmetric pattern match: true if some concrete path could satisfy both
    /// `self` and `other`. A single wildcard in either matches one component
    /// and a recursive wildcard in either matches the remainder.
    pub fn matches(&self, other: &Path) -> bool {
        contexts_match(self.context(), other.context())
            && components_match(&self.components, &other.components)
    }

    /// Asymmetric scope check: true if every path described by `requested` is
    /// also described by `self`.
    ///
    /// `/a/*` covers `/a/b` and `/a/*` but not `/a/**`, while `/a/**` covers
    /// all three.
    pub fn covers(&self, requested: &Path) -> bool {
        let context_covered = match (self.context(), requested.context()) {
            (Some(WILDCARD), _) => true,
            (declared, requested) => declared == requested,
        };
        context_covered && components_cover(&self.components, &requested.components)
    }
}

fn contexts_match(lhs: Option<&str>, rhs: Option<&str>) -> bool {
    lhs == Some(WILDCARD) || rhs == Some(WILDCARD) || lhs == rhs
}

fn components_match(lhs: &[String], rhs: &[String]) -> bool {
    match (lhs.split_first(), rhs.split_first()) {
        (Some((l, _)), _) if l == WILDCARD_RECURSIVE => true,
        (_, Some((r, _))) if r == WILDCARD_RECURSIVE => true,
        (None, None) => true,
        (Some((l, lt)), Some((r, rt))) => {
            (l == WILDCARD || r == WILDCARD || l == r) && components_match(lt, rt)
        }
        _ => false,
    }
}

fn components_cover(declared: &[String], requested: &[String]) -> bool {
    match (declared.split_first(), requested.split_first()) {
        (Some((d, _)), _) if d == WILDCARD_RECURSIVE => true,
        (None, None) => true,
        (Some((d, dt)), Some((r, rt))) => {
            r != WILDCARD_RECURSIVE && (d == WILDCARD || d == r) && components_cover(dt, rt)
        }
        _ => false,
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(context) = &self.context {
            write!(f, "{context}{CONTEXT_SEPARATOR}")?;
        } else {
            write!(f, "{SEPARATOR}")?;
        }
        write!(f, "{}", self.components.join("/"))
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Path({self})")
    }
}

impl FromStr for Path {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let split = |rest: &str| -> Vec<String> {
            rest.split(SEPARATOR)
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect()
        };

        match s.split_once(CONTEXT_SEPARATOR) {
            None => Self::new(None, split(s)),
            Some((context, rest)) => {
                if context.trim().is_empty() || rest.contains(CONTEXT_SEPARATOR) {
                    return Err(TypeError::InvalidPath {
                        path: s.to_string(),
                        reason: format!("expected exactly one {CONTEXT_SEPARATOR:?}"),
                    });
                }
                Self::new(Some(context.to_string()), split(rest))
            }
        }
    }
}

impl TryFrom<String> for Path {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Path> for String {
    fn from(value: Path) -> Self {
        value.to_string()
    }
}
