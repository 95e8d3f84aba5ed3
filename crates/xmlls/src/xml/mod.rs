//
// xml/mod.rs
//
// XML parsing: element trees with resolved namespaces and source lines
//

pub mod parser;
pub mod tree;

use std::fmt;

pub use parser::{parse, parse_recovering, XmlError};
pub use tree::{Attribute, Element, NodeId, XmlDocument};

pub const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";
pub const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

/// A namespace-qualified name. Displays in Clark notation (`{ns}local`),
/// or as the bare local name when there is no namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExpandedName {
    pub namespace: Option<String>,
    pub local: String,
}

impl ExpandedName {
    pub fn new(namespace: Option<&str>, local: &str) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string),
            local: local.to_string(),
        }
    }

    pub fn local(local: &str) -> Self {
        Self::new(None, local)
    }
}

impl fmt::Display for ExpandedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{{{}}}{}", ns, self.local),
            None => f.write_str(&self.local),
        }
    }
}

/// Anything that carries an element name: parsed document elements and
/// schema element declarations alike. Name extraction lives here once so
/// callers never care which side of the comparison they hold.
pub trait NamedNode {
    fn expanded_name(&self) -> &ExpandedName;

    fn local_name(&self) -> &str {
        &self.expanded_name().local
    }

    fn namespace(&self) -> Option<&str> {
        self.expanded_name().namespace.as_deref()
    }

    /// Local-name comparison that ignores namespaces
    fn has_local_name(&self, local: &str) -> bool {
        self.local_name() == local
    }
}

/// Split `prefix:local` into its parts
pub fn split_qname(raw: &str) -> (Option<&str>, &str) {
    match raw.split_once(':') {
        Some((prefix, local)) if !prefix.is_empty() && !local.is_empty() => (Some(prefix), local),
        _ => (None, raw),
    }
}
