//
// schema/mod.rs
//
// Compiled XML Schema model: element declarations, types, content models
//

mod loader;
mod validate;

use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use crate::xml::{ExpandedName, NamedNode};

pub use validate::{ValidationError, ValidationOutcome};

pub const XSD_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema";

pub type ElementId = usize;
pub type TypeId = usize;

/// Occurrence bounds of a particle; `max == None` is unbounded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occurs {
    pub min: u32,
    pub max: Option<u32>,
}

impl Occurs {
    pub const ONCE: Occurs = Occurs {
        min: 1,
        max: Some(1),
    };
    pub const ANY: Occurs = Occurs { min: 0, max: None };
}

impl Default for Occurs {
    fn default() -> Self {
        Self::ONCE
    }
}

/// A node of a content model
#[derive(Debug, Clone, PartialEq)]
pub enum Particle {
    Element { decl: ElementId, occurs: Occurs },
    Sequence { items: Vec<Particle>, occurs: Occurs },
    Choice { items: Vec<Particle>, occurs: Occurs },
    All { items: Vec<Particle>, occurs: Occurs },
    /// `xs:any` wildcard
    Any { occurs: Occurs },
}

impl Particle {
    pub fn occurs(&self) -> Occurs {
        match self {
            Particle::Element { occurs, .. }
            | Particle::Sequence { occurs, .. }
            | Particle::Choice { occurs, .. }
            | Particle::All { occurs, .. }
            | Particle::Any { occurs } => *occurs,
        }
    }

    /// Every element declaration reachable in this particle, in document order
    pub fn element_decls(&self) -> Vec<ElementId> {
        let mut out = Vec::new();
        self.collect_decls(&mut out);
        out
    }

    fn collect_decls(&self, out: &mut Vec<ElementId>) {
        match self {
            Particle::Element { decl, .. } => out.push(*decl),
            Particle::Sequence { items, .. }
            | Particle::Choice { items, .. }
            | Particle::All { items, .. } => {
                for item in items {
                    item.collect_decls(out);
                }
            }
            Particle::Any { .. } => {}
        }
    }

    pub fn has_wildcard(&self) -> bool {
        match self {
            Particle::Any { .. } => true,
            Particle::Element { .. } => false,
            Particle::Sequence { items, .. }
            | Particle::Choice { items, .. }
            | Particle::All { items, .. } => items.iter().any(Particle::has_wildcard),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Simple,
    Complex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Derivation {
    None,
    Extension,
    Restriction,
}

/// A simple or complex type definition
#[derive(Debug, Clone)]
pub struct TypeDef {
    pub name: Option<ExpandedName>,
    pub kind: TypeKind,
    pub base: Option<TypeId>,
    pub derivation: Derivation,
    /// Element content model; `None` for simple, text-only or empty content
    pub content: Option<Particle>,
    pub mixed: bool,
    pub required_attributes: Vec<ExpandedName>,
}

impl TypeDef {
    pub(crate) fn simple(name: Option<ExpandedName>) -> Self {
        Self {
            name,
            kind: TypeKind::Simple,
            base: None,
            derivation: Derivation::None,
            content: None,
            mixed: false,
            required_attributes: Vec::new(),
        }
    }

    pub fn is_complex(&self) -> bool {
        self.kind == TypeKind::Complex
    }
}

/// An element declaration (global or local)
#[derive(Debug, Clone)]
pub struct ElementDecl {
    pub name: ExpandedName,
    pub type_id: Option<TypeId>,
    pub is_global: bool,
}

impl NamedNode for ElementDecl {
    fn expanded_name(&self) -> &ExpandedName {
        &self.name
    }
}

/// A compiled schema
#[derive(Debug)]
pub struct Schema {
    path: PathBuf,
    target_namespace: Option<String>,
    elements: Vec<ElementDecl>,
    types: Vec<TypeDef>,
    globals: IndexMap<ExpandedName, ElementId>,
    root_elements: Vec<ElementId>,
}

impl Schema {
    /// Load and compile the schema at `path`, following `xs:include`s.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        loader::load(path)
    }

    /// Compile schema text; `location` anchors relative includes.
    pub fn parse(text: &str, location: &Path) -> anyhow::Result<Self> {
        loader::compile(text, location)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn target_namespace(&self) -> Option<&str> {
        self.target_namespace.as_deref()
    }

    pub fn element(&self, id: ElementId) -> &ElementDecl {
        &self.elements[id]
    }

    pub fn type_def(&self, id: TypeId) -> &TypeDef {
        &self.types[id]
    }

    /// The declared type of an element
    pub fn element_type(&self, id: ElementId) -> Option<&TypeDef> {
        self.elements[id].type_id.map(|t| &self.types[t])
    }

    pub fn global_element(&self, name: &ExpandedName) -> Option<ElementId> {
        self.globals.get(name).copied()
    }

    pub fn global_elements(&self) -> impl Iterator<Item = ElementId> + '_ {
        self.globals.values().copied()
    }

    /// Global elements that no other declaration references; every global
    /// element when that set would be empty.
    pub fn root_elements(&self) -> &[ElementId] {
        &self.root_elements
    }

    /// The type chain starting at `type_id` and following base types,
    /// stopping at the first repeated type.
    pub fn type_chain(&self, type_id: TypeId) -> Vec<TypeId> {
        let mut chain = Vec::new();
        let mut current = Some(type_id);
        while let Some(id) = current {
            if chain.contains(&id) {
                break;
            }
            chain.push(id);
            current = self.types[id].base;
        }
        chain
    }
}
