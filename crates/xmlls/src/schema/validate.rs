//
// schema/validate.rs
//
// Instance validation against a compiled schema
//

use std::collections::{HashMap, HashSet};

use super::{ElementId, Particle, Schema, TypeId, TypeKind};
use crate::xml::{self, Element, ExpandedName, NamedNode, NodeId, XmlDocument, XmlError};

/// One schema violation found in a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
    /// Specific explanation, when one is available
    pub reason: Option<String>,
    /// 1-based source line of the offending element
    pub line: Option<usize>,
    /// The element whose content or attributes failed validation
    pub parent: Option<NodeId>,
}

/// A parsed document together with every violation found in it
#[derive(Debug)]
pub struct ValidationOutcome {
    pub document: XmlDocument,
    pub errors: Vec<ValidationError>,
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

impl Schema {
    /// Validate `content`. Un-namespaced elements are additionally matched as
    /// if they belonged to `default_namespace`.
    ///
    /// Malformed XML is returned as an error rather than a validation error.
    pub fn validate(
        &self,
        content: &str,
        default_namespace: Option<&str>,
    ) -> Result<ValidationOutcome, XmlError> {
        let document = xml::parse(content)?;
        let mut validator = Validator {
            schema: self,
            default_namespace,
            errors: Vec::new(),
        };
        validator.validate_root(document.root());
        let errors = validator.errors;
        Ok(ValidationOutcome { document, errors })
    }

    /// Content model of a type including everything inherited by extension
    pub fn effective_content(&self, type_id: TypeId) -> Option<Particle> {
        let mut parts = Vec::new();
        for id in self.type_chain(type_id) {
            let def = &self.types[id];
            if let Some(content) = &def.content {
                parts.push(content.clone());
            }
            if def.derivation != super::Derivation::Extension {
                break;
            }
        }
        match parts.len() {
            0 => None,
            1 => parts.pop(),
            _ => {
                parts.reverse();
                Some(Particle::Sequence {
                    items: parts,
                    occurs: super::Occurs::ONCE,
                })
            }
        }
    }

    fn required_attributes(&self, type_id: TypeId) -> Vec<&ExpandedName> {
        self.type_chain(type_id)
            .into_iter()
            .flat_map(|id| self.types[id].required_attributes.iter())
            .collect()
    }
}

struct Validator<'s> {
    schema: &'s Schema,
    default_namespace: Option<&'s str>,
    errors: Vec<ValidationError>,
}

impl Validator<'_> {
    fn effective_name(&self, element: Element<'_>) -> ExpandedName {
        match (element.namespace(), self.default_namespace) {
            (None, Some(ns)) => ExpandedName::new(Some(ns), element.local_name()),
            _ => element.expanded_name().clone(),
        }
    }

    fn matches(&self, element: Element<'_>, decl: ElementId) -> bool {
        let declared = &self.schema.element(decl).name;
        declared == element.expanded_name() || *declared == self.effective_name(element)
    }

    fn validate_root(&mut self, root: Element<'_>) {
        let name = self.effective_name(root);
        let decl = self
            .schema
            .global_element(&name)
            .or_else(|| self.schema.global_element(root.expanded_name()));
        match decl {
            Some(decl) => self.validate_element(root, decl),
            None => self.errors.push(ValidationError {
                message: format!("failed validating <{}>", name),
                reason: Some(format!("'{}' is not an element of the schema", name)),
                line: Some(root.line()),
                parent: None,
            }),
        }
    }

    fn validate_element(&mut self, element: Element<'_>, decl: ElementId) {
        let Some(type_id) = self.schema.element(decl).type_id else {
            return;
        };
        let def = self.schema.type_def(type_id);
        let name = self.effective_name(element);

        for required in self.schema.required_attributes(type_id) {
            if element
                .attribute(required.namespace.as_deref(), &required.local)
                .is_none()
            {
                self.errors.push(ValidationError {
                    message: format!("failed validating <{}>", name),
                    reason: Some(format!("missing required attribute '{}'", required)),
                    line: Some(element.line()),
                    parent: Some(element.id()),
                });
            }
        }

        if def.kind == TypeKind::Simple {
            if let Some(first) = element.child(0) {
                self.errors.push(ValidationError {
                    message: format!("failed validating <{}>", name),
                    reason: Some(format!(
                        "Element '{}' has a simple type and cannot contain child elements.",
                        name
                    )),
                    line: Some(first.line()),
                    parent: Some(element.id()),
                });
            }
            return;
        }

        let content = self.schema.effective_content(type_id);
        let children: Vec<Element<'_>> = element.children().collect();
        let empty = Particle::Sequence {
            items: Vec::new(),
            occurs: super::Occurs::ONCE,
        };
        let model = content.as_ref().unwrap_or(&empty);

        let mut matcher = Matcher::new(self, &children);
        let ends = matcher.particle(model, 0);
        let furthest = matcher.furthest;

        if !ends.contains(children.len()) {
            let reason = if furthest < children.len() {
                format!(
                    "Unexpected child with tag '{}' at position {}.",
                    self.effective_name(children[furthest]),
                    furthest + 1
                )
            } else {
                format!("The content of element '{}' is not complete.", name)
            };
            self.errors.push(ValidationError {
                message: format!("failed validating <{}> with its content model", name),
                reason: Some(reason),
                line: Some(element.line()),
                parent: Some(element.id()),
            });
        }

        let decls = model.element_decls();
        let lax = model.has_wildcard();
        for child in children {
            let child_decl = decls
                .iter()
                .copied()
                .find(|&d| self.matches(child, d))
                .or_else(|| {
                    lax.then(|| {
                        self.schema
                            .global_element(&self.effective_name(child))
                            .or_else(|| self.schema.global_element(child.expanded_name()))
                    })
                    .flatten()
                });
            if let Some(child_decl) = child_decl {
                self.validate_element(child, child_decl);
            }
        }
    }
}

/// Set of child positions, stored as a bitmap over the words it spans
#[derive(Debug, Clone, Default)]
struct Positions {
    /// Index of the first word in `words`
    base: usize,
    words: Vec<u64>,
}

impl Positions {
    fn single(pos: usize) -> Self {
        Self {
            base: pos / 64,
            words: vec![1u64 << (pos % 64)],
        }
    }

    fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    fn contains(&self, pos: usize) -> bool {
        (pos / 64)
            .checked_sub(self.base)
            .and_then(|i| self.words.get(i))
            .is_some_and(|w| *w & (1u64 << (pos % 64)) != 0)
    }

    /// Grow the bitmap so it covers words `lo..=hi`
    fn cover(&mut self, lo: usize, hi: usize) {
        if self.words.is_empty() {
            self.base = lo;
            self.words = vec![0; hi - lo + 1];
            return;
        }
        if lo < self.base {
            let mut grown = vec![0; self.base - lo];
            grown.extend_from_slice(&self.words);
            self.words = grown;
            self.base = lo;
        }
        if hi >= self.base + self.words.len() {
            self.words.resize(hi - self.base + 1, 0);
        }
    }

    /// Add every position of `other`, returning the ones that were new
    fn union_new(&mut self, other: &Positions) -> Vec<usize> {
        let mut added = Vec::new();
        if other.words.is_empty() {
            return added;
        }
        self.cover(other.base, other.base + other.words.len() - 1);
        let offset = other.base - self.base;
        for (i, word) in other.words.iter().enumerate() {
            let slot = &mut self.words[offset + i];
            let mut fresh = *word & !*slot;
            *slot |= *word;
            while fresh != 0 {
                let bit = fresh.trailing_zeros() as usize;
                added.push((other.base + i) * 64 + bit);
                fresh &= fresh - 1;
            }
        }
        added
    }

    fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(move |(i, &word)| {
            let base = (self.base + i) * 64;
            let mut rest = word;
            std::iter::from_fn(move || {
                if rest == 0 {
                    return None;
                }
                let bit = rest.trailing_zeros() as usize;
                rest &= rest - 1;
                Some(base + bit)
            })
        })
    }
}

/// Set-of-positions matcher: each step maps a child index to every index
/// reachable after consuming one particle. Results are memoized per
/// particle and start index, so nested unbounded groups stay polynomial.
struct Matcher<'v, 's, 'c, 'd> {
    validator: &'v Validator<'s>,
    children: &'c [Element<'d>],
    /// Highest child count consumed along any path
    furthest: usize,
    /// `(particle address, start)` to the ends of all its repetitions
    repeated: HashMap<(usize, usize), Positions>,
    /// `(group address, start)` to the ends of a single occurrence
    single: HashMap<(usize, usize), Positions>,
}

impl<'v, 's, 'c, 'd> Matcher<'v, 's, 'c, 'd> {
    fn new(validator: &'v Validator<'s>, children: &'c [Element<'d>]) -> Self {
        Self {
            validator,
            children,
            furthest: 0,
            repeated: HashMap::new(),
            single: HashMap::new(),
        }
    }

    fn particle(&mut self, particle: &Particle, start: usize) -> Positions {
        let key = (particle as *const Particle as usize, start);
        if let Some(hit) = self.repeated.get(&key) {
            return hit.clone();
        }
        let ends = self.repeat(particle, start);
        self.repeated.insert(key, ends.clone());
        ends
    }

    fn repeat(&mut self, particle: &Particle, start: usize) -> Positions {
        let occurs = particle.occurs();
        let mut result = Positions::default();
        let mut frontier = Positions::single(start);
        let mut count = 0u32;

        loop {
            if count >= occurs.min {
                let added = result.union_new(&frontier);
                if occurs.max.is_none() {
                    // Past the minimum an unbounded particle reaches the
                    // closure of the frontier.
                    let mut pending = added;
                    while let Some(pos) = pending.pop() {
                        let next = self.once(particle, pos);
                        pending.extend(result.union_new(&next));
                    }
                    return result;
                }
                // Positions already reached with fewer occurrences have
                // already been extended with a larger budget.
                if added.is_empty() && count > occurs.min {
                    return result;
                }
            }
            if occurs.max.is_some_and(|max| count >= max) {
                return result;
            }

            let mut next = Positions::default();
            for pos in frontier.iter() {
                next.union_new(&self.once(particle, pos));
            }
            if next.is_empty() {
                return result;
            }
            frontier = next;
            count += 1;
        }
    }

    fn once(&mut self, particle: &Particle, pos: usize) -> Positions {
        match particle {
            Particle::Element { decl, .. } => {
                let matched = self
                    .children
                    .get(pos)
                    .is_some_and(|child| self.validator.matches(*child, *decl));
                if matched {
                    self.consumed(pos)
                } else {
                    Positions::default()
                }
            }
            Particle::Any { .. } => {
                if pos < self.children.len() {
                    self.consumed(pos)
                } else {
                    Positions::default()
                }
            }
            _ => {
                let key = (particle as *const Particle as usize, pos);
                if let Some(hit) = self.single.get(&key) {
                    return hit.clone();
                }
                let ends = self.group(particle, pos);
                self.single.insert(key, ends.clone());
                ends
            }
        }
    }

    fn group(&mut self, particle: &Particle, pos: usize) -> Positions {
        match particle {
            Particle::Sequence { items, .. } => {
                let mut positions = Positions::single(pos);
                for item in items {
                    let mut next = Positions::default();
                    for p in positions.iter() {
                        next.union_new(&self.particle(item, p));
                    }
                    if next.is_empty() {
                        return next;
                    }
                    positions = next;
                }
                positions
            }
            Particle::Choice { items, .. } => {
                let mut positions = Positions::default();
                for item in items {
                    positions.union_new(&self.particle(item, pos));
                }
                positions
            }
            Particle::All { items, .. } => self.all(items, pos),
            Particle::Element { .. } | Particle::Any { .. } => self.once(particle, pos),
        }
    }

    fn consumed(&mut self, pos: usize) -> Positions {
        self.furthest = self.furthest.max(pos + 1);
        Positions::single(pos + 1)
    }

    /// Each member at most once, in any order; required members must appear.
    fn all(&mut self, items: &[Particle], start: usize) -> Positions {
        let required: Vec<usize> = (0..items.len())
            .filter(|&i| items[i].occurs().min > 0)
            .collect();
        let mut result = Positions::default();
        let mut seen = HashSet::new();
        let mut pending = vec![(start, vec![false; items.len()])];

        while let Some((pos, used)) = pending.pop() {
            if !seen.insert((pos, used.clone())) {
                continue;
            }
            if required.iter().all(|&i| used[i]) {
                result.union_new(&Positions::single(pos));
            }
            for (i, item) in items.iter().enumerate() {
                if used[i] {
                    continue;
                }
                for next in self.particle(item, pos).iter() {
                    let mut marked = used.clone();
                    marked[i] = true;
                    pending.push((next, marked));
                }
            }
        }
        result
    }
}
