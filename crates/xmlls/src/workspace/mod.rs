//
// workspace/mod.rs
//
// Per-root schema resolution and the schema cache shared by documents
//

pub mod locators;
pub mod path_resolve;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tower_lsp::lsp_types::Url;

use crate::config::LocatorConfig;
use crate::schema::Schema;
use crate::xml::parse_recovering;

pub use locators::{build_locators, LocatorInput, SchemaCandidate, SchemaLocator};

/// The schema governing one document
#[derive(Debug, Clone)]
pub struct SchemaBinding {
    pub path: PathBuf,
    pub schema: Arc<Schema>,
    /// Namespace assumed for un-namespaced elements, when the locator that
    /// found the schema asked for it
    pub default_namespace: Option<String>,
}

/// A workspace root with its locators and loaded schemas.
///
/// A schema file is loaded at most once and shared by every document bound
/// to it; it is unloaded when the last such document is released.
pub struct Workspace {
    root: Url,
    root_path: Option<PathBuf>,
    locators: Vec<Box<dyn SchemaLocator>>,
    schemas: HashMap<PathBuf, Arc<Schema>>,
    schema_for_uri: HashMap<Url, PathBuf>,
    default_namespaces: HashMap<PathBuf, String>,
    /// Schema paths that failed to load; not retried until reconfigured
    failed_loads: HashSet<PathBuf>,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("root", &self.root.as_str())
            .field("locators", &self.locators.len())
            .field("schemas", &self.schemas.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Workspace {
    pub fn new(root: Url, configs: &[LocatorConfig]) -> Self {
        let root_path = root.to_file_path().ok();
        let locators = build_locators(configs, root_path.as_deref());
        Self::with_locators(root, locators)
    }

    pub fn with_locators(root: Url, locators: Vec<Box<dyn SchemaLocator>>) -> Self {
        Self {
            root_path: root.to_file_path().ok(),
            root,
            locators,
            schemas: HashMap::new(),
            schema_for_uri: HashMap::new(),
            default_namespaces: HashMap::new(),
            failed_loads: HashSet::new(),
        }
    }

    pub fn root(&self) -> &Url {
        &self.root
    }

    pub fn root_path(&self) -> Option<&Path> {
        self.root_path.as_deref()
    }

    /// Replace the locators after a configuration change. Failed loads are
    /// forgotten so they get another attempt; existing bindings stay.
    pub fn reconfigure(&mut self, configs: &[LocatorConfig]) {
        self.locators = build_locators(configs, self.root_path.as_deref());
        self.failed_loads.clear();
    }

    /// Find the schema for `uri`, loading and caching it as needed.
    pub fn resolve(&mut self, uri: &Url, content: &str) -> Option<SchemaBinding> {
        let document = match parse_recovering(content) {
            Ok(document) => document,
            Err(err) => {
                log::info!("Could not parse {}: {}", uri, err);
                return None;
            }
        };

        if let Some(binding) = self.binding_for(uri) {
            return Some(binding);
        }

        if self.locators.is_empty() {
            log::warn!("No schema locators configured for {}", self.root);
        }

        let input = LocatorInput {
            uri,
            document: &document,
            workspace_root: self.root_path.as_deref(),
        };
        let candidate = self.locators.iter().find_map(|locator| {
            log::trace!("Trying locator {} for {}", locator.name(), uri);
            locator.locate(&input)
        });
        let Some(candidate) = candidate else {
            log::warn!("No schema located for {}", uri);
            return None;
        };

        let schema = self.load(&candidate.path)?;
        if candidate.use_default_namespace {
            if let Some(ns) = schema.target_namespace() {
                self.default_namespaces
                    .insert(candidate.path.clone(), ns.to_string());
            }
        }
        self.schema_for_uri
            .insert(uri.clone(), candidate.path.clone());
        self.binding_for(uri)
    }

    /// Load or reuse the schema at `path`. A load failure is remembered and
    /// yields `None` without consulting further locators.
    fn load(&mut self, path: &Path) -> Option<Arc<Schema>> {
        if let Some(schema) = self.schemas.get(path) {
            return Some(Arc::clone(schema));
        }
        if self.failed_loads.contains(path) {
            log::trace!("Skipping schema {} after an earlier failure", path.display());
            return None;
        }
        match Schema::load(path) {
            Ok(schema) => {
                log::info!("Successfully loaded schema {}", path.display());
                let schema = Arc::new(schema);
                self.schemas.insert(path.to_path_buf(), Arc::clone(&schema));
                Some(schema)
            }
            Err(err) => {
                log::error!("Failed to load schema {}: {:#}", path.display(), err);
                self.failed_loads.insert(path.to_path_buf());
                None
            }
        }
    }

    /// The binding currently recorded for `uri`, without running locators
    pub fn binding_for(&self, uri: &Url) -> Option<SchemaBinding> {
        let path = self.schema_for_uri.get(uri)?;
        let schema = self.schemas.get(path)?;
        Some(SchemaBinding {
            path: path.clone(),
            schema: Arc::clone(schema),
            default_namespace: self.default_namespaces.get(path).cloned(),
        })
    }

    /// Forget the binding of `uri`, unloading its schema when no other
    /// document uses it.
    pub fn release_document(&mut self, uri: &Url) {
        let Some(path) = self.schema_for_uri.remove(uri) else {
            return;
        };
        log::info!("Document {} no longer uses {}", uri, path.display());
        if self.schema_for_uri.values().any(|p| *p == path) {
            return;
        }
        if self.schemas.remove(&path).is_some() {
            log::info!("Removed schema {} from cache", path.display());
        }
        self.default_namespaces.remove(&path);
    }

    pub fn loaded_schema_count(&self) -> usize {
        self.schemas.len()
    }

    pub fn bound_document_count(&self) -> usize {
        self.schema_for_uri.len()
    }

    /// Depth of the root directory when it contains `path`
    fn contains_path(&self, path: &Path) -> Option<usize> {
        let root = self.root_path.as_deref()?;
        path.starts_with(root).then(|| root.components().count())
    }
}

/// Every workspace of the session, keyed by root URI
#[derive(Debug, Default)]
pub struct WorkspaceRegistry {
    workspaces: Vec<Workspace>,
}

impl WorkspaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a workspace; a root that is already registered is kept as is.
    pub fn add(&mut self, workspace: Workspace) {
        if self.workspaces.iter().any(|w| w.root == workspace.root) {
            return;
        }
        log::info!("Workspace root: {}", workspace.root);
        self.workspaces.push(workspace);
    }

    pub fn remove(&mut self, root: &Url) -> Option<Workspace> {
        let index = self.workspaces.iter().position(|w| w.root == *root)?;
        Some(self.workspaces.remove(index))
    }

    /// The workspace whose root is the longest prefix of the document's path
    pub fn for_document(&self, uri: &Url) -> Option<&Workspace> {
        let index = self.index_for(uri)?;
        self.workspaces.get(index)
    }

    pub fn for_document_mut(&mut self, uri: &Url) -> Option<&mut Workspace> {
        let index = self.index_for(uri)?;
        self.workspaces.get_mut(index)
    }

    fn index_for(&self, uri: &Url) -> Option<usize> {
        let path = uri.to_file_path().ok()?;
        self.workspaces
            .iter()
            .enumerate()
            .filter_map(|(i, w)| w.contains_path(&path).map(|depth| (i, depth)))
            .max_by_key(|(_, depth)| *depth)
            .map(|(i, _)| i)
    }

    pub fn reconfigure(&mut self, configs: &[LocatorConfig]) {
        for workspace in &mut self.workspaces {
            workspace.reconfigure(configs);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Workspace> {
        self.workspaces.iter()
    }

    pub fn len(&self) -> usize {
        self.workspaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workspaces.is_empty()
    }
}
