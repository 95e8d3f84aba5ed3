//
// state.rs
//
// Copyright (C) 2024-2026 Posit Software, PBC. All rights reserved.
// Modifications copyright (C) 2026 Jonathan Marc Bearak
//

use serde_json::Value;
use tower_lsp::lsp_types::{Diagnostic, Position, Url};

use crate::completion_context::{resolve_context, CompletionContext};
use crate::config::{self, ServerSettings};
use crate::diagnostics::validate_document;
use crate::document_store::{DocumentStore, DocumentStoreConfig};
use crate::workspace::{SchemaBinding, Workspace, WorkspaceRegistry};

/// Everything the server knows: open documents, workspaces and settings.
///
/// Owned by the backend behind a single lock and handed to handlers by
/// reference.
#[derive(Debug)]
pub struct WorldState {
    pub sessions: DocumentStore,
    pub workspaces: WorkspaceRegistry,
    pub settings: ServerSettings,
}

impl Default for WorldState {
    fn default() -> Self {
        Self::new(ServerSettings::default())
    }
}

impl WorldState {
    pub fn new(settings: ServerSettings) -> Self {
        let sessions = DocumentStore::new(DocumentStoreConfig {
            max_sessions: settings.max_sessions,
            ttl: settings.session_ttl,
        });
        Self {
            sessions,
            workspaces: WorkspaceRegistry::new(),
            settings,
        }
    }

    pub fn add_workspace(&mut self, root: Url) {
        let workspace = Workspace::new(root, &self.settings.locators);
        self.workspaces.add(workspace);
    }

    /// Apply a `workspace/didChangeConfiguration` payload. Returns whether
    /// the locators changed.
    pub fn apply_configuration(&mut self, settings: &Value) -> bool {
        if let Some(ms) = settings.get("validationDelayMs").and_then(|v| v.as_u64()) {
            self.settings.validation_delay = std::time::Duration::from_millis(ms);
        }
        let Some(locators) = config::parse_locators(settings) else {
            log::trace!("Configuration change without schemaLocators, nothing to do");
            return false;
        };
        log::info!("Reconfiguring {} schema locator(s)", locators.len());
        self.workspaces.reconfigure(&locators);
        self.settings.locators = locators;
        true
    }

    /// Resolve the schema for `uri` in its workspace
    pub fn resolve_schema(&mut self, uri: &Url, content: &str) -> Option<SchemaBinding> {
        let Some(workspace) = self.workspaces.for_document_mut(uri) else {
            log::warn!("No workspace for {}", uri);
            return None;
        };
        workspace.resolve(uri, content)
    }

    /// The schema `uri` is currently bound to, without running locators
    pub fn bound_schema(&self, uri: &Url) -> Option<SchemaBinding> {
        self.workspaces.for_document(uri)?.binding_for(uri)
    }

    /// Validate the session content of `uri`.
    ///
    /// With `resolve` the schema is located first when the document is not
    /// yet bound; otherwise only an existing binding is used. Returns `None`
    /// when there is no session; an unbound document yields an empty set.
    pub fn validate(&mut self, uri: &Url, resolve: bool) -> Option<Vec<Diagnostic>> {
        let content = self.sessions.peek(uri)?.text();
        let binding = if resolve {
            self.resolve_schema(uri, &content)
        } else {
            self.bound_schema(uri)
        };

        let Some(binding) = binding else {
            log::trace!("No schema for {}, clearing diagnostics", uri);
            return Some(Vec::new());
        };
        Some(validate_document(
            &binding.schema,
            binding.default_namespace.as_deref(),
            &content,
        ))
    }

    /// Completion context at `position`, or `None` without a session or a
    /// schema.
    pub fn completion_context(&mut self, uri: &Url, position: Position) -> Option<CompletionContext> {
        let content = self.sessions.get(uri)?.text();
        let binding = self.resolve_schema(uri, &content)?;
        Some(resolve_context(
            &binding.schema,
            binding.default_namespace.as_deref(),
            &content,
            position,
        ))
    }

    /// Drop the session of `uri` and its schema binding
    pub fn close_document(&mut self, uri: &Url) {
        if !self.sessions.close(uri) {
            log::trace!("Closed {} without a session", uri);
        }
        if let Some(workspace) = self.workspaces.for_document_mut(uri) {
            workspace.release_document(uri);
        }
    }
}
