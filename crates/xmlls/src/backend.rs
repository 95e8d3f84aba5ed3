//
// backend.rs
//
// Copyright (C) 2022-2026 Posit Software, PBC. All rights reserved.
// Modifications copyright (C) 2026 Jonathan Marc Bearak
//

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tower_lsp::jsonrpc::Result;
use tower_lsp::lsp_types::*;
use tower_lsp::Client;
use tower_lsp::LanguageServer;
use tower_lsp::LspService;
use tower_lsp::Server;

use crate::completion_context::completion_items;
use crate::config::parse_settings;
use crate::content_provider::{ContentProvider, DiskContentProvider};
use crate::state::WorldState;

/// Sink for published diagnostics
#[async_trait]
pub trait DiagnosticsPublisher: Send + Sync + 'static {
    async fn publish(&self, uri: Url, diagnostics: Vec<Diagnostic>);
}

#[async_trait]
impl DiagnosticsPublisher for Client {
    async fn publish(&self, uri: Url, diagnostics: Vec<Diagnostic>) {
        self.publish_diagnostics(uri, diagnostics, None).await;
    }
}

pub struct Backend<P: DiagnosticsPublisher = Client> {
    publisher: Arc<P>,
    content: Arc<dyn ContentProvider>,
    state: Arc<RwLock<WorldState>>,
}

impl Backend<Client> {
    pub fn new(client: Client) -> Self {
        Self::with_publisher(client, Arc::new(DiskContentProvider))
    }
}

impl<P: DiagnosticsPublisher> Backend<P> {
    pub fn with_publisher(publisher: P, content: Arc<dyn ContentProvider>) -> Self {
        Self {
            publisher: Arc::new(publisher),
            content,
            state: Arc::new(RwLock::new(WorldState::default())),
        }
    }

    /// Shared state, for inspection by embedders and tests
    pub fn state(&self) -> Arc<RwLock<WorldState>> {
        Arc::clone(&self.state)
    }

    /// Validate `uri` now and publish the result
    async fn validate_now(&self, uri: &Url, resolve: bool) {
        let diagnostics = {
            let mut state = self.state.write().await;
            state.validate(uri, resolve)
        };
        match diagnostics {
            Some(diagnostics) => self.publisher.publish(uri.clone(), diagnostics).await,
            None => log::trace!("No session for {}, skipping validation", uri),
        }
    }

    /// Arm the trailing validation for `uri`, replacing any armed one. The
    /// task reads the session at fire time.
    async fn schedule_validation(&self, uri: &Url) {
        let (token, delay) = {
            let mut state = self.state.write().await;
            let delay = state.settings.validation_delay;
            match state.sessions.schedule_validation(uri) {
                Some(token) => (token, delay),
                None => return,
            }
        };
        log::trace!("Scheduled deferred validation for {} in {:?}", uri, delay);

        let state_arc = Arc::clone(&self.state);
        let publisher = Arc::clone(&self.publisher);
        let uri = uri.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => { return; }
                _ = tokio::time::sleep(delay) => {}
            }

            let diagnostics = {
                let mut state = state_arc.write().await;
                if token.is_cancelled() {
                    return;
                }
                state.sessions.complete_validation(&uri, &token);
                state.validate(&uri, false)
            };

            match diagnostics {
                Some(diagnostics) => {
                    log::info!("Running deferred validation for {}", uri);
                    publisher.publish(uri, diagnostics).await;
                }
                None => log::trace!("Session for {} is gone, dropping deferred validation", uri),
            }
        });
    }
}

#[tower_lsp::async_trait]
impl<P: DiagnosticsPublisher> LanguageServer for Backend<P> {
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        log::info!("Initializing xmlls");

        let settings = params
            .initialization_options
            .as_ref()
            .map(parse_settings)
            .unwrap_or_default();

        let mut state = self.state.write().await;
        *state = WorldState::new(settings);

        #[allow(deprecated)]
        let root_uri = params.root_uri;
        if let Some(root_uri) = root_uri {
            state.add_workspace(root_uri);
        }
        for folder in params.workspace_folders.unwrap_or_default() {
            log::info!("Adding workspace folder: {}", folder.uri);
            state.add_workspace(folder.uri);
        }
        drop(state);

        Ok(InitializeResult {
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Options(
                    TextDocumentSyncOptions {
                        open_close: Some(true),
                        change: Some(TextDocumentSyncKind::INCREMENTAL),
                        save: Some(TextDocumentSyncSaveOptions::Supported(true)),
                        ..Default::default()
                    },
                )),
                completion_provider: Some(CompletionOptions {
                    trigger_characters: Some(vec![String::from("<")]),
                    ..Default::default()
                }),
                ..Default::default()
            },
            server_info: Some(ServerInfo {
                name: String::from("xmlls"),
                version: Some(String::from(env!("CARGO_PKG_VERSION"))),
            }),
        })
    }

    async fn initialized(&self, _: InitializedParams) {
        let state = self.state.read().await;
        log::info!(
            "xmlls ready: {} workspace(s), {} schema locator(s)",
            state.workspaces.len(),
            state.settings.locators.len()
        );
    }

    async fn shutdown(&self) -> Result<()> {
        log::info!("Shutting down xmlls");
        Ok(())
    }

    async fn did_change_configuration(&self, params: DidChangeConfigurationParams) {
        let mut state = self.state.write().await;
        state.apply_configuration(&params.settings);
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        let uri = params.text_document.uri;
        log::info!("didOpen: {}", uri);
        {
            let mut state = self.state.write().await;
            state.sessions.open(uri.clone(), &params.text_document.text);
        }
        self.validate_now(&uri, true).await;
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        let uri = params.text_document.uri;
        log::trace!("didChange: {}", uri);
        let applied = {
            let mut state = self.state.write().await;
            state
                .sessions
                .apply_change(&uri, &params.content_changes, self.content.as_ref())
                .is_some()
        };
        if !applied {
            return;
        }

        self.validate_now(&uri, false).await;
        self.schedule_validation(&uri).await;
    }

    async fn did_save(&self, params: DidSaveTextDocumentParams) {
        let uri = params.text_document.uri;
        log::info!("didSave: {}", uri);
        let reloaded = {
            let mut state = self.state.write().await;
            state.sessions.save(&uri, self.content.as_ref()).is_some()
        };
        if reloaded {
            self.validate_now(&uri, true).await;
        }
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        let uri = params.text_document.uri;
        log::info!("didClose: {}", uri);
        let mut state = self.state.write().await;
        state.close_document(&uri);
    }

    async fn completion(&self, params: CompletionParams) -> Result<Option<CompletionResponse>> {
        let uri = &params.text_document_position.text_document.uri;
        let position = params.text_document_position.position;
        log::trace!("completion: {} at {}:{}", uri, position.line, position.character);

        let context = {
            let mut state = self.state.write().await;
            state.completion_context(uri, position)
        };
        let items = context.as_ref().map(completion_items).unwrap_or_default();
        log::trace!("Found {} completion item(s)", items.len());

        Ok(Some(CompletionResponse::List(CompletionList {
            is_incomplete: false,
            items,
        })))
    }
}

pub async fn start_lsp() -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();

    let (service, socket) = LspService::build(Backend::<Client>::new).finish();
    Server::new(stdin, stdout, socket).serve(service).await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_provider::tests::MemoryContentProvider;
    use crate::schema::test_schemas::ROOT_AB;
    use serde_json::json;
    use std::fs;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<(Url, Vec<Diagnostic>)>>>);

    impl Recorder {
        fn take(&self) -> Vec<(Url, Vec<Diagnostic>)> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    #[async_trait]
    impl DiagnosticsPublisher for Recorder {
        async fn publish(&self, uri: Url, diagnostics: Vec<Diagnostic>) {
            self.0.lock().unwrap().push((uri, diagnostics));
        }
    }

    struct Harness {
        _dir: TempDir,
        backend: Backend<Recorder>,
        recorder: Recorder,
        provider: Arc<MemoryContentProvider>,
        uri: Url,
    }

    async fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("schemas")).unwrap();
        fs::write(dir.path().join("schemas/root.xsd"), ROOT_AB).unwrap();
        let uri = Url::from_file_path(dir.path().join("doc.xml")).unwrap();

        let recorder = Recorder::default();
        let provider = Arc::new(MemoryContentProvider::default());
        let backend = Backend::with_publisher(recorder.clone(), provider.clone());
        backend
            .initialize(InitializeParams {
                workspace_folders: Some(vec![WorkspaceFolder {
                    uri: Url::from_directory_path(dir.path()).unwrap(),
                    name: "ws".to_string(),
                }]),
                initialization_options: Some(json!({
                    "schemaLocators": [{ "rootElement": true, "searchPaths": ["schemas"] }],
                    "validationDelayMs": 100
                })),
                ..Default::default()
            })
            .await
            .unwrap();

        Harness {
            _dir: dir,
            backend,
            recorder,
            provider,
            uri,
        }
    }

    fn change(uri: &Url, text: &str) -> DidChangeTextDocumentParams {
        DidChangeTextDocumentParams {
            text_document: VersionedTextDocumentIdentifier {
                uri: uri.clone(),
                version: 2,
            },
            content_changes: vec![TextDocumentContentChangeEvent {
                range: None,
                range_length: None,
                text: text.to_string(),
            }],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_without_session_recovers_from_provider() {
        let h = harness().await;
        h.provider.set(&h.uri, "<root/>");

        h.backend.did_change(change(&h.uri, "<root><b/><a/></root>")).await;
        assert_eq!(h.provider.reads(&h.uri), 1);
        // Recovered but never resolved: the immediate pass clears
        let published = h.recorder.take();
        assert_eq!(published.len(), 1);
        assert!(published[0].1.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_dropped_when_recovery_fails() {
        let h = harness().await;
        h.backend.did_change(change(&h.uri, "<root/>")).await;
        assert!(h.recorder.take().is_empty());
        assert!(!h.backend.state().read().await.sessions.contains(&h.uri));
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_reloads_persisted_content() {
        let h = harness().await;
        h.backend
            .did_open(DidOpenTextDocumentParams {
                text_document: TextDocumentItem::new(
                    h.uri.clone(),
                    "xml".to_string(),
                    1,
                    "<root><b/><a/></root>".to_string(),
                ),
            })
            .await;
        assert_eq!(h.recorder.take()[0].1.len(), 1);

        h.provider.set(&h.uri, "<root><a/></root>");
        h.backend
            .did_save(DidSaveTextDocumentParams {
                text_document: TextDocumentIdentifier::new(h.uri.clone()),
                text: None,
            })
            .await;
        let published = h.recorder.take();
        assert_eq!(published.len(), 1);
        assert!(published[0].1.is_empty());

        let state = h.backend.state();
        let mut state = state.write().await;
        assert_eq!(state.sessions.get(&h.uri).unwrap().text(), "<root><a/></root>");
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_disarms_deferred_validation() {
        let h = harness().await;
        h.backend
            .did_open(DidOpenTextDocumentParams {
                text_document: TextDocumentItem::new(h.uri.clone(), "xml".to_string(), 1, "<root/>".to_string()),
            })
            .await;
        h.backend.did_change(change(&h.uri, "<root><a/></root>")).await;
        h.backend
            .did_close(DidCloseTextDocumentParams {
                text_document: TextDocumentIdentifier::new(h.uri.clone()),
            })
            .await;
        h.recorder.take();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(h.recorder.take().is_empty());
    }
}
