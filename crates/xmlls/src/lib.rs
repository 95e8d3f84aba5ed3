// lib.rs - Library root of the XML language server.
//
// The binary entry point lives in main.rs and only parses arguments,
// configures logging and calls `backend::start_lsp`. Benchmarks and
// integration tests use the modules below directly.

pub mod backend;
pub mod completion_context;
pub mod config;
pub mod content_provider;
pub mod diagnostics;
pub mod document_store;
pub mod position;
pub mod schema;
pub mod state;
pub mod workspace;
pub mod xml;
