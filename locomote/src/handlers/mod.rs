// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::sync::Arc;

use crate::auth::AccountManager;
use crate::content::dispatcher::{Dispatcher, PatternError};
use crate::db::files::Database;
use crate::settings::Settings;

pub use self::file::{
    FileBytesHandler, FileContentHandler, FileListHandler, FileRecordHandler, FileRelationHandler,
};
pub use self::search::SearchHandler;

pub mod file;
pub mod search;

/// State shared by a repository's request handlers
pub struct HandlerContext {
    pub db: Database,
    pub settings: Settings,
    pub accounts: Arc<AccountManager>,
    /// Fetch bytes from the server when the local cache misses
    pub on_demand: bool,
}

/// Register the standard repository endpoints on a dispatcher.
///
/// Ordering matters: the first matching pattern wins, and the trailing
/// rest-capture serves raw file bytes for everything else.
pub fn register(
    dispatcher: &mut Dispatcher,
    context: Arc<HandlerContext>,
    search_limit: usize,
) -> Result<(), PatternError> {
    dispatcher.add("files.api", Arc::new(FileListHandler::new(context.clone())))?;
    dispatcher.add(
        "files.api/{id}",
        Arc::new(FileRecordHandler::new(context.clone())),
    )?;
    dispatcher.add(
        "files.api/{id}/content",
        Arc::new(FileContentHandler::new(context.clone())),
    )?;
    dispatcher.add(
        "files.api/{id}/{relation}",
        Arc::new(FileRelationHandler::new(context.clone())),
    )?;
    dispatcher.add(
        "search.api",
        Arc::new(SearchHandler::new(context.clone(), search_limit)),
    )?;
    dispatcher.add("{path...}", Arc::new(FileBytesHandler::new(context)))?;

    Ok(())
}

/// Infer a MIME type from a path's extension. Unknown extensions fall
/// back to an opaque byte stream.
pub(crate) fn mime_for_path(path: &str) -> &'static str {
    match path.rsplit_once('.').map(|(_, ext)| ext) {
        Some("html" | "htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "text/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("md") => "text/markdown",
        Some("xml") => "application/xml",
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("webp") => "image/webp",
        Some("woff2") => "font/woff2",
        _ => "application/octet-stream",
    }
}
