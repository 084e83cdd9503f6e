// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, TryStreamExt};
use log::{info, warn};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::task;
use url::Url;

use crate::auth::AccountManager;
use crate::db::files::{self, Change, Database, File, Id, PageRow};
use crate::environment;
use crate::paths::CachePaths;
use crate::queue::command::{Args, Command, CommandQueue, Invocation};
use crate::queue::OpError;
use crate::request;
use crate::settings::Settings;

pub use self::manifest::Manifest;

pub mod manifest;

/// Command names registered on a repository's queue
pub const REFRESH: &str = "refresh";
pub const DOWNLOAD_FILESET: &str = "download-fileset";
pub const RESET_FILESET: &str = "reset-fileset";
pub const GC: &str = "gc";

/// Outcome of a refresh cycle
#[derive(Debug, Clone, Default)]
pub struct Refresh {
    /// Per-file failures aggregated while the DB delta itself succeeded
    pub warnings: Vec<String>,
    /// Set when the caller's deadline passed while the cycle continued in
    /// the background
    pub incomplete: bool,
}

/// Shared state for the sync commands of one repository
pub struct Context {
    pub settings: Settings,
    pub db: Database,
    pub paths: CachePaths,
    pub accounts: Arc<AccountManager>,
    warnings: Mutex<Vec<String>>,
}

impl Context {
    pub fn new(
        settings: Settings,
        db: Database,
        paths: CachePaths,
        accounts: Arc<AccountManager>,
    ) -> Self {
        Self {
            settings,
            db,
            paths,
            accounts,
            warnings: Mutex::new(vec![]),
        }
    }

    /// Warnings gathered by the most recent refresh cycle
    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().expect("mutex lock").clone()
    }

    fn clear_warnings(&self) {
        self.warnings.lock().expect("mutex lock").clear();
    }

    fn warn(&self, message: String) {
        warn!("{message}");
        self.warnings.lock().expect("mutex lock").push(message);
    }
}

/// Register the sync protocol commands on a repository's queue
pub fn register(queue: &CommandQueue, context: Arc<Context>) {
    queue.register(Arc::new(RefreshCommand {
        context: context.clone(),
    }));
    queue.register(Arc::new(DownloadFilesetCommand {
        context: context.clone(),
    }));
    queue.register(Arc::new(ResetFilesetCommand {
        context: context.clone(),
    }));
    queue.register(Arc::new(GcCommand { context }));
}

struct RefreshCommand {
    context: Arc<Context>,
}

impl Command for RefreshCommand {
    fn name(&self) -> &str {
        REFRESH
    }

    fn execute(&self, _args: Args) -> BoxFuture<'static, Result<Vec<Invocation>, OpError>> {
        let context = self.context.clone();
        async move { refresh(&context).await.map_err(op_error) }.boxed()
    }
}

struct DownloadFilesetCommand {
    context: Arc<Context>,
}

impl Command for DownloadFilesetCommand {
    fn name(&self) -> &str {
        DOWNLOAD_FILESET
    }

    fn execute(&self, args: Args) -> BoxFuture<'static, Result<Vec<Invocation>, OpError>> {
        let context = self.context.clone();
        async move {
            let [category, url] = &args[..] else {
                return Err(op_error(Error::Protocol(format!(
                    "download-fileset expects (category, url), got {args:?}"
                ))));
            };

            match download_fileset(&context, category, url).await {
                Ok(()) => Ok(vec![]),
                Err(error) if error.is_fatal() => Err(op_error(error)),
                Err(error) => {
                    context.warn(format!("fileset {category}: download failed: {error}"));
                    Ok(vec![])
                }
            }
        }
        .boxed()
    }
}

struct ResetFilesetCommand {
    context: Arc<Context>,
}

impl Command for ResetFilesetCommand {
    fn name(&self) -> &str {
        RESET_FILESET
    }

    fn execute(&self, args: Args) -> BoxFuture<'static, Result<Vec<Invocation>, OpError>> {
        let context = self.context.clone();
        async move {
            let [category] = &args[..] else {
                return Err(op_error(Error::Protocol(format!(
                    "reset-fileset expects (category), got {args:?}"
                ))));
            };

            match reset_fileset(&context, category).await {
                Ok(follow_ons) => Ok(follow_ons),
                Err(error) if error.is_fatal() => Err(op_error(error)),
                // The reset record stays behind, so the next refresh
                // replays the reset from the top.
                Err(error) => {
                    context.warn(format!("fileset {category}: reset failed: {error}"));
                    Ok(vec![])
                }
            }
        }
        .boxed()
    }
}

struct GcCommand {
    context: Arc<Context>,
}

impl Command for GcCommand {
    fn name(&self) -> &str {
        GC
    }

    fn execute(&self, _args: Args) -> BoxFuture<'static, Result<Vec<Invocation>, OpError>> {
        let context = self.context.clone();
        async move {
            context.db.prune_deleted().await.map_err(Error::from).map_err(op_error)?;
            Ok(vec![])
        }
        .boxed()
    }
}

/// One refresh cycle: fetch the updates feed, merge the DB delta, then
/// fan out follow-on downloads and resets.
///
/// All DB mutation commits before any download is scheduled, so readers
/// observe either the old or the new metadata state, never a mix. Byte
/// availability lags metadata until the downloads land.
async fn refresh(context: &Context) -> Result<Vec<Invocation>, Error> {
    context.clear_warnings();

    let since = context.db.sync_cursor().await?;
    let url = context.settings.url_for_updates(since.as_deref())?;
    let body = fetch_with_retry(context, url).await?;
    let manifest: Manifest = serde_json::from_slice(&body)?;

    for category in manifest.filesets.keys() {
        if !context.db.filesets().contains_key(category) {
            return Err(Error::Protocol(format!("unknown fileset category: {category}")));
        }
    }

    let changed = since.as_deref() != Some(manifest.commit.as_str()) || !manifest.db.is_empty();
    if changed {
        let records = [&manifest.db.inserts[..], &manifest.db.updates[..]].concat();
        let changes = to_changes(context, &records)?;
        let deletes = manifest
            .db
            .deletes
            .iter()
            .cloned()
            .map(Id::from)
            .collect::<Vec<_>>();

        context
            .db
            .merge_updates(&changes, &deletes, &manifest.commit)
            .await?;
        context.db.prune_related().await?;

        info!(
            "merged {} changes, {} deletions at {}",
            changes.len(),
            deletes.len(),
            manifest.commit
        );
    }

    for reset in &manifest.resets {
        if !context.db.filesets().contains_key(&reset.category) {
            return Err(Error::Protocol(format!(
                "unknown fileset category: {}",
                reset.category
            )));
        }
        context.db.insert_reset(&reset.category, &reset.cvs).await?;
    }

    let mut follow_ons = vec![];

    // Interrupted resets from earlier cycles replay alongside any the
    // server just requested.
    let resets = context.db.in_progress_resets().await?;
    for reset in &resets {
        follow_ons.push(Invocation::new(RESET_FILESET, [reset.category.clone()]));
    }

    if let Some(cursor) = context.db.sync_cursor().await? {
        let mut categories = context.db.filesets().keys().cloned().collect::<Vec<_>>();
        categories.sort();

        for category in categories {
            if context.db.cache_location_for_fileset(&category).is_none() {
                continue;
            }
            // A pending reset schedules its own download
            if resets.iter().any(|reset| reset.category == category) {
                continue;
            }
            if context.db.fileset_cursor(&category).await?.as_deref() == Some(cursor.as_str()) {
                continue;
            }

            let listed = manifest.filesets.get(&category);
            if listed.is_none() && context.db.category_files(&category).await?.is_empty() {
                continue;
            }

            let url = match listed.and_then(|fileset| fileset.url.clone()) {
                Some(url) => url,
                None => context.settings.url_for_fileset(&category)?.to_string(),
            };

            follow_ons.push(Invocation::new(DOWNLOAD_FILESET, [category, url]));
        }
    }

    follow_ons.push(Invocation::new(GC, Vec::<String>::new()));

    Ok(follow_ons)
}

/// Download a category's fileset bundle, stage it, verify it, then
/// promote the entries into the cache tier and mark them downloaded.
///
/// Partial failure deletes whatever is still staged and leaves the
/// fileset cursor behind, so the next refresh retries; files already
/// promoted stay promoted.
async fn download_fileset(context: &Context, category: &str, url: &str) -> Result<(), Error> {
    let Some(tier_dir) = context.db.cache_location_for_fileset(category) else {
        return Ok(());
    };

    let cursor = context.db.sync_cursor().await?;

    let records = context.db.category_files(category).await?;
    if records.is_empty() {
        if let Some(cursor) = &cursor {
            context.db.record_fileset_synced(category, cursor).await?;
        }
        return Ok(());
    }

    let expected = records
        .iter()
        .map(|file| (file.path.clone(), (file.size, file.digest.clone())))
        .collect::<HashMap<_, _>>();

    let staging = Staging::acquire(&context.paths, &format!("{DOWNLOAD_FILESET}-{category}"))?;

    let url = url
        .parse::<Url>()
        .map_err(|_| Error::Protocol(format!("invalid fileset url: {url}")))?;
    fetch_to_file(context, url, &staging.bundle_path()).await?;

    let bundle = staging.bundle_path();
    let files_dir = staging.files_dir();
    let (entries, skipped) =
        task::spawn_blocking(move || extract_bundle(&bundle, &files_dir, &expected))
            .await
            .expect("spawn blocking")?;

    for path in skipped {
        context.warn(format!("fileset {category}: no record for bundle entry {path}"));
    }

    let count = entries.len();
    for (rel, staged) in entries {
        let target = tier_dir.join(&rel);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        promote(&staged, &target).await?;
        context.db.mark_downloaded(&rel).await?;
    }

    if let Some(cursor) = &cursor {
        context.db.record_fileset_synced(category, cursor).await?;
    }

    info!("fileset {category}: downloaded {count} files");

    Ok(())
}

/// Move a fully staged, verified file into its tier location.
///
/// The final step is always a same-directory rename, so a concurrent
/// reader sees either nothing or the complete file. When staging and the
/// tier sit on different filesystems the bytes are first copied next to
/// the target.
async fn promote(staged: &Path, target: &Path) -> io::Result<()> {
    if tokio::fs::rename(staged, target).await.is_ok() {
        return Ok(());
    }

    let name = target
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("staged");
    let partial = target.with_file_name(format!("{name}.part"));

    tokio::fs::copy(staged, &partial).await?;
    tokio::fs::rename(&partial, target).await?;
    let _ = tokio::fs::remove_file(staged).await;

    Ok(())
}

/// Repair a diverged category from the server's authoritative list.
///
/// Rows absent from the list are removed, rows present are upserted, and
/// a download follow-on fetches the bytes. The reset record is deleted
/// only once the list has been applied, so an interruption anywhere
/// leaves it behind for the next refresh to replay.
async fn reset_fileset(context: &Context, category: &str) -> Result<Vec<Invocation>, Error> {
    let Some(cvs) = context.db.reset_cvs(category).await? else {
        return Ok(vec![]);
    };

    let url = context.settings.url_for_reset(category, &cvs)?;
    let body = fetch_with_retry(context, url).await?;
    let list: manifest::ResetList = serde_json::from_slice(&body)?;

    for record in &list.files {
        if record.category != category {
            return Err(Error::Protocol(format!(
                "reset list for {category} carries a record in {}",
                record.category
            )));
        }
    }

    let changes = to_changes(context, &list.files)?;
    context.db.apply_reset(category, &changes).await?;
    context.db.prune_related().await?;

    let mut follow_ons = vec![];
    if context.db.cache_location_for_fileset(category).is_some() {
        let url = context.settings.url_for_fileset(category)?;
        follow_ons.push(Invocation::new(
            DOWNLOAD_FILESET,
            [category.to_string(), url.to_string()],
        ));
    }

    context.db.delete_reset(category).await?;

    info!("fileset {category}: reset to {} files", list.files.len());

    Ok(follow_ons)
}

fn to_changes(context: &Context, records: &[manifest::Record]) -> Result<Vec<Change>, Error> {
    records
        .iter()
        .map(|record| {
            let fileset = context.db.filesets().get(&record.category).ok_or_else(|| {
                Error::Protocol(format!("unknown fileset category: {}", record.category))
            })?;

            let mut page = None;
            for mapping in &fileset.mappings {
                let Some(value) = record.related.get(mapping) else {
                    continue;
                };

                if mapping == "pages" {
                    match serde_json::from_value::<PageRow>(value.clone()) {
                        Ok(row) => page = Some(row),
                        Err(error) => context
                            .warn(format!("{}: malformed {mapping} row: {error}", record.path)),
                    }
                } else {
                    context.warn(format!("{}: unsupported mapping table {mapping}", record.path));
                }
            }

            Ok(Change {
                file: File {
                    id: Id::from(record.id.clone()),
                    path: record.path.clone(),
                    category: record.category.clone(),
                    status: record.status,
                    commit: record.commit.clone(),
                    content_type: record.content_type.clone(),
                    size: record.size,
                    digest: record.digest.clone(),
                },
                page,
            })
        })
        .collect()
}

/// Fetch a response body in full, retrying transient transport failures
/// with exponential backoff up to the configured budget
async fn fetch_with_retry(context: &Context, url: Url) -> Result<Vec<u8>, Error> {
    with_retry(context, || {
        let url = url.clone();
        async move {
            let credentials = context.accounts.credentials();
            request::get_body(url, credentials.as_ref()).await
        }
    })
    .await
}

async fn fetch_to_file(context: &Context, url: Url, path: &Path) -> Result<(), Error> {
    with_retry(context, || {
        let url = url.clone();
        async move {
            let credentials = context.accounts.credentials();
            let mut stream = request::get(url, credentials.as_ref()).await?;

            let mut out = tokio::fs::File::create(path).await?;
            while let Some(chunk) = stream.try_next().await? {
                out.write_all(&chunk).await?;
            }
            out.flush().await?;

            Ok(())
        }
    })
    .await
}

async fn with_retry<T, F, Fut>(context: &Context, mut operation: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, request::Error>>,
{
    let mut attempt = 1;
    let mut delay = Duration::from_millis(environment::SYNC_RETRY_BASE_DELAY_MS);

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(request::Error::Auth(status)) => {
                context.accounts.mark_stale();
                return Err(Error::Auth(status));
            }
            Err(error) if error.is_transient() && attempt < environment::SYNC_RETRY_LIMIT => {
                warn!("transient fetch failure (attempt {attempt}): {error}");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(error) => return Err(Error::Transport(error)),
        }
    }
}

/// A staging directory scoped to one download.
///
/// Deleted on drop; promoted files have already been renamed out by then.
struct Staging {
    path: PathBuf,
}

impl Staging {
    fn acquire(paths: &CachePaths, op_id: &str) -> io::Result<Self> {
        let path = paths.staging_for(op_id);

        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        std::fs::create_dir_all(path.join("files"))?;

        Ok(Self { path })
    }

    fn bundle_path(&self) -> PathBuf {
        self.path.join("bundle.zip")
    }

    fn files_dir(&self) -> PathBuf {
        self.path.join("files")
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

type Expected = HashMap<String, (Option<u64>, Option<String>)>;

/// Unpack a fileset bundle into the staging area, verifying entry sizes
/// and digests against the file records. Entries without a record are
/// skipped and reported.
fn extract_bundle(
    bundle: &Path,
    out_dir: &Path,
    expected: &Expected,
) -> Result<(Vec<(String, PathBuf)>, Vec<String>), Error> {
    use std::fs::{create_dir_all, File};
    use std::io::copy;

    let mut archive = zip::ZipArchive::new(File::open(bundle)?)?;

    let mut entries = vec![];
    let mut skipped = vec![];

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        if entry.is_dir() {
            continue;
        }
        if entry.enclosed_name().is_none() {
            return Err(Error::UnsafeEntry(entry.name().to_string()));
        }

        let rel = entry.name().to_string();
        let Some((size, digest)) = expected.get(&rel) else {
            skipped.push(rel);
            continue;
        };

        let staged = out_dir.join(&rel);
        if let Some(parent) = staged.parent() {
            create_dir_all(parent)?;
        }

        let mut out = File::create(&staged)?;
        let written = copy(&mut entry, &mut out)?;

        if let Some(size) = size {
            if written != *size {
                return Err(Error::SizeMismatch(rel));
            }
        }
        if let Some(digest) = digest {
            let actual = hex::encode(Sha256::digest(std::fs::read(&staged)?));
            if &actual != digest {
                return Err(Error::DigestMismatch(rel));
            }
        }

        entries.push((rel, staged));
    }

    Ok((entries, skipped))
}

fn op_error(error: Error) -> OpError {
    Box::new(error)
}

#[derive(Debug, Error)]
pub enum Error {
    /// Network failure after exhausting the retry budget
    #[error("transport: {0}")]
    Transport(#[source] request::Error),
    /// Credentials rejected; not retried
    #[error("authentication rejected ({0})")]
    Auth(StatusCode),
    /// Malformed server payload
    #[error("malformed manifest")]
    Manifest(#[from] serde_json::Error),
    /// Server payload violates the protocol contract
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("file database")]
    Database(#[from] files::Error),
    #[error("invalid url")]
    InvalidUrl(#[from] url::ParseError),
    #[error("archive")]
    Archive(#[from] zip::result::ZipError),
    #[error("unsafe bundle entry path: {0}")]
    UnsafeEntry(String),
    #[error("size mismatch for staged file: {0}")]
    SizeMismatch(String),
    #[error("digest mismatch for staged file: {0}")]
    DigestMismatch(String),
    #[error("io")]
    Io(#[from] io::Error),
}

impl Error {
    /// Fatal errors reject the refresh promise; the rest aggregate as
    /// warnings on an otherwise successful cycle.
    fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Database(_) | Error::Manifest(_) | Error::Protocol(_) | Error::Auth(_)
        )
    }
}
