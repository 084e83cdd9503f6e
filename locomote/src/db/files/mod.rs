// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;
use std::path::PathBuf;

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Acquire, Pool, QueryBuilder, Sqlite, SqliteConnection};
use thiserror::Error;

use crate::environment;
use crate::fileset::Fileset;
use crate::paths::CachePaths;

/// A file record identifier, assigned by the server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into, Display)]
pub struct Id(String);

impl From<&str> for Id {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Lifecycle status of a file record
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Status {
    /// Shipped with the app; bytes live in the packaged tier
    Packaged,
    /// Published by the server; bytes live in a cache tier, when cachable
    Published,
    /// Deleted on the server; row retained until garbage collection
    Deleted,
}

impl TryFrom<String> for Status {
    type Error = strum::ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A single file record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct File {
    pub id: Id,
    pub path: String,
    pub category: String,
    pub status: Status,
    pub commit: String,
    pub content_type: Option<String>,
    pub size: Option<u64>,
    pub digest: Option<String>,
}

/// Column values for a row in the `pages` related table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRow {
    pub title: Option<String>,
    pub content: Option<String>,
}

/// An insert or update of one file record, with any related rows carried
/// inline. Related rows take the owning record's commit as their version.
#[derive(Debug, Clone)]
pub struct Change {
    pub file: File,
    pub page: Option<PageRow>,
}

impl From<File> for Change {
    fn from(file: File) -> Self {
        Self { file, page: None }
    }
}

/// An in-progress fileset reset record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reset {
    pub category: String,
    pub cvs: String,
}

/// Filter terms for file record listings. Equality over the indexed
/// columns, plus a prefix match on path.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub category: Option<String>,
    pub status: Option<Status>,
    pub path: Option<String>,
    pub commit: Option<String>,
    pub path_prefix: Option<String>,
}

/// A full-text search hit
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    #[serde(flatten)]
    pub file: File,
    pub title: Option<String>,
}

/// The per-repository metadata store.
///
/// Holds the `files` table, related tables declared by fileset mappings,
/// reset records and the sync cursors. All mutations are transactional;
/// reads may run concurrently with queue writes.
#[derive(Debug, Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
    filesets: HashMap<String, Fileset>,
    paths: CachePaths,
}

impl Database {
    pub async fn new(
        paths: CachePaths,
        filesets: HashMap<String, Fileset>,
        read_only: bool,
    ) -> Result<Self, Error> {
        let options = SqliteConnectOptions::new()
            .filename(&paths.db_path)
            .create_if_missing(true)
            .read_only(read_only)
            .foreign_keys(true)
            .pragma("case_sensitive_like", "1");

        Self::connect(options, paths, filesets, 8).await
    }

    async fn connect(
        options: SqliteConnectOptions,
        paths: CachePaths,
        filesets: HashMap<String, Fileset>,
        max_connections: u32,
    ) -> Result<Self, Error> {
        let pool = sqlx::pool::PoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::migrate!("src/db/files/migrations").run(&pool).await?;

        Ok(Self {
            pool,
            filesets,
            paths,
        })
    }

    pub fn filesets(&self) -> &HashMap<String, Fileset> {
        &self.filesets
    }

    /// Apply one updates-feed delta in a single transaction.
    ///
    /// Inserts and updates are upserted together with their inline related
    /// rows; deletions are marked `deleted` and retained until
    /// [`Self::prune_deleted`]. The sync cursor advances to `commit` only
    /// if the transaction commits; any failure leaves the store at its
    /// pre-merge state.
    pub async fn merge_updates(
        &self,
        changes: &[Change],
        deletes: &[Id],
        commit: &str,
    ) -> Result<(), Error> {
        let mut transaction = self.pool.begin().await?;

        for chunk in changes.chunks(environment::DB_BATCH_SIZE) {
            upsert_changes(chunk, transaction.acquire().await?).await?;
        }

        if !deletes.is_empty() {
            let mut query = QueryBuilder::new(
                "
                UPDATE files SET status = 'deleted'
                WHERE id IN (
                ",
            );
            let mut separated = query.separated(", ");
            for id in deletes {
                separated.push_bind(id.to_string());
            }
            separated.push_unseparated(");");

            query.build().execute(transaction.acquire().await?).await?;
        }

        sqlx::query(
            "
            INSERT INTO sync_cursor (id, \"commit\")
            VALUES (0, ?)
            ON CONFLICT (id) DO UPDATE SET \"commit\" = excluded.\"commit\";
            ",
        )
        .bind(commit)
        .execute(transaction.acquire().await?)
        .await?;

        transaction.commit().await?;

        Ok(())
    }

    /// Replace a category with the authoritative file list returned by a
    /// reset. Rows absent from the list are physically deleted; rows
    /// present are upserted. Runs in a single transaction.
    pub async fn apply_reset(&self, category: &str, changes: &[Change]) -> Result<(), Error> {
        let mut transaction = self.pool.begin().await?;

        let mut query = QueryBuilder::new(
            "
            DELETE FROM files
            WHERE category =
            ",
        );
        query.push_bind(category);
        if !changes.is_empty() {
            query.push(" AND id NOT IN (");
            let mut separated = query.separated(", ");
            for change in changes {
                separated.push_bind(change.file.id.to_string());
            }
            separated.push_unseparated(")");
        }

        query.build().execute(transaction.acquire().await?).await?;

        for chunk in changes.chunks(environment::DB_BATCH_SIZE) {
            upsert_changes(chunk, transaction.acquire().await?).await?;
        }

        transaction.commit().await?;

        Ok(())
    }

    /// Prune related values after applying updates.
    ///
    /// Deletes records in related tables whose version doesn't match the
    /// owning file's commit. Idempotent.
    pub async fn prune_related(&self) -> Result<(), Error> {
        sqlx::query(
            "
            DELETE FROM pages
            WHERE file_id NOT IN (SELECT id FROM files)
               OR version != (SELECT \"commit\" FROM files WHERE id = pages.file_id);
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Garbage-collect rows marked `deleted`, cascading to related tables.
    pub async fn prune_deleted(&self) -> Result<(), Error> {
        sqlx::query("DELETE FROM files WHERE status = 'deleted';")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Transition the record at `path` from `packaged` to `published`
    /// once its bytes are locally available. A no-op for already
    /// `published` rows; an error when the row is absent or `deleted`.
    pub async fn mark_downloaded(&self, path: &str) -> Result<(), Error> {
        let statuses = sqlx::query_as::<_, (String,)>("SELECT status FROM files WHERE path = ?;")
            .bind(path)
            .fetch_all(&self.pool)
            .await?;

        if statuses.is_empty() {
            return Err(Error::RowNotFound);
        }
        if statuses.iter().all(|(status,)| status == "deleted") {
            return Err(Error::Deleted(path.to_string()));
        }

        sqlx::query("UPDATE files SET status = 'published' WHERE path = ? AND status = 'packaged';")
            .bind(path)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// The last commit ingested from the updates feed
    pub async fn sync_cursor(&self) -> Result<Option<String>, Error> {
        let row =
            sqlx::query_as::<_, (String,)>("SELECT \"commit\" FROM sync_cursor WHERE id = 0;")
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(commit,)| commit))
    }

    /// The last commit whose bytes completed downloading for a category
    pub async fn fileset_cursor(&self, category: &str) -> Result<Option<String>, Error> {
        let row = sqlx::query_as::<_, (String,)>(
            "SELECT \"commit\" FROM fileset_cursors WHERE category = ?;",
        )
        .bind(category)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(commit,)| commit))
    }

    /// Record that a category's fileset download completed at `commit`
    pub async fn record_fileset_synced(&self, category: &str, commit: &str) -> Result<(), Error> {
        sqlx::query(
            "
            INSERT INTO fileset_cursors (category, \"commit\")
            VALUES (?, ?)
            ON CONFLICT (category) DO UPDATE SET \"commit\" = excluded.\"commit\";
            ",
        )
        .bind(category)
        .bind(commit)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert a reset record for the category with the client visible set
    /// returned by the server. Replaces any previous record, keeping a
    /// single in-progress reset per category.
    pub async fn insert_reset(&self, category: &str, cvs: &str) -> Result<(), Error> {
        sqlx::query(
            "
            INSERT INTO resets (category, cvs, in_progress)
            VALUES (?, ?, 1)
            ON CONFLICT (category) DO UPDATE SET cvs = excluded.cvs, in_progress = 1;
            ",
        )
        .bind(category)
        .bind(cvs)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Read the reset CVS for a fileset category
    pub async fn reset_cvs(&self, category: &str) -> Result<Option<String>, Error> {
        let row = sqlx::query_as::<_, (String,)>("SELECT cvs FROM resets WHERE category = ?;")
            .bind(category)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(cvs,)| cvs))
    }

    /// List any in-progress fileset resets
    pub async fn in_progress_resets(&self) -> Result<Vec<Reset>, Error> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT category, cvs FROM resets WHERE in_progress = 1 ORDER BY category;",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(category, cvs)| Reset { category, cvs })
            .collect())
    }

    pub async fn delete_reset(&self, category: &str) -> Result<(), Error> {
        sqlx::query("DELETE FROM resets WHERE category = ?;")
            .bind(category)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn delete_all_resets(&self) -> Result<(), Error> {
        sqlx::query("DELETE FROM resets;").execute(&self.pool).await?;

        Ok(())
    }

    /// Look up a readable (published or packaged) record by id
    pub async fn file_by_id(&self, id: &Id) -> Result<Option<File>, Error> {
        let entry = sqlx::query_as::<_, encoding::Entry>(
            "
            SELECT id, path, category, status, \"commit\", content_type, size, digest
            FROM files
            WHERE id = ? AND status IN ('published', 'packaged');
            ",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(entry.map(File::from))
    }

    /// Look up a readable record by repo-relative path
    pub async fn file_by_path(&self, path: &str) -> Result<Option<File>, Error> {
        let entry = sqlx::query_as::<_, encoding::Entry>(
            "
            SELECT id, path, category, status, \"commit\", content_type, size, digest
            FROM files
            WHERE path = ? AND status IN ('published', 'packaged')
            ORDER BY category
            LIMIT 1;
            ",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(entry.map(File::from))
    }

    /// List readable records matching the filter, ordered by path
    pub async fn query(&self, filter: &Filter) -> Result<Vec<File>, Error> {
        let mut query = QueryBuilder::new(
            "
            SELECT id, path, category, status, \"commit\", content_type, size, digest
            FROM files
            WHERE status IN ('published', 'packaged')
            ",
        );

        if let Some(category) = &filter.category {
            query.push(" AND category = ").push_bind(category.clone());
        }
        if let Some(status) = &filter.status {
            query.push(" AND status = ").push_bind(status.to_string());
        }
        if let Some(path) = &filter.path {
            query.push(" AND path = ").push_bind(path.clone());
        }
        if let Some(commit) = &filter.commit {
            query.push(" AND \"commit\" = ").push_bind(commit.clone());
        }
        if let Some(prefix) = &filter.path_prefix {
            query
                .push(" AND path LIKE ")
                .push_bind(format!("{}%", like_escape(prefix)))
                .push(" ESCAPE '\\'");
        }

        query.push(" ORDER BY path;");

        let entries = query
            .build_query_as::<encoding::Entry>()
            .fetch_all(&self.pool)
            .await?;

        Ok(entries.into_iter().map(File::from).collect())
    }

    /// All readable records in a category, ordered by path
    pub async fn category_files(&self, category: &str) -> Result<Vec<File>, Error> {
        self.query(&Filter {
            category: Some(category.to_string()),
            ..Default::default()
        })
        .await
    }

    /// Records sharing the reference record's path directory
    pub async fn siblings(&self, of: &File) -> Result<Vec<File>, Error> {
        let mut query = self.hierarchy_query();
        query.push(" AND id != ").push_bind(of.id.to_string());

        match of.path.rsplit_once('/') {
            Some((dir, _)) => {
                let prefix = like_escape(dir);
                query
                    .push(" AND path LIKE ")
                    .push_bind(format!("{prefix}/%"))
                    .push(" ESCAPE '\\' AND path NOT LIKE ")
                    .push_bind(format!("{prefix}/%/%"))
                    .push(" ESCAPE '\\'");
            }
            None => {
                query.push(" AND path NOT LIKE '%/%'");
            }
        }

        query.push(" ORDER BY path;");

        let entries = query
            .build_query_as::<encoding::Entry>()
            .fetch_all(&self.pool)
            .await?;

        Ok(entries.into_iter().map(File::from).collect())
    }

    /// Records whose path directory is the reference record's path
    pub async fn children(&self, of: &File) -> Result<Vec<File>, Error> {
        let prefix = like_escape(&of.path);

        let mut query = self.hierarchy_query();
        query
            .push(" AND path LIKE ")
            .push_bind(format!("{prefix}/%"))
            .push(" ESCAPE '\\' AND path NOT LIKE ")
            .push_bind(format!("{prefix}/%/%"))
            .push(" ESCAPE '\\' ORDER BY path;");

        let entries = query
            .build_query_as::<encoding::Entry>()
            .fetch_all(&self.pool)
            .await?;

        Ok(entries.into_iter().map(File::from).collect())
    }

    /// Records whose path has the reference record's path as a directory
    /// prefix, at any depth
    pub async fn descendants(&self, of: &File) -> Result<Vec<File>, Error> {
        let prefix = like_escape(&of.path);

        let mut query = self.hierarchy_query();
        query
            .push(" AND path LIKE ")
            .push_bind(format!("{prefix}/%"))
            .push(" ESCAPE '\\' ORDER BY path;");

        let entries = query
            .build_query_as::<encoding::Entry>()
            .fetch_all(&self.pool)
            .await?;

        Ok(entries.into_iter().map(File::from).collect())
    }

    fn hierarchy_query(&self) -> QueryBuilder<'static, Sqlite> {
        QueryBuilder::new(
            "
            SELECT id, path, category, status, \"commit\", content_type, size, digest
            FROM files
            WHERE status IN ('published', 'packaged')
            ",
        )
    }

    /// Full-text search over the `pages` related table joined to `files`.
    ///
    /// Every whitespace-separated term must match the page title or
    /// content, case-insensitively. A title match outranks a content
    /// match; ties order by path, which keeps results deterministic for a
    /// given store state.
    pub async fn search(&self, q: &str, limit: usize) -> Result<Vec<SearchResult>, Error> {
        let terms = q
            .split_whitespace()
            .map(|term| format!("%{}%", like_escape(&term.to_lowercase())))
            .collect::<Vec<_>>();

        if terms.is_empty() {
            return Ok(vec![]);
        }

        let mut query = QueryBuilder::new(
            "
            SELECT f.id, f.path, f.category, f.status, f.\"commit\",
                   f.content_type, f.size, f.digest, p.title,
            ",
        );

        for (i, term) in terms.iter().enumerate() {
            if i > 0 {
                query.push(" + ");
            }
            query
                .push("(CASE WHEN lower(p.title) LIKE ")
                .push_bind(term.clone())
                .push(" ESCAPE '\\' THEN 2 ELSE 0 END + CASE WHEN lower(p.content) LIKE ")
                .push_bind(term.clone())
                .push(" ESCAPE '\\' THEN 1 ELSE 0 END)");
        }

        query.push(
            "
            AS rank
            FROM files f
            JOIN pages p ON p.file_id = f.id
            WHERE f.status IN ('published', 'packaged')
            ",
        );

        for term in &terms {
            query
                .push(" AND (lower(p.title) LIKE ")
                .push_bind(term.clone())
                .push(" ESCAPE '\\' OR lower(p.content) LIKE ")
                .push_bind(term.clone())
                .push(" ESCAPE '\\')");
        }

        query
            .push(" ORDER BY rank DESC, f.path ASC LIMIT ")
            .push_bind(limit as i64)
            .push(";");

        let entries = query
            .build_query_as::<encoding::SearchEntry>()
            .fetch_all(&self.pool)
            .await?;

        Ok(entries
            .into_iter()
            .map(|entry| SearchResult {
                title: entry.title.clone(),
                file: File::from(entry.entry),
            })
            .collect())
    }

    /// The directory holding a fileset category's bytes, or `None` when
    /// the category isn't locally cachable. The packaged tier is never
    /// returned here.
    pub fn cache_location_for_fileset(&self, category: &str) -> Option<PathBuf> {
        self.filesets
            .get(category)
            .and_then(|fileset| fileset.cache_location(&self.paths))
    }

    /// The on-disk location of a file record's bytes, or `None` when the
    /// record isn't locally cachable.
    pub fn cache_location_for_file(&self, file: &File) -> Option<PathBuf> {
        match file.status {
            Status::Deleted => None,
            Status::Packaged => Some(self.paths.packaged_dir.join(&file.category).join(&file.path)),
            Status::Published => self
                .cache_location_for_fileset(&file.category)
                .map(|dir| dir.join(&file.path)),
        }
    }
}

async fn upsert_changes(changes: &[Change], connection: &mut SqliteConnection) -> Result<(), Error> {
    if changes.is_empty() {
        return Ok(());
    }

    QueryBuilder::new(
        "
        INSERT INTO files (id, path, category, status, \"commit\", content_type, size, digest)
        ",
    )
    .push_values(changes, |mut b, change| {
        let File {
            id,
            path,
            category,
            status,
            commit,
            content_type,
            size,
            digest,
        } = &change.file;

        b.push_bind(id.to_string())
            .push_bind(path)
            .push_bind(category)
            .push_bind(status.to_string())
            .push_bind(commit)
            .push_bind(content_type)
            .push_bind(size.map(|i| i as i64))
            .push_bind(digest);
    })
    .push(
        "
        ON CONFLICT (id) DO UPDATE SET
            path = excluded.path,
            category = excluded.category,
            status = excluded.status,
            \"commit\" = excluded.\"commit\",
            content_type = excluded.content_type,
            size = excluded.size,
            digest = excluded.digest;
        ",
    )
    .build()
    .execute(&mut *connection)
    .await?;

    let pages = changes
        .iter()
        .filter_map(|change| change.page.as_ref().map(|page| (&change.file, page)))
        .collect::<Vec<_>>();
    if !pages.is_empty() {
        QueryBuilder::new(
            "
            INSERT INTO pages (file_id, version, title, content)
            ",
        )
        .push_values(pages, |mut b, (file, page)| {
            b.push_bind(file.id.to_string())
                .push_bind(&file.commit)
                .push_bind(&page.title)
                .push_bind(&page.content);
        })
        .push(
            "
            ON CONFLICT (file_id) DO UPDATE SET
                version = excluded.version,
                title = excluded.title,
                content = excluded.content;
            ",
        )
        .build()
        .execute(&mut *connection)
        .await?;
    }

    Ok(())
}

fn like_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Row not found")]
    RowNotFound,
    #[error("file is deleted: {0}")]
    Deleted(String),
    #[error("sqlx")]
    Sqlx(#[source] sqlx::Error),
    #[error("sqlx migration")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl From<sqlx::Error> for Error {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::RowNotFound => Error::RowNotFound,
            error => Error::Sqlx(error),
        }
    }
}

mod encoding {
    use sqlx::FromRow;

    use super::{File, Id, Status};

    #[derive(FromRow)]
    pub struct Entry {
        #[sqlx(try_from = "String")]
        pub id: Id,
        pub path: String,
        pub category: String,
        #[sqlx(try_from = "String")]
        pub status: Status,
        pub commit: String,
        pub content_type: Option<String>,
        pub size: Option<i64>,
        pub digest: Option<String>,
    }

    impl From<Entry> for File {
        fn from(entry: Entry) -> Self {
            File {
                id: entry.id,
                path: entry.path,
                category: entry.category,
                status: entry.status,
                commit: entry.commit,
                content_type: entry.content_type,
                size: entry.size.map(|i| i as u64),
                digest: entry.digest,
            }
        }
    }

    #[derive(FromRow)]
    pub struct SearchEntry {
        #[sqlx(flatten)]
        pub entry: Entry,
        pub title: Option<String>,
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::*;
    use crate::fileset;
    use crate::paths::BasePaths;
    use crate::settings::Settings;

    pub(crate) async fn memory() -> Database {
        let settings = Settings::new("acme", "docs");
        let paths = CachePaths::for_repository(&BasePaths::under("/tmp/locomote-test"), &settings);

        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .unwrap()
            .pragma("case_sensitive_like", "1")
            .foreign_keys(true);

        // A single connection keeps the in-memory database shared
        Database::connect(options, paths, fileset::standard(), 1).await.unwrap()
    }

    fn file(id: &str, path: &str, category: &str, status: Status, commit: &str) -> File {
        File {
            id: Id::from(id),
            path: path.to_string(),
            category: category.to_string(),
            status,
            commit: commit.to_string(),
            content_type: None,
            size: None,
            digest: None,
        }
    }

    fn page_change(id: &str, path: &str, commit: &str, title: &str, content: &str) -> Change {
        Change {
            file: file(id, path, "pages", Status::Published, commit),
            page: Some(PageRow {
                title: Some(title.to_string()),
                content: Some(content.to_string()),
            }),
        }
    }

    #[tokio::test]
    async fn merge_insert_query() {
        let db = memory().await;

        db.merge_updates(
            &[
                page_change("f1", "a/b.txt", "c1", "Beta", "beta page"),
                file("f2", "a/c.txt", "assets", Status::Published, "c1").into(),
            ],
            &[],
            "c1",
        )
        .await
        .unwrap();

        assert_eq!(db.sync_cursor().await.unwrap().as_deref(), Some("c1"));

        let fetched = db.file_by_id(&Id::from("f1")).await.unwrap().unwrap();
        assert_eq!(fetched.path, "a/b.txt");
        assert_eq!(fetched.commit, "c1");

        let by_path = db.file_by_path("a/c.txt").await.unwrap().unwrap();
        assert_eq!(by_path.id, Id::from("f2"));

        let listed = db
            .query(&Filter {
                category: Some("pages".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn merge_is_transactional() {
        let db = memory().await;

        // Two distinct ids claiming the same (category, path) violate the
        // uniqueness constraint; nothing from the batch may survive.
        let result = db
            .merge_updates(
                &[
                    file("f1", "a/b.txt", "pages", Status::Published, "c1").into(),
                    file("f2", "a/b.txt", "pages", Status::Published, "c1").into(),
                ],
                &[],
                "c1",
            )
            .await;

        assert!(result.is_err());
        assert!(db.file_by_id(&Id::from("f1")).await.unwrap().is_none());
        assert_eq!(db.sync_cursor().await.unwrap(), None);
    }

    #[tokio::test]
    async fn prune_related_enforces_version_match() {
        let db = memory().await;

        db.merge_updates(
            &[page_change("f1", "a/b.txt", "c1", "Beta", "beta page")],
            &[],
            "c1",
        )
        .await
        .unwrap();

        // File advances without a fresh page row; the stale page must go.
        db.merge_updates(
            &[file("f1", "a/b.txt", "pages", Status::Published, "c2").into()],
            &[],
            "c2",
        )
        .await
        .unwrap();

        db.prune_related().await.unwrap();

        assert!(db.search("beta", 10).await.unwrap().is_empty());

        // Idempotent
        db.prune_related().await.unwrap();
    }

    #[tokio::test]
    async fn mark_downloaded_transitions() {
        let db = memory().await;

        db.merge_updates(
            &[
                file("f1", "a/b.txt", "pages", Status::Packaged, "c1").into(),
                file("f2", "a/c.txt", "pages", Status::Deleted, "c1").into(),
            ],
            &[],
            "c1",
        )
        .await
        .unwrap();

        db.mark_downloaded("a/b.txt").await.unwrap();
        let fetched = db.file_by_id(&Id::from("f1")).await.unwrap().unwrap();
        assert_eq!(fetched.status, Status::Published);

        // Idempotent on already-published rows
        db.mark_downloaded("a/b.txt").await.unwrap();

        assert!(matches!(
            db.mark_downloaded("missing.txt").await,
            Err(Error::RowNotFound)
        ));
        assert!(matches!(
            db.mark_downloaded("a/c.txt").await,
            Err(Error::Deleted(_))
        ));
    }

    #[tokio::test]
    async fn reset_records() {
        let db = memory().await;

        db.insert_reset("pages", "v7").await.unwrap();
        db.insert_reset("pages", "v8").await.unwrap();

        // A single in-progress record per category
        let resets = db.in_progress_resets().await.unwrap();
        assert_eq!(resets.len(), 1);
        assert_eq!(resets[0].cvs, "v8");
        assert_eq!(db.reset_cvs("pages").await.unwrap().as_deref(), Some("v8"));

        db.delete_reset("pages").await.unwrap();
        assert!(db.in_progress_resets().await.unwrap().is_empty());

        db.insert_reset("pages", "v9").await.unwrap();
        db.insert_reset("assets", "v9").await.unwrap();
        db.delete_all_resets().await.unwrap();
        assert!(db.in_progress_resets().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn apply_reset_replaces_category() {
        let db = memory().await;

        db.merge_updates(
            &[
                file("f1", "a/b.txt", "pages", Status::Published, "c1").into(),
                file("f2", "a/c.txt", "pages", Status::Published, "c1").into(),
                file("f3", "img/x.png", "assets", Status::Published, "c1").into(),
            ],
            &[],
            "c1",
        )
        .await
        .unwrap();

        db.apply_reset(
            "pages",
            &[
                file("f1", "a/b.txt", "pages", Status::Published, "c2").into(),
                file("f4", "a/d.txt", "pages", Status::Published, "c2").into(),
            ],
        )
        .await
        .unwrap();

        let pages = db.category_files("pages").await.unwrap();
        assert_eq!(
            pages.iter().map(|f| f.id.to_string()).collect::<Vec<_>>(),
            vec!["f1".to_string(), "f4".to_string()]
        );
        // Other categories untouched
        assert_eq!(db.category_files("assets").await.unwrap().len(), 1);

        // An empty authoritative list empties the category
        db.apply_reset("pages", &[]).await.unwrap();
        assert!(db.category_files("pages").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn deletes_mark_then_gc() {
        let db = memory().await;

        db.merge_updates(
            &[page_change("f1", "a/b.txt", "c1", "Beta", "beta page")],
            &[],
            "c1",
        )
        .await
        .unwrap();

        db.merge_updates(&[], &[Id::from("f1")], "c2").await.unwrap();

        // Marked rows are invisible to readers but still present
        assert!(db.file_by_id(&Id::from("f1")).await.unwrap().is_none());

        db.prune_deleted().await.unwrap();
        assert!(matches!(
            db.mark_downloaded("a/b.txt").await,
            Err(Error::RowNotFound)
        ));
    }

    #[tokio::test]
    async fn hierarchy_queries() {
        let db = memory().await;

        let changes = [
            ("f1", "index.txt"),
            ("f2", "a/one.txt"),
            ("f3", "a/two.txt"),
            ("f4", "a/one.txt/nested.txt"),
            ("f5", "a/one.txt/deep/leaf.txt"),
            ("f6", "root.txt"),
        ]
        .into_iter()
        .map(|(id, path)| file(id, path, "pages", Status::Published, "c1").into())
        .collect::<Vec<Change>>();

        db.merge_updates(&changes, &[], "c1").await.unwrap();

        let one = db.file_by_id(&Id::from("f2")).await.unwrap().unwrap();

        let siblings = db.siblings(&one).await.unwrap();
        assert_eq!(
            siblings.iter().map(|f| f.path.as_str()).collect::<Vec<_>>(),
            vec!["a/two.txt"]
        );

        let children = db.children(&one).await.unwrap();
        assert_eq!(
            children.iter().map(|f| f.path.as_str()).collect::<Vec<_>>(),
            vec!["a/one.txt/nested.txt"]
        );

        let descendants = db.descendants(&one).await.unwrap();
        assert_eq!(
            descendants.iter().map(|f| f.path.as_str()).collect::<Vec<_>>(),
            vec!["a/one.txt/deep/leaf.txt", "a/one.txt/nested.txt"]
        );

        let root = db.file_by_id(&Id::from("f1")).await.unwrap().unwrap();
        let root_siblings = db.siblings(&root).await.unwrap();
        assert_eq!(
            root_siblings.iter().map(|f| f.path.as_str()).collect::<Vec<_>>(),
            vec!["root.txt"]
        );
    }

    #[tokio::test]
    async fn search_ranks_title_over_content() {
        let db = memory().await;

        db.merge_updates(
            &[
                page_change("f1", "a.txt", "c1", "Nothing here", "mentions locomote once"),
                page_change("f2", "b.txt", "c1", "Locomote guide", "all about it"),
                page_change("f3", "c.txt", "c1", "Unrelated", "unrelated"),
            ],
            &[],
            "c1",
        )
        .await
        .unwrap();

        let results = db.search("locomote", 10).await.unwrap();
        assert_eq!(
            results
                .iter()
                .map(|r| r.file.id.to_string())
                .collect::<Vec<_>>(),
            vec!["f2".to_string(), "f1".to_string()]
        );

        // Limit applies after ranking
        let results = db.search("locomote", 1).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].title.as_deref(), Some("Locomote guide"));

        // Deleted rows never match
        db.merge_updates(&[], &[Id::from("f2")], "c2").await.unwrap();
        let results = db.search("locomote", 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].file.id, Id::from("f1"));
    }

    #[tokio::test]
    async fn cache_locations() {
        let settings = Settings::new("acme", "docs");
        let paths = CachePaths::for_repository(&BasePaths::under("/srv/loco"), &settings);
        let db_paths = paths.clone();

        // Location math is independent of the pool; build the struct by hand.
        let db = Database {
            pool: sqlx::pool::PoolOptions::new().max_connections(1).connect_lazy_with(
                SqliteConnectOptions::from_str("sqlite::memory:").unwrap(),
            ),
            filesets: fileset::standard(),
            paths: db_paths,
        };

        let dir = db.cache_location_for_fileset("pages").unwrap();
        assert!(dir.ends_with("acme/docs/master/cache/pages"));
        assert_eq!(db.cache_location_for_fileset("unknown"), None);

        let packaged = file("f1", "a/b.txt", "pages", Status::Packaged, "c1");
        assert!(db
            .cache_location_for_file(&packaged)
            .unwrap()
            .starts_with(&paths.packaged_dir));

        let published = file("f1", "a/b.txt", "pages", Status::Published, "c1");
        assert_eq!(
            db.cache_location_for_file(&published).unwrap(),
            paths.app_cache_dir.join("pages").join("a/b.txt")
        );
    }
}
