// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

/// Max attempts for a single server request within one refresh cycle
pub const SYNC_RETRY_LIMIT: u32 = 3;
/// Base delay for exponential backoff between retries, in milliseconds
pub const SYNC_RETRY_BASE_DELAY_MS: u64 = 250;
/// Buffer size used when reading a file, 16KiB
pub const FILE_READ_BUFFER_SIZE: usize = 16 * 1024;
/// Files smaller than this are read in one shot rather than streamed
pub const FILE_READ_CHUNK_THRESHOLD: usize = 4 * 1024 * 1024;
/// Default maximum number of full-text search results
pub const SEARCH_RESULT_LIMIT: usize = 50;
/// DB batch size
pub const DB_BATCH_SIZE: usize = 1000;
/// Default interval between content refreshes, in minutes
pub const DEFAULT_REFRESH_INTERVAL_MINUTES: u64 = 5;
/// Default startup sync timeout, in seconds
pub const DEFAULT_STARTUP_TIMEOUT_SECONDS: u64 = 30;

/// Environment variable naming the refresh interval, in minutes
pub const ENV_REFRESH_INTERVAL: &str = "LOCOMOTE_REFRESH_INTERVAL";
/// Environment variable naming the startup sync timeout, in seconds
pub const ENV_STARTUP_TIMEOUT: &str = "LOCOMOTE_STARTUP_TIMEOUT";
/// Environment variable overriding the base data directory
pub const ENV_DATA_DIR: &str = "LOCOMOTE_DATA_DIR";

pub fn version() -> String {
    format!("locomote {}", env!("CARGO_PKG_VERSION"))
}
