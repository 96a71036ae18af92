//! # Resync SQLite
//!
//! SQLite staging, target and checkpoint store for resync.
//!
//! Staging tables live next to the target tables in the same connection.
//! Source tables may live in the same database or in an attached one
//! (see [`SqliteStore::attach_source`]); a source name of the form
//! `schema.table` addresses an attached database.
//!
//! Every [`Operation`](resync_core::Operation) renders to a single
//! statement. Target rows are aliased `_t`, staged rows `_s`, so raw
//! override fragments and source conditions refer to columns as
//! `_s."column"` or `_t."column"`.
//!
//! ## Example
//!
//! ```rust
//! use resync_core::{EntityPolicy, SyncEngine, SyncOptions};
//! use resync_sqlite::SqliteStore;
//!
//! let mut store = SqliteStore::open_in_memory().unwrap();
//! store
//!     .connection()
//!     .execute_batch(
//!         "CREATE TABLE src_tags (id INTEGER, date_updated TEXT);
//!          CREATE TABLE tags (id INTEGER PRIMARY KEY, date_updated TEXT);
//!          INSERT INTO src_tags VALUES (1, '2024-01-01 00:00:00');",
//!     )
//!     .unwrap();
//!
//! let policy = EntityPolicy::new("tags")
//!     .with_source_name("src_tags")
//!     .with_fields(["id", "date_updated"]);
//! let report = SyncEngine::new(SyncOptions::new().with_incremental(false))
//!     .run(vec![policy], &mut store)
//!     .unwrap();
//! assert!(report.success());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod sql;
mod store;

pub use error::{SqliteError, SqliteResult};
pub use store::{SqliteStore, CHECKPOINT_TABLE};
