// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

pub mod queue;
pub mod sql;
pub mod tables;
pub mod traits;

pub use sql::{Dialect, SqlStore};
pub use tables::TableManager;
pub use traits::{CursorStore, MetadataStore, QueueStore, RecordStore, RowData, StorageError, StoredRow, SyncCursor};
