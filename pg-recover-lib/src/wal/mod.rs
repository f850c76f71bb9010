//! Component F: write-ahead log replay for point-in-time recovery
//! (spec §4.F). Submodules mirror the pipeline stages: read a segment
//! and reassemble records (`segment`, `record`, `lsn`), maintain the
//! full-page-write cache records are replayed against (`fpw_cache`),
//! apply each record's redo action (`redo`), and orchestrate a scan into
//! either a transaction listing or emitted rows (`txn`, `scan`).

pub mod fpw_cache;
pub mod lsn;
pub mod record;
pub mod redo;
pub mod scan;
pub mod segment;
pub mod txn;

pub use fpw_cache::FpwCache;
pub use lsn::{Lsn, WalSegmentName};
pub use record::{BlockReference, Record, RecordHeader, ResourceManager};
pub use redo::{apply_record, RedoOutcome};
pub use scan::{discover, list_segments, restore, CancellationToken};
pub use segment::{discover_segment_size, SegmentReader, WAL_PAGE_SIZE};
pub use txn::{RecoveredTransaction, TransactionTracker};
