// # segsync-core
//
// Core library for segment reconciliation of email-marketing lists.
//
// ## Architecture Overview
//
// This library keeps subscriber segment tags consistent between a local
// tabular snapshot per list and a remote subscriber directory:
// - **RuleSource**: Loads rule rows and groups them per list and segment
// - **evaluator**: Decides whether a subscriber satisfies a segment
// - **tags**: Merges matched segment names into a subscriber's tag string
// - **ListRepository**: Loads/saves list snapshots and change history
// - **Provisioner**: Ensures remote lists, fields and segment labels exist
// - **ReconciliationEngine**: Orchestrates the per-list reconcile flow
// - **ComponentRegistry**: Plugin-based registry for directories and stores
//
// ## Design Principles
//
// 1. **Separation of Concerns**: Core logic is separate from implementations
// 2. **Existence before mutation**: Remote objects are checked before created
// 3. **Plugin-Based**: Directory clients are registered dynamically
// 4. **Library-First**: All core functionality can be used as a library
// 5. **Failure isolation**: Batches, lists and labels fail independently

pub mod config;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod model;
pub mod provisioning;
pub mod registry;
pub mod rules;
pub mod snapshot;
pub mod store;
pub mod tags;
pub mod traits;

// Re-export core types for convenience
pub use config::{
    DirectoryConfig, EngineConfig, ListStoreConfig, RuleSourceConfig, SyncConfig, TableStoreConfig,
};
pub use engine::{ListReport, ReconcileEvent, ReconciliationEngine, RunResult, reconcile};
pub use error::{Error, Result};
pub use model::{
    CellValue, ChangeEntry, ChangeSet, ListId, ListSnapshot, PassthroughRow, Row, SegmentRule,
    SubscriberRecord,
};
pub use provisioning::{LabelOutcome, LabelState, Provisioner, RemoteListHandle};
pub use registry::ComponentRegistry;
pub use rules::{RuleSet, RuleSource};
pub use snapshot::ListRepository;
pub use store::{FileTableStore, MemoryTableStore};
pub use traits::{SegmentLabelProvisioner, SubscriberDirectory, TableStore};
