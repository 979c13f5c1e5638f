//! Core traits for segsync
//!
//! This module defines the abstract interfaces of the external collaborators.
//!
//! - [`TableStore`]: Spreadsheet-like local storage
//! - [`SubscriberDirectory`]: The remote email-marketing directory
//! - [`SegmentLabelProvisioner`]: Out-of-band segment label creation

pub mod directory;
pub mod table_store;

pub use directory::{
    DirectoryFactory, FieldType, LabelOperator, ListProfile, RemoteSubscriber,
    SegmentLabelProvisioner, SegmentLabelRule, SubscriberDirectory, SubscriberPayload,
    UpsertOutcome,
};
pub use table_store::{TableStore, TableStoreFactory};
