//! Datapoint Storage
//!
//! Collaborator traits the detection and forecast core read from and write
//! to, plus two backends: an in-memory store and a Sled-backed store.

pub mod history;
pub mod persistence;

pub use history::SledStore;
pub use persistence::{
    AnomalyDatapointStore, DatapointStore, InMemoryStore, PredictedDatapointStore, StoreError,
};
