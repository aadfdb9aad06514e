//! Kernel module - stream infrastructure and broker integration.

pub mod clients;
pub mod events;
pub mod images;
pub mod ingest;
pub mod reaper;
pub mod storage;

pub use clients::{ClientRegistry, ClientStats};
pub use events::{Metrics, StreamEvent};
pub use images::DecodedImage;
pub use ingest::IngestBridge;
pub use storage::{
    MeasurementStore, NewImage, NewReading, PersistedReading, PgMeasurementStore, TestStore,
};
