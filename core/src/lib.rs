pub mod adapter;
pub mod backoff;
pub mod bridge;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod limiter;
pub mod model;
pub mod poller;
pub mod store;
pub mod targets;

pub use adapter::{
    AdapterFuture, AdapterSet, BambuAdapter, ConnectionInfo, MockAdapter, MoonrakerAdapter,
    PrinterAdapter, PrusaLinkAdapter, UploadRequest, UploadResult,
};
pub use backoff::BackoffTracker;
pub use bridge::{BridgeRequest, ProcessBridge, ProcessInfo};
pub use config::{
    AdapterTimeouts, BridgeConfig, FleetConfig, LogLevel, PollingConfig, StorageConfig,
};
pub use dispatcher::{remote_file_name, PrintDispatcher};
pub use error::{Error, ErrorClass, Result, StorageAction};
pub use limiter::{ConcurrencyLimiter, LimiterPermit};
pub use model::{
    now_epoch_seconds, Credential, Device, DeviceId, DeviceSnapshot, Endpoint, EpochSeconds,
    FileFormat, FileId, FileRecord, JobId, JobStatus, ManagementState, OperationalState,
    PrintJob, ProtocolKind,
};
pub use poller::{persist_updates, PersistReport, PollUpdate, StatusPoller};
pub use store::{
    DeviceRegistry, FileStore, JobStore, JobUpdate, LocalFileStore, MemoryStore, RonStore,
    SnapshotSink, StoreState,
};
