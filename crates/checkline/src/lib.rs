//! `checkline` - Offline-first inspection checklist capture and sync
//!
//! This library runs fire-department equipment checklists on a device that
//! is often offline: it captures verdicts, notes and photos, queues each
//! finalized checklist durably, and delivers the queue to the records
//! service with an audit timeline once connectivity returns.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod checklist;
pub mod cli;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod logging;
pub mod remote;
pub mod session;
pub mod storage;
pub mod submission;
pub mod sync;
pub mod timeline;
pub mod upload;

pub use checklist::{
    CapturedImage, ChecklistItem, Principal, StaticCatalog, Template, TemplateCatalog,
    TemplateItem, Verdict,
};
pub use config::Config;
pub use connectivity::{Connectivity, ConnectivityProbe};
pub use error::{Error, Result};
pub use logging::init_logging;
pub use remote::{HttpRemoteService, MemoryRemote, RemoteError, RemoteService};
pub use session::{ChecklistSession, FinalizeError, Progress, SessionContext, SessionLimits};
pub use storage::{DrainLease, Storage, StorageStats};
pub use submission::{Submission, SubmissionId, SubmissionState, SubmissionStatus};
pub use sync::{DrainOutcome, DrainReport, SyncHandle, SyncOptions, SyncOrchestrator};
pub use timeline::{TimelineEvent, TimelineOperation};
pub use upload::UploadPipeline;
