pub mod backend;
pub mod context;
pub mod error;
pub mod events;
pub mod pending;
pub mod policy;
pub mod reconcile;
pub mod resend;
pub mod rest;
pub mod session;
pub mod timeline;
pub mod watcher;
pub mod wire;

pub use backend::GroupBackend;
pub use context::SyncContext;
pub use error::{BackendError, BackendResult};
pub use events::EventBus;
pub use pending::PendingBuffer;
pub use policy::SyncPolicy;
pub use resend::{PassOutcome, PassReport, ResendWorker};
pub use rest::RestBackend;
pub use session::Session;
pub use timeline::{GroupTimeline, LoadReport};
pub use watcher::{GroupWatcher, TickOutcome};
