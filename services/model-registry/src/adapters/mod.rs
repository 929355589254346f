//! Collaborators the registry core talks to: blob storage, the event bus and
//! notification channels.
pub mod blob;
pub mod events;
pub mod notify;

pub use blob::{BlobError, BlobPresence, BlobStore, HttpBlobStore};
pub use events::{EventBus, EventBusError, EventEnvelope, LogEventBus, MemoryEventBus, NatsEventBus};
pub use notify::{LogChannel, NotificationChannel, NotifyError, WebhookChannel};
