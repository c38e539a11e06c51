pub mod instance;
pub mod link;
pub mod slots;

pub use instance::{Instance, InstanceError, InstanceRegistry, RECONNECT_PERIOD};
pub use link::{connection_error_reply, BackendLink, LinkSender, MAX_PENDING_REQUESTS};
pub use slots::SlotTable;
