//! Session lifecycle: time source, background persistence and the registry
//! of live sessions.

pub mod clock;
pub mod persister;
pub mod registry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use persister::{
    PersistenceEvent, PersistenceEventReceiver, PersistenceEventSender, Persister,
    persistence_channel,
};
pub use registry::{SessionHandle, SessionRegistry};
