//! Time, clocks and the phased event scheduler.

mod clock;
mod dag;
mod event;
mod scheduler;
mod sleeper;

pub use clock::{Clock, ClockTree};
pub use dag::{Dag, VertexId};
pub use event::{EventSpec, Handler, Payload, PendingOccurrence, RunSummary, StopReason};
pub(crate) use event::Occurrence;
pub use scheduler::{Scheduler, SchedulerState};
pub use sleeper::{Expired, Sleeper, TimeoutSettings};
