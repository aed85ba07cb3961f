//! NetSched queue engine.
//!
//! The in-memory authoritative state machine behind every queue: job store,
//! status matrix, affinity/group registries, client registry, expiration
//! timeline, dispatcher, and waiter registry, composed behind one coarse
//! lock per queue. The network surface, the queue directory, and the
//! background threads live in `netsched_server`; the wire formats in
//! `netsched_protocol`.

pub mod affinity;
pub mod clients;
pub mod dispatch;
pub mod durability;
pub mod group;
pub mod job;
pub mod queue;
pub mod status;
pub mod store;
pub mod timeline;
pub mod waiters;

pub use affinity::{AffId, AffinityRegistry, RegistryLimits};
pub use clients::{ClientId, ClientRegistry, TouchOutcome};
pub use durability::{Journal, JournalError, JournalEvent, JournalOp, MemoryJournal, NullJournal};
pub use group::{GroupId, GroupRegistry};
pub use job::{Job, JobEvent, JobEventKind};
pub use queue::{
    ConsumeOutcome, ConsumeRequest, CounterSnapshot, Datagram, DispatchedJob, JobInfo, OpOutcome,
    PurgeStats, Queue, QueueContext, SubmitSpec,
};
pub use status::{transition_allowed, StatusMatrix};
pub use waiters::{Waiter, WaiterRegistry};
