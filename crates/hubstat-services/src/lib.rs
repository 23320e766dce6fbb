//! hubstat-services — the status aggregation pipeline.
//!
//! Deliveries flow receiver → assembler → conflation manager → ready queue
//! → worker pool → bundle handlers. The committer derives transport offsets
//! from what has been fully processed.

pub mod assembler;
pub mod commit;
pub mod dedup;
pub mod manager;
pub mod ready_queue;
pub mod receiver;
pub mod registration;
pub mod sink;
pub mod stats;
pub mod transport;
pub mod unit;
pub mod worker;

pub use assembler::{AssembledMessage, AssemblyError, MessageAssembler};
pub use commit::{commit_positions, resumption_snapshot, Committer, OffsetStore};
pub use dedup::DedupCache;
pub use manager::{ConflationManager, InsertOutcome};
pub use ready_queue::{ReadyQueue, Ticket};
pub use receiver::{handle_delivery, sweep_loop, Receiver};
pub use registration::{
    BundleHandler, BundleMetadata, Registration, RegistrationError, Registry, SyncMode,
};
pub use sink::FileSink;
pub use stats::{PipelineStats, StatsSnapshot};
pub use transport::{channel, ChannelSender, ChannelTransport, Delivery, Fragmenter, Transport};
pub use unit::{ClaimedBundle, Completion, ConflationUnit, Outcome, ResumptionMetadata};
pub use worker::{RetryPolicy, WorkerPool};
