//! Server-side functionality: timestamp types, clock and consensus seams,
//! the worker and controller roles, and the service shard layout.

mod clock;
mod consensus;
mod controller;
mod service;
mod timestamp;
mod worker;

#[cfg(test)]
pub(crate) mod testutil;

pub use clock::{
    monotonic_ns, ClockReading, MonotonicClock, RpcTimeAuthority,
    SteadyClock, TimeAuthority,
};
pub use consensus::{
    gen_new_lease_val, ClusterMembership, ConsensusClient, LeaseGrant,
    PaxosReply, PaxosRequest, RpcConsensusClient, StandbyStatus,
};
pub use controller::{
    ControllerTiming, TsoController, WorkerHandle, SUICIDE_EXIT_CODE,
};
pub use service::{TsoConfig, TsoService};
pub use timestamp::{Timestamp, TimestampBatch, TIMESTAMP_BATCH_WIRE_LEN};
pub use worker::{
    TsoWorker, WorkerCommand, WorkerControlInfo, WorkerStats,
    REPLY_STATUS_BAD_REQUEST, REPLY_STATUS_NOT_READY, REPLY_STATUS_OK,
    REPLY_STATUS_SHUTDOWN,
};
