//! Public interface to the tsoracle core library, linked by the server
//! executable and by client applications.
//!
//! A TSO (timestamp oracle) cluster issues strictly monotonic, globally
//! unique timestamps to clients of a distributed transactional database.
//! Each server process runs one controller shard (cluster membership, the
//! mastership lease, time-authority sync) and any number of worker shards
//! serving the `GetTimestampBatch` hot path.

#[macro_use]
pub mod utils;

pub mod client;
pub mod server;
pub mod transport;

pub use client::{ReceivedBatch, TsoClientStub};
pub use server::{
    ClusterMembership, ConsensusClient, LeaseGrant, MonotonicClock,
    RpcConsensusClient, RpcTimeAuthority, StandbyStatus, SteadyClock,
    TimeAuthority, Timestamp, TimestampBatch, TsoConfig, TsoService,
    WorkerControlInfo, SUICIDE_EXIT_CODE,
};
pub use transport::{TransportProto, TxEndpoint};
pub use utils::TsoError;
