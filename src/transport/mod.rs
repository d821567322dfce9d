//! RPC transport: endpoint grammar, message framing, per-connection
//! channels, and the per-shard hub.

mod channel;
mod endpoint;
mod frame;
mod hub;
mod stub;

pub use channel::{FailureObserver, MessageObserver, RpcChannel};
pub use endpoint::{TransportProto, TxEndpoint};
pub use frame::{
    encode_frame, MessageMetadata, RpcMessage, RpcParser, Verb, ACK_PAXOS,
    ACK_TIME, GET_ATOMIC_CLOCK_TIME, GET_GPS_CLOCK_TIME,
    GET_PAXOS_LEADER_URL, GET_TSO_MASTER_URL, GET_TSO_WORKERS_URLS,
    UPDATE_PAXOS,
};
pub use hub::RpcHub;
pub use stub::RpcQueryStub;
