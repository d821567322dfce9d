//! Consensus (Paxos) client seam: cluster membership, the mastership lease
//! and the reserved-time-threshold record live behind this interface.

use async_trait::async_trait;

use serde::{Deserialize, Serialize};

use tokio::sync::Mutex;
use tokio::time::Duration;

use crate::transport::{
    RpcQueryStub, TxEndpoint, ACK_PAXOS, GET_PAXOS_LEADER_URL, UPDATE_PAXOS,
};
use crate::utils::TsoError;

/// Requests carried in `UPDATE_PAXOS` payloads.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum PaxosRequest {
    JoinCluster { instance_url: String },
    RenewLeaseAndExtendThreshold { instance_url: String },
    StandbyHeartBeat { instance_url: String },
    RemoveLease { new_threshold_ns: Option<u64> },
    ExitCluster { instance_url: String },
}

/// Replies carried in `ACK_PAXOS` payloads.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum PaxosReply {
    Joined {
        is_master: bool,
        master_url: String,
        prev_reserved_time_threshold: u64,
    },
    LeaseExtended {
        lease_expiry_tai_ns: u64,
        reserved_time_threshold: u64,
    },
    Standby {
        master_alive: bool,
        master_url: String,
        prev_reserved_time_threshold: u64,
    },
    Removed,
    Exited,
    Rejected {
        lease_lost: bool,
        reason: String,
    },
}

/// Outcome of joining the server cluster.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ClusterMembership {
    pub is_master: bool,
    pub master_url: String,
    /// The predecessor master's registered threshold; a new master must wait
    /// this value out before issuing anything.
    pub prev_reserved_time_threshold: u64,
}

/// Outcome of a successful master heartbeat.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct LeaseGrant {
    pub lease_expiry_tai_ns: u64,
    pub reserved_time_threshold: u64,
}

/// Outcome of a standby heartbeat.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct StandbyStatus {
    pub master_alive: bool,
    pub master_url: String,
    pub prev_reserved_time_threshold: u64,
}

/// The lease value a correct consensus grants on a heartbeat: tolerates up
/// to 3 missed heartbeats plus one extra millisecond.
pub fn gen_new_lease_val(
    time_authority_now_ns: u64,
    heart_beat_interval: Duration,
) -> u64 {
    time_authority_now_ns
        + 3 * heart_beat_interval.as_nanos() as u64
        + 1_000_000
}

/// Client seam to the consensus subsystem. Implementations must never report
/// success unless consensus actually confirmed: lease safety and threshold
/// durability across mastership changes both rest on it.
#[async_trait]
pub trait ConsensusClient: Send + Sync {
    /// Joins the TSO server cluster, returning this instance's role and the
    /// predecessor threshold.
    async fn join_cluster(
        &self,
        instance_url: &str,
    ) -> Result<ClusterMembership, TsoError>;

    /// Master heartbeat: renews the lease and extends the reserved time
    /// threshold. `LeaseLost` means consensus no longer recognizes this
    /// instance as master.
    async fn renew_lease_and_extend_threshold(
        &self,
        instance_url: &str,
        timeout: Duration,
    ) -> Result<LeaseGrant, TsoError>;

    /// Standby heartbeat: maintains membership and reports on the master's
    /// health.
    async fn update_standby_heartbeat(
        &self,
        instance_url: &str,
    ) -> Result<StandbyStatus, TsoError>;

    /// Removes this instance's lease record, optionally registering a final
    /// threshold for the successor to wait out.
    async fn remove_lease(
        &self,
        new_threshold_ns: Option<u64>,
    ) -> Result<(), TsoError>;

    /// Leaves the cluster.
    async fn exit_cluster(&self, instance_url: &str) -> Result<(), TsoError>;
}

/// RPC-backed consensus client speaking verbs 110..112 to the Paxos leader.
pub struct RpcConsensusClient {
    stub: Mutex<RpcQueryStub>,
    rpc_timeout: Duration,
}

impl RpcConsensusClient {
    /// Connects to any Paxos instance, asks it for the leader URL, and
    /// reconnects to the leader if needed.
    pub async fn connect(
        seed: TxEndpoint,
        with_checksum: bool,
        rpc_timeout: Duration,
    ) -> Result<RpcConsensusClient, TsoError> {
        let mut stub = RpcQueryStub::connect(seed.clone(), with_checksum).await?;
        let reply = stub
            .query(GET_PAXOS_LEADER_URL, &[], rpc_timeout)
            .await?;
        if reply.verb != ACK_PAXOS {
            return logged_err!(
                "paxos";
                "unexpected reply verb {} to leader query",
                reply.verb
            );
        }
        let leader_url: String = rmp_serde::from_slice(&reply.payload)?;
        let leader = TxEndpoint::parse_url(&leader_url)?;
        if leader != seed {
            pf_info!("paxos"; "redirected to leader '{}'", leader);
            stub.close().await?;
            stub = RpcQueryStub::connect(leader, with_checksum).await?;
        }

        Ok(RpcConsensusClient {
            stub: Mutex::new(stub),
            rpc_timeout,
        })
    }

    async fn request(
        &self,
        req: &PaxosRequest,
        timeout: Duration,
    ) -> Result<PaxosReply, TsoError> {
        let payload = rmp_serde::to_vec(req)?;
        let mut stub = self.stub.lock().await;
        let reply = stub.query(UPDATE_PAXOS, &payload, timeout).await?;
        if reply.verb != ACK_PAXOS {
            return logged_err!(
                "paxos";
                "unexpected reply verb {} from consensus",
                reply.verb
            );
        }
        Ok(rmp_serde::from_slice(&reply.payload)?)
    }
}

#[async_trait]
impl ConsensusClient for RpcConsensusClient {
    async fn join_cluster(
        &self,
        instance_url: &str,
    ) -> Result<ClusterMembership, TsoError> {
        let req = PaxosRequest::JoinCluster {
            instance_url: instance_url.into(),
        };
        match self.request(&req, self.rpc_timeout).await? {
            PaxosReply::Joined {
                is_master,
                master_url,
                prev_reserved_time_threshold,
            } => Ok(ClusterMembership {
                is_master,
                master_url,
                prev_reserved_time_threshold,
            }),
            PaxosReply::Rejected { reason, .. } => Err(TsoError::msg(reason)),
            other => logged_err!("paxos"; "unexpected join reply {:?}", other),
        }
    }

    async fn renew_lease_and_extend_threshold(
        &self,
        instance_url: &str,
        timeout: Duration,
    ) -> Result<LeaseGrant, TsoError> {
        let req = PaxosRequest::RenewLeaseAndExtendThreshold {
            instance_url: instance_url.into(),
        };
        match self.request(&req, timeout).await? {
            PaxosReply::LeaseExtended {
                lease_expiry_tai_ns,
                reserved_time_threshold,
            } => Ok(LeaseGrant {
                lease_expiry_tai_ns,
                reserved_time_threshold,
            }),
            PaxosReply::Rejected { lease_lost, reason } => {
                if lease_lost {
                    Err(TsoError::LeaseLost)
                } else {
                    Err(TsoError::msg(reason))
                }
            }
            other => logged_err!("paxos"; "unexpected renew reply {:?}", other),
        }
    }

    async fn update_standby_heartbeat(
        &self,
        instance_url: &str,
    ) -> Result<StandbyStatus, TsoError> {
        let req = PaxosRequest::StandbyHeartBeat {
            instance_url: instance_url.into(),
        };
        match self.request(&req, self.rpc_timeout).await? {
            PaxosReply::Standby {
                master_alive,
                master_url,
                prev_reserved_time_threshold,
            } => Ok(StandbyStatus {
                master_alive,
                master_url,
                prev_reserved_time_threshold,
            }),
            PaxosReply::Rejected { reason, .. } => Err(TsoError::msg(reason)),
            other => logged_err!("paxos"; "unexpected standby reply {:?}", other),
        }
    }

    async fn remove_lease(
        &self,
        new_threshold_ns: Option<u64>,
    ) -> Result<(), TsoError> {
        let req = PaxosRequest::RemoveLease { new_threshold_ns };
        match self.request(&req, self.rpc_timeout).await? {
            PaxosReply::Removed => Ok(()),
            PaxosReply::Rejected { reason, .. } => Err(TsoError::msg(reason)),
            other => logged_err!("paxos"; "unexpected remove reply {:?}", other),
        }
    }

    async fn exit_cluster(&self, instance_url: &str) -> Result<(), TsoError> {
        let req = PaxosRequest::ExitCluster {
            instance_url: instance_url.into(),
        };
        match self.request(&req, self.rpc_timeout).await? {
            PaxosReply::Exited => Ok(()),
            PaxosReply::Rejected { reason, .. } => Err(TsoError::msg(reason)),
            other => logged_err!("paxos"; "unexpected exit reply {:?}", other),
        }
    }
}

#[cfg(test)]
mod consensus_tests {
    use super::*;
    use crate::transport::{MessageMetadata, RpcHub, TransportProto};

    /// Minimal in-process paxos leader answering the verbs the client uses.
    async fn run_fake_paxos(mut hub: RpcHub) {
        let my_url = hub.server_endpoint().url();
        loop {
            let (from, msg) = match hub.recv_msg().await {
                Ok(got) => got,
                Err(_) => return,
            };
            let reply_meta = MessageMetadata::response_to(
                msg.metadata.request_id.unwrap_or(0),
            );
            let payload = match msg.verb {
                GET_PAXOS_LEADER_URL => rmp_serde::to_vec(&my_url).unwrap(),
                UPDATE_PAXOS => {
                    let req: PaxosRequest =
                        rmp_serde::from_slice(&msg.payload).unwrap();
                    let reply = match req {
                        PaxosRequest::JoinCluster { instance_url } => {
                            PaxosReply::Joined {
                                is_master: true,
                                master_url: instance_url,
                                prev_reserved_time_threshold: 500,
                            }
                        }
                        PaxosRequest::RenewLeaseAndExtendThreshold {
                            ..
                        } => PaxosReply::LeaseExtended {
                            lease_expiry_tai_ns: gen_new_lease_val(
                                1_000_000,
                                Duration::from_millis(10),
                            ),
                            reserved_time_threshold: 31_001_000,
                        },
                        PaxosRequest::StandbyHeartBeat { instance_url } => {
                            PaxosReply::Standby {
                                master_alive: true,
                                master_url: instance_url,
                                prev_reserved_time_threshold: 0,
                            }
                        }
                        PaxosRequest::RemoveLease { .. } => PaxosReply::Removed,
                        PaxosRequest::ExitCluster { .. } => PaxosReply::Exited,
                    };
                    rmp_serde::to_vec(&reply).unwrap()
                }
                _ => continue,
            };
            let _ = hub.send(ACK_PAXOS, &payload, &from, reply_meta).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn rpc_client_full_cycle() -> Result<(), TsoError> {
        let hub = RpcHub::new_and_setup(
            TxEndpoint::new(TransportProto::TcpK2rpc, "127.0.0.1", 0),
            false,
        )
        .await?;
        let paxos_ep = hub.server_endpoint().clone();
        tokio::spawn(run_fake_paxos(hub));

        let client = RpcConsensusClient::connect(
            paxos_ep,
            false,
            Duration::from_secs(1),
        )
        .await?;

        let membership = client.join_cluster("rrdma+10.0.0.1:5300").await?;
        assert!(membership.is_master);
        assert_eq!(membership.prev_reserved_time_threshold, 500);

        let grant = client
            .renew_lease_and_extend_threshold(
                "rrdma+10.0.0.1:5300",
                Duration::from_secs(1),
            )
            .await?;
        assert_eq!(grant.lease_expiry_tai_ns, 1_000_000 + 30_000_000 + 1_000_000);
        assert_eq!(grant.reserved_time_threshold, 31_001_000);

        client.remove_lease(Some(grant.reserved_time_threshold)).await?;
        client.exit_cluster("rrdma+10.0.0.1:5300").await?;
        Ok(())
    }

    #[test]
    fn lease_formula_tolerates_three_misses() {
        let lease = gen_new_lease_val(1_000, Duration::from_millis(10));
        assert_eq!(lease, 1_000 + 30_000_000 + 1_000_000);
    }
}
