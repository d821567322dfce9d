//! Scripted consensus and time-authority fakes shared across tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use tokio::time::Duration;

use crate::server::clock::{ClockReading, MonotonicClock, TimeAuthority};
use crate::server::consensus::{
    gen_new_lease_val, ClusterMembership, ConsensusClient, LeaseGrant,
    StandbyStatus,
};
use crate::utils::TsoError;

/// Consensus fake honoring the lease formula against a supplied clock.
pub(crate) struct ScriptedConsensus {
    clock: Arc<dyn MonotonicClock>,
    /// TAI minus local diff the fake's authority view runs at, so granted
    /// thresholds land on the same scale the workers compute `tbe` on.
    diff_ta_local_ns: i64,
    hb_interval: Duration,
    join_as_master: bool,
    prev_threshold: u64,
    /// Errors to fail upcoming renew calls with, popped per call.
    pub(crate) fail_renews: Mutex<Vec<TsoError>>,
    pub(crate) master_alive: Mutex<bool>,
    pub(crate) removed: Mutex<bool>,
}

impl ScriptedConsensus {
    pub(crate) fn new(
        clock: Arc<dyn MonotonicClock>,
        diff_ta_local_ns: i64,
        join_as_master: bool,
        prev_threshold: u64,
    ) -> Arc<Self> {
        Arc::new(ScriptedConsensus {
            clock,
            diff_ta_local_ns,
            hb_interval: Duration::from_millis(10),
            join_as_master,
            prev_threshold,
            fail_renews: Mutex::new(Vec::new()),
            master_alive: Mutex::new(true),
            removed: Mutex::new(false),
        })
    }

    fn time_authority_now(&self) -> u64 {
        (self.clock.now_ns() as i128 + self.diff_ta_local_ns as i128).max(0)
            as u64
    }

    fn grant(&self) -> LeaseGrant {
        let lease =
            gen_new_lease_val(self.time_authority_now(), self.hb_interval);
        LeaseGrant {
            lease_expiry_tai_ns: lease,
            reserved_time_threshold: lease,
        }
    }
}

#[async_trait]
impl ConsensusClient for ScriptedConsensus {
    async fn join_cluster(
        &self,
        instance_url: &str,
    ) -> Result<ClusterMembership, TsoError> {
        Ok(ClusterMembership {
            is_master: self.join_as_master,
            master_url: instance_url.into(),
            prev_reserved_time_threshold: self.prev_threshold,
        })
    }

    async fn renew_lease_and_extend_threshold(
        &self,
        _instance_url: &str,
        _timeout: Duration,
    ) -> Result<LeaseGrant, TsoError> {
        if let Some(err) = self.fail_renews.lock().unwrap().pop() {
            return Err(err);
        }
        Ok(self.grant())
    }

    async fn update_standby_heartbeat(
        &self,
        instance_url: &str,
    ) -> Result<StandbyStatus, TsoError> {
        Ok(StandbyStatus {
            master_alive: *self.master_alive.lock().unwrap(),
            master_url: instance_url.into(),
            prev_reserved_time_threshold: self.prev_threshold,
        })
    }

    async fn remove_lease(
        &self,
        _new_threshold_ns: Option<u64>,
    ) -> Result<(), TsoError> {
        *self.removed.lock().unwrap() = true;
        Ok(())
    }

    async fn exit_cluster(&self, _instance_url: &str) -> Result<(), TsoError> {
        Ok(())
    }
}

/// Time authority fake returning a settable reading.
pub(crate) struct ScriptedAuthority {
    reading: Mutex<Result<ClockReading, TsoError>>,
}

impl ScriptedAuthority {
    pub(crate) fn fixed(diff: i64, uncertainty: u32) -> Arc<Self> {
        Arc::new(ScriptedAuthority {
            reading: Mutex::new(Ok(ClockReading {
                tai_minus_local_ns: diff,
                uncertainty_ns: uncertainty,
            })),
        })
    }

    pub(crate) fn set(&self, reading: Result<ClockReading, TsoError>) {
        *self.reading.lock().unwrap() = reading;
    }
}

#[async_trait]
impl TimeAuthority for ScriptedAuthority {
    async fn check_atomic_gps_clock(&self) -> Result<ClockReading, TsoError> {
        self.reading.lock().unwrap().clone()
    }
}
