//! Monotonic clock source and the time-authority (atomic/GPS clock) seam.

use std::sync::OnceLock;
use std::time::Instant;

use async_trait::async_trait;

use serde::{Deserialize, Serialize};

use tokio::sync::Mutex;
use tokio::time::Duration;

use crate::transport::{
    RpcQueryStub, TxEndpoint, ACK_TIME, GET_ATOMIC_CLOCK_TIME,
};
use crate::utils::TsoError;

static PROCESS_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds elapsed on the process-local steady clock. Strictly
/// non-decreasing; the zero point is the first call in this process.
pub fn monotonic_ns() -> u64 {
    PROCESS_EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Strictly non-decreasing nanosecond counter seam, so the issuance path can
/// be driven by a hand-cranked clock in tests.
pub trait MonotonicClock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// The process steady clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SteadyClock;

impl MonotonicClock for SteadyClock {
    fn now_ns(&self) -> u64 {
        monotonic_ns()
    }
}

/// One reading from the time authority: the difference of TAI to the local
/// steady clock, and the size of the uncertainty window around it. The
/// current real time lies within
/// `[local + tai_minus_local_ns, local + tai_minus_local_ns + uncertainty_ns]`.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub struct ClockReading {
    pub tai_minus_local_ns: i64,
    pub uncertainty_ns: u32,
}

/// Seam to the authoritative hardware time source.
#[async_trait]
pub trait TimeAuthority: Send + Sync {
    /// Queries the atomic/GPS clock service for a fresh reading.
    async fn check_atomic_gps_clock(&self) -> Result<ClockReading, TsoError>;
}

/// RPC-backed time authority speaking `GET_ATOMIC_CLOCK_TIME`/`ACK_TIME` to
/// the hardware clock service.
pub struct RpcTimeAuthority {
    stub: Mutex<RpcQueryStub>,
    rpc_timeout: Duration,
}

impl RpcTimeAuthority {
    pub async fn connect(
        endpoint: TxEndpoint,
        with_checksum: bool,
        rpc_timeout: Duration,
    ) -> Result<RpcTimeAuthority, TsoError> {
        let stub = RpcQueryStub::connect(endpoint, with_checksum).await?;
        Ok(RpcTimeAuthority {
            stub: Mutex::new(stub),
            rpc_timeout,
        })
    }
}

#[async_trait]
impl TimeAuthority for RpcTimeAuthority {
    async fn check_atomic_gps_clock(&self) -> Result<ClockReading, TsoError> {
        let mut stub = self.stub.lock().await;
        let reply = stub
            .query(GET_ATOMIC_CLOCK_TIME, &[], self.rpc_timeout)
            .await
            .map_err(|e| TsoError::ClockUnavailable(e.to_string()))?;
        if reply.verb != ACK_TIME {
            return Err(TsoError::ClockUnavailable(format!(
                "unexpected reply verb {}",
                reply.verb
            )));
        }
        rmp_serde::from_slice(&reply.payload)
            .map_err(|e| TsoError::ClockUnavailable(e.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod test_clock {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use super::MonotonicClock;

    /// Hand-cranked monotonic clock for deterministic issuance tests.
    #[derive(Debug, Default)]
    pub(crate) struct ManualClock {
        now_ns: AtomicU64,
    }

    impl ManualClock {
        pub(crate) fn at(now_ns: u64) -> Arc<ManualClock> {
            Arc::new(ManualClock {
                now_ns: AtomicU64::new(now_ns),
            })
        }

        pub(crate) fn set(&self, now_ns: u64) {
            self.now_ns.store(now_ns, Ordering::Release);
        }

        pub(crate) fn advance(&self, delta_ns: u64) {
            self.now_ns.fetch_add(delta_ns, Ordering::AcqRel);
        }
    }

    impl MonotonicClock for ManualClock {
        fn now_ns(&self) -> u64 {
            self.now_ns.load(Ordering::Acquire)
        }
    }
}

#[cfg(test)]
mod clock_tests {
    use super::*;

    #[test]
    fn monotonic_never_decreases() {
        let mut prev = monotonic_ns();
        for _ in 0..1000 {
            let now = monotonic_ns();
            assert!(now >= prev);
            prev = now;
        }
    }
}
