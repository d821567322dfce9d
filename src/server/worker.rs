//! Worker role: serves the `GetTimestampBatch` hot path, deriving timestamps
//! from controller-supplied parameters plus local monotonic time.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};

use tokio::sync::{mpsc, oneshot};

use crate::server::clock::MonotonicClock;
use crate::server::timestamp::{TimestampBatch, TIMESTAMP_BATCH_WIRE_LEN};
use crate::transport::{
    MessageMetadata, RpcHub, RpcMessage, TxEndpoint, ACK_TIME,
    GET_GPS_CLOCK_TIME,
};
use crate::utils::TsoError;

/// Status byte leading every `ACK_TIME` reply to a batch request.
pub const REPLY_STATUS_OK: u8 = 0;
pub const REPLY_STATUS_NOT_READY: u8 = 1;
pub const REPLY_STATUS_SHUTDOWN: u8 = 2;
pub const REPLY_STATUS_BAD_REQUEST: u8 = 3;

/// Bound on clock re-reads while busy-yielding across an exhausted
/// microsecond.
const EXHAUSTED_USEC_SPIN_BOUND: usize = 4096;

/// Control info pushed from the controller to every worker. An immutable
/// snapshot; replaced atomically within the worker's single-threaded shard.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct WorkerControlInfo {
    /// Whether this worker may serve requests.
    pub is_ready: bool,

    /// Step between adjacent timestamps of one worker; equals the total
    /// worker count, so all workers' timestamps interleave without collision.
    pub tbe_ns_step: u16,

    /// Signed offset from the local monotonic clock to TAI nanoseconds.
    pub tbe_adjustment: i64,

    /// Uncertainty window size in ns.
    pub ts_delta: u32,

    /// No batch whose `tbe` exceeds this may be issued.
    pub reserved_time_threshold: u64,

    /// Per-batch TTL stamped into replies, in ns.
    pub batch_ttl_ns: u32,
}

/// Per-worker issuance counters, collected periodically by the controller.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct WorkerStats {
    pub batches_issued: u64,
    pub timestamps_issued: u64,
    pub not_ready_errors: u64,
    pub clamped_batches: u64,
}

impl WorkerStats {
    /// Folds another worker's counters into this aggregate.
    pub fn merge(&mut self, other: &WorkerStats) {
        self.batches_issued += other.batches_issued;
        self.timestamps_issued += other.timestamps_issued;
        self.not_ready_errors += other.not_ready_errors;
        self.clamped_batches += other.clamped_batches;
    }
}

/// Commands dispatched from the controller shard to a worker shard. FIFO per
/// worker; an `UpdateControlInfo` sent before any later command is observed
/// first.
#[derive(Debug)]
pub enum WorkerCommand {
    /// Replace the worker's control info.
    UpdateControlInfo {
        info: WorkerControlInfo,
        ack: oneshot::Sender<()>,
    },

    /// Report issuance counters.
    CollectStats {
        reply: oneshot::Sender<WorkerStats>,
    },

    /// Stop serving: reply `Shutdown` to any further request.
    Quiesce { ack: oneshot::Sender<()> },

    /// Tear the worker down.
    Shutdown { ack: oneshot::Sender<()> },
}

/// The issuance state machine. Pure compute over shard-local state: no
/// suspension points anywhere on this path.
///
/// Timestamps are placed on the nanosecond axis at
/// `floor(now_tai, 1µs) + offset + slot * step`, where `slot` counts
/// timestamps already issued within that microsecond. Successive batches are
/// strictly increasing as long as the monotonic clock never decreases and a
/// backward adjustment is waited out (the hold below).
struct TsIssuer {
    tso_id: u32,

    /// Hosting shard index, used as the log prefix.
    shard: u16,

    /// This worker's residue class on the nanosecond axis, in `[0, step)`.
    offset: u16,

    ctl: WorkerControlInfo,

    /// Requests refuse until the monotonic clock reaches this point; set
    /// when a new adjustment would otherwise move `now_tai` behind the last
    /// issued `tbe`.
    hold_until_mono_ns: u64,

    /// Last request's batch-end time rounded at microsecond level.
    last_tbe_usec_rounded: u64,

    /// Count of timestamps issued within that microsecond. Each worker can
    /// place at most `1000 / step` timestamps per microsecond.
    last_usec_count: u16,

    /// `tbe` of the most recently issued timestamp.
    last_issued_tbe: u64,

    stats: WorkerStats,
}

impl TsIssuer {
    fn new(tso_id: u32, shard: u16, offset: u16) -> Self {
        TsIssuer {
            tso_id,
            shard,
            offset,
            ctl: WorkerControlInfo::default(),
            hold_until_mono_ns: 0,
            last_tbe_usec_rounded: 0,
            last_usec_count: 0,
            last_issued_tbe: 0,
            stats: WorkerStats::default(),
        }
    }

    /// Applies a control info update from the controller. If the new
    /// adjustment moves time backward relative to the last issued `tbe`, the
    /// worker must not serve until local monotonic time catches up with it.
    fn apply_control_info(&mut self, info: WorkerControlInfo, mono_now_ns: u64) {
        if info == self.ctl {
            return;
        }
        if info.tbe_adjustment < self.ctl.tbe_adjustment
            && self.last_issued_tbe > 0
        {
            let projected = mono_now_ns as i128 + info.tbe_adjustment as i128;
            if projected < self.last_issued_tbe as i128 {
                let hold =
                    self.last_issued_tbe as i128 - info.tbe_adjustment as i128;
                self.hold_until_mono_ns = hold.max(0) as u64;
                pf_warn!(
                    self.shard;
                    "adjustment moved time backward, holding issuance for {} ns",
                    self.hold_until_mono_ns.saturating_sub(mono_now_ns)
                );
            }
        }
        self.ctl = info;
    }

    fn refuse(&mut self) -> TsoError {
        self.stats.not_ready_errors += 1;
        TsoError::NotReady
    }

    /// Issues a batch of up to `batch_size` timestamps.
    fn issue(
        &mut self,
        batch_size: u16,
        clock: &dyn MonotonicClock,
    ) -> Result<TimestampBatch, TsoError> {
        if batch_size == 0 {
            return Err(TsoError::msg("requested batch of size 0"));
        }
        let ctl = self.ctl;
        if !ctl.is_ready {
            return Err(self.refuse());
        }
        let step = ctl.tbe_ns_step as u64;
        if step == 0 || step > 1000 {
            return Err(self.refuse());
        }

        let mono = clock.now_ns();
        if mono < self.hold_until_mono_ns {
            return Err(self.refuse());
        }
        let now_tai = mono as i128 + ctl.tbe_adjustment as i128;
        if now_tai <= 0 {
            return Err(self.refuse());
        }
        let mut usec = now_tai as u64 / 1000;
        if usec < self.last_tbe_usec_rounded {
            // cannot happen while the hold above is honored
            return Err(self.refuse());
        }

        let per_usec_cap = (1000 / step) as u16;
        let mut slots_used = if usec == self.last_tbe_usec_rounded {
            self.last_usec_count
        } else {
            0
        };
        if slots_used >= per_usec_cap {
            // microsecond exhausted: busy-yield to the next one, bounded
            let mut advanced = false;
            for _ in 0..EXHAUSTED_USEC_SPIN_BOUND {
                let t = clock.now_ns() as i128 + ctl.tbe_adjustment as i128;
                if t as u64 / 1000 > usec {
                    usec = t as u64 / 1000;
                    slots_used = 0;
                    advanced = true;
                    break;
                }
            }
            if !advanced {
                return Err(self.refuse());
            }
        }

        let tbe_base =
            usec * 1000 + self.offset as u64 + slots_used as u64 * step;
        if tbe_base > ctl.reserved_time_threshold {
            return Err(self.refuse());
        }
        let mut count = batch_size.min(per_usec_cap - slots_used);
        let max_by_threshold =
            (ctl.reserved_time_threshold - tbe_base) / step + 1;
        if count as u64 > max_by_threshold {
            count = max_by_threshold as u16;
            self.stats.clamped_batches += 1;
        }

        self.last_tbe_usec_rounded = usec;
        self.last_usec_count = slots_used + count;
        self.last_issued_tbe = tbe_base + (count as u64 - 1) * step;
        self.stats.batches_issued += 1;
        self.stats.timestamps_issued += count as u64;

        Ok(TimestampBatch {
            tbe_base,
            ts_delta: ctl.ts_delta,
            tso_id: self.tso_id,
            tbe_ns_step: ctl.tbe_ns_step,
            count,
            ttl_ns: ctl.batch_ttl_ns,
        })
    }
}

/// Worker role hosted on one shard. Owns its RPC hub (and thus its listener)
/// and its issuance state exclusively.
pub struct TsoWorker {
    /// Shard index within the service, for logging.
    shard: u16,

    issuer: TsIssuer,

    hub: RpcHub,

    /// Receiver side of the controller command channel.
    rx_ctrl: mpsc::UnboundedReceiver<WorkerCommand>,

    clock: Arc<dyn MonotonicClock>,

    /// Set by `Quiesce`; requests are answered with `Shutdown` afterwards.
    shutting_down: bool,
}

impl TsoWorker {
    pub fn new(
        tso_id: u32,
        shard: u16,
        offset: u16,
        hub: RpcHub,
        rx_ctrl: mpsc::UnboundedReceiver<WorkerCommand>,
        clock: Arc<dyn MonotonicClock>,
    ) -> Self {
        TsoWorker {
            shard,
            issuer: TsIssuer::new(tso_id, shard, offset),
            hub,
            rx_ctrl,
            clock,
            shutting_down: false,
        }
    }

    /// Endpoint URLs this worker serves on, one per transport.
    pub fn urls(&self) -> Vec<String> {
        vec![self.hub.server_endpoint().url()]
    }

    /// Main event loop of this worker shard.
    pub async fn run(mut self) {
        pf_info!(
            self.shard;
            "worker serving on '{}'",
            self.hub.server_endpoint()
        );

        loop {
            tokio::select! {
                // control commands beat request traffic
                biased;

                cmd = self.rx_ctrl.recv() => {
                    match cmd {
                        Some(WorkerCommand::UpdateControlInfo { info, ack }) => {
                            self.issuer
                                .apply_control_info(info, self.clock.now_ns());
                            let _ = ack.send(());
                        }
                        Some(WorkerCommand::CollectStats { reply }) => {
                            let _ = reply.send(self.issuer.stats);
                        }
                        Some(WorkerCommand::Quiesce { ack }) => {
                            self.shutting_down = true;
                            let _ = ack.send(());
                        }
                        Some(WorkerCommand::Shutdown { ack }) => {
                            if let Err(err) = self.hub.stop().await {
                                pf_warn!(
                                    self.shard;
                                    "error stopping worker hub: {}",
                                    err
                                );
                            }
                            let _ = ack.send(());
                            break;
                        }
                        None => break, // controller side dropped
                    }
                },

                msg = self.hub.recv_msg() => {
                    match msg {
                        Ok((from, msg)) => self.handle_request(from, msg).await,
                        Err(_) => break,
                    }
                },
            }
        }

        pf_debug!(self.shard; "worker exited");
    }

    /// Serves one inbound batch request.
    async fn handle_request(&mut self, from: TxEndpoint, msg: RpcMessage) {
        if msg.verb != GET_GPS_CLOCK_TIME {
            pf_warn!(self.shard; "ignoring unexpected verb {}", msg.verb);
            return;
        }
        let reply_meta = match msg.metadata.request_id {
            Some(id) => MessageMetadata::response_to(id),
            None => MessageMetadata::default(),
        };

        let mut payload =
            BytesMut::with_capacity(1 + TIMESTAMP_BATCH_WIRE_LEN);
        if self.shutting_down {
            payload.put_u8(REPLY_STATUS_SHUTDOWN);
        } else if msg.payload.len() < 2 {
            payload.put_u8(REPLY_STATUS_BAD_REQUEST);
        } else {
            let batch_size =
                u16::from_le_bytes([msg.payload[0], msg.payload[1]]);
            match self.issuer.issue(batch_size, &*self.clock) {
                Ok(batch) => {
                    payload.put_u8(REPLY_STATUS_OK);
                    batch.encode(&mut payload);
                }
                Err(TsoError::NotReady) => {
                    payload.put_u8(REPLY_STATUS_NOT_READY);
                }
                Err(TsoError::Shutdown) => {
                    payload.put_u8(REPLY_STATUS_SHUTDOWN);
                }
                Err(_) => payload.put_u8(REPLY_STATUS_BAD_REQUEST),
            }
        }

        if let Err(err) =
            self.hub.send(ACK_TIME, &payload, &from, reply_meta).await
        {
            pf_warn!(self.shard; "error replying to '{}': {}", from, err);
        }
    }
}
