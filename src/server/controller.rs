//! Controller role: cluster membership, the mastership lease heartbeat,
//! periodic synchronization with the authoritative time source, and
//! propagation of control state to the worker shards.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};

use futures::future;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Duration, MissedTickBehavior};

use crate::server::clock::{MonotonicClock, TimeAuthority};
use crate::server::consensus::{gen_new_lease_val, ConsensusClient};
use crate::server::worker::{
    WorkerCommand, WorkerControlInfo, WorkerStats, REPLY_STATUS_OK,
    REPLY_STATUS_SHUTDOWN,
};
use crate::transport::{
    MessageMetadata, RpcHub, RpcMessage, TxEndpoint, ACK_TIME,
    GET_TSO_MASTER_URL, GET_TSO_WORKERS_URLS,
};
use crate::utils::TsoError;

/// Process exit code used when the master finds its lease lost.
pub const SUICIDE_EXIT_CODE: i32 = 1;

/// Consecutive missed heartbeats after which the lease is treated as lost;
/// the lease formula grants exactly this much slack.
const MAX_MISSED_HEARTBEATS: u8 = 3;

/// Largest correction applied to the TAI-local diff per time-sync tick once
/// synced. Larger drift converges over multiple ticks instead of jumping.
const TIME_SYNC_MAX_STEP_NS: i64 = 1_000;

/// Step bound for the wait on the predecessor's reserved time threshold.
const THRESHOLD_WAIT_SLICE: Duration = Duration::from_millis(10);

/// Intervals driving the controller's periodic tasks.
#[derive(Debug, Clone)]
pub struct ControllerTiming {
    pub heart_beat_interval: Duration,
    pub time_sync_interval: Duration,
    pub stats_update_interval: Duration,
    /// Batch uncertainty window, also stamped into batches as their TTL.
    /// Should stay below the minimum transaction latency.
    pub tb_window_size: Duration,
}

/// Cross-shard address of one worker, held by the controller.
pub struct WorkerHandle {
    pub tx: mpsc::UnboundedSender<WorkerCommand>,
    /// Endpoint URLs the worker serves on, one per transport.
    pub urls: Vec<String>,
}

/// Controller role hosted on shard 0.
pub struct TsoController {
    tso_id: u32,

    /// URL of this instance's controller endpoint, registered in consensus.
    my_url: String,

    hub: RpcHub,

    workers: Vec<WorkerHandle>,

    consensus: Arc<dyn ConsensusClient>,
    authority: Arc<dyn TimeAuthority>,
    clock: Arc<dyn MonotonicClock>,

    timing: ControllerTiming,

    // ---- controller state ----
    is_master: bool,

    /// URL of the current TSO master instance.
    master_url: String,

    /// Lease registered at consensus while master, extended by heartbeat.
    my_lease_expiry_tai: u64,

    /// The predecessor master's threshold; must be waited out before the
    /// first ready broadcast.
    prev_reserved_time_threshold: u64,

    /// TAI minus local monotonic, recomputed by time-sync.
    diff_ta_local_ns: i64,

    /// False until the first successful time-sync (which snaps the diff).
    time_synced: bool,

    stop_requested: bool,

    /// Client-facing verbs answer `Shutdown` once unregistered.
    handlers_registered: bool,

    missed_heartbeats: u8,

    last_sent_control_info: WorkerControlInfo,
    control_info_to_send: WorkerControlInfo,

    /// Worker URLs, outer dim worker shards, inner dim transports.
    worker_urls: Vec<Vec<String>>,
}

impl TsoController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tso_id: u32,
        hub: RpcHub,
        workers: Vec<WorkerHandle>,
        consensus: Arc<dyn ConsensusClient>,
        authority: Arc<dyn TimeAuthority>,
        clock: Arc<dyn MonotonicClock>,
        timing: ControllerTiming,
    ) -> Self {
        let my_url = hub.server_endpoint().url();
        TsoController {
            tso_id,
            my_url,
            hub,
            workers,
            consensus,
            authority,
            clock,
            timing,
            is_master: false,
            master_url: String::new(),
            my_lease_expiry_tai: 0,
            prev_reserved_time_threshold: u64::MAX,
            diff_ta_local_ns: 0,
            time_synced: false,
            stop_requested: false,
            handlers_registered: false,
            missed_heartbeats: 0,
            last_sent_control_info: WorkerControlInfo::default(),
            control_info_to_send: WorkerControlInfo::default(),
            worker_urls: Vec::new(),
        }
    }

    /// Known current time of the time authority: local monotonic now plus
    /// the synced diff.
    fn time_authority_now(&self) -> u64 {
        (self.clock.now_ns() as i128 + self.diff_ta_local_ns as i128).max(0)
            as u64
    }

    /// Startup: initialize control info and time sync, join the cluster,
    /// take the assigned role, register client-facing verbs. The periodic
    /// drivers are armed by `run()`.
    pub async fn start(&mut self) -> Result<(), TsoError> {
        self.initialize_internal().await?;

        let membership = self.consensus.join_cluster(&self.my_url).await?;
        pf_info!(
            "ctrl";
            "joined cluster as {} (prev threshold {})",
            if membership.is_master { "master" } else { "standby" },
            membership.prev_reserved_time_threshold
        );
        self.master_url = membership.master_url.clone();
        self.set_role_internal(
            membership.is_master,
            membership.prev_reserved_time_threshold,
        )
        .await?;

        self.handlers_registered = true;
        Ok(())
    }

    /// First step of startup: seed the control info, perform the first time
    /// sync (required; without it every adjustment would be garbage), and
    /// collect the worker endpoint URLs.
    async fn initialize_internal(&mut self) -> Result<(), TsoError> {
        self.control_info_to_send = WorkerControlInfo {
            is_ready: false,
            tbe_ns_step: self.workers.len() as u16,
            tbe_adjustment: 0,
            ts_delta: 0,
            reserved_time_threshold: 0,
            batch_ttl_ns: self.timing.tb_window_size.as_nanos() as u32,
        };

        let reading = self.authority.check_atomic_gps_clock().await?;
        self.diff_ta_local_ns = reading.tai_minus_local_ns;
        self.time_synced = true;
        self.control_info_to_send.tbe_adjustment =
            self.diff_ta_local_ns + (reading.uncertainty_ns as i64) / 2;
        self.control_info_to_send.ts_delta = reading.uncertainty_ns;

        self.worker_urls =
            self.workers.iter().map(|w| w.urls.clone()).collect();
        Ok(())
    }

    /// Takes the given role. A fresh master must wait out the predecessor's
    /// reserved time threshold before the out-of-band heartbeat that flips
    /// workers to ready.
    async fn set_role_internal(
        &mut self,
        is_master: bool,
        prev_reserved_time_threshold: u64,
    ) -> Result<(), TsoError> {
        self.is_master = is_master;
        self.prev_reserved_time_threshold = prev_reserved_time_threshold;

        if is_master {
            self.master_url = self.my_url.clone();
            // joining (or taking over) as master comes with a fresh lease
            self.my_lease_expiry_tai = gen_new_lease_val(
                self.time_authority_now(),
                self.timing.heart_beat_interval,
            );
            loop {
                let now = self.time_authority_now();
                if now > prev_reserved_time_threshold {
                    break;
                }
                let remaining = Duration::from_nanos(
                    prev_reserved_time_threshold - now + 1,
                );
                pf_info!(
                    "ctrl";
                    "waiting out predecessor threshold, {:?} remaining",
                    remaining
                );
                time::sleep(remaining.min(THRESHOLD_WAIT_SLICE)).await;
            }
            // out-of-band heartbeat + broadcast, ahead of the next tick
            self.do_master_heart_beat().await
        } else {
            self.send_workers_control_info().await
        }
    }

    /// One heartbeat tick. `Err(LeaseLost)` demands suicide.
    async fn heart_beat_tick(&mut self) -> Result<(), TsoError> {
        if self.stop_requested {
            return self.do_heart_beat_during_stop().await;
        }
        if self.is_master {
            self.do_master_heart_beat().await
        } else {
            self.do_standby_heart_beat().await
        }
    }

    /// Master path: renew the lease and extend the reserved time threshold.
    /// The RPC timeout equals the heartbeat interval; a timeout counts as a
    /// missed heartbeat and the lease tolerates three of those.
    async fn do_master_heart_beat(&mut self) -> Result<(), TsoError> {
        match self
            .consensus
            .renew_lease_and_extend_threshold(
                &self.my_url,
                self.timing.heart_beat_interval,
            )
            .await
        {
            Ok(grant) => {
                self.missed_heartbeats = 0;
                self.my_lease_expiry_tai = grant.lease_expiry_tai_ns;
                self.control_info_to_send.reserved_time_threshold =
                    grant.reserved_time_threshold;
                self.send_workers_control_info().await
            }
            Err(TsoError::LeaseLost) => Err(TsoError::LeaseLost),
            Err(err) => {
                self.missed_heartbeats += 1;
                pf_warn!(
                    "ctrl";
                    "missed heartbeat {}/{}: {}",
                    self.missed_heartbeats,
                    MAX_MISSED_HEARTBEATS,
                    err
                );
                if self.missed_heartbeats >= MAX_MISSED_HEARTBEATS
                    || self.time_authority_now() > self.my_lease_expiry_tai
                {
                    Err(TsoError::LeaseLost)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Standby path: maintain membership; if consensus reports the former
    /// master dead, take over out-of-band before the next tick.
    async fn do_standby_heart_beat(&mut self) -> Result<(), TsoError> {
        match self.consensus.update_standby_heartbeat(&self.my_url).await {
            Ok(status) => {
                if status.master_alive {
                    self.master_url = status.master_url;
                    Ok(())
                } else {
                    pf_info!("ctrl"; "former master dead, taking over mastership");
                    self.set_role_internal(
                        true,
                        status.prev_reserved_time_threshold,
                    )
                    .await
                }
            }
            Err(err) => {
                pf_warn!("ctrl"; "standby heartbeat failed: {}", err);
                Ok(())
            }
        }
    }

    /// Stop-path heartbeat: fence the workers, then drop the lease record
    /// (registering our final threshold for the successor to wait out).
    async fn do_heart_beat_during_stop(&mut self) -> Result<(), TsoError> {
        let quiesces: Vec<_> = self
            .workers
            .iter()
            .filter_map(|w| {
                let (tx_ack, rx_ack) = oneshot::channel();
                w.tx.send(WorkerCommand::Quiesce { ack: tx_ack })
                    .ok()
                    .map(|()| rx_ack)
            })
            .collect();
        for ack in future::join_all(quiesces).await {
            let _ = ack;
        }
        self.send_workers_control_info().await?;

        if self.is_master {
            if let Err(err) = self
                .consensus
                .remove_lease(Some(
                    self.control_info_to_send.reserved_time_threshold,
                ))
                .await
            {
                pf_warn!("ctrl"; "error removing lease during stop: {}", err);
            }
            self.is_master = false;
        }
        Ok(())
    }

    /// One time-sync tick: refresh the TAI-local diff from the authority
    /// (bounded step once synced) and fold it into the pending control info.
    /// Workers are not pushed from here; the next heartbeat sends.
    async fn time_sync_tick(&mut self) {
        match self.authority.check_atomic_gps_clock().await {
            Ok(reading) => {
                if !self.time_synced {
                    self.diff_ta_local_ns = reading.tai_minus_local_ns;
                    self.time_synced = true;
                } else {
                    let step = (reading.tai_minus_local_ns
                        - self.diff_ta_local_ns)
                        .clamp(-TIME_SYNC_MAX_STEP_NS, TIME_SYNC_MAX_STEP_NS);
                    self.diff_ta_local_ns += step;
                }
                self.control_info_to_send.tbe_adjustment =
                    self.diff_ta_local_ns
                        + (reading.uncertainty_ns as i64) / 2;
                self.control_info_to_send.ts_delta = reading.uncertainty_ns;
            }
            Err(err) => {
                // keep the previous diff; workers are never updated from
                // stale data
                pf_warn!("ctrl"; "time sync failed: {}", err);
            }
        }
    }

    /// One stats tick: collect per-worker counters, aggregate, report.
    async fn stats_tick(&mut self) {
        let replies: Vec<_> = self
            .workers
            .iter()
            .filter_map(|w| {
                let (tx_reply, rx_reply) = oneshot::channel();
                w.tx.send(WorkerCommand::CollectStats { reply: tx_reply })
                    .ok()
                    .map(|()| rx_reply)
            })
            .collect();

        let mut total = WorkerStats::default();
        for reply in future::join_all(replies).await {
            if let Ok(stats) = reply {
                total.merge(&stats);
            }
        }
        pf_info!(
            "ctrl";
            "tso {} stats: batches {} timestamps {} not_ready {} clamped {}",
            self.tso_id,
            total.batches_issued,
            total.timestamps_issued,
            total.not_ready_errors,
            total.clamped_batches
        );
    }

    /// Propagates the pending control info to every worker, skipping the
    /// fan-out when nothing changed since the last send. `is_ready` is
    /// computed here from the current state.
    async fn send_workers_control_info(&mut self) -> Result<(), TsoError> {
        let mut info = self.control_info_to_send;
        info.is_ready = self.is_master
            && !self.stop_requested
            && self.time_authority_now() >= self.prev_reserved_time_threshold;
        if info == self.last_sent_control_info {
            return Ok(());
        }

        let mut acks = Vec::with_capacity(self.workers.len());
        for worker in &self.workers {
            let (tx_ack, rx_ack) = oneshot::channel();
            worker
                .tx
                .send(WorkerCommand::UpdateControlInfo {
                    info,
                    ack: tx_ack,
                })
                .map_err(TsoError::msg)?;
            acks.push(rx_ack);
        }
        for ack in future::join_all(acks).await {
            ack?;
        }

        self.last_sent_control_info = info;
        pf_debug!(
            "ctrl";
            "sent control info: ready {} step {} threshold {}",
            info.is_ready,
            info.tbe_ns_step,
            info.reserved_time_threshold
        );
        Ok(())
    }

    /// Answers the client-facing controller verbs.
    async fn handle_client_query(&mut self, from: TxEndpoint, msg: RpcMessage) {
        let reply_meta = match msg.metadata.request_id {
            Some(id) => MessageMetadata::response_to(id),
            None => MessageMetadata::default(),
        };

        let mut payload = BytesMut::new();
        match msg.verb {
            GET_TSO_MASTER_URL => {
                if self.handlers_registered {
                    payload.put_u8(REPLY_STATUS_OK);
                    match rmp_serde::to_vec(&self.master_url) {
                        Ok(bytes) => payload.extend_from_slice(&bytes),
                        Err(err) => {
                            pf_error!("ctrl"; "error encoding master url: {}", err);
                            return;
                        }
                    }
                } else {
                    payload.put_u8(REPLY_STATUS_SHUTDOWN);
                }
            }
            GET_TSO_WORKERS_URLS => {
                if self.handlers_registered {
                    payload.put_u8(REPLY_STATUS_OK);
                    match rmp_serde::to_vec(&self.worker_urls) {
                        Ok(bytes) => payload.extend_from_slice(&bytes),
                        Err(err) => {
                            pf_error!("ctrl"; "error encoding worker urls: {}", err);
                            return;
                        }
                    }
                } else {
                    payload.put_u8(REPLY_STATUS_SHUTDOWN);
                }
            }
            verb => {
                pf_warn!("ctrl"; "ignoring unexpected verb {}", verb);
                return;
            }
        }

        if let Err(err) =
            self.hub.send(ACK_TIME, &payload, &from, reply_meta).await
        {
            pf_warn!("ctrl"; "error replying to '{}': {}", from, err);
        }
    }

    /// Unconditionally crash the process: we are master but no longer hold
    /// the lease. No consensus cleanup is attempted (the record is already
    /// lost); workers everywhere are fenced by the absence of further
    /// threshold extensions.
    fn suicide(&self) -> ! {
        pf_error!(
            "ctrl";
            "tso {} lost mastership lease, terminating now",
            self.tso_id
        );
        std::process::exit(SUICIDE_EXIT_CODE);
    }

    /// Main event loop of the controller shard. All periodic tasks are
    /// serialized here; a tick that would overlap a still-running prior
    /// handler is skipped.
    pub async fn run(mut self, mut rx_stop: watch::Receiver<bool>) {
        let mut heart_beat =
            time::interval(self.timing.heart_beat_interval);
        heart_beat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut time_sync = time::interval(self.timing.time_sync_interval);
        time_sync.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut stats_update =
            time::interval(self.timing.stats_update_interval);
        stats_update.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = heart_beat.tick() => {
                    match self.heart_beat_tick().await {
                        Ok(()) => {}
                        Err(TsoError::LeaseLost) => self.suicide(),
                        Err(err) => pf_error!("ctrl"; "heartbeat error: {}", err),
                    }
                    if self.stop_requested {
                        break; // timers are cancelled by exiting the loop
                    }
                },

                _ = time_sync.tick() => self.time_sync_tick().await,

                _ = stats_update.tick() => self.stats_tick().await,

                msg = self.hub.recv_msg() => {
                    match msg {
                        Ok((from, msg)) => {
                            self.handle_client_query(from, msg).await;
                        }
                        Err(_) => break,
                    }
                },

                _ = rx_stop.changed() => {
                    pf_info!("ctrl"; "graceful stop requested");
                    self.stop_requested = true;
                    self.handlers_registered = false;
                    // the next heartbeat tick runs the stop path
                },
            }
        }

        // past the loop: lease removed by the stop-path heartbeat; leave the
        // cluster and tear everything down
        if let Err(err) = self.consensus.exit_cluster(&self.my_url).await {
            pf_warn!("ctrl"; "error exiting cluster: {}", err);
        }

        let shutdowns: Vec<_> = self
            .workers
            .iter()
            .filter_map(|w| {
                let (tx_ack, rx_ack) = oneshot::channel();
                w.tx.send(WorkerCommand::Shutdown { ack: tx_ack })
                    .ok()
                    .map(|()| rx_ack)
            })
            .collect();
        for ack in future::join_all(shutdowns).await {
            let _ = ack;
        }

        if let Err(err) = self.hub.stop().await {
            pf_warn!("ctrl"; "error stopping controller hub: {}", err);
        }
        pf_info!("ctrl"; "controller exited");
    }
}

#[cfg(test)]
mod controller_tests {
    use super::*;
    use crate::server::clock::test_clock::ManualClock;
    use crate::server::clock::ClockReading;
    use crate::server::testutil::{ScriptedAuthority, ScriptedConsensus};
    use crate::transport::TransportProto;

    /// Spawns a stand-in worker task that acks every command and records the
    /// control infos it observes.
    fn recorder_worker(
    ) -> (WorkerHandle, mpsc::UnboundedReceiver<WorkerControlInfo>) {
        let (tx_cmd, mut rx_cmd) = mpsc::unbounded_channel();
        let (tx_seen, rx_seen) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(cmd) = rx_cmd.recv().await {
                match cmd {
                    WorkerCommand::UpdateControlInfo { info, ack } => {
                        let _ = tx_seen.send(info);
                        let _ = ack.send(());
                    }
                    WorkerCommand::CollectStats { reply } => {
                        let _ = reply.send(WorkerStats::default());
                    }
                    WorkerCommand::Quiesce { ack } => {
                        let _ = ack.send(());
                    }
                    WorkerCommand::Shutdown { ack } => {
                        let _ = ack.send(());
                        break;
                    }
                }
            }
        });
        (
            WorkerHandle {
                tx: tx_cmd,
                urls: vec!["rrdma+127.0.0.1:5301".into()],
            },
            rx_seen,
        )
    }

    async fn test_controller(
        consensus: Arc<ScriptedConsensus>,
        authority: Arc<ScriptedAuthority>,
        clock: Arc<ManualClock>,
        n_workers: usize,
    ) -> Result<
        (TsoController, Vec<mpsc::UnboundedReceiver<WorkerControlInfo>>),
        TsoError,
    > {
        let hub = RpcHub::new_and_setup(
            TxEndpoint::new(TransportProto::TcpK2rpc, "127.0.0.1", 0),
            false,
        )
        .await?;
        let mut workers = Vec::new();
        let mut seens = Vec::new();
        for _ in 0..n_workers {
            let (handle, seen) = recorder_worker();
            workers.push(handle);
            seens.push(seen);
        }
        let ctrl = TsoController::new(
            7,
            hub,
            workers,
            consensus,
            authority,
            clock,
            ControllerTiming {
                heart_beat_interval: Duration::from_millis(10),
                time_sync_interval: Duration::from_millis(10),
                stats_update_interval: Duration::from_secs(1),
                tb_window_size: Duration::from_millis(8),
            },
        );
        Ok((ctrl, seens))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_as_master_readies_workers() -> Result<(), TsoError> {
        let clock = ManualClock::at(1_000);
        let consensus = ScriptedConsensus::new(clock.clone(), 0, true, 0);
        let authority = ScriptedAuthority::fixed(500_000, 4_000);
        let (mut ctrl, mut seens) =
            test_controller(consensus, authority, clock, 3).await?;

        ctrl.start().await?;
        assert!(ctrl.is_master);
        assert_eq!(ctrl.master_url, ctrl.my_url);

        for seen in seens.iter_mut() {
            let info = seen.recv().await.unwrap();
            assert!(info.is_ready);
            assert_eq!(info.tbe_ns_step, 3);
            assert_eq!(info.ts_delta, 4_000);
            assert_eq!(info.tbe_adjustment, 500_000 + 2_000);
            assert!(info.reserved_time_threshold > 0);
            assert_eq!(info.batch_ttl_ns, 8_000_000);
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn master_waits_out_prev_threshold() -> Result<(), TsoError> {
        let clock = ManualClock::at(0);
        // predecessor threshold lies 5ms of TAI time ahead
        let consensus =
            ScriptedConsensus::new(clock.clone(), 0, true, 5_000_000);
        let authority = ScriptedAuthority::fixed(0, 1_000);
        let (mut ctrl, mut seens) =
            test_controller(consensus, authority, clock.clone(), 1).await?;

        let ticker = {
            let clock = clock.clone();
            tokio::spawn(async move {
                // stand-in for real time passing under the manual clock
                loop {
                    time::sleep(Duration::from_millis(2)).await;
                    clock.advance(2_000_000);
                }
            })
        };
        ctrl.start().await?;
        ticker.abort();

        let info = seens[0].recv().await.unwrap();
        assert!(info.is_ready);
        assert!(ctrl.time_authority_now() > 5_000_000);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lease_rejection_demands_suicide() -> Result<(), TsoError> {
        let clock = ManualClock::at(1_000);
        let consensus = ScriptedConsensus::new(clock.clone(), 0, true, 0);
        let authority = ScriptedAuthority::fixed(0, 1_000);
        let (mut ctrl, _seens) =
            test_controller(consensus.clone(), authority, clock, 1).await?;
        ctrl.start().await?;

        consensus
            .fail_renews
            .lock()
            .unwrap()
            .push(TsoError::LeaseLost);
        assert_eq!(ctrl.heart_beat_tick().await, Err(TsoError::LeaseLost));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn three_missed_heartbeats_lose_the_lease() -> Result<(), TsoError> {
        let clock = ManualClock::at(1_000);
        let consensus = ScriptedConsensus::new(clock.clone(), 0, true, 0);
        let authority = ScriptedAuthority::fixed(0, 1_000);
        let (mut ctrl, _seens) =
            test_controller(consensus.clone(), authority, clock, 1).await?;
        ctrl.start().await?;

        for _ in 0..3 {
            consensus
                .fail_renews
                .lock()
                .unwrap()
                .push(TsoError::msg("rpc timed out"));
        }
        assert_eq!(ctrl.heart_beat_tick().await, Ok(()));
        assert_eq!(ctrl.heart_beat_tick().await, Ok(()));
        assert_eq!(ctrl.heart_beat_tick().await, Err(TsoError::LeaseLost));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unchanged_control_info_is_not_resent() -> Result<(), TsoError> {
        let clock = ManualClock::at(1_000);
        let consensus = ScriptedConsensus::new(clock.clone(), 0, true, 0);
        let authority = ScriptedAuthority::fixed(0, 1_000);
        let (mut ctrl, mut seens) =
            test_controller(consensus, authority, clock.clone(), 1).await?;
        ctrl.start().await?;
        let _ = seens[0].recv().await.unwrap();

        // same pending info: the fan-out is skipped
        ctrl.send_workers_control_info().await?;
        assert!(seens[0].try_recv().is_err());

        // a heartbeat with the clock unmoved grants the same threshold, so
        // nothing is resent either
        ctrl.heart_beat_tick().await?;
        assert!(seens[0].try_recv().is_err());

        // once the clock moves, the extended threshold must be fanned out
        clock.advance(10_000);
        ctrl.heart_beat_tick().await?;
        assert!(seens[0].try_recv().is_ok());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn time_sync_step_is_bounded() -> Result<(), TsoError> {
        let clock = ManualClock::at(1_000);
        let consensus = ScriptedConsensus::new(clock.clone(), 0, true, 0);
        let authority = ScriptedAuthority::fixed(100_000, 2_000);
        let (mut ctrl, _seens) =
            test_controller(consensus, authority.clone(), clock, 1).await?;
        ctrl.start().await?;
        assert_eq!(ctrl.diff_ta_local_ns, 100_000);

        // a 10µs drift converges at most 1µs per tick
        authority.set(Ok(ClockReading {
            tai_minus_local_ns: 110_000,
            uncertainty_ns: 2_000,
        }));
        ctrl.time_sync_tick().await;
        assert_eq!(ctrl.diff_ta_local_ns, 101_000);
        ctrl.time_sync_tick().await;
        assert_eq!(ctrl.diff_ta_local_ns, 102_000);
        assert_eq!(
            ctrl.control_info_to_send.tbe_adjustment,
            102_000 + 1_000
        );

        // clock outage keeps the previous diff
        authority.set(Err(TsoError::ClockUnavailable("gps down".into())));
        ctrl.time_sync_tick().await;
        assert_eq!(ctrl.diff_ta_local_ns, 102_000);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn standby_takes_over_dead_master() -> Result<(), TsoError> {
        let clock = ManualClock::at(1_000);
        let consensus = ScriptedConsensus::new(clock.clone(), 0, false, 0);
        let authority = ScriptedAuthority::fixed(0, 1_000);
        let (mut ctrl, mut seens) =
            test_controller(consensus.clone(), authority, clock, 2).await?;
        ctrl.start().await?;
        assert!(!ctrl.is_master);
        // standby broadcast carries is_ready = false
        let info = seens[0].recv().await.unwrap();
        assert!(!info.is_ready);

        *consensus.master_alive.lock().unwrap() = false;
        ctrl.heart_beat_tick().await?;
        assert!(ctrl.is_master);
        let info = seens[0].recv().await.unwrap();
        assert!(info.is_ready);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_path_removes_lease_and_fences() -> Result<(), TsoError> {
        let clock = ManualClock::at(1_000);
        let consensus = ScriptedConsensus::new(clock.clone(), 0, true, 0);
        let authority = ScriptedAuthority::fixed(0, 1_000);
        let (mut ctrl, mut seens) =
            test_controller(consensus.clone(), authority, clock, 1).await?;
        ctrl.start().await?;
        let _ = seens[0].recv().await.unwrap();

        ctrl.stop_requested = true;
        ctrl.heart_beat_tick().await?;
        assert!(*consensus.removed.lock().unwrap());
        let info = seens[0].recv().await.unwrap();
        assert!(!info.is_ready);
        Ok(())
    }
}
