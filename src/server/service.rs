//! TSO service: shard layout and lifecycle. Shard 0 hosts the controller,
//! every remaining shard hosts one worker with its own listener.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::server::clock::{MonotonicClock, SteadyClock, TimeAuthority};
use crate::server::consensus::ConsensusClient;
use crate::server::controller::{
    ControllerTiming, TsoController, WorkerHandle,
};
use crate::server::worker::TsoWorker;
use crate::transport::{RpcHub, TransportProto, TxEndpoint};
use crate::utils::TsoError;

/// Workers partition each microsecond into `1000 / worker_count` slots, so
/// more than 1000 of them cannot tile the nanosecond axis.
const MAX_WORKERS: u16 = 1000;

/// Configuration parameters struct.
#[derive(Debug, PartialEq, Eq, Clone, serde::Deserialize)]
pub struct TsoConfig {
    /// Controller heartbeat interval in millisecs.
    pub ctrol_heart_beat_interval_ms: u64,

    /// Controller time-sync interval in millisecs.
    pub ctrol_time_sync_interval_ms: u64,

    /// Controller stats collection interval in millisecs.
    pub ctrol_stats_update_interval_ms: u64,

    /// Batch uncertainty window size in millisecs; should be less than the
    /// minimum transaction latency. Also used as the batches' TTL.
    pub ctrol_ts_batch_win_size_ms: u64,

    /// Whether RPC frames carry a per-frame CRC.
    pub enable_tx_checksum: bool,
}

impl Default for TsoConfig {
    fn default() -> Self {
        TsoConfig {
            ctrol_heart_beat_interval_ms: 10,
            ctrol_time_sync_interval_ms: 10,
            ctrol_stats_update_interval_ms: 1000,
            ctrol_ts_batch_win_size_ms: 8,
            enable_tx_checksum: false,
        }
    }
}

impl TsoConfig {
    /// Parses a config from an optional TOML string and validates it.
    pub fn parse(config_str: Option<&str>) -> Result<TsoConfig, TsoError> {
        let config = parsed_config!(config_str => TsoConfig;
                                    ctrol_heart_beat_interval_ms,
                                    ctrol_time_sync_interval_ms,
                                    ctrol_stats_update_interval_ms,
                                    ctrol_ts_batch_win_size_ms,
                                    enable_tx_checksum)?;
        if config.ctrol_heart_beat_interval_ms == 0 {
            return logged_err!("svc"; "invalid ctrol_heart_beat_interval_ms '0'");
        }
        if config.ctrol_time_sync_interval_ms == 0 {
            return logged_err!("svc"; "invalid ctrol_time_sync_interval_ms '0'");
        }
        if config.ctrol_stats_update_interval_ms == 0 {
            return logged_err!("svc"; "invalid ctrol_stats_update_interval_ms '0'");
        }
        if config.ctrol_ts_batch_win_size_ms == 0 {
            return logged_err!("svc"; "invalid ctrol_ts_batch_win_size_ms '0'");
        }
        Ok(config)
    }
}

/// One running TSO server instance.
pub struct TsoService {
    tso_id: u32,

    controller_url: String,
    worker_urls: Vec<Vec<String>>,

    tx_stop: watch::Sender<bool>,
    controller_handle: JoinHandle<()>,
    worker_handles: Vec<JoinHandle<()>>,
}

impl TsoService {
    /// Creates and starts a TSO server instance: binds one listener per
    /// shard, spawns the worker tasks, runs the controller's startup
    /// sequence (cluster join, role take-over), then arms its periodic
    /// drivers.
    ///
    /// With `base_port` p, the controller listens on p and worker shard k on
    /// p + k; a base port of 0 lets every shard pick a free port.
    #[allow(clippy::too_many_arguments)]
    pub async fn new_and_setup(
        tso_id: u32,
        shards: u16,
        listen_host: &str,
        base_port: u16,
        proto: TransportProto,
        consensus: Arc<dyn ConsensusClient>,
        authority: Arc<dyn TimeAuthority>,
        config_str: Option<&str>,
    ) -> Result<TsoService, TsoError> {
        if shards < 2 {
            return Err(TsoError::NotEnoughCores(shards));
        }
        let worker_count = shards - 1;
        if worker_count > MAX_WORKERS {
            return logged_err!(
                "svc";
                "at most {} workers supported, configured with {}",
                MAX_WORKERS,
                worker_count
            );
        }
        if 1000 % worker_count != 0 {
            // uniqueness still holds via per-microsecond slot disjointness,
            // but worker residue classes are then only stable within one
            // microsecond
            pf_warn!(
                "svc";
                "{} workers do not evenly tile the nanosecond axis",
                worker_count
            );
        }
        let config = TsoConfig::parse(config_str)?;

        let clock: Arc<dyn MonotonicClock> = Arc::new(SteadyClock);

        let mut worker_handles = Vec::with_capacity(worker_count as usize);
        let mut workers = Vec::with_capacity(worker_count as usize);
        for shard in 1..=worker_count {
            let port = if base_port == 0 { 0 } else { base_port + shard };
            let hub = RpcHub::new_and_setup(
                TxEndpoint::new(proto, listen_host, port),
                config.enable_tx_checksum,
            )
            .await?;
            let (tx_cmd, rx_cmd) = mpsc::unbounded_channel();
            let worker = TsoWorker::new(
                tso_id,
                shard,
                shard - 1, // residue offset within [0, worker_count)
                hub,
                rx_cmd,
                clock.clone(),
            );
            workers.push(WorkerHandle {
                tx: tx_cmd,
                urls: worker.urls(),
            });
            worker_handles.push(tokio::spawn(worker.run()));
        }
        let worker_urls: Vec<Vec<String>> =
            workers.iter().map(|w| w.urls.clone()).collect();

        let ctrl_hub = RpcHub::new_and_setup(
            TxEndpoint::new(proto, listen_host, base_port),
            config.enable_tx_checksum,
        )
        .await?;
        let controller_url = ctrl_hub.server_endpoint().url();

        let timing = ControllerTiming {
            heart_beat_interval: Duration::from_millis(
                config.ctrol_heart_beat_interval_ms,
            ),
            time_sync_interval: Duration::from_millis(
                config.ctrol_time_sync_interval_ms,
            ),
            stats_update_interval: Duration::from_millis(
                config.ctrol_stats_update_interval_ms,
            ),
            tb_window_size: Duration::from_millis(
                config.ctrol_ts_batch_win_size_ms,
            ),
        };
        let mut controller = TsoController::new(
            tso_id, ctrl_hub, workers, consensus, authority, clock, timing,
        );
        controller.start().await?;

        let (tx_stop, rx_stop) = watch::channel(false);
        let controller_handle = tokio::spawn(controller.run(rx_stop));

        pf_info!(
            "svc";
            "tso {} up with {} worker shards, controller at '{}'",
            tso_id,
            worker_count,
            controller_url
        );
        Ok(TsoService {
            tso_id,
            controller_url,
            worker_urls,
            tx_stop,
            controller_handle,
            worker_handles,
        })
    }

    /// URL of the controller's client-facing endpoint.
    pub fn controller_url(&self) -> &str {
        &self.controller_url
    }

    /// Worker endpoint URLs; outer dim worker shards, inner dim transports.
    pub fn worker_urls(&self) -> &[Vec<String>] {
        &self.worker_urls
    }

    /// Stops the instance gracefully. In-flight work completes, the lease is
    /// removed from consensus, all shards wind down.
    pub async fn graceful_stop(self) -> Result<(), TsoError> {
        self.tx_stop.send(true)?;
        self.controller_handle.await?;
        for handle in self.worker_handles {
            handle.await?;
        }
        pf_info!("svc"; "tso {} stopped gracefully", self.tso_id);
        Ok(())
    }
}
