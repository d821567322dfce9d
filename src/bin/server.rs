//! TSO server node executable.

use std::sync::Arc;

use clap::Parser;

use env_logger::Env;

use tokio::runtime::Builder;
use tokio::signal;
use tokio::time::Duration;

use tsoracle::{
    pf_error, pf_info, RpcConsensusClient, RpcTimeAuthority, TransportProto,
    TsoConfig, TsoError, TsoService, TxEndpoint,
};

/// Timeout on the one-shot control-plane RPCs issued at startup.
const STARTUP_RPC_TIMEOUT: Duration = Duration::from_secs(1);

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Numeric ID of this TSO cluster.
    #[arg(short, long, default_value_t = 1)]
    tso_id: u32,

    /// Number of shards; shard 0 hosts the controller, the rest host one
    /// worker each. Must be at least 2.
    #[arg(short, long, default_value_t = 4)]
    shards: u16,

    /// IP address to listen on.
    #[arg(long, default_value_t = String::from("127.0.0.1"))]
    host: String,

    /// Base port: the controller listens here, worker shard k on base + k.
    #[arg(short, long, default_value_t = 52600)]
    base_port: u16,

    /// Transport proto tag for the listeners ('rrdma' or 'tcp+k2rpc').
    #[arg(long, default_value_t = String::from("tcp+k2rpc"))]
    proto: String,

    /// Endpoint URL of any Paxos instance of the consensus subsystem.
    #[arg(short, long)]
    paxos: String,

    /// Endpoint URL of the atomic/GPS clock service.
    #[arg(short, long)]
    clock: String,

    /// Config string in TOML format.
    #[arg(long)]
    config: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(proto)` on success or
    /// `Err(TsoError)` on any error.
    fn sanitize(&self) -> Result<TransportProto, TsoError> {
        if self.shards < 2 {
            return Err(TsoError::NotEnoughCores(self.shards));
        }
        if self.base_port <= 1024 {
            return Err(TsoError::msg(format!(
                "invalid base_port {}",
                self.base_port
            )));
        }
        if self.base_port as u32 + self.shards as u32 - 1 > u16::MAX as u32 {
            return Err(TsoError::msg(format!(
                "shard ports exceed 65535 with base_port {}",
                self.base_port
            )));
        }
        if self.threads < 2 {
            return Err(TsoError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )));
        }
        TxEndpoint::parse_url(&self.paxos)?;
        TxEndpoint::parse_url(&self.clock)?;
        TransportProto::parse_name(&self.proto).ok_or_else(|| {
            TsoError::msg(format!("proto name '{}' unrecognized", self.proto))
        })
    }
}

// Server node executable main entrance.
fn server_main() -> Result<(), TsoError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let proto = args.sanitize()?;
    let config = TsoConfig::parse(args.config.as_deref())?;

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name(format!("tokio-worker-tso{}", args.tso_id))
        .build()?;

    // enter tokio runtime, set the service up, and wait for a termination
    // signal
    runtime.block_on(async move {
        let consensus = Arc::new(
            RpcConsensusClient::connect(
                TxEndpoint::parse_url(&args.paxos)?,
                config.enable_tx_checksum,
                STARTUP_RPC_TIMEOUT,
            )
            .await?,
        );
        let authority = Arc::new(
            RpcTimeAuthority::connect(
                TxEndpoint::parse_url(&args.clock)?,
                config.enable_tx_checksum,
                STARTUP_RPC_TIMEOUT,
            )
            .await?,
        );

        let service = TsoService::new_and_setup(
            args.tso_id,
            args.shards,
            &args.host,
            args.base_port,
            proto,
            consensus,
            authority,
            args.config.as_deref(),
        )
        .await?;

        signal::ctrl_c().await?;
        pf_info!("server"; "termination signal received");
        service.graceful_stop().await?;

        Ok::<(), TsoError>(()) // give type hint for this async closure
    })
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(true)
        .format_target(false)
        .init();

    if let Err(e) = server_main() {
        pf_error!("server"; "server_main exited: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod server_args_tests {
    use super::*;

    fn valid_args() -> CliArgs {
        CliArgs {
            tso_id: 1,
            shards: 4,
            host: "127.0.0.1".into(),
            base_port: 52600,
            proto: "tcp+k2rpc".into(),
            paxos: "tcp+k2rpc+127.0.0.1:52500".into(),
            clock: "tcp+k2rpc+127.0.0.1:52510".into(),
            config: None,
            threads: 4,
        }
    }

    #[test]
    fn sanitize_valid() -> Result<(), TsoError> {
        assert_eq!(valid_args().sanitize(), Ok(TransportProto::TcpK2rpc));
        Ok(())
    }

    #[test]
    fn sanitize_not_enough_shards() {
        let mut args = valid_args();
        args.shards = 1;
        assert_eq!(args.sanitize(), Err(TsoError::NotEnoughCores(1)));
    }

    #[test]
    fn sanitize_invalid_base_port() {
        let mut args = valid_args();
        args.base_port = 1023;
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_port_range_overflow() {
        let mut args = valid_args();
        args.base_port = 65530;
        args.shards = 10;
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_proto() {
        let mut args = valid_args();
        args.proto = "carrier-pigeon".into();
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_paxos_url() {
        let mut args = valid_args();
        args.paxos = "127.0.0.1:52500".into();
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_threads() {
        let mut args = valid_args();
        args.threads = 1;
        assert!(args.sanitize().is_err());
    }
}
