//! Small request/reply stub over a single RPC channel, for callers that
//! issue one query at a time and wait for the matching reply.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{self, Duration, Instant};

use crate::transport::channel::RpcChannel;
use crate::transport::endpoint::TxEndpoint;
use crate::transport::frame::{MessageMetadata, RpcMessage, Verb};
use crate::utils::{tcp_connect_with_retry, TsoError};

const CONNECT_RETRIES: u8 = 2;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// One-connection query stub: send a request, await the correlated reply.
pub struct RpcQueryStub {
    endpoint: TxEndpoint,
    chan: Arc<RpcChannel>,
    rx_recv: mpsc::UnboundedReceiver<RpcMessage>,
    next_req_id: u64,
}

impl RpcQueryStub {
    /// Connects to the remote endpoint and starts the channel.
    pub async fn connect(
        endpoint: TxEndpoint,
        with_checksum: bool,
    ) -> Result<RpcQueryStub, TsoError> {
        let conn =
            tcp_connect_with_retry(endpoint.socket_addr()?, CONNECT_RETRIES)
                .await?;
        let chan = RpcChannel::new(conn, endpoint.clone(), with_checksum);

        let (tx_recv, rx_recv) = mpsc::unbounded_channel();
        chan.register_message_observer(Some(Box::new(move |_, msg| {
            let _ = tx_recv.send(msg);
        })))?;
        chan.register_failure_observer(None)?;
        chan.run()?;

        Ok(RpcQueryStub {
            endpoint,
            chan,
            rx_recv,
            next_req_id: 0,
        })
    }

    /// The remote endpoint this stub queries.
    pub fn endpoint(&self) -> &TxEndpoint {
        &self.endpoint
    }

    /// Sends one request and awaits the reply carrying its request id.
    /// Replies to older (timed-out) requests are discarded.
    pub async fn query(
        &mut self,
        verb: Verb,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<RpcMessage, TsoError> {
        let req_id = self.next_req_id;
        self.next_req_id += 1;
        self.chan
            .send(verb, payload, MessageMetadata::request(req_id))?;

        let deadline = Instant::now() + timeout;
        loop {
            match time::timeout_at(deadline, self.rx_recv.recv()).await {
                Ok(Some(msg)) => {
                    if msg.metadata.response_id == Some(req_id) {
                        return Ok(msg);
                    }
                    // stale reply to an abandoned request
                    pf_debug!(
                        self.endpoint;
                        "discarding stale reply {:?}",
                        msg.metadata.response_id
                    );
                }
                Ok(None) => return Err(TsoError::ChannelDown),
                Err(_) => {
                    return Err(TsoError::msg(format!(
                        "request verb {} -> '{}' timed out",
                        verb, self.endpoint
                    )));
                }
            }
        }
    }

    /// Gracefully closes the underlying channel.
    pub async fn close(&mut self) -> Result<(), TsoError> {
        self.chan.graceful_close(CLOSE_TIMEOUT).await
    }
}
