//! Client API communication stub: obtains timestamp batches from workers and
//! cluster information from the controller.

use tokio::time::Duration;

use crate::server::{
    monotonic_ns, Timestamp, TimestampBatch, REPLY_STATUS_BAD_REQUEST,
    REPLY_STATUS_NOT_READY, REPLY_STATUS_OK, REPLY_STATUS_SHUTDOWN,
};
use crate::transport::{
    RpcMessage, RpcQueryStub, TxEndpoint, ACK_TIME, GET_GPS_CLOCK_TIME,
    GET_TSO_MASTER_URL, GET_TSO_WORKERS_URLS,
};
use crate::utils::TsoError;

/// A batch together with its local receive time, so expiry can be checked
/// before timestamps are handed out.
#[derive(Debug, Clone, Copy)]
pub struct ReceivedBatch {
    pub batch: TimestampBatch,
    received_at_mono_ns: u64,
}

impl ReceivedBatch {
    /// Expands the batch into its timestamps.
    pub fn expand(&self) -> Vec<Timestamp> {
        self.batch.expand()
    }

    /// A batch must not be used once its TTL has elapsed since receipt.
    pub fn is_expired(&self) -> bool {
        monotonic_ns().saturating_sub(self.received_at_mono_ns)
            > self.batch.ttl_ns as u64
    }
}

/// Client-side stub owning one connection to a TSO endpoint (a worker for
/// batches, the controller for cluster queries).
pub struct TsoClientStub {
    stub: RpcQueryStub,
}

impl TsoClientStub {
    /// Connects to the given endpoint URL.
    pub async fn connect(
        url: &str,
        with_checksum: bool,
    ) -> Result<TsoClientStub, TsoError> {
        let endpoint = TxEndpoint::parse_url(url)?;
        let stub = RpcQueryStub::connect(endpoint, with_checksum).await?;
        Ok(TsoClientStub { stub })
    }

    /// Strips the status byte off a reply, mapping error statuses.
    fn checked_body(reply: &RpcMessage) -> Result<&[u8], TsoError> {
        if reply.verb != ACK_TIME {
            return Err(TsoError::msg(format!(
                "unexpected reply verb {}",
                reply.verb
            )));
        }
        match reply.payload.first() {
            Some(&REPLY_STATUS_OK) => Ok(&reply.payload[1..]),
            Some(&REPLY_STATUS_NOT_READY) => Err(TsoError::NotReady),
            Some(&REPLY_STATUS_SHUTDOWN) => Err(TsoError::Shutdown),
            Some(&REPLY_STATUS_BAD_REQUEST) => {
                Err(TsoError::msg("server rejected request as malformed"))
            }
            Some(&status) => Err(TsoError::msg(format!(
                "unknown reply status {}",
                status
            ))),
            None => Err(TsoError::msg("empty reply payload")),
        }
    }

    /// Requests a batch of up to `batch_size` timestamps from the connected
    /// worker. The server may return fewer than requested.
    pub async fn get_timestamp_batch(
        &mut self,
        batch_size: u16,
        timeout: Duration,
    ) -> Result<ReceivedBatch, TsoError> {
        if batch_size == 0 {
            return Err(TsoError::msg("batch size must be positive"));
        }
        self.get_timestamp_batch_raw(batch_size, timeout).await
    }

    /// Like `get_timestamp_batch` but without local validation of the size.
    pub async fn get_timestamp_batch_raw(
        &mut self,
        batch_size: u16,
        timeout: Duration,
    ) -> Result<ReceivedBatch, TsoError> {
        let reply = self
            .stub
            .query(GET_GPS_CLOCK_TIME, &batch_size.to_le_bytes(), timeout)
            .await?;
        let body = Self::checked_body(&reply)?;
        let batch = TimestampBatch::decode(body)?;
        Ok(ReceivedBatch {
            batch,
            received_at_mono_ns: monotonic_ns(),
        })
    }

    /// Asks the controller for the current master instance URL.
    pub async fn get_master_url(
        &mut self,
        timeout: Duration,
    ) -> Result<String, TsoError> {
        let reply =
            self.stub.query(GET_TSO_MASTER_URL, &[], timeout).await?;
        let body = Self::checked_body(&reply)?;
        Ok(rmp_serde::from_slice(body)?)
    }

    /// Asks the controller for all worker endpoint URLs; outer dim is worker
    /// shards, inner dim the transports each shard supports.
    pub async fn get_workers_urls(
        &mut self,
        timeout: Duration,
    ) -> Result<Vec<Vec<String>>, TsoError> {
        let reply =
            self.stub.query(GET_TSO_WORKERS_URLS, &[], timeout).await?;
        let body = Self::checked_body(&reply)?;
        Ok(rmp_serde::from_slice(body)?)
    }

    /// Gracefully closes the underlying channel.
    pub async fn close(&mut self) -> Result<(), TsoError> {
        self.stub.close().await
    }
}
