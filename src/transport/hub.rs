//! RPC hub: one per shard that serves or originates RPC traffic. Owns the
//! listener bound to the local endpoint and the map of active peer channels
//! keyed by canonical endpoint.

use std::sync::Arc;

use futures::future;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::transport::channel::RpcChannel;
use crate::transport::endpoint::{TransportProto, TxEndpoint};
use crate::transport::frame::{MessageMetadata, RpcMessage, Verb};
use crate::utils::{tcp_bind_with_retry, tcp_connect_with_retry, TsoError};

const BIND_RETRIES: u8 = 10;
const CONNECT_RETRIES: u8 = 2;

/// Deadline handed to channels when the hub winds them down.
const CHANNEL_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// RPC hub instance for one shard.
pub struct RpcHub {
    /// The endpoint we accept connections on.
    server_endpoint: TxEndpoint,

    /// Receiver side of the inbound message channel; all channels' message
    /// observers feed into this.
    rx_recv: mpsc::UnboundedReceiver<(TxEndpoint, RpcMessage)>,

    /// Map from endpoint -> channel, shared with the acceptor task.
    channels: flashmap::ReadHandle<TxEndpoint, Arc<RpcChannel>>,

    /// Sender side of the connect channel, used when proactively connecting
    /// to some peer.
    tx_connect: mpsc::UnboundedSender<TxEndpoint>,

    /// Receiver side of the connack channel.
    rx_connack: mpsc::UnboundedReceiver<Result<TxEndpoint, TsoError>>,

    /// Stop signal to the acceptor task.
    tx_stop: watch::Sender<bool>,

    /// Join handle of the acceptor task.
    acceptor_handle: Option<JoinHandle<()>>,

    stopped: bool,
}

impl RpcHub {
    /// Creates a new RPC hub listening on the given endpoint. Spawns the
    /// acceptor task. A port of 0 picks a free one; the chosen port is
    /// reflected in `server_endpoint()`.
    pub async fn new_and_setup(
        endpoint: TxEndpoint,
        with_checksum: bool,
    ) -> Result<RpcHub, TsoError> {
        let mut server_endpoint = endpoint;
        let listener =
            tcp_bind_with_retry(server_endpoint.socket_addr()?, BIND_RETRIES)
                .await?;
        server_endpoint.port = listener.local_addr()?.port();

        let (tx_recv, rx_recv) = mpsc::unbounded_channel();
        let (channels_write, channels_read) =
            flashmap::new::<TxEndpoint, Arc<RpcChannel>>();
        let (tx_connect, rx_connect) = mpsc::unbounded_channel();
        let (tx_connack, rx_connack) = mpsc::unbounded_channel();
        let (tx_stop, rx_stop) = watch::channel(false);

        let mut acceptor = HubAcceptorTask {
            local: server_endpoint.clone(),
            proto: server_endpoint.proto,
            with_checksum,
            listener,
            tx_recv,
            channels_write,
            channels_read: channels_read.clone(),
            rx_connect,
            tx_connack,
            rx_stop,
        };
        let acceptor_handle =
            tokio::spawn(async move { acceptor.run().await });

        pf_info!(server_endpoint; "accepting connections");
        Ok(RpcHub {
            server_endpoint,
            rx_recv,
            channels: channels_read,
            tx_connect,
            rx_connack,
            tx_stop,
            acceptor_handle: Some(acceptor_handle),
            stopped: false,
        })
    }

    /// The endpoint this hub accepts incoming connections on.
    pub fn server_endpoint(&self) -> &TxEndpoint {
        &self.server_endpoint
    }

    /// Returns the existing channel for an endpoint, or opens an outbound
    /// connection, wraps it in a fresh channel with this hub's observers
    /// wired, stores and starts it.
    pub async fn get_or_make_channel(
        &mut self,
        endpoint: &TxEndpoint,
    ) -> Result<Arc<RpcChannel>, TsoError> {
        if self.stopped {
            return Err(TsoError::Shutdown);
        }

        let existing = {
            let guard = self.channels.guard();
            guard.get(endpoint).cloned()
        };
        if let Some(chan) = existing {
            if !chan.is_closed() {
                return Ok(chan);
            }
        }

        self.tx_connect
            .send(endpoint.clone())
            .map_err(TsoError::msg)?;
        match self.rx_connack.recv().await {
            Some(Ok(ep)) if ep == *endpoint => {
                let guard = self.channels.guard();
                guard.get(endpoint).cloned().ok_or(TsoError::ChannelDown)
            }
            Some(Ok(ep)) => logged_err!(
                self.server_endpoint;
                "connack endpoint mismatch: expected '{}', got '{}'",
                endpoint,
                ep
            ),
            Some(Err(err)) => Err(err),
            None => Err(TsoError::ChannelDown),
        }
    }

    /// Sends a message to the given endpoint, resolving (or creating) its
    /// channel first.
    pub async fn send(
        &mut self,
        verb: Verb,
        payload: &[u8],
        endpoint: &TxEndpoint,
        metadata: MessageMetadata,
    ) -> Result<(), TsoError> {
        let chan = self.get_or_make_channel(endpoint).await?;
        chan.send(verb, payload, metadata)
    }

    /// Receives the next inbound message from any active channel.
    pub async fn recv_msg(
        &mut self,
    ) -> Result<(TxEndpoint, RpcMessage), TsoError> {
        self.rx_recv.recv().await.ok_or(TsoError::ChannelDown)
    }

    /// Stops the hub: closes the listener, awaits the acceptor, then
    /// gracefully closes every channel in parallel and waits for all.
    pub async fn stop(&mut self) -> Result<(), TsoError> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        let _ = self.tx_stop.send(true);
        if let Some(handle) = self.acceptor_handle.take() {
            handle.await?;
        }

        let chans: Vec<Arc<RpcChannel>> = {
            let guard = self.channels.guard();
            guard.keys().filter_map(|ep| guard.get(ep).cloned()).collect()
        };
        let closes = chans
            .iter()
            .map(|chan| chan.graceful_close(CHANNEL_CLOSE_TIMEOUT));
        for res in future::join_all(closes).await {
            if let Err(err) = res {
                pf_warn!(self.server_endpoint; "error closing channel: {}", err);
            }
        }

        pf_debug!(self.server_endpoint; "hub stopped");
        Ok(())
    }
}

/// RpcHub listener/connector task.
struct HubAcceptorTask {
    /// Listening endpoint, used as the log prefix of this task.
    local: TxEndpoint,
    proto: TransportProto,
    with_checksum: bool,

    listener: TcpListener,

    tx_recv: mpsc::UnboundedSender<(TxEndpoint, RpcMessage)>,
    channels_write: flashmap::WriteHandle<TxEndpoint, Arc<RpcChannel>>,
    channels_read: flashmap::ReadHandle<TxEndpoint, Arc<RpcChannel>>,

    rx_connect: mpsc::UnboundedReceiver<TxEndpoint>,
    tx_connack: mpsc::UnboundedSender<Result<TxEndpoint, TsoError>>,

    rx_stop: watch::Receiver<bool>,
}

impl HubAcceptorTask {
    /// Wraps a connection in a fresh channel with the hub's observers wired,
    /// stores it in the map (evicting any prior entry for that endpoint,
    /// whose close is awaited), and starts it.
    async fn install_channel(
        &mut self,
        conn: TcpStream,
        endpoint: TxEndpoint,
    ) -> Result<Arc<RpcChannel>, TsoError> {
        let prior = {
            let guard = self.channels_read.guard();
            guard.get(&endpoint).cloned()
        };
        if let Some(prior) = prior {
            {
                let mut guard = self.channels_write.guard();
                guard.remove(endpoint.clone());
            }
            if let Err(err) =
                prior.graceful_close(CHANNEL_CLOSE_TIMEOUT).await
            {
                pf_warn!(
                    self.local;
                    "error closing prior channel for '{}': {}",
                    endpoint,
                    err
                );
            }
        }

        let chan =
            RpcChannel::new(conn, endpoint.clone(), self.with_checksum);
        let tx_recv = self.tx_recv.clone();
        chan.register_message_observer(Some(Box::new(move |ep, msg| {
            let _ = tx_recv.send((ep.clone(), msg));
        })))?;
        chan.register_failure_observer(Some(Box::new(|ep, err| {
            pf_warn!(ep; "channel reported failure: {}", err);
        })))?;
        chan.run()?;

        {
            let mut guard = self.channels_write.guard();
            guard.insert(endpoint, chan.clone());
        }
        Ok(chan)
    }

    /// Opens an outbound connection to a peer endpoint.
    async fn connect_new_peer(
        &mut self,
        endpoint: TxEndpoint,
    ) -> Result<(), TsoError> {
        pf_debug!(self.local; "connecting to peer '{}'...", endpoint);
        let conn =
            tcp_connect_with_retry(endpoint.socket_addr()?, CONNECT_RETRIES)
                .await?;
        self.install_channel(conn, endpoint.clone()).await?;
        pf_debug!(self.local; "connected to peer '{}'", endpoint);
        Ok(())
    }

    /// Acceptor task loop.
    async fn run(&mut self) {
        pf_debug!(self.local; "acceptor task spawned");

        loop {
            tokio::select! {
                // stop signal
                _ = self.rx_stop.changed() => break,

                // proactive connection request
                to_connect = self.rx_connect.recv() => {
                    match to_connect {
                        Some(endpoint) => {
                            let res = self
                                .connect_new_peer(endpoint.clone())
                                .await
                                .map(|()| endpoint);
                            if res.is_err() {
                                pf_error!(self.local; "error connecting to new peer");
                            }
                            if self.tx_connack.send(res).is_err() {
                                break; // hub side dropped
                            }
                        }
                        None => break,
                    }
                },

                // new peer connection accepted
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((conn, addr)) => {
                            let endpoint = TxEndpoint::from_peer_addr(
                                self.proto, addr,
                            );
                            if let Err(err) = self
                                .install_channel(conn, endpoint.clone())
                                .await
                            {
                                pf_error!(
                                    self.local;
                                    "error accepting peer '{}': {}",
                                    endpoint,
                                    err
                                );
                            }
                        }
                        Err(err) => {
                            pf_warn!(self.local; "error accepting connection: {}", err);
                        }
                    }
                },
            }
        }

        pf_debug!(self.local; "acceptor task exited");
    }
}

#[cfg(test)]
mod hub_tests {
    use super::*;
    use crate::transport::frame::{ACK_TIME, GET_GPS_CLOCK_TIME};

    async fn test_hub(port: u16) -> Result<RpcHub, TsoError> {
        RpcHub::new_and_setup(
            TxEndpoint::new(TransportProto::TcpK2rpc, "127.0.0.1", port),
            true,
        )
        .await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn request_reply_between_hubs() -> Result<(), TsoError> {
        let mut server = test_hub(0).await?;
        let server_ep = server.server_endpoint().clone();
        let mut client = test_hub(0).await?;

        // client sends a request to the server's endpoint
        client
            .send(
                GET_GPS_CLOCK_TIME,
                b"\x03\x00",
                &server_ep,
                MessageMetadata::request(9),
            )
            .await?;

        // server sees it keyed under the client's ephemeral endpoint and
        // replies on the same channel
        let (from_ep, msg) = server.recv_msg().await?;
        assert_eq!(msg.verb, GET_GPS_CLOCK_TIME);
        assert_eq!(&msg.payload[..], b"\x03\x00");
        server
            .send(
                ACK_TIME,
                b"ok",
                &from_ep,
                MessageMetadata::response_to(msg.metadata.request_id.unwrap()),
            )
            .await?;

        let (reply_ep, reply) = client.recv_msg().await?;
        assert_eq!(reply_ep, server_ep);
        assert_eq!(reply.verb, ACK_TIME);
        assert_eq!(reply.metadata.response_id, Some(9));

        client.stop().await?;
        server.stop().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn channel_reuse_for_same_endpoint() -> Result<(), TsoError> {
        let mut server = test_hub(0).await?;
        let server_ep = server.server_endpoint().clone();
        let mut client = test_hub(0).await?;

        let chan1 = client.get_or_make_channel(&server_ep).await?;
        let chan2 = client.get_or_make_channel(&server_ep).await?;
        assert!(Arc::ptr_eq(&chan1, &chan2));

        client.stop().await?;
        server.stop().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn stop_closes_all_channels() -> Result<(), TsoError> {
        let mut server = test_hub(0).await?;
        let server_ep = server.server_endpoint().clone();
        let mut client = test_hub(0).await?;

        let chan = client.get_or_make_channel(&server_ep).await?;
        client.stop().await?;
        assert!(chan.is_closed());

        // further sends fail fast
        assert_eq!(
            client
                .send(
                    ACK_TIME,
                    b"late",
                    &server_ep,
                    MessageMetadata::default(),
                )
                .await,
            Err(TsoError::Shutdown)
        );

        server.stop().await?;
        Ok(())
    }
}
