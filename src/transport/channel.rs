//! RPC channel wrapping one connection to a single remote endpoint.
//!
//! A channel owns a reader task (the receive loop feeding the framing parser
//! and dispatching to the registered observers) and a writer task draining
//! the send queue. Sends are non-blocking and best-effort.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

use crate::transport::endpoint::TxEndpoint;
use crate::transport::frame::{
    encode_frame, MessageMetadata, RpcMessage, RpcParser, Verb,
};
use crate::utils::TsoError;

/// Channel lifecycle states.
///
/// ```text
/// Fresh -- run() --> Running -- close() --> Closing -- loop exits --> Closed
///                    Running -- recv EOF --> Closing
///                    Running -- parser error --> Closing (after failure observer)
/// ```
const STATE_FRESH: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_CLOSING: u8 = 2;
const STATE_CLOSED: u8 = 3;

/// Upper bound on records dispatched per receive-loop turn before yielding.
const DISPATCH_BOUND: usize = 16;

/// Observer invoked once per inbound message.
pub type MessageObserver = Box<dyn Fn(&TxEndpoint, RpcMessage) + Send + Sync>;

/// Observer invoked once per transport or framing error.
pub type FailureObserver = Box<dyn Fn(&TxEndpoint, &TsoError) + Send + Sync>;

/// Pieces consumed by `run()` when the loops are spawned.
struct ChannelSetup {
    conn: TcpStream,
    rx_send: mpsc::UnboundedReceiver<Bytes>,
    rx_closed: watch::Receiver<bool>,
    msg_observer: MessageObserver,
    failure_observer: FailureObserver,
}

/// RPC channel over one connection to one remote endpoint.
pub struct RpcChannel {
    /// The remote endpoint this channel talks to.
    endpoint: TxEndpoint,

    /// Whether outbound frames carry a CRC32.
    with_checksum: bool,

    state: AtomicU8,

    /// Sender side of the outbound frame queue, drained by the writer task.
    tx_send: mpsc::UnboundedSender<Bytes>,

    /// Close signal to both loops.
    tx_closed: watch::Sender<bool>,

    /// Present until `run()`; observers may be replaced while this holds.
    setup: Mutex<Option<ChannelSetup>>,

    /// Join handles of the (reader, writer) tasks, taken by close.
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl RpcChannel {
    /// Wraps an established connection. Default (logging) observers are
    /// installed; `run()` must be called to start the receive loop.
    pub fn new(
        conn: TcpStream,
        endpoint: TxEndpoint,
        with_checksum: bool,
    ) -> Arc<RpcChannel> {
        let (tx_send, rx_send) = mpsc::unbounded_channel();
        let (tx_closed, rx_closed) = watch::channel(false);
        Arc::new(RpcChannel {
            endpoint,
            with_checksum,
            state: AtomicU8::new(STATE_FRESH),
            tx_send,
            tx_closed,
            setup: Mutex::new(Some(ChannelSetup {
                conn,
                rx_send,
                rx_closed,
                msg_observer: Self::default_message_observer(),
                failure_observer: Self::default_failure_observer(),
            })),
            tasks: Mutex::new(None),
        })
    }

    /// The remote endpoint of this channel.
    pub fn endpoint(&self) -> &TxEndpoint {
        &self.endpoint
    }

    fn default_message_observer() -> MessageObserver {
        Box::new(|endpoint, msg| {
            pf_warn!(
                endpoint;
                "message with verb {} ignored since no message observer registered",
                msg.verb
            );
        })
    }

    fn default_failure_observer() -> FailureObserver {
        Box::new(|endpoint, err| {
            pf_warn!(endpoint; "failure ignored: {}", err);
        })
    }

    /// Installs the message observer; `None` installs the logging default.
    /// Idempotent. Must be called before `run()`.
    pub fn register_message_observer(
        &self,
        observer: Option<MessageObserver>,
    ) -> Result<(), TsoError> {
        let mut setup = self.setup.lock().unwrap();
        match setup.as_mut() {
            Some(setup) => {
                setup.msg_observer =
                    observer.unwrap_or_else(Self::default_message_observer);
                Ok(())
            }
            None => logged_err!(
                self.endpoint;
                "cannot register message observer on running channel"
            ),
        }
    }

    /// Installs the failure observer; `None` installs the logging default.
    /// Idempotent. Must be called before `run()`.
    pub fn register_failure_observer(
        &self,
        observer: Option<FailureObserver>,
    ) -> Result<(), TsoError> {
        let mut setup = self.setup.lock().unwrap();
        match setup.as_mut() {
            Some(setup) => {
                setup.failure_observer =
                    observer.unwrap_or_else(Self::default_failure_observer);
                Ok(())
            }
            None => logged_err!(
                self.endpoint;
                "cannot register failure observer on running channel"
            ),
        }
    }

    /// Starts the receive loop and the writer task. Precondition: not yet
    /// running.
    pub fn run(self: &Arc<Self>) -> Result<(), TsoError> {
        if self
            .state
            .compare_exchange(
                STATE_FRESH,
                STATE_RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return logged_err!(self.endpoint; "channel already running");
        }

        let setup = match self.setup.lock().unwrap().take() {
            Some(setup) => setup,
            None => {
                return logged_err!(self.endpoint; "channel setup pieces missing")
            }
        };
        let (conn_read, conn_write) = setup.conn.into_split();

        let writer_handle = tokio::spawn(Self::writer_loop(
            self.endpoint.clone(),
            conn_write,
            setup.rx_send,
            setup.rx_closed.clone(),
        ));
        let this = Arc::clone(self);
        let reader_handle = tokio::spawn(this.reader_loop(
            conn_read,
            setup.rx_closed,
            setup.msg_observer,
            setup.failure_observer,
        ));
        *self.tasks.lock().unwrap() = Some((reader_handle, writer_handle));

        pf_debug!(self.endpoint; "channel running");
        Ok(())
    }

    /// Sends a message, non-blocking and best-effort. Silently dropped if
    /// closing is in progress; `ChannelDown` if not yet running.
    pub fn send(
        &self,
        verb: Verb,
        payload: &[u8],
        metadata: MessageMetadata,
    ) -> Result<(), TsoError> {
        match self.state.load(Ordering::Acquire) {
            STATE_RUNNING => {
                let frame = encode_frame(
                    verb,
                    payload,
                    &metadata,
                    self.with_checksum,
                )?;
                if self.tx_send.send(frame).is_err() {
                    pf_debug!(self.endpoint; "writer gone, dropping send");
                }
                Ok(())
            }
            STATE_FRESH => Err(TsoError::ChannelDown),
            _ => {
                pf_debug!(self.endpoint; "going down, ignoring send");
                Ok(())
            }
        }
    }

    /// Completes when both the close and the receive loop have finished.
    /// After `timeout`, the receive loop is aborted even if a read has not
    /// returned.
    pub async fn graceful_close(
        &self,
        timeout: Duration,
    ) -> Result<(), TsoError> {
        if self
            .state
            .compare_exchange(
                STATE_FRESH,
                STATE_CLOSED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            return Ok(()); // never ran
        }

        self.mark_closing();
        let _ = self.tx_closed.send(true);

        let tasks = self.tasks.lock().unwrap().take();
        if let Some((mut reader, mut writer)) = tasks {
            if time::timeout(timeout, &mut reader).await.is_err() {
                pf_warn!(
                    self.endpoint;
                    "receive loop did not finish in {:?}, aborting",
                    timeout
                );
                reader.abort();
            }
            if time::timeout(timeout, &mut writer).await.is_err() {
                writer.abort();
            }
        }

        self.state.store(STATE_CLOSED, Ordering::Release);
        pf_debug!(self.endpoint; "channel closed");
        Ok(())
    }

    /// True once the channel has fully closed.
    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_CLOSED
    }

    fn mark_closing(&self) {
        let _ = self.state.compare_exchange(
            STATE_RUNNING,
            STATE_CLOSING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// The receive loop. Repeats until closing: dispatch a bounded number of
    /// already-parsed records then yield, or await one inbound chunk. Recv
    /// errors are logged and the close predicate re-evaluated rather than
    /// propagated.
    async fn reader_loop(
        self: Arc<Self>,
        mut conn_read: OwnedReadHalf,
        mut rx_closed: watch::Receiver<bool>,
        msg_observer: MessageObserver,
        failure_observer: FailureObserver,
    ) {
        let mut parser = RpcParser::new();
        let mut chunk = BytesMut::with_capacity(16 * 1024);

        while self.state.load(Ordering::Acquire) == STATE_RUNNING {
            if parser.can_dispatch() {
                match parser.dispatch_some(DISPATCH_BOUND) {
                    Ok(msgs) => {
                        for msg in msgs {
                            if self.state.load(Ordering::Acquire)
                                != STATE_RUNNING
                            {
                                break;
                            }
                            (msg_observer)(&self.endpoint, msg);
                        }
                    }
                    Err(err) => {
                        pf_warn!(self.endpoint; "parser error: {}", err);
                        (failure_observer)(&self.endpoint, &err);
                        break;
                    }
                }
                // let other tasks on this runtime make progress between
                // dispatch rounds
                tokio::task::yield_now().await;
                continue;
            }

            chunk.clear();
            tokio::select! {
                nread = conn_read.read_buf(&mut chunk) => {
                    match nread {
                        Ok(0) => break, // remote end closed connection
                        Ok(_) => parser.feed(&chunk),
                        Err(err) => {
                            pf_warn!(
                                self.endpoint;
                                "error receiving: {}",
                                err
                            );
                            let err = TsoError::from(err);
                            (failure_observer)(&self.endpoint, &err);
                            // the connection is considered down; flip the
                            // close predicate and re-evaluate
                            self.mark_closing();
                        }
                    }
                },

                _ = rx_closed.changed() => {},
            }
        }

        self.mark_closing();
        let _ = self.tx_closed.send(true); // stop the writer too
        self.state.store(STATE_CLOSED, Ordering::Release);
        pf_debug!(self.endpoint; "receive loop exited");
    }

    /// Drains the outbound frame queue into the connection.
    async fn writer_loop(
        endpoint: TxEndpoint,
        mut conn_write: OwnedWriteHalf,
        mut rx_send: mpsc::UnboundedReceiver<Bytes>,
        mut rx_closed: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                frame = rx_send.recv() => {
                    match frame {
                        Some(frame) => {
                            if let Err(err) = conn_write.write_all(&frame).await {
                                pf_debug!(endpoint; "error writing frame: {}", err);
                                break;
                            }
                        }
                        None => break, // channel struct dropped
                    }
                },

                _ = rx_closed.changed() => break,
            }
        }
        let _ = conn_write.shutdown().await;
    }
}
