//! Background push listener.
//!
//! One long-lived task per open storage reads the dedicated push socket in
//! a loop, demultiplexing unsolicited push frames from the deferred
//! answers to subscribe requests. Subscribe answers travel through a
//! one-slot hand-off: at most one subscribe is outstanding per listener.
//! Outbound writes (subscribes and push acknowledgments) share the socket
//! with the reader and are serialized by a write lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::DriverError;
use crate::protocol::push::{write_push_ack, PushMessage};
use crate::protocol::{self, Request};
use crate::session::ClientSession;
use crate::wire;

/// Callbacks invoked by the listener's reader task. Implementations must
/// not block; anything that needs the network has to be spawned.
pub trait PushHandler: Send + Sync + 'static {
    fn on_message(&self, message: PushMessage);
    /// The push socket died. Outstanding live listeners should be failed.
    fn on_disconnect(&self);
    /// A replacement socket is connected. Return false to surrender when
    /// no session can authenticate the re-subscription; return true after
    /// spawning the re-subscribe handshake.
    fn on_reconnect(&self) -> bool;
    fn on_shutdown(&self);
}

type SubscribeSlot = Arc<Mutex<Option<oneshot::Sender<Result<Vec<u8>, DriverError>>>>>;

/// Owns the dedicated push socket and its reader task.
pub struct PushListener {
    url: Mutex<String>,
    writer: Arc<tokio::sync::Mutex<Option<OwnedWriteHalf>>>,
    pending: SubscribeSlot,
    shutdown: Arc<AtomicBool>,
    config: ClientConfig,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PushListener {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            url: Mutex::new(String::new()),
            writer: Arc::new(tokio::sync::Mutex::new(None)),
            pending: Arc::new(Mutex::new(None)),
            shutdown: Arc::new(AtomicBool::new(false)),
            config,
            task: Mutex::new(None),
        }
    }

    pub fn url(&self) -> String {
        self.url.lock().clone()
    }

    /// Install an established socket and start the reader task. Also
    /// revives a listener that previously surrendered.
    pub async fn start(&self, stream: TcpStream, url: &str, handler: Arc<dyn PushHandler>) {
        self.shutdown.store(false, Ordering::SeqCst);
        *self.url.lock() = url.to_string();
        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);

        let task = tokio::spawn(reader_task(
            read_half,
            url.to_string(),
            Arc::clone(&self.writer),
            Arc::clone(&self.pending),
            Arc::clone(&self.shutdown),
            self.config.clone(),
            handler,
        ));
        *self.task.lock() = Some(task);
    }

    /// Send a subscribe over the push socket and wait for its deferred
    /// acknowledgment. Returns `None` on timeout.
    pub async fn subscribe(
        &self,
        session: &Arc<ClientSession>,
        request: &Request,
    ) -> Result<Option<Vec<u8>>, DriverError> {
        let (sender, receiver) = oneshot::channel();
        {
            let mut slot = self.pending.lock();
            if slot.is_some() {
                return Err(DriverError::Protocol(
                    "a subscribe request is already outstanding on the push channel".to_string(),
                ));
            }
            *slot = Some(sender);
        }

        let url = self.url();
        let (session_id, token) = session
            .node_session(&url)
            .map(|node| (node.session_id, node.token))
            .unwrap_or((-1, None));

        let payload = request.encode_payload().await?;
        let write_result = {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(w) => {
                    protocol::write_request(
                        w,
                        request.command(),
                        session_id,
                        token.as_ref(),
                        &payload,
                    )
                    .await
                }
                None => Err(DriverError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "push channel is not connected",
                ))),
            }
        };
        if let Err(e) = write_result {
            self.pending.lock().take();
            return Err(e);
        }

        match tokio::time::timeout(self.config.request_timeout, receiver).await {
            Err(_) => {
                // No answer in time. Clear the slot so a later frame is not
                // mistaken for a response to a subscribe nobody waits for.
                self.pending.lock().take();
                Ok(None)
            }
            Ok(Err(_)) => Err(DriverError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "push channel closed while waiting for a subscribe answer",
            ))),
            Ok(Ok(result)) => result.map(Some),
        }
    }

    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.pending.lock().take();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        *self.writer.lock().await = None;
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

#[allow(clippy::too_many_arguments)]
async fn reader_task(
    mut read_half: OwnedReadHalf,
    url: String,
    writer: Arc<tokio::sync::Mutex<Option<OwnedWriteHalf>>>,
    pending: SubscribeSlot,
    shutdown: Arc<AtomicBool>,
    config: ClientConfig,
    handler: Arc<dyn PushHandler>,
) {
    loop {
        let exit = read_loop(&mut read_half, &writer, &pending, &shutdown, &handler).await;
        if shutdown.load(Ordering::SeqCst) {
            handler.on_shutdown();
            return;
        }
        if let Err(e) = exit {
            warn!(url, error = %e, "push channel lost");
        }

        // Fail anyone waiting on a subscribe answer before reconnecting.
        pending.lock().take();
        *writer.lock().await = None;
        handler.on_disconnect();

        loop {
            tokio::time::sleep(config.retry_delay).await;
            if shutdown.load(Ordering::SeqCst) {
                handler.on_shutdown();
                return;
            }
            match tokio::time::timeout(config.connect_timeout, TcpStream::connect(&url)).await {
                Ok(Ok(stream)) => {
                    let (new_read, new_write) = stream.into_split();
                    read_half = new_read;
                    *writer.lock().await = Some(new_write);
                    if !handler.on_reconnect() {
                        info!(url, "no session can re-subscribe, stopping push listener");
                        // Mark the listener shut down so the owner can see
                        // the surrender and rebuild the channel later.
                        shutdown.store(true, Ordering::SeqCst);
                        handler.on_shutdown();
                        return;
                    }
                    info!(url, "push channel reconnected");
                    break;
                }
                Ok(Err(e)) => debug!(url, error = %e, "push reconnect failed"),
                Err(_) => debug!(url, "push reconnect timed out"),
            }
        }
    }
}

async fn read_loop(
    read_half: &mut OwnedReadHalf,
    writer: &Arc<tokio::sync::Mutex<Option<OwnedWriteHalf>>>,
    pending: &SubscribeSlot,
    shutdown: &Arc<AtomicBool>,
    handler: &Arc<dyn PushHandler>,
) -> Result<(), DriverError> {
    loop {
        let status = wire::read_u8(read_half).await?;
        if shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }
        match status {
            protocol::STATUS_OK => {
                let envelope = protocol::read_ok_envelope(read_half).await?;
                match pending.lock().take() {
                    Some(sender) => {
                        let _ = sender.send(Ok(envelope.payload));
                    }
                    None => warn!("subscribe answer arrived with nobody waiting"),
                }
            }
            protocol::STATUS_ERROR => {
                let error = protocol::read_error_envelope(read_half).await?;
                match pending.lock().take() {
                    Some(sender) => {
                        let _ = sender.send(Err(DriverError::Server(error)));
                    }
                    None => warn!(error = %error, "error frame arrived with nobody waiting"),
                }
            }
            protocol::STATUS_PUSH => {
                let (message, ack_id) = PushMessage::read(read_half).await?;
                debug!(kind = ?message.kind(), "push frame received");
                handler.on_message(message);
                if let Some(ack_id) = ack_id {
                    let mut writer = writer.lock().await;
                    if let Some(w) = writer.as_mut() {
                        write_push_ack(w, ack_id).await?;
                        w.flush().await?;
                    }
                }
            }
            other => {
                return Err(DriverError::Protocol(format!(
                    "unrecognized status byte on the push channel: {other}"
                )));
            }
        }
    }
}
