//! Session lifecycle and the public verdict operations.
//!
//! One `Session` owns one WebSocket connection. Any number of tasks may issue
//! requests through a shared `&Session` concurrently; each request gets its
//! own correlation id and waits on its own pending entry while a single
//! receive loop reads the socket.

use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;
use parking_lot::Mutex;
use reqwest::Url;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use verdict_core::{Options, ScanVerdict, Sha256, UploadError, VerdictError};

use crate::correlator::{self, Correlator, Expect};
use crate::protocol::{
    self, ClientMessage, VerdictRequest, VerdictRequestForStream, VerdictRequestForUrl,
    VerdictResponse,
};
use crate::reader;
use crate::transport::{self, FrameWriter};
use crate::upload::{UploadChannel, UploadSource};

/// Connection lifecycle.
///
/// `Disconnected → Connecting → Authenticated → Closed`, with `Failed`
/// reachable only from `Connecting` when the token is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disconnected,
    Connecting,
    Authenticated,
    Failed,
    Closed,
}

/// Per-request overrides.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Correlation id to use instead of a generated one.
    pub correlation_id: Option<String>,
    /// Deadline override for this request.
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn guid(&self) -> String {
        self.correlation_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }
}

struct Lifecycle {
    state: State,
    session_id: Option<String>,
}

pub struct Session {
    options: Options,
    lifecycle: Mutex<Lifecycle>,
    correlator: Arc<Correlator>,
    writer: OnceLock<Arc<FrameWriter>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    uploader: UploadChannel,
}

impl Session {
    /// Create a disconnected session.
    ///
    /// # Errors
    ///
    /// `Transport` if the HTTP client for uploads cannot be built.
    pub fn new(options: Options) -> Result<Self, VerdictError> {
        let uploader = UploadChannel::new(options.upload_timeout)?;
        Ok(Self {
            options,
            lifecycle: Mutex::new(Lifecycle {
                state: State::Disconnected,
                session_id: None,
            }),
            correlator: Correlator::new(),
            writer: OnceLock::new(),
            tasks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            uploader,
        })
    }

    /// Current lifecycle state. A connection the service dropped reads as `Closed`.
    #[must_use]
    pub fn state(&self) -> State {
        match self.lifecycle.lock().state {
            State::Authenticated if self.correlator.is_closed() => State::Closed,
            state => state,
        }
    }

    /// Identifier the service assigned on successful authentication.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.lifecycle.lock().session_id.clone()
    }

    /// Open the connection and authenticate with `token`.
    ///
    /// # Errors
    ///
    /// `Authentication` if the service rejects the token (the session is then
    /// `Failed`), `InvalidState` if `connect` was already called, and
    /// `Transport`/`ConnectionClosed`/`Timeout` if the connection cannot be
    /// established (the session is then `Closed`).
    #[instrument(skip(self, token), fields(url = %self.options.url))]
    pub async fn connect(&self, token: &str) -> Result<(), VerdictError> {
        {
            let mut lifecycle = self.lifecycle.lock();
            match lifecycle.state {
                State::Disconnected => lifecycle.state = State::Connecting,
                State::Connecting => {
                    return Err(VerdictError::InvalidState("connect already in progress"))
                }
                State::Authenticated => return Err(VerdictError::InvalidState("already connected")),
                State::Failed => {
                    return Err(VerdictError::InvalidState("authentication already failed"))
                }
                State::Closed => return Err(VerdictError::InvalidState("session is closed")),
            }
        }

        let result = self.handshake(token).await;
        let (result, teardown) = self.settle(result);
        if teardown {
            self.correlator.fail_all(|| VerdictError::ConnectionClosed);
            self.teardown().await;
        } else if result.is_ok() {
            self.start_keep_alive();
        }
        result
    }

    /// Record the handshake outcome. The flag is true when the connection must be torn down.
    fn settle(&self, result: Result<String, VerdictError>) -> (Result<(), VerdictError>, bool) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state == State::Closed {
            // close() ran while we were connecting.
            return (Err(VerdictError::ConnectionClosed), true);
        }

        match result {
            Ok(session_id) => {
                info!(session_id = %session_id, "authenticated");
                lifecycle.state = State::Authenticated;
                lifecycle.session_id = Some(session_id);
                (Ok(()), false)
            }
            Err(e @ VerdictError::Authentication(_)) => {
                warn!(%e, "authentication rejected");
                // The socket stays open until close() or drop.
                lifecycle.state = State::Failed;
                (Err(e), false)
            }
            Err(e) => {
                debug!(%e, "connect failed");
                lifecycle.state = State::Closed;
                (Err(e), true)
            }
        }
    }

    async fn handshake(&self, token: &str) -> Result<String, VerdictError> {
        let timeout = self.options.request_timeout;
        let (sink, source) = transport::connect(&self.options.url, timeout).await?;

        let writer = Arc::new(FrameWriter::new(sink));
        let _ = self.writer.set(Arc::clone(&writer));

        let (auth_tx, auth_rx) = oneshot::channel();
        let reader = tokio::spawn(reader::run(source, Arc::clone(&self.correlator), auth_tx));
        self.tasks.lock().push(reader);

        let request = ClientMessage::AuthRequest {
            token: token.to_string(),
        };
        writer.send_text(protocol::encode(&request)?).await?;

        let auth = tokio::time::timeout(timeout, auth_rx)
            .await
            .map_err(|_| VerdictError::Timeout)?
            .map_err(|_| VerdictError::ConnectionClosed)??;

        if !auth.success {
            let reason = auth.text.unwrap_or_else(|| "token rejected".to_string());
            return Err(VerdictError::Authentication(reason));
        }
        auth.session_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| VerdictError::Authentication("response carried no session id".into()))
    }

    fn start_keep_alive(&self) {
        if !self.options.keep_alive {
            return;
        }
        let Some(writer) = self.writer.get().map(Arc::clone) else {
            return;
        };
        let interval = self.options.keep_alive_interval;
        let shutdown = self.shutdown.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(correlator::deadline_after(interval), interval);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = writer.ping().await {
                            debug!(%e, "keep-alive ping failed");
                            break;
                        }
                        trace!("keep-alive ping sent");
                    }
                }
            }
        });
        self.tasks.lock().push(task);
    }

    /// Close the connection. Idempotent; every pending request fails with
    /// `ConnectionClosed`.
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut self.lifecycle.lock().state, State::Closed);
        if previous == State::Closed {
            return;
        }
        self.correlator.fail_all(|| VerdictError::ConnectionClosed);
        self.teardown().await;
        info!("session closed");
    }

    async fn teardown(&self) {
        self.shutdown.cancel();
        if let Some(writer) = self.writer.get() {
            writer.close().await;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Session id and writer, if requests may be sent right now.
    fn ready(&self) -> Result<(String, Arc<FrameWriter>), VerdictError> {
        let lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            State::Disconnected => return Err(VerdictError::InvalidState("not connected")),
            State::Connecting => {
                return Err(VerdictError::InvalidState("connect has not completed"))
            }
            State::Failed => return Err(VerdictError::InvalidState("authentication failed")),
            State::Closed => return Err(VerdictError::ConnectionClosed),
            State::Authenticated => {}
        }
        if self.correlator.is_closed() {
            return Err(VerdictError::ConnectionClosed);
        }
        let session_id = lifecycle
            .session_id
            .clone()
            .ok_or(VerdictError::InvalidState("no session id"))?;
        let writer = self
            .writer
            .get()
            .map(Arc::clone)
            .ok_or(VerdictError::ConnectionClosed)?;
        Ok((session_id, writer))
    }

    fn timeout(&self, opts: &RequestOptions) -> Duration {
        opts.timeout.unwrap_or(self.options.request_timeout)
    }

    /// Register the id `msg` carries, write `msg`, and wait for the matching response.
    async fn exchange(
        &self,
        writer: &FrameWriter,
        msg: &ClientMessage,
        timeout: Duration,
    ) -> Result<VerdictResponse, VerdictError> {
        let guid = msg
            .guid()
            .ok_or(VerdictError::InvalidState("message carries no correlation id"))?;
        let text = protocol::encode(msg)?;
        // Registered before the write so a fast response cannot slip past.
        let pending =
            self.correlator
                .register(guid, correlator::deadline_after(timeout), Expect::Any)?;
        writer.send_text(text).await?;
        pending.wait().await
    }

    fn sha256_request(&self, session_id: String, sha256: &Sha256, guid: &str) -> ClientMessage {
        ClientMessage::VerdictRequest(VerdictRequest {
            session_id,
            sha256: sha256.to_string(),
            guid: guid.to_string(),
            use_cache: self.options.use_cache,
            use_hash_lookup: self.options.use_hash_lookup,
        })
    }

    /// Request the verdict for a SHA-256 digest.
    #[instrument(skip(self, opts), fields(sha256 = %sha256))]
    pub async fn for_sha256(
        &self,
        sha256: &Sha256,
        opts: &RequestOptions,
    ) -> Result<ScanVerdict, VerdictError> {
        let (session_id, writer) = self.ready()?;
        let guid = opts.guid();
        let msg = self.sha256_request(session_id, sha256, &guid);

        let resp = self.exchange(&writer, &msg, self.timeout(opts)).await?;
        debug!(guid = %guid, verdict = %resp.verdict, "verdict received");
        Ok(resp.into())
    }

    /// Request the verdict for the file behind `url`. The service downloads it.
    #[instrument(skip(self, opts), fields(url = %url))]
    pub async fn for_url(&self, url: &Url, opts: &RequestOptions) -> Result<ScanVerdict, VerdictError> {
        let (session_id, writer) = self.ready()?;
        let guid = opts.guid();
        let msg = ClientMessage::VerdictRequestForUrl(VerdictRequestForUrl {
            session_id,
            url: url.to_string(),
            guid: guid.clone(),
            use_cache: self.options.use_cache,
            use_hash_lookup: self.options.use_hash_lookup,
        });

        let resp = self.exchange(&writer, &msg, self.timeout(opts)).await?;
        debug!(guid = %guid, verdict = %resp.verdict, sha256 = %resp.sha256, "verdict received");
        Ok(resp.into())
    }

    /// Request the verdict for a local file, uploading it if the service
    /// does not know it yet.
    #[instrument(skip(self, opts), fields(path = %path.display()))]
    pub async fn for_file(&self, path: &Path, opts: &RequestOptions) -> Result<ScanVerdict, VerdictError> {
        self.ready()?;
        let owned = path.to_path_buf();
        let sha256 = tokio::task::spawn_blocking(move || Sha256::from_path(&owned))
            .await
            .map_err(|e| VerdictError::Io(std::io::Error::other(e)))??;
        self.for_sample(&sha256, UploadSource::File(path.to_path_buf()), opts)
            .await
    }

    /// Request the verdict for an in-memory buffer, uploading it if the
    /// service does not know it yet.
    #[instrument(skip(self, data, opts), fields(len = data.len()))]
    pub async fn for_buf(&self, data: Bytes, opts: &RequestOptions) -> Result<ScanVerdict, VerdictError> {
        self.ready()?;
        let sha256 = Sha256::from_bytes(&data);
        self.for_sample(&sha256, UploadSource::Bytes(data), opts).await
    }

    /// Request the verdict for a sample only available as a byte stream of
    /// known length. The service hashes it after the upload.
    #[instrument(skip(self, body, opts))]
    pub async fn for_stream<S, E>(
        &self,
        body: S,
        len: u64,
        opts: &RequestOptions,
    ) -> Result<ScanVerdict, VerdictError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send + Sync + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
    {
        let (session_id, writer) = self.ready()?;
        let msg = ClientMessage::VerdictRequestForStream(VerdictRequestForStream {
            session_id,
            guid: opts.guid(),
            use_cache: self.options.use_cache,
            use_hash_lookup: self.options.use_hash_lookup,
        });
        let source = UploadSource::stream(body, len);
        self.with_upload(&writer, &msg, source, self.timeout(opts)).await
    }

    async fn for_sample(
        &self,
        sha256: &Sha256,
        source: UploadSource,
        opts: &RequestOptions,
    ) -> Result<ScanVerdict, VerdictError> {
        let (session_id, writer) = self.ready()?;
        let msg = self.sha256_request(session_id, sha256, &opts.guid());
        self.with_upload(&writer, &msg, source, self.timeout(opts)).await
    }

    /// Send `msg`; if the answer is `Unknown`, upload `source` and wait on the
    /// same id for the final verdict.
    async fn with_upload(
        &self,
        writer: &FrameWriter,
        msg: &ClientMessage,
        source: UploadSource,
        timeout: Duration,
    ) -> Result<ScanVerdict, VerdictError> {
        let resp = self.exchange(writer, msg, timeout).await?;
        if !resp.verdict.is_unknown() {
            debug!(guid = %resp.guid, verdict = %resp.verdict, "verdict received");
            return Ok(resp.into());
        }

        let (url, token) = resp.upload_target().ok_or(UploadError::MissingTarget)?;

        // Registered before the upload so a final verdict sent right after it
        // is not dropped. Further `Unknown` responses for this id are ignored.
        let budget = self.options.upload_timeout.saturating_add(timeout);
        let deadline = correlator::deadline_after(budget);
        let pending = self.correlator.register(&resp.guid, deadline, Expect::Final)?;

        info!(guid = %resp.guid, "verdict unknown, uploading sample");
        let wait = pending.wait();
        tokio::pin!(wait);

        // close() or a lost connection fails the wait, which abandons the upload.
        tokio::select! {
            reply = &mut wait => return reply.map(Into::into),
            uploaded = self.uploader.upload(url, token, source) => uploaded?,
        }

        let resp = wait.await?;
        debug!(guid = %resp.guid, verdict = %resp.verdict, "verdict received after upload");
        Ok(resp.into())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown.cancel();
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        self.correlator.fail_all(|| VerdictError::ConnectionClosed);
    }
}
