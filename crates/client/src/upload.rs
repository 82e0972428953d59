//! Out-of-band upload of samples the service has not seen yet.

use std::fmt;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH};
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument};
use verdict_core::{UploadError, VerdictError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Caller-supplied body chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send + Sync>>;

/// Where the upload body comes from.
pub enum UploadSource {
    /// Streamed from disk, never held in memory as a whole.
    File(PathBuf),
    Bytes(Bytes),
    /// Arbitrary chunks; `len` is sent as the content length.
    Stream { body: ByteStream, len: u64 },
}

impl UploadSource {
    /// Wrap any fallible byte stream whose total length is known up front.
    pub fn stream<S, E>(body: S, len: u64) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + Sync + 'static,
        E: Into<BoxError> + 'static,
    {
        Self::Stream {
            body: Box::pin(body.map_err(Into::<BoxError>::into)),
            len,
        }
    }
}

impl fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Bytes(data) => f.debug_tuple("Bytes").field(&data.len()).finish(),
            Self::Stream { len, .. } => f.debug_struct("Stream").field("len", len).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadChannel {
    client: reqwest::Client,
}

impl UploadChannel {
    /// Build a channel whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, VerdictError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(VerdictError::transport)?;
        Ok(Self { client })
    }

    /// `PUT` the sample to the presigned `url`, authorized by `token`.
    ///
    /// # Errors
    ///
    /// `UploadError::Status` for any non-2xx answer, `Transport` when the
    /// request cannot be sent, `Io` when the source file cannot be read.
    #[instrument(skip(self, token, source))]
    pub async fn upload(&self, url: &str, token: &str, source: UploadSource) -> Result<(), UploadError> {
        let (body, len) = match source {
            UploadSource::File(path) => {
                let file = tokio::fs::File::open(&path).await?;
                let len = file.metadata().await?.len();
                (reqwest::Body::wrap_stream(ReaderStream::new(file)), len)
            }
            UploadSource::Bytes(data) => {
                let len = data.len() as u64;
                (reqwest::Body::from(data), len)
            }
            UploadSource::Stream { body, len } => (reqwest::Body::wrap_stream(body), len),
        };

        let resp = self
            .client
            .put(url)
            .header(AUTHORIZATION, token)
            .header(CONTENT_LENGTH, len)
            .body(body)
            .send()
            .await
            .map_err(|e| UploadError::Transport(Box::new(e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), "upload rejected");
            return Err(UploadError::Status {
                status: status.as_u16(),
                body,
            });
        }

        debug!(status = status.as_u16(), bytes = len, "upload complete");
        Ok(())
    }
}
