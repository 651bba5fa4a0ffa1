use std::fmt::Debug;
use std::pin::Pin;

use tokio::io::{AsyncBufRead, Take};
use tokio::sync::oneshot;

use crate::errors::{HubError, Result};

pub type EntryId = u64;

/// Bytes of an upload request body, read straight off the uploader's
/// connection.
pub type BodyStream = Pin<Box<dyn AsyncBufRead + Send>>;

/// Upload request body bounded by its declared `Content-Length`.
pub type RequestBody = Take<BodyStream>;

/// Remainder of the upload body bounded to the file content only.
pub type FileReader = Take<RequestBody>;

/// Terminal value of an entry's outcome signal. On success the request body
/// travels back to the uploader so it can consume the closing delimiter.
pub type Outcome = Result<RequestBody>;

/// One pending transfer: an upload waiting for its downloader.
pub struct TransportEntry {
    pub id: EntryId,
    pub name: String,
    pub content_type: Option<String>,
    pub content_length: u64,
    pub reader: FileReader,
    pub completion: Completion,
}

impl TransportEntry {
    pub fn new(
        id: EntryId,
        name: String,
        content_type: Option<String>,
        content_length: u64,
        reader: FileReader,
        completion: Completion,
    ) -> Self {
        Self {
            id,
            name,
            content_type,
            content_length,
            reader,
            completion,
        }
    }
}

impl Debug for TransportEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportEntry")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .field("remaining", &self.reader.limit())
            .finish()
    }
}

/// Resolving half of the outcome signal, owned by whoever holds the entry.
///
/// Resolution consumes the value, so an outcome is reported at most once.
/// Dropping an unresolved completion reports a [`HubError::DownstreamFailure`]:
/// the transport only drops a relay early when its downloader went away.
pub struct Completion {
    tx: Option<oneshot::Sender<Outcome>>,
}

/// Waiting half of the outcome signal, held by the suspended uploader.
pub struct CompletionWaiter {
    rx: oneshot::Receiver<Outcome>,
}

/// Create a linked pair of outcome signal halves.
pub fn completion() -> (Completion, CompletionWaiter) {
    let (tx, rx) = oneshot::channel();
    (Completion { tx: Some(tx) }, CompletionWaiter { rx })
}

impl Completion {
    pub fn succeed(self, body: RequestBody) {
        self.resolve(Ok(body))
    }

    pub fn fail(self, error: HubError) {
        self.resolve(Err(error))
    }

    fn resolve(mut self, outcome: Outcome) {
        if let Some(tx) = self.tx.take() {
            if tx.send(outcome).is_err() {
                log::debug!("outcome dropped, the uploader is already gone");
            }
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(HubError::DownstreamFailure(
                "download abandoned before completion".to_owned(),
            )));
        }
    }
}

impl CompletionWaiter {
    /// Suspend until the outcome resolves. Safe to call again if a previous
    /// call was cancelled before it returned.
    pub async fn wait(&mut self) -> Outcome {
        match (&mut self.rx).await {
            Ok(outcome) => outcome,
            Err(_) => Err(HubError::DownstreamFailure(
                "outcome signal closed".to_owned(),
            )),
        }
    }
}
