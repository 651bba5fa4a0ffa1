//! Download side: redirect-by-query and the single-use direct fetch that
//! relays bytes from the uploader's connection into the response.

use std::collections::HashMap;
use std::io;

use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{Redirect, Response};
use bytes::Bytes;
use futures::stream::{self, Stream};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tokio::io::AsyncReadExt;

use crate::entry::{Completion, EntryId, FileReader, TransportEntry};
use crate::errors::{HubError, Result};
use crate::server::Hub;

/// Size of each read from the uploader's connection.
pub const CHUNK_SIZE: usize = 8 * 1024;

const NAME_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Stable, shareable download path for an entry.
pub fn download_path(id: EntryId, name: &str) -> String {
    format!("/hub/{}/{}", id, utf8_percent_encode(name, NAME_ENCODE_SET))
}

/// `GET /hub?e=<id>`: point the client at the download path without
/// claiming the entry.
pub async fn redirect(
    State(hub): State<Hub>,
    RawQuery(query): RawQuery,
) -> Result<Redirect> {
    let id = entry_id_from_query(query.as_deref())?;
    let summary = hub.shelf().lookup(id)?;
    let location = download_path(id, &summary.name);
    log::debug!("hub/{}: redirecting to {}", id, location);
    Ok(Redirect::to(&location))
}

/// `GET /hub/<id>[/<name>]`: claim the entry and stream it out.
pub async fn fetch(
    State(hub): State<Hub>,
    Path(params): Path<HashMap<String, String>>,
) -> Result<Response> {
    let raw_id = params.get("id").map(String::as_str).unwrap_or_default();
    let id: EntryId = raw_id
        .parse()
        .map_err(|_| HubError::NotFound(format!("{:?} not found", raw_id)))?;

    let entry = hub.shelf().claim(id)?;
    log::info!(
        "hub/{}: claimed {:?} ({} bytes)",
        id,
        entry.name,
        entry.content_length
    );

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_LENGTH, entry.content_length);
    if let Some(content_type) = entry
        .content_type
        .as_deref()
        .and_then(|value| HeaderValue::from_str(value).ok())
    {
        response = response.header(header::CONTENT_TYPE, content_type);
    }

    let relay = Relay::new(entry);
    Ok(response.body(Body::from_stream(relay.into_stream()))?)
}

fn entry_id_from_query(query: Option<&str>) -> Result<EntryId> {
    let query = query
        .filter(|query| !query.is_empty())
        .ok_or_else(|| HubError::BadRequest("No query string".to_owned()))?;

    let value = url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "e")
        .map(|(_, value)| value)
        .ok_or_else(|| {
            HubError::BadRequest("Parameter `e` is required".to_owned())
        })?;

    value.parse().map_err(|_| {
        HubError::BadRequest("Parameter `e` should be an integer".to_owned())
    })
}

/// Pumps one claimed entry from the uploader's body into a response stream.
///
/// Each chunk is read from the uploader only when the downloader's side
/// asks for the next one, so both connections move at the pace of the
/// slower one. The outcome resolves as success as soon as the last declared
/// byte has been read, since the transport stops polling a body once its
/// `Content-Length` is satisfied and may never poll an empty one at all.
/// Running out of input early or failing to read resolves it as
/// incomplete, and dropping the relay short of the declared length means
/// the downloader went away.
pub struct Relay {
    id: EntryId,
    reader: Option<FileReader>,
    completion: Option<Completion>,
    expected: u64,
    delivered: u64,
    buf: Box<[u8]>,
}

impl Relay {
    pub fn new(entry: TransportEntry) -> Self {
        Self {
            id: entry.id,
            reader: Some(entry.reader),
            completion: Some(entry.completion),
            expected: entry.content_length,
            delivered: 0,
            buf: vec![0u8; CHUNK_SIZE].into_boxed_slice(),
        }
    }

    pub fn into_stream(
        self,
    ) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        stream::unfold(self, |mut relay| async move {
            let chunk = relay.next_chunk().await?;
            Some((chunk, relay))
        })
    }

    async fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        if self.delivered == self.expected {
            self.complete();
            return None;
        }

        let reader = self.reader.as_mut()?;
        match reader.read(&mut self.buf).await {
            Ok(0) => self.abort(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "uploader disconnected",
            )),
            Ok(read) => {
                self.delivered += read as u64;
                let chunk = Bytes::copy_from_slice(&self.buf[..read]);
                if self.delivered == self.expected {
                    self.complete();
                }
                Some(Ok(chunk))
            }
            Err(e) => {
                log::debug!("hub/{}: reading from uploader failed: {}", self.id, e);
                self.abort(e)
            }
        }
    }

    /// Resolve success and hand the rest of the request body back.
    fn complete(&mut self) {
        if let (Some(reader), Some(completion)) =
            (self.reader.take(), self.completion.take())
        {
            log::info!(
                "hub/{}: transfer completed, {} bytes delivered",
                self.id,
                self.delivered
            );
            completion.succeed(reader.into_inner());
        }
    }

    fn abort(&mut self, cause: io::Error) -> Option<io::Result<Bytes>> {
        log::debug!(
            "hub/{}: transfer incomplete, total_len = {}, content-length = {}",
            self.id,
            self.delivered,
            self.expected
        );
        self.reader = None;
        if let Some(completion) = self.completion.take() {
            completion.fail(HubError::TransferIncomplete {
                delivered: self.delivered,
                expected: self.expected,
            });
        }
        Some(Err(cause))
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        if self.delivered == self.expected {
            self.complete();
            return;
        }
        if let Some(completion) = self.completion.take() {
            log::debug!(
                "hub/{}: downloader went away after {} of {} bytes",
                self.id,
                self.delivered,
                self.expected
            );
            completion.fail(HubError::DownstreamFailure(format!(
                "downloader disconnected after {} of {} bytes",
                self.delivered, self.expected
            )));
        }
    }
}
