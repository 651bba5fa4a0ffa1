use std::io;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::{stream, TryStreamExt};
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;

use crate::entry::{
    completion, BodyStream, CompletionWaiter, EntryId, Outcome, RequestBody,
    TransportEntry,
};
use crate::errors::{HubError, Result};
use crate::framing::{self, UploadFraming};
use crate::server::Hub;

/// Confirmation sent to the uploader once its file has been delivered.
pub const DONE: &[u8] = b"Done.";

/// `POST /hub`: register the upload and hold the connection until a
/// downloader has taken the whole file.
///
/// Headers are validated before anything is committed. After that the
/// success status goes out straight away and the body is produced only
/// once the transfer concludes; a failure errors the body stream, which
/// makes the transport drop the uploader's connection instead of sending
/// a partial confirmation.
pub async fn upload(
    State(hub): State<Hub>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response> {
    let framing = UploadFraming::from_headers(
        header_str(&headers, header::CONTENT_TYPE),
        header_str(&headers, header::CONTENT_LENGTH),
    )?;
    log::debug!(
        "ingress: accepted upload of {} bytes, boundary {:?}",
        framing.content_length,
        String::from_utf8_lossy(&framing.boundary)
    );

    let stream: BodyStream = Box::pin(StreamReader::new(
        body.into_data_stream().map_err(io::Error::other),
    ));
    let request_body = stream.take(framing.content_length);

    let confirmation = stream::once(async move {
        match receive(hub, framing, request_body).await {
            Ok(()) => Ok(Bytes::from_static(DONE)),
            Err(e @ HubError::Multipart(_)) => {
                log::warn!("ingress: closing sender connection: {}", e);
                Err(io::Error::other(e))
            }
            Err(e) => {
                log::debug!("ingress: closing sender connection: {}", e);
                Err(io::Error::other(e))
            }
        }
    });

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(header::CONTENT_LENGTH, DONE.len())
        .body(Body::from_stream(confirmation))?)
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Walk the multipart body up to the file part, register it and wait for
/// its outcome. Returns once the closing delimiter has been verified.
pub async fn receive(
    hub: Hub,
    framing: UploadFraming,
    mut body: RequestBody,
) -> Result<()> {
    let boundary = framing.boundary;
    let head = loop {
        match framing::next_part(&mut body, &boundary).await? {
            Some(head) if head.is_file_field() => break head,
            Some(head) => {
                log::debug!("ingress: skipping field {:?}", head.field_name);
            }
            None => {
                return Err(HubError::multipart(format!(
                    "no `{}` field in upload",
                    framing::FILE_FIELD
                )))
            }
        }
    };

    let content_length = framing::file_length(body.limit(), boundary.len())?;
    let shelf = hub.shelf();
    let id = shelf.allocate_id();
    let (completion, mut waiter) = completion();
    let entry = TransportEntry::new(
        id,
        head.display_name(),
        head.content_type,
        content_length,
        body.take(content_length),
        completion,
    );
    log::info!("hub/{}: registered {:?}", id, entry);
    shelf.insert(entry)?;

    let _registration = Registration { hub: &hub, id };
    let mut body = wait_for_outcome(&hub, id, &mut waiter).await?;
    framing::expect_closing_delimiter(&mut body, &boundary).await?;
    log::info!("hub/{}: upload finished", id);
    Ok(())
}

async fn wait_for_outcome(
    hub: &Hub,
    id: EntryId,
    waiter: &mut CompletionWaiter,
) -> Outcome {
    let Some(limit) = hub.wait_timeout() else {
        return waiter.wait().await;
    };

    match tokio::time::timeout(limit, waiter.wait()).await {
        Ok(outcome) => outcome,
        Err(_) if hub.shelf().withdraw(id) => {
            log::info!("hub/{}: no downloader within {:?}", id, limit);
            Err(HubError::NoDownloader(limit))
        }
        // A downloader claimed it just in time
        Err(_) => waiter.wait().await,
    }
}

/// Withdraws an unclaimed entry when the upload future is dropped: on a
/// wait timeout, on shutdown, or when the transport cancels the request.
/// The transport does not read an idle uploader's socket, so an uploader
/// that silently closes its connection stays listed until one of those
/// happens or a downloader claims the entry and runs into the short body.
struct Registration<'a> {
    hub: &'a Hub,
    id: EntryId,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if self.hub.shelf().withdraw(self.id) {
            log::info!("hub/{}: withdrawn, uploader went away", self.id);
        }
    }
}
