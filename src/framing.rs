//! Multipart framing for uploads.
//!
//! An upload body carries the file as the last part of a
//! `multipart/form-data` document. The part does not declare its own length,
//! so it is derived from how much of the declared `Content-Length` is left
//! once the part headers have been read: everything except the closing
//! delimiter `CRLF "--" boundary "--" CRLF` is file content.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};

use crate::errors::{HubError, Result};

/// Form field name carrying the file.
pub const FILE_FIELD: &str = "f";
/// File name used when the uploader did not send one.
pub const DEFAULT_FILE_NAME: &str = "Anonymous File";

const MULTIPART_PREFIX: &str = "multipart/form-data;";
const BOUNDARY_PARAM: &str = "boundary=";
const DASHES: &[u8] = b"--";
const CRLF: &[u8] = b"\r\n";

const MAX_HEADER_LINE: usize = 8 * 1024;
const MAX_HEADERS: usize = 64;
// Delimiter lines may carry trailing whitespace padding
const DELIMITER_SLACK: usize = 64;

/// Upload request metadata validated from the request headers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadFraming {
    pub boundary: Vec<u8>,
    pub content_length: u64,
}

impl UploadFraming {
    /// Validate the `Content-Type` and `Content-Length` of an upload.
    ///
    /// A body shorter than its boundary token cannot be a multipart
    /// document and is rejected up front.
    pub fn from_headers(
        content_type: Option<&str>,
        content_length: Option<&str>,
    ) -> Result<Self> {
        let boundary = content_type.and_then(parse_boundary);
        let content_length =
            content_length.and_then(|value| value.trim().parse::<u64>().ok());

        match (boundary, content_length) {
            (Some(boundary), Some(content_length))
                if content_length >= boundary.len() as u64 =>
            {
                Ok(Self {
                    boundary: boundary.into_bytes(),
                    content_length,
                })
            }
            _ => Err(HubError::BadRequest(
                "Bad Content-Length/Content-Type".to_owned(),
            )),
        }
    }
}

/// Extract the boundary token from a `multipart/form-data` content type.
pub fn parse_boundary(content_type: &str) -> Option<String> {
    let lower = content_type.to_ascii_lowercase();
    if !lower.starts_with(MULTIPART_PREFIX) {
        return None;
    }

    let param = lower[MULTIPART_PREFIX.len()..].find(BOUNDARY_PARAM)?;
    let start = MULTIPART_PREFIX.len() + param + BOUNDARY_PARAM.len();
    let value = unquote(content_type[start..].split(';').next()?.trim());
    if value.is_empty() {
        None
    } else {
        Some(value.to_owned())
    }
}

/// Bytes the closing delimiter occupies after the last part's content.
pub fn delimiter_overhead(boundary_len: usize) -> u64 {
    (boundary_len + 2 * DASHES.len() + 2 * CRLF.len()) as u64
}

/// Length of the final part's content, given how many bytes of the outer
/// body remain once its headers have been consumed.
pub fn file_length(remaining: u64, boundary_len: usize) -> Result<u64> {
    remaining
        .checked_sub(delimiter_overhead(boundary_len))
        .ok_or_else(|| {
            HubError::multipart(format!(
                "{} remaining bytes cannot hold the closing delimiter",
                remaining
            ))
        })
}

/// The exact bytes that must follow the final part's content.
pub fn closing_delimiter(boundary: &[u8]) -> Vec<u8> {
    [CRLF, DASHES, boundary, DASHES, CRLF].concat()
}

/// Headers of one multipart part.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartHead {
    pub field_name: Option<String>,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
}

impl PartHead {
    pub fn is_file_field(&self) -> bool {
        self.field_name.as_deref() == Some(FILE_FIELD)
    }

    /// File name to show to downloaders.
    pub fn display_name(&self) -> String {
        match self.file_name.as_deref() {
            Some(name) if !name.is_empty() => name.to_owned(),
            _ => DEFAULT_FILE_NAME.to_owned(),
        }
    }

    fn apply_header(&mut self, line: &[u8]) -> Result<()> {
        let text = String::from_utf8_lossy(line);
        let (name, value) = text.split_once(':').ok_or_else(|| {
            HubError::multipart(format!("malformed part header {:?}", text))
        })?;
        let (name, value) = (name.trim(), value.trim());

        if name.eq_ignore_ascii_case("content-disposition") {
            for param in value.split(';').map(str::trim) {
                if let Some(field) = param.strip_prefix("name=") {
                    self.field_name = Some(unquote(field).to_owned());
                } else if let Some(file) = param.strip_prefix("filename=") {
                    self.file_name = Some(unquote(file).to_owned());
                }
            }
        } else if name.eq_ignore_ascii_case("content-type")
            && !value.is_empty()
        {
            self.content_type = Some(value.to_owned());
        }
        Ok(())
    }
}

/// Advance past the next delimiter line and read the headers of the part
/// that follows it. Returns `None` when the closing delimiter is reached.
///
/// On return the reader is positioned at the first byte of the part's
/// content.
pub async fn next_part<R>(
    reader: &mut R,
    boundary: &[u8],
) -> Result<Option<PartHead>>
where
    R: AsyncBufRead + Unpin,
{
    if seek_delimiter(reader, boundary).await? == Delimiter::Close {
        return Ok(None);
    }

    let mut head = PartHead::default();
    let mut line = Vec::new();
    for _ in 0..=MAX_HEADERS {
        match read_line(reader, &mut line, MAX_HEADER_LINE).await? {
            LineRead::Eof => {
                return Err(HubError::multipart(
                    "body ended inside part headers",
                ))
            }
            LineRead::TooLong => {
                return Err(HubError::multipart("part header line too long"))
            }
            LineRead::Line if line.is_empty() => return Ok(Some(head)),
            LineRead::Line => head.apply_header(&line)?,
        }
    }
    Err(HubError::multipart("too many part headers"))
}

/// Read the closing delimiter that must follow the final part's content.
pub async fn expect_closing_delimiter<R>(
    reader: &mut R,
    boundary: &[u8],
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let expected = closing_delimiter(boundary);
    let mut trailer = vec![0u8; expected.len()];
    reader
        .read_exact(&mut trailer)
        .await
        .map_err(|e| {
            HubError::multipart(format!("closing delimiter unreadable: {}", e))
        })?;

    if trailer != expected {
        return Err(HubError::multipart(format!(
            "expected closing delimiter, found {:?}",
            String::from_utf8_lossy(&trailer)
        )));
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Delimiter {
    Part,
    Close,
}

enum LineRead {
    Line,
    TooLong,
    Eof,
}

async fn seek_delimiter<R>(reader: &mut R, boundary: &[u8]) -> Result<Delimiter>
where
    R: AsyncBufRead + Unpin,
{
    let cap = boundary.len() + 2 * DASHES.len() + DELIMITER_SLACK;
    let mut line = Vec::with_capacity(cap);
    loop {
        match read_line(reader, &mut line, cap).await? {
            LineRead::Eof => {
                return Err(HubError::multipart(
                    "body ended before the closing delimiter",
                ))
            }
            // Part content, too long to be a delimiter
            LineRead::TooLong => continue,
            LineRead::Line => {
                if let Some(delimiter) = delimiter_kind(&line, boundary) {
                    return Ok(delimiter);
                }
            }
        }
    }
}

fn delimiter_kind(line: &[u8], boundary: &[u8]) -> Option<Delimiter> {
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |pos| pos + 1);
    let rest = line[..end]
        .strip_prefix(DASHES)?
        .strip_prefix(boundary)?;
    match rest {
        [] => Some(Delimiter::Part),
        [b'-', b'-'] => Some(Delimiter::Close),
        _ => None,
    }
}

/// Read one line into `line` without its terminator. Lines longer than `cap`
/// are consumed but not kept.
async fn read_line<R>(
    reader: &mut R,
    line: &mut Vec<u8>,
    cap: usize,
) -> Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let mut truncated = false;
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(LineRead::Eof);
        }

        let (used, complete) = match buf.iter().position(|&b| b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (buf.len(), false),
        };
        if !truncated {
            if line.len() + used > cap {
                truncated = true;
            } else {
                line.extend_from_slice(&buf[..used]);
            }
        }
        reader.consume(used);

        if complete {
            if truncated {
                return Ok(LineRead::TooLong);
            }
            if line.last() == Some(&b'\n') {
                line.pop();
            }
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(LineRead::Line);
        }
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::io::AsyncReadExt;

    fn file_part(boundary: &str, disposition: &str, content: &[u8]) -> Vec<u8> {
        let mut body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\n\
             keep me\r\n\
             --{b}\r\nContent-Disposition: {d}\r\n\
             Content-Type: application/octet-stream\r\n\r\n",
            b = boundary,
            d = disposition,
        )
        .into_bytes();
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
        body
    }

    fn pattern(len: usize) -> Vec<u8> {
        // Includes CRLF and dashes so content looks like framing
        b"ab\r\n--XYZ\r\n"
            .iter()
            .copied()
            .cycle()
            .take(len)
            .collect()
    }

    #[rstest]
    #[case("multipart/form-data; boundary=XYZ", Some("XYZ"))]
    #[case("Multipart/Form-Data; Boundary=AbC123", Some("AbC123"))]
    #[case("multipart/form-data; boundary=\"quoted-b\"", Some("quoted-b"))]
    #[case("multipart/form-data; boundary=XYZ; charset=utf-8", Some("XYZ"))]
    #[case("multipart/form-data; boundary=", None)]
    #[case("multipart/form-data", None)]
    #[case("multipart/mixed; boundary=XYZ", None)]
    #[case("text/plain", None)]
    fn boundary_parsing(#[case] header: &str, #[case] expected: Option<&str>) {
        assert_eq!(parse_boundary(header).as_deref(), expected);
    }

    #[rstest]
    #[case(None, Some("100"))]
    #[case(Some("text/plain"), Some("100"))]
    #[case(Some("multipart/form-data; boundary=XYZ"), None)]
    #[case(Some("multipart/form-data; boundary=XYZ"), Some("lots"))]
    #[case(Some("multipart/form-data; boundary=XYZ"), Some("-4"))]
    #[case(Some("multipart/form-data; boundary=XYZ"), Some("2"))]
    fn bad_upload_headers(
        #[case] content_type: Option<&str>,
        #[case] content_length: Option<&str>,
    ) {
        let result = UploadFraming::from_headers(content_type, content_length);
        assert!(matches!(result, Err(HubError::BadRequest(_))));
    }

    #[test]
    fn upload_headers_accepted() {
        let framing = UploadFraming::from_headers(
            Some("multipart/form-data; boundary=XYZ"),
            Some("3"),
        )
        .unwrap();
        assert_eq!(framing.boundary, b"XYZ");
        assert_eq!(framing.content_length, 3);
    }

    #[rstest]
    #[case(3 + 8, 3, 0)]
    #[case(3 + 8 + 5, 3, 5)]
    #[case(40 + 8 + 8192, 40, 8192)]
    fn length_arithmetic(
        #[case] remaining: u64,
        #[case] boundary_len: usize,
        #[case] expected: u64,
    ) {
        assert_eq!(file_length(remaining, boundary_len).unwrap(), expected);
    }

    #[test]
    fn length_arithmetic_rejects_short_bodies() {
        assert!(matches!(
            file_length(10, 3),
            Err(HubError::Multipart(_))
        ));
    }

    #[test]
    fn closing_delimiter_bytes() {
        assert_eq!(closing_delimiter(b"XYZ"), b"\r\n--XYZ--\r\n");
        assert_eq!(delimiter_overhead(3), 11);
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(5)]
    #[case(8191)]
    #[case(8192)]
    #[case(8193)]
    #[case(100_000)]
    #[tokio::test]
    async fn derived_length_matches_content(#[case] size: usize) {
        let content = pattern(size);
        let body = file_part(
            "XYZ",
            "form-data; name=\"f\"; filename=\"a.bin\"",
            &content,
        );
        let mut reader = (&body[..]).take(body.len() as u64);

        let mut head = next_part(&mut reader, b"XYZ").await.unwrap().unwrap();
        assert_eq!(head.field_name.as_deref(), Some("note"));
        while !head.is_file_field() {
            head = next_part(&mut reader, b"XYZ").await.unwrap().unwrap();
        }
        assert_eq!(head.display_name(), "a.bin");

        let length = file_length(reader.limit(), 3).unwrap();
        assert_eq!(length, size as u64);

        let mut received = Vec::new();
        (&mut reader)
            .take(length)
            .read_to_end(&mut received)
            .await
            .unwrap();
        assert_eq!(received, content);

        expect_closing_delimiter(&mut reader, b"XYZ").await.unwrap();
        assert_eq!(reader.limit(), 0);
    }

    #[rstest]
    #[case("form-data; name=\"f\"; filename=\"a.txt\"", "a.txt")]
    #[case("form-data; name=\"f\"; filename=plain.txt", "plain.txt")]
    #[case("form-data; name=\"f\"; filename=\"\"", DEFAULT_FILE_NAME)]
    #[case("form-data; name=\"f\"", DEFAULT_FILE_NAME)]
    #[case("form-data; filename=\"x y.txt\"; name=f", "x y.txt")]
    #[tokio::test]
    async fn disposition_parsing(
        #[case] disposition: &str,
        #[case] expected: &str,
    ) {
        let body = format!(
            "--B\r\nContent-Disposition: {}\r\n\r\nx\r\n--B--\r\n",
            disposition
        );
        let head = next_part(&mut body.as_bytes(), b"B")
            .await
            .unwrap()
            .unwrap();
        assert!(head.is_file_field());
        assert_eq!(head.display_name(), expected);
        assert_eq!(head.content_type, None);
    }

    #[tokio::test]
    async fn preamble_is_skipped() {
        let body = b"preamble text\r\n--B\r\ncontent-type: image/png\r\n\r\n";
        let head = next_part(&mut &body[..], b"B").await.unwrap().unwrap();
        assert_eq!(head.content_type.as_deref(), Some("image/png"));
        assert_eq!(head.field_name, None);
    }

    #[tokio::test]
    async fn closing_delimiter_ends_parts() {
        let body = b"--B\r\nContent-Disposition: form-data; name=\"x\"\r\n\r\n\
                     1\r\n--B--\r\n";
        let mut reader = &body[..];
        let head = next_part(&mut reader, b"B").await.unwrap().unwrap();
        assert!(!head.is_file_field());
        assert_eq!(next_part(&mut reader, b"B").await.unwrap(), None);
    }

    #[rstest]
    #[case(&b"--B\r\nContent-Disposition: form-data"[..])]
    #[case(&b"no delimiter here\r\n"[..])]
    #[case(&b"--B\r\nnot a header\r\n\r\n"[..])]
    #[tokio::test]
    async fn truncated_or_corrupt_heads(#[case] body: &[u8]) {
        let mut reader = body;
        assert!(matches!(
            next_part(&mut reader, b"B").await,
            Err(HubError::Multipart(_))
        ));
    }

    #[tokio::test]
    async fn oversized_header_line_is_rejected() {
        let mut body = b"--B\r\nX-Padding: ".to_vec();
        body.extend(std::iter::repeat(b'a').take(MAX_HEADER_LINE));
        body.extend_from_slice(b"\r\n\r\n");
        assert!(matches!(
            next_part(&mut &body[..], b"B").await,
            Err(HubError::Multipart(_))
        ));
    }

    #[tokio::test]
    async fn long_lines_inside_content_are_skipped() {
        let mut body = b"--B\r\nContent-Disposition: form-data; name=\"big\"\r\n\r\n"
            .to_vec();
        body.extend(std::iter::repeat(b'z').take(50_000));
        body.extend_from_slice(
            b"\r\n--B\r\nContent-Disposition: form-data; name=\"f\"\r\n\r\n",
        );
        let mut reader = &body[..];
        next_part(&mut reader, b"B").await.unwrap().unwrap();
        let head = next_part(&mut reader, b"B").await.unwrap().unwrap();
        assert!(head.is_file_field());
    }

    #[tokio::test]
    async fn wrong_closing_delimiter_is_rejected() {
        let mut reader = &b"\r\n--XYZ\r\n--"[..];
        assert!(matches!(
            expect_closing_delimiter(&mut reader, b"XYZ").await,
            Err(HubError::Multipart(_))
        ));
    }
}
