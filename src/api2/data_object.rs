//! Binds a single HTTP request against one upstream path to Precache
//! Manager calls.
//!
//! `GET`/`HEAD`/`POST`/`DELETE` on `/<upstream-path>` all land here; routing
//! on method and `Accept`/`Cache-Control` happens in this one module so the
//! error-to-status projection and the "always release on every path"
//! discipline live in one place, rather than spreading the workflow across
//! several router entries.

use std::time::{Duration, Instant};

use hyper::{Body, Method, Request, Response, StatusCode};
use percent_encoding::percent_decode_str;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::backup::checksummer::{read_sidecar, ChunkChecksum};
use crate::backup::{Datatype, EntityHandle, OpenMode, PrecacheError, PrecacheManager};

use super::types::{error_response, plain_error};

const METADATA_MIME: &str = "application/vnd.irobot.metadata+json";
const ETA_MIME: &str = "application/vnd.irobot.eta";

pub fn path_from_uri(uri: &hyper::Uri) -> Result<String, PrecacheError> {
    let decoded = percent_decode_str(uri.path())
        .decode_utf8()
        .map_err(|err| PrecacheError::Internal(anyhow::format_err!("invalid path encoding: {}", err)))?;
    Ok(decoded.trim_start_matches('/').to_string())
}

pub async fn handle(req: Request<Body>, manager: &PrecacheManager, timeout: Duration) -> Response<Body> {
    let path = match path_from_uri(req.uri()) {
        Ok(p) => p,
        Err(err) => return error_response(&err),
    };
    let deadline = Instant::now() + timeout;

    match *req.method() {
        Method::OPTIONS => plain_options_response(),
        Method::GET | Method::HEAD => handle_get(req, manager, &path, deadline).await,
        Method::POST => handle_post(manager, &path, deadline).await,
        Method::DELETE => handle_delete(manager, &path, deadline).await,
        _ => plain_error(StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed", "unsupported method for this endpoint"),
    }
}

fn plain_options_response() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header(hyper::header::ALLOW, "GET, HEAD, POST, DELETE, OPTIONS")
        .body(Body::empty())
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// Runs `fut`, converting a deadline overrun into `PrecacheError::Deadline`,
/// which projects to `504 Gateway Timeout`.
async fn with_deadline<T, F>(deadline: Instant, fut: F) -> Result<T, PrecacheError>
where
    F: std::future::Future<Output = Result<T, PrecacheError>>,
{
    match tokio::time::timeout(remaining(deadline), fut).await {
        Ok(result) => result,
        Err(_) => Err(PrecacheError::Deadline),
    }
}

fn wants_metadata(req: &Request<Body>) -> bool {
    req.headers()
        .get(hyper::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains(METADATA_MIME))
        .unwrap_or(false)
}

/// True if `Accept` is present and non-empty but names no media range this
/// endpoint can serve (`*/*`, `application/octet-stream`, or the metadata
/// media type).
fn accept_is_unsatisfiable(req: &Request<Body>) -> bool {
    let value = match req.headers().get(hyper::header::ACCEPT).and_then(|v| v.to_str().ok()) {
        Some(v) if !v.trim().is_empty() => v,
        _ => return false,
    };

    !value.split(',').any(|range| {
        let range = range.split(';').next().unwrap_or("").trim();
        range == "*/*" || range == "application/octet-stream" || range == METADATA_MIME
    })
}

fn wants_no_cache(req: &Request<Body>) -> bool {
    req.headers()
        .get(hyper::header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("no-cache"))
        .unwrap_or(false)
}

fn if_none_match_hits(req: &Request<Body>, etag: &str) -> bool {
    req.headers()
        .get(hyper::header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_matches('"') == etag || v == "*")
        .unwrap_or(false)
}

fn eta_response(manager: &PrecacheManager, id: i64, datatype: Datatype) -> Response<Body> {
    let eta = match manager.eta(id, datatype) {
        Ok(eta) => eta,
        Err(_) => None,
    };

    let header_value = match eta {
        Some(eta) => {
            let iso = crate::tools::time::epoch_to_rfc3339_utc(eta.at_epoch).unwrap_or_default();
            format!("{} +/- {}", iso, eta.stderr_secs.round() as i64)
        }
        None => "unknown +/- 0".to_string(),
    };

    Response::builder()
        .status(StatusCode::ACCEPTED)
        .header(hyper::header::CONTENT_TYPE, ETA_MIME)
        .header("iRobot-ETA", header_value)
        .body(Body::empty())
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

async fn handle_get(req: Request<Body>, manager: &PrecacheManager, path: &str, deadline: Instant) -> Response<Body> {
    if accept_is_unsatisfiable(&req) {
        return error_response(&PrecacheError::Unacceptable);
    }

    let mode = if wants_no_cache(&req) {
        OpenMode::ForceRefetch
    } else if wants_metadata(&req) {
        OpenMode::MetadataOnly
    } else {
        OpenMode::Existing
    };

    let open_result = with_deadline(deadline, async { manager.open(path, mode).await }).await;
    let mut handle = match open_result {
        Ok(result) => result.handle,
        Err(err) => return error_response(&err),
    };

    let response = if wants_metadata(&req) {
        serve_metadata(&req, &handle)
    } else {
        if !handle.is_data_ready() {
            manager.wait_until_settled(handle.id, Datatype::Data, remaining(deadline)).await;
            if let Ok(fresh) = manager.peek(handle.id) {
                handle = fresh;
            }
        }
        if handle.is_data_ready() {
            serve_data(&req, &handle).await
        } else {
            eta_response(manager, handle.id, Datatype::Data)
        }
    };

    manager.release(&handle);

    if *req.method() == Method::HEAD {
        let mut response = response;
        *response.body_mut() = Body::empty();
        response
    } else {
        response
    }
}

fn serve_metadata(req: &Request<Body>, handle: &EntityHandle) -> Response<Body> {
    let etag = handle.checksum.clone().unwrap_or_default();
    if if_none_match_hits(req, &etag) {
        return not_modified(&etag);
    }

    let metadata_path = handle.precache_dir.join("metadata");
    let contents = match std::fs::read(&metadata_path) {
        Ok(bytes) => bytes,
        Err(err) => {
            return error_response(&PrecacheError::Internal(anyhow::format_err!(
                "unable to read metadata sidecar: {}",
                err
            )))
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, METADATA_MIME)
        .header(hyper::header::ETAG, format!("\"{}\"", etag))
        .body(Body::from(contents))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn not_modified(etag: &str) -> Response<Body> {
    Response::builder()
        .status(StatusCode::NOT_MODIFIED)
        .header(hyper::header::ETAG, format!("\"{}\"", etag))
        .body(Body::empty())
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

async fn serve_data(req: &Request<Body>, handle: &EntityHandle) -> Response<Body> {
    let etag = handle.checksum.clone().unwrap_or_default();
    if if_none_match_hits(req, &etag) {
        return not_modified(&etag);
    }

    let total = match handle.data_size {
        Some(size) => size,
        None => return error_response(&PrecacheError::Internal(anyhow::format_err!("entity has no recorded data size"))),
    };

    let range_header = req.headers().get(hyper::header::RANGE).and_then(|v| v.to_str().ok());
    match range_header {
        Some(value) => serve_range(value, handle, total, &etag).await,
        None => serve_whole(handle, total, &etag).await,
    }
}

async fn serve_whole(handle: &EntityHandle, total: u64, etag: &str) -> Response<Body> {
    let data_path = handle.precache_dir.join("data");
    let file = match tokio::fs::File::open(&data_path).await {
        Ok(file) => file,
        Err(err) => {
            return error_response(&PrecacheError::Internal(anyhow::format_err!("unable to open data file: {}", err)))
        }
    };

    let stream = tokio_util::codec::FramedRead::new(file, tokio_util::codec::BytesCodec::new());
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/octet-stream")
        .header(hyper::header::CONTENT_LENGTH, total)
        .header(hyper::header::ETAG, format!("\"{}\"", etag))
        .header(hyper::header::ACCEPT_RANGES, "bytes")
        .body(Body::wrap_stream(stream))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

struct AlignedPart {
    start: u64,
    end: u64,
    etag: String,
}

/// Expands `(start, end)` (inclusive) to the full span of `.checksums`
/// chunks it overlaps, so ranges are always served aligned to chunk
/// boundaries from the checksum sidecar.
fn align_to_chunks(start: u64, end: u64, chunks: &[ChunkChecksum], whole_etag: &str) -> Option<AlignedPart> {
    let mut overlapping = chunks
        .iter()
        .filter(|c| c.offset <= end && c.offset + c.length.max(1) > start);

    let first = overlapping.next()?;
    let mut last = first;
    let mut count = 1;
    for chunk in overlapping {
        last = chunk;
        count += 1;
    }

    let etag = if count == 1 { first.md5_hex.clone() } else { whole_etag.to_string() };
    Some(AlignedPart {
        start: first.offset,
        end: last.offset + last.length.saturating_sub(1),
        etag,
    })
}

fn parse_byte_ranges(header: &str, total: u64) -> Result<Vec<(u64, u64)>, PrecacheError> {
    let spec = header.strip_prefix("bytes=").ok_or(PrecacheError::BadRange)?;
    let mut ranges = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        let (start_str, end_str) = part.split_once('-').ok_or(PrecacheError::BadRange)?;
        let (start, end) = if start_str.is_empty() {
            let suffix: u64 = end_str.parse().map_err(|_| PrecacheError::BadRange)?;
            if suffix == 0 || suffix > total {
                return Err(PrecacheError::BadRange);
            }
            (total - suffix, total - 1)
        } else {
            let start: u64 = start_str.parse().map_err(|_| PrecacheError::BadRange)?;
            let end: u64 = if end_str.is_empty() {
                total.saturating_sub(1)
            } else {
                end_str.parse().map_err(|_| PrecacheError::BadRange)?
            };
            (start, end)
        };
        if start > end || start >= total {
            return Err(PrecacheError::BadRange);
        }
        ranges.push((start, end.min(total.saturating_sub(1))));
    }
    if ranges.is_empty() {
        return Err(PrecacheError::BadRange);
    }
    Ok(ranges)
}

async fn read_span(path: &std::path::Path, start: u64, end: u64) -> Result<Vec<u8>, PrecacheError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|err| PrecacheError::Internal(anyhow::format_err!("unable to open data file: {}", err)))?;
    file.seek(std::io::SeekFrom::Start(start))
        .await
        .map_err(|err| PrecacheError::Internal(err.into()))?;
    let len = (end - start + 1) as usize;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf)
        .await
        .map_err(|err| PrecacheError::Internal(anyhow::format_err!("short read serving range: {}", err)))?;
    Ok(buf)
}

async fn serve_range(header: &str, handle: &EntityHandle, total: u64, whole_etag: &str) -> Response<Body> {
    let requested = match parse_byte_ranges(header, total) {
        Ok(r) => r,
        Err(err) => return error_response(&err),
    };

    let sidecar_path = handle.precache_dir.join("checksums");
    let chunks = read_sidecar(&sidecar_path).unwrap_or_default();

    let mut parts = Vec::new();
    for (start, end) in requested {
        let part = if chunks.is_empty() {
            AlignedPart { start, end, etag: whole_etag.to_string() }
        } else {
            match align_to_chunks(start, end, &chunks, whole_etag) {
                Some(part) => part,
                None => return error_response(&PrecacheError::BadRange),
            }
        };
        parts.push(part);
    }

    let data_path = handle.precache_dir.join("data");

    if parts.len() == 1 {
        let part = &parts[0];
        let bytes = match read_span(&data_path, part.start, part.end).await {
            Ok(bytes) => bytes,
            Err(err) => return error_response(&err),
        };
        return Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .header(hyper::header::CONTENT_TYPE, "application/octet-stream")
            .header(hyper::header::CONTENT_RANGE, format!("bytes {}-{}/{}", part.start, part.end, total))
            .header(hyper::header::CONTENT_LENGTH, bytes.len() as u64)
            .header(hyper::header::ETAG, format!("\"{}\"", part.etag))
            .body(Body::from(bytes))
            .unwrap_or_else(|_| Response::new(Body::empty()));
    }

    let boundary = format!("irobot_byteranges_{}", handle.id);
    let mut body = Vec::new();
    for part in &parts {
        let bytes = match read_span(&data_path, part.start, part.end).await {
            Ok(bytes) => bytes,
            Err(err) => return error_response(&err),
        };
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n");
        body.extend_from_slice(format!("Content-Range: bytes {}-{}/{}\r\n", part.start, part.end, total).as_bytes());
        body.extend_from_slice(format!("ETag: \"{}\"\r\n\r\n", part.etag).as_bytes());
        body.extend_from_slice(&bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());

    Response::builder()
        .status(StatusCode::PARTIAL_CONTENT)
        .header(hyper::header::CONTENT_TYPE, format!("multipart/byteranges; boundary={}", boundary))
        .header(hyper::header::CONTENT_LENGTH, body.len() as u64)
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

async fn handle_post(manager: &PrecacheManager, path: &str, deadline: Instant) -> Response<Body> {
    let result = with_deadline(deadline, async { manager.open(path, OpenMode::ForceRefetch).await }).await;
    match result {
        Ok(result) => {
            let response = if result.refetched {
                eta_response(manager, result.handle.id, Datatype::Data)
            } else {
                Response::builder()
                    .status(StatusCode::CREATED)
                    .body(Body::empty())
                    .unwrap_or_else(|_| Response::new(Body::empty()))
            };
            manager.release(&result.handle);
            response
        }
        Err(err) => error_response(&err),
    }
}

async fn handle_delete(manager: &PrecacheManager, path: &str, deadline: Instant) -> Response<Body> {
    match with_deadline(deadline, async { manager.delete(path).await }).await {
        Ok(()) => Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Body::empty())
            .unwrap_or_else(|_| Response::new(Body::empty())),
        Err(err) => error_response(&err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(offset: u64, length: u64, md5: &str) -> ChunkChecksum {
        ChunkChecksum { offset, length, md5_hex: md5.to_string() }
    }

    #[test]
    fn single_byte_ranges_align_to_their_chunk() {
        let chunks = vec![chunk(0, 1_048_576, "chunk0"), chunk(1_048_576, 1_048_576, "chunk1")];
        let part = align_to_chunks(0, 0, &chunks, "whole").unwrap();
        assert_eq!((part.start, part.end), (0, 1_048_575));
        assert_eq!(part.etag, "chunk0");

        let part = align_to_chunks(1_048_575, 1_048_575, &chunks, "whole").unwrap();
        assert_eq!((part.start, part.end), (0, 1_048_575));
        assert_eq!(part.etag, "chunk0");

        let part = align_to_chunks(1_048_576, 1_048_576, &chunks, "whole").unwrap();
        assert_eq!(part.etag, "chunk1");
    }

    #[test]
    fn parses_multiple_byte_ranges() {
        let ranges = parse_byte_ranges("bytes=0-0,1048575-1048575", 2_097_152).unwrap();
        assert_eq!(ranges, vec![(0, 0), (1_048_575, 1_048_575)]);
    }

    #[test]
    fn suffix_range_counts_from_the_end() {
        let ranges = parse_byte_ranges("bytes=-10", 100).unwrap();
        assert_eq!(ranges, vec![(90, 99)]);
    }

    #[test]
    fn out_of_bounds_range_is_rejected() {
        assert!(parse_byte_ranges("bytes=1000-2000", 100).is_err());
    }

    #[test]
    fn path_from_uri_strips_leading_slash_and_decodes() {
        let uri: hyper::Uri = "/seq%2Falpha".parse().unwrap();
        assert_eq!(path_from_uri(&uri).unwrap(), "seq/alpha");
    }
}
