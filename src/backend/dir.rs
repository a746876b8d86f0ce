//! Static directory serving.
//!
//! Resolves request paths under a configured root, refusing anything that
//! would escape it, and streams file bytes to the connection in bounded
//! chunks. Resolution or I/O failures become normal HTTP error responses.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::http::mime;
use crate::http::request::{Method, Request};
use crate::http::response::{Response, ResponseBuilder, StatusCode};
use crate::http::writer::ConnectionWriter;
use crate::routing::DirSpec;

/// Joins `rel` onto `root` component by component. Any parent-directory
/// component rejects the whole path; the result can never leave the root.
pub fn resolve_path(root: &Path, rel: &str) -> Option<PathBuf> {
    let mut out = root.to_path_buf();

    for part in rel.split('/') {
        match part {
            "" | "." => continue,
            ".." => return None,
            part => out.push(part),
        }
    }

    Some(out)
}

/// Serves one request from the directory backend, returning the response
/// status and the body bytes streamed, for the access log. Client-side
/// write failures are the only hard errors; everything else answers with
/// an HTTP error status.
pub async fn serve(
    spec: &DirSpec,
    req: &Request,
    writer: &ConnectionWriter,
    chunk_size: usize,
) -> anyhow::Result<(StatusCode, u64)> {
    if !matches!(req.method, Method::GET | Method::HEAD) {
        let resp = Response::error(StatusCode::MethodNotAllowed);
        writer.send_response(&resp).await?;
        return Ok((StatusCode::MethodNotAllowed, 0));
    }

    // strip the matched route prefix and any query string
    let pattern = req.target().map(|t| t.pattern.as_str()).unwrap_or("");
    let path = req.path.strip_prefix(pattern).unwrap_or(&req.path);
    let path = path.split_once('?').map(|(p, _)| p).unwrap_or(path);

    let Some(mut resolved) = resolve_path(&spec.root, path) else {
        debug!(path = %req.path, "Rejected path escaping the directory root");
        let resp = Response::error(StatusCode::NotFound);
        writer.send_response(&resp).await?;
        return Ok((StatusCode::NotFound, 0));
    };

    let mut meta = match tokio::fs::metadata(&resolved).await {
        Ok(meta) => meta,
        Err(_) => {
            let resp = Response::error(StatusCode::NotFound);
            writer.send_response(&resp).await?;
            return Ok((StatusCode::NotFound, 0));
        }
    };

    if meta.is_dir() {
        resolved.push(&spec.index_file);

        meta = match tokio::fs::metadata(&resolved).await {
            Ok(meta) => meta,
            Err(_) => {
                let resp = Response::error(StatusCode::NotFound);
                writer.send_response(&resp).await?;
                return Ok((StatusCode::NotFound, 0));
            }
        };
    }

    let mut file = match tokio::fs::File::open(&resolved).await {
        Ok(file) => file,
        Err(e) => {
            debug!(path = %resolved.display(), error = %e, "Failed to open file");
            let resp = Response::error(StatusCode::InternalServerError);
            writer.send_response(&resp).await?;
            return Ok((StatusCode::InternalServerError, 0));
        }
    };

    let len = meta.len();

    let head = ResponseBuilder::new(StatusCode::Ok)
        .header("Content-Type", mime::content_type(&resolved))
        .header("Content-Length", len.to_string())
        .build();
    writer.send_response(&head).await?;

    if req.method == Method::HEAD {
        return Ok((StatusCode::Ok, 0));
    }

    // stream the body in bounded chunks
    let mut sent: u64 = 0;
    let mut chunk = vec![0u8; chunk_size];

    while sent < len {
        let n = file
            .read(&mut chunk)
            .await
            .context("Failed reading file body")?;

        if n == 0 {
            bail!(
                "file {} truncated at {sent} of {len} bytes",
                resolved.display()
            );
        }

        writer.send_bytes(Bytes::copy_from_slice(&chunk[..n])).await?;
        sent += n as u64;
    }

    Ok((StatusCode::Ok, sent))
}
