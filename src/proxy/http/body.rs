use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

use crate::{proxy::http::codec::read_line_with_timeout, util::timeout_with_context};

const MAX_CHUNK_LINE_LENGTH: usize = 8192;
const READ_BUFFER: usize = 16 * 1024;

#[derive(Debug, Error)]
#[error("body exceeds configured limit of {limit} bytes")]
pub struct BodyTooLarge {
    pub limit: usize,
}

/// Framing of a message body on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyPlan {
    Empty,
    Fixed(usize),
    Chunked,
    UntilClose,
}

/// Reads a whole body into memory, de-chunking if needed. Each read is bounded by `timeout`;
/// bodies larger than `limit` fail with [`BodyTooLarge`].
pub async fn read_body<S>(
    reader: &mut BufReader<S>,
    plan: BodyPlan,
    timeout: Duration,
    peer: SocketAddr,
    limit: usize,
) -> Result<Bytes>
where
    S: AsyncRead + Unpin,
{
    match plan {
        BodyPlan::Empty => Ok(Bytes::new()),
        BodyPlan::Fixed(length) => {
            if length > limit {
                return Err(BodyTooLarge { limit }.into());
            }
            let mut body = BytesMut::with_capacity(length);
            read_exact_into(reader, &mut body, length, timeout, peer).await?;
            Ok(body.freeze())
        }
        BodyPlan::Chunked => read_chunked_body(reader, timeout, peer, limit).await,
        BodyPlan::UntilClose => read_until_close(reader, timeout, peer, limit).await,
    }
}

async fn read_exact_into<S>(
    reader: &mut BufReader<S>,
    body: &mut BytesMut,
    mut remaining: usize,
    timeout: Duration,
    peer: SocketAddr,
) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = [0u8; READ_BUFFER];
    while remaining > 0 {
        let to_read = remaining.min(buffer.len());
        let read = timeout_with_context(
            timeout,
            reader.read(&mut buffer[..to_read]),
            format!("reading body from {peer}"),
        )
        .await?;
        if read == 0 {
            bail!("unexpected EOF while reading body from {peer}");
        }
        body.extend_from_slice(&buffer[..read]);
        remaining -= read;
    }
    Ok(())
}

async fn read_chunked_body<S>(
    reader: &mut BufReader<S>,
    timeout: Duration,
    peer: SocketAddr,
    limit: usize,
) -> Result<Bytes>
where
    S: AsyncRead + Unpin,
{
    let mut body = BytesMut::new();
    let mut line = String::new();

    loop {
        let size_bytes =
            read_line_with_timeout(reader, &mut line, timeout, peer, MAX_CHUNK_LINE_LENGTH).await?;
        if size_bytes == 0 {
            bail!("unexpected EOF while reading chunk size from {peer}");
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let size_str = trimmed
            .split_once(';')
            .map(|(size, _)| size)
            .unwrap_or(trimmed)
            .trim();
        let chunk_size = usize::from_str_radix(size_str, 16)
            .with_context(|| format!("invalid chunk size '{size_str}'"))?;

        if chunk_size == 0 {
            // Trailers are read and dropped.
            loop {
                let trailer_bytes =
                    read_line_with_timeout(reader, &mut line, timeout, peer, MAX_CHUNK_LINE_LENGTH)
                        .await?;
                if trailer_bytes == 0 {
                    bail!("unexpected EOF while reading chunk trailer from {peer}");
                }
                if line.trim_end_matches(['\r', '\n']).is_empty() {
                    return Ok(body.freeze());
                }
            }
        }

        if body.len().saturating_add(chunk_size) > limit {
            return Err(BodyTooLarge { limit }.into());
        }
        read_exact_into(reader, &mut body, chunk_size, timeout, peer).await?;

        let mut crlf = [0u8; 2];
        timeout_with_context(
            timeout,
            reader.read_exact(&mut crlf),
            format!("reading chunk terminator from {peer}"),
        )
        .await?;
        if &crlf != b"\r\n" {
            bail!("invalid chunk terminator when reading from {peer}");
        }
    }
}

async fn read_until_close<S>(
    reader: &mut BufReader<S>,
    timeout: Duration,
    peer: SocketAddr,
    limit: usize,
) -> Result<Bytes>
where
    S: AsyncRead + Unpin,
{
    let mut body = BytesMut::new();
    let mut buffer = [0u8; READ_BUFFER];
    loop {
        let read = timeout_with_context(
            timeout,
            reader.read(&mut buffer),
            format!("reading body from {peer}"),
        )
        .await?;
        if read == 0 {
            return Ok(body.freeze());
        }
        if body.len().saturating_add(read) > limit {
            return Err(BodyTooLarge { limit }.into());
        }
        body.extend_from_slice(&buffer[..read]);
    }
}
