//! Primitive codec for the framed binary channel.
//!
//! All integers are big-endian. Byte arrays and strings carry an `i32`
//! length prefix, with `-1` meaning "absent". Record identities are encoded
//! as a bucket id (`i32`) followed by a position (`i64`).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::DriverError;
use crate::record::RecordId;

/// Maximum length accepted for a single byte-array field (16 MB).
pub const MAX_FIELD_SIZE: usize = 16 * 1024 * 1024;

pub async fn write_u8<W: AsyncWrite + Unpin>(w: &mut W, v: u8) -> Result<(), DriverError> {
    w.write_u8(v).await?;
    Ok(())
}

pub async fn read_u8<R: AsyncRead + Unpin>(r: &mut R) -> Result<u8, DriverError> {
    Ok(r.read_u8().await?)
}

pub async fn write_i16<W: AsyncWrite + Unpin>(w: &mut W, v: i16) -> Result<(), DriverError> {
    w.write_i16(v).await?;
    Ok(())
}

pub async fn read_i16<R: AsyncRead + Unpin>(r: &mut R) -> Result<i16, DriverError> {
    Ok(r.read_i16().await?)
}

pub async fn write_i32<W: AsyncWrite + Unpin>(w: &mut W, v: i32) -> Result<(), DriverError> {
    w.write_i32(v).await?;
    Ok(())
}

pub async fn read_i32<R: AsyncRead + Unpin>(r: &mut R) -> Result<i32, DriverError> {
    Ok(r.read_i32().await?)
}

pub async fn write_i64<W: AsyncWrite + Unpin>(w: &mut W, v: i64) -> Result<(), DriverError> {
    w.write_i64(v).await?;
    Ok(())
}

pub async fn read_i64<R: AsyncRead + Unpin>(r: &mut R) -> Result<i64, DriverError> {
    Ok(r.read_i64().await?)
}

pub async fn write_bool<W: AsyncWrite + Unpin>(w: &mut W, v: bool) -> Result<(), DriverError> {
    w.write_u8(v as u8).await?;
    Ok(())
}

pub async fn read_bool<R: AsyncRead + Unpin>(r: &mut R) -> Result<bool, DriverError> {
    Ok(r.read_u8().await? != 0)
}

pub async fn write_opt_bytes<W: AsyncWrite + Unpin>(
    w: &mut W,
    v: Option<&[u8]>,
) -> Result<(), DriverError> {
    match v {
        None => w.write_i32(-1).await?,
        Some(bytes) => {
            w.write_i32(bytes.len() as i32).await?;
            w.write_all(bytes).await?;
        }
    }
    Ok(())
}

pub async fn read_opt_bytes<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<Option<Vec<u8>>, DriverError> {
    let len = r.read_i32().await?;
    if len == -1 {
        return Ok(None);
    }
    if len < 0 || len as usize > MAX_FIELD_SIZE {
        return Err(DriverError::Protocol(format!(
            "invalid field length on the wire: {len}"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

pub async fn write_bytes<W: AsyncWrite + Unpin>(w: &mut W, v: &[u8]) -> Result<(), DriverError> {
    write_opt_bytes(w, Some(v)).await
}

pub async fn read_bytes<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, DriverError> {
    read_opt_bytes(r)
        .await?
        .ok_or_else(|| DriverError::Protocol("unexpected absent field on the wire".to_string()))
}

pub async fn write_opt_string<W: AsyncWrite + Unpin>(
    w: &mut W,
    v: Option<&str>,
) -> Result<(), DriverError> {
    write_opt_bytes(w, v.map(str::as_bytes)).await
}

pub async fn read_opt_string<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<Option<String>, DriverError> {
    match read_opt_bytes(r).await? {
        None => Ok(None),
        Some(bytes) => String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| DriverError::Protocol(format!("invalid UTF-8 string on the wire: {e}"))),
    }
}

pub async fn write_string<W: AsyncWrite + Unpin>(w: &mut W, v: &str) -> Result<(), DriverError> {
    write_opt_string(w, Some(v)).await
}

pub async fn read_string<R: AsyncRead + Unpin>(r: &mut R) -> Result<String, DriverError> {
    read_opt_string(r)
        .await?
        .ok_or_else(|| DriverError::Protocol("unexpected absent string on the wire".to_string()))
}

pub async fn write_rid<W: AsyncWrite + Unpin>(w: &mut W, rid: RecordId) -> Result<(), DriverError> {
    w.write_i32(rid.bucket).await?;
    w.write_i64(rid.position).await?;
    Ok(())
}

pub async fn read_rid<R: AsyncRead + Unpin>(r: &mut R) -> Result<RecordId, DriverError> {
    let bucket = r.read_i32().await?;
    let position = r.read_i64().await?;
    Ok(RecordId { bucket, position })
}
