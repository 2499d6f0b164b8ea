use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted input line, not counting the delimiter.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

pub fn join_notice(identifier: &str) -> String {
    format!("User [{identifier}] joined")
}

pub fn leave_notice(identifier: &str) -> String {
    format!("User [{identifier}] left")
}

pub fn chat_line(identifier: &str, text: &str) -> String {
    format!("User [{identifier}]: {text}")
}

/// Appends the `\n` delimiter to `content`.
pub fn encode_line(content: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(content.len() + 1);
    frame.extend_from_slice(content.as_bytes());
    frame.push(b'\n');
    frame
}

/// Reads one `\n`-delimited line and strips the delimiter along with a
/// trailing `\r`. A final line without delimiter is still returned; `None`
/// means end of stream. Lines longer than `max_len` bytes fail with
/// `InvalidData`, and invalid UTF-8 is replaced rather than rejected.
pub async fn read_line<R>(reader: &mut R, max_len: usize) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let limit = (max_len as u64).saturating_add(1);
    let bytes = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;
    if bytes == 0 {
        return Ok(None);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if buf.len() > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line exceeds {max_len} bytes"),
        ));
    }

    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

pub async fn write_line<W>(writer: &mut W, content: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_line(content)).await?;
    writer.flush().await
}
