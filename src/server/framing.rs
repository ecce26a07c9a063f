// Message framing for the IPC surface.
//
// Two wire formats are accepted and auto-detected per connection:
// `Content-Length` framed bodies (LSP-style) and newline-delimited JSON.
// Replies use whichever framing the client spoke first.

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    ContentLength,
    Ndjson,
}

/// Read one message, detecting the framing on first contact. Returns
/// `None` on clean EOF.
pub async fn read_message<R>(
    reader: &mut BufReader<R>,
    framing: &mut Option<Framing>,
) -> Result<Option<Value>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(raw_len) = trimmed.strip_prefix("Content-Length:") {
            *framing = Some(Framing::ContentLength);
            let length: usize = raw_len
                .trim()
                .parse()
                .context("invalid Content-Length header")?;
            // Consume remaining headers up to the blank separator line.
            loop {
                line.clear();
                let n = reader.read_line(&mut line).await?;
                if n == 0 {
                    return Err(anyhow!("EOF inside message headers"));
                }
                if line.trim().is_empty() {
                    break;
                }
            }
            let mut body = vec![0u8; length];
            reader.read_exact(&mut body).await?;
            let value = serde_json::from_slice(&body).context("invalid JSON body")?;
            return Ok(Some(value));
        }

        if framing.is_none() {
            *framing = Some(Framing::Ndjson);
        }
        let value = serde_json::from_str(trimmed).context("invalid JSON line")?;
        return Ok(Some(value));
    }
}

pub async fn write_message<W>(writer: &mut W, framing: Framing, value: &Value) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_string(value)?;
    match framing {
        Framing::ContentLength => {
            let header = format!("Content-Length: {}\r\n\r\n", body.len());
            writer.write_all(header.as_bytes()).await?;
            writer.write_all(body.as_bytes()).await?;
        }
        Framing::Ndjson => {
            writer.write_all(body.as_bytes()).await?;
            writer.write_all(b"\n").await?;
        }
    }
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn ndjson_roundtrip() {
        let input = b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n";
        let mut reader = BufReader::new(&input[..]);
        let mut framing = None;
        let msg = read_message(&mut reader, &mut framing).await.unwrap().unwrap();
        assert_eq!(msg["method"], "ping");
        assert_eq!(framing, Some(Framing::Ndjson));
    }

    #[tokio::test]
    async fn content_length_roundtrip() {
        let body = json!({"jsonrpc": "2.0", "id": 2, "method": "initialize"}).to_string();
        let framed = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);
        let mut reader = BufReader::new(framed.as_bytes());
        let mut framing = None;
        let msg = read_message(&mut reader, &mut framing).await.unwrap().unwrap();
        assert_eq!(msg["method"], "initialize");
        assert_eq!(framing, Some(Framing::ContentLength));
    }

    #[tokio::test]
    async fn write_matches_detected_framing() {
        let mut out: Vec<u8> = Vec::new();
        write_message(&mut out, Framing::ContentLength, &json!({"ok": true}))
            .await
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("Content-Length: "));

        let mut out: Vec<u8> = Vec::new();
        write_message(&mut out, Framing::Ndjson, &json!({"ok": true}))
            .await
            .unwrap();
        assert!(String::from_utf8(out).unwrap().ends_with("}\n"));
    }

    #[tokio::test]
    async fn eof_returns_none() {
        let mut reader = BufReader::new(&b""[..]);
        let mut framing = None;
        assert!(read_message(&mut reader, &mut framing).await.unwrap().is_none());
    }
}
