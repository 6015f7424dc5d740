use std::sync::Arc;

use anyhow::{anyhow, Result};
use authvault_core::protocol::{
    ApiRequest, ApiResponse, Envelope, ResponseEnvelope, PROTOCOL_VERSION,
};
use authvault_core::BundleAccessController;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn, Instrument};

pub const MAX_LINE_BYTES: usize = 64 * 1024;

pub struct BundleServer {
    controller: Arc<BundleAccessController>,
}

impl BundleServer {
    pub fn new(controller: Arc<BundleAccessController>) -> Self {
        Self { controller }
    }

    /// Accept connections until the listener fails. Each connection gets its own task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, "bundle server listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            let conn_id = uuid::Uuid::new_v4();
            let span = tracing::info_span!("conn", id = %conn_id, peer = %peer);
            tokio::spawn(
                async move {
                    if let Err(e) = server.handle_connection(stream).await {
                        warn!(error = %e, "connection error");
                    }
                }
                .instrument(span),
            );
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            // Never buffer more than one byte past the cap.
            let n = (&mut reader)
                .take(MAX_LINE_BYTES as u64 + 1)
                .read_until(b'\n', &mut buf)
                .await?;
            if n == 0 {
                debug!("client closed connection");
                return Ok(());
            }
            if buf.last() == Some(&b'\n') {
                buf.pop();
            }
            if buf.len() > MAX_LINE_BYTES {
                write_envelope(
                    &mut writer,
                    &Envelope::Error {
                        message: "request too large".to_string(),
                    },
                )
                .await?;
                return Err(anyhow!("request line exceeds {MAX_LINE_BYTES} bytes"));
            }
            let reply = match std::str::from_utf8(&buf) {
                Ok(line) if line.trim_end().is_empty() => continue,
                Ok(line) => match serde_json::from_str::<Envelope>(line.trim_end()) {
                    Ok(Envelope::Request(req)) => Envelope::Response(ResponseEnvelope {
                        id: req.id,
                        response: self.dispatch(req.request).await,
                    }),
                    Ok(_) => Envelope::Error {
                        message: "expected Request envelope".to_string(),
                    },
                    Err(e) => Envelope::Error {
                        message: format!("malformed request: {e}"),
                    },
                },
                Err(e) => Envelope::Error {
                    message: format!("request is not valid UTF-8: {e}"),
                },
            };
            write_envelope(&mut writer, &reply).await?;
        }
    }

    pub async fn dispatch(&self, request: ApiRequest) -> ApiResponse {
        match request {
            ApiRequest::Ping => ApiResponse::Pong {
                protocol_version: PROTOCOL_VERSION,
            },
            ApiRequest::CreateBundle(create) => self.controller.create(create).await.into(),
            ApiRequest::LookupBundle(query) => self
                .controller
                .lookup(query.username.as_deref(), query.lookup_key.as_deref())
                .await
                .into(),
        }
    }
}

async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(serde_json::to_string(envelope)?.as_bytes())
        .await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
