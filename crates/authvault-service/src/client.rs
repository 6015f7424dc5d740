use std::net::SocketAddr;

use anyhow::{anyhow, Result};
use authvault_core::protocol::{ApiRequest, ApiResponse, Envelope, RequestEnvelope};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Line-protocol client, one request in flight at a time.
pub struct BundleClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: u64,
}

impl BundleClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer,
            next_id: 1,
        })
    }

    pub async fn send(&mut self, request: ApiRequest) -> Result<ApiResponse> {
        let id = self.next_id;
        self.next_id += 1;
        let envelope = Envelope::Request(RequestEnvelope { id, request });
        self.writer
            .write_all(serde_json::to_string(&envelope)?.as_bytes())
            .await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(anyhow!("server closed connection"));
        }
        match serde_json::from_str(line.trim_end())? {
            Envelope::Response(resp) if resp.id == id => Ok(resp.response),
            Envelope::Response(resp) => Err(anyhow!("response id {} != request id {id}", resp.id)),
            Envelope::Error { message } => Err(anyhow!(message)),
            Envelope::Request(_) => Err(anyhow!("unexpected request from server")),
        }
    }
}
