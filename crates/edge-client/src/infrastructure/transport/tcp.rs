//! Reference transport: JSON lines over TCP.
//!
//! Stands in for the secure-tunnel SDK on a trusted LAN.  Every message is one
//! JSON object followed by `\n`, tagged by `type`:
//!
//! ```text
//! client                                   device
//!   │ ── pair_request{password|sct} ──────►  │
//!   │ ◄── pair_accepted{sct} / pair_rejected │      (connection closed)
//!
//!   │ ── connect{sct} ────────────────────►  │
//!   │ ◄── connect_accepted / connect_rejected│
//!   │ ◄──────────── control{body} ─────────► │      (either direction)
//!   │ ── close ───────────────────────────►  │
//! ```
//!
//! There is no encryption here; the real SDK provides it.  The frames exist so
//! the binary can talk to a simple device simulator.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edge_core::DeviceKey;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::transport::{
    AddressResolver, ClientIdentity, PairingCredential, PairingOutcome, PairingTarget,
    PairingTransport, SessionTarget, SessionTransport, TransportError, TransportSession,
};

/// Bound on a single request/reply exchange.
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// One line on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    PairRequest {
        product_id: String,
        device_id: String,
        client_fingerprint: String,
        client_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sct: Option<String>,
    },
    PairAccepted {
        sct: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_name: Option<String>,
    },
    PairRejected {
        reason: String,
    },
    Connect {
        product_id: String,
        device_id: String,
        client_fingerprint: String,
        sct: String,
    },
    ConnectAccepted,
    ConnectRejected {
        reason: String,
    },
    Control {
        body: String,
    },
    Close,
}

/// Encodes `frame` as one line, including the trailing newline.
pub fn encode_frame(frame: &Frame) -> Result<String, TransportError> {
    let mut line =
        serde_json::to_string(frame).map_err(|e| TransportError::Protocol(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

pub fn decode_frame(line: &str) -> Result<Frame, TransportError> {
    serde_json::from_str(line.trim_end())
        .map_err(|e| TransportError::Protocol(format!("malformed frame: {e}")))
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<(), TransportError> {
    let line = encode_frame(frame)?;
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|_| TransportError::Closed)?;
    writer.flush().await.map_err(|_| TransportError::Closed)
}

async fn read_frame(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> Result<Frame, TransportError> {
    match tokio::time::timeout(REPLY_TIMEOUT, lines.next_line()).await {
        Err(_) => Err(TransportError::Unreachable("device did not answer".to_string())),
        Ok(Err(e)) => Err(TransportError::Unreachable(e.to_string())),
        Ok(Ok(None)) => Err(TransportError::Closed),
        Ok(Ok(Some(line))) => decode_frame(&line),
    }
}

async fn dial(address: SocketAddr) -> Result<(Lines<BufReader<OwnedReadHalf>>, OwnedWriteHalf), TransportError> {
    let stream = TcpStream::connect(address)
        .await
        .map_err(|e| TransportError::Unreachable(format!("{address}: {e}")))?;
    stream.set_nodelay(true).ok();
    let (read, write) = stream.into_split();
    Ok((BufReader::new(read).lines(), write))
}

/// JSON-lines-over-TCP implementation of both transport seams.
pub struct TcpTransport {
    resolver: Arc<dyn AddressResolver>,
}

impl TcpTransport {
    /// `resolver` locates paired devices when opening sessions.
    pub fn new(resolver: Arc<dyn AddressResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl PairingTransport for TcpTransport {
    async fn pair(
        &self,
        target: &PairingTarget,
        identity: &ClientIdentity,
    ) -> Result<PairingOutcome, TransportError> {
        let (mut lines, mut writer) = dial(target.address).await?;
        let (password, sct) = match &target.credential {
            PairingCredential::Password(p) => (Some(p.clone()), None),
            PairingCredential::Sct(s) => (None, Some(s.clone())),
        };
        write_frame(
            &mut writer,
            &Frame::PairRequest {
                product_id: target.key.product_id.clone(),
                device_id: target.key.device_id.clone(),
                client_fingerprint: identity.fingerprint.clone(),
                client_name: identity.display_name.clone(),
                password,
                sct,
            },
        )
        .await?;

        let reply = read_frame(&mut lines).await;
        writer.shutdown().await.ok();
        match reply? {
            Frame::PairAccepted { sct, device_name } => Ok(PairingOutcome { sct, device_name }),
            Frame::PairRejected { reason } => Err(TransportError::Rejected(reason)),
            other => Err(TransportError::Protocol(format!(
                "expected a pairing reply, got {other:?}"
            ))),
        }
    }
}

#[async_trait]
impl SessionTransport for TcpTransport {
    async fn open(
        &self,
        target: &SessionTarget,
        identity: &ClientIdentity,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        let address = self
            .resolver
            .resolve(&target.key)
            .map(|device| device.address)
            .ok_or_else(|| {
                TransportError::Unreachable(format!(
                    "{} has not been seen on the local network",
                    target.key
                ))
            })?;

        let (mut lines, mut writer) = dial(address).await?;
        write_frame(
            &mut writer,
            &Frame::Connect {
                product_id: target.key.product_id.clone(),
                device_id: target.key.device_id.clone(),
                client_fingerprint: identity.fingerprint.clone(),
                sct: target.sct.clone(),
            },
        )
        .await?;

        match read_frame(&mut lines).await? {
            Frame::ConnectAccepted => {
                info!("{}: session established with {address}", target.key);
                Ok(Arc::new(TcpSession::start(target.key.clone(), lines, writer)))
            }
            Frame::ConnectRejected { reason } => Err(TransportError::Rejected(reason)),
            other => Err(TransportError::Protocol(format!(
                "expected a connect reply, got {other:?}"
            ))),
        }
    }
}

/// One established TCP session.
pub struct TcpSession {
    key: DeviceKey,
    writer: Mutex<Option<OwnedWriteHalf>>,
    link: CancellationToken,
    reader: JoinHandle<()>,
}

impl TcpSession {
    fn start(key: DeviceKey, lines: Lines<BufReader<OwnedReadHalf>>, writer: OwnedWriteHalf) -> Self {
        let link = CancellationToken::new();
        let reader = tokio::spawn(read_loop(key.clone(), lines, link.clone()));
        Self {
            key,
            writer: Mutex::new(Some(writer)),
            link,
            reader,
        }
    }
}

/// Drains frames sent by the device until it closes the link.
async fn read_loop(key: DeviceKey, mut lines: Lines<BufReader<OwnedReadHalf>>, link: CancellationToken) {
    loop {
        let line = tokio::select! {
            _ = link.cancelled() => return,
            line = lines.next_line() => line,
        };
        match line.map(|l| l.map(|l| decode_frame(&l))) {
            Ok(Some(Ok(Frame::Control { body }))) => debug!("{key}: control from device: {body}"),
            Ok(Some(Ok(Frame::Close))) | Ok(None) => {
                debug!("{key}: device closed the session");
                break;
            }
            Ok(Some(Ok(other))) => debug!("{key}: ignoring unexpected frame {other:?}"),
            Ok(Some(Err(e))) => warn!("{key}: {e}"),
            Err(e) => {
                warn!("{key}: session read failed: {e}");
                break;
            }
        }
    }
    link.cancel();
}

#[async_trait]
impl TransportSession for TcpSession {
    async fn send(&self, body: &str) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut().filter(|_| !self.link.is_cancelled()) else {
            return Err(TransportError::Closed);
        };
        let result = write_frame(
            stream,
            &Frame::Control {
                body: body.to_string(),
            },
        )
        .await;
        if result.is_err() {
            self.link.cancel();
        }
        result
    }

    async fn closed(&self) {
        self.link.cancelled().await;
    }

    async fn close(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut stream) = writer {
            if !self.link.is_cancelled() {
                write_frame(&mut stream, &Frame::Close).await.ok();
            }
            stream.shutdown().await.ok();
            debug!("{}: session closed", self.key);
        }
        self.link.cancel();
        self.reader.abort();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
