//! Minecraft MOTD probe
//!
//! After a Minecraft tunnel activates, the public endpoint is probed a few
//! times on a widening schedule. The first successful status ping produces a
//! group notification with the MOTD and player counts; if every attempt fails
//! the group hears that instead. Probes are cancelable per tunnel (CloseProxy)
//! and globally (shutdown).

use anyhow::{anyhow, Result};
use bytes::{Buf, BufMut, BytesMut};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::core::state::Notifier;
use crate::logger::log;

/// Probe offsets measured from activation.
pub const PROBE_DELAYS: [Duration; 5] = [
    Duration::from_secs(15),
    Duration::from_secs(60),
    Duration::from_secs(180),
    Duration::from_secs(300),
    Duration::from_secs(600),
];

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_STATUS_LEN: usize = 256 * 1024;

/// Result of a successful server-list ping.
#[derive(Debug, Clone, PartialEq)]
pub struct MotdInfo {
    pub motd: String,
    pub online: i64,
    pub max: i64,
    pub version: String,
}

pub struct MotdProbe {
    notifier: Arc<dyn Notifier>,
    probes: Arc<DashMap<String, Arc<CancellationToken>>>,
}

impl MotdProbe {
    /// The notifier is injected at construction so this module never needs to
    /// know about the bot transport.
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            notifier,
            probes: Arc::new(DashMap::new()),
        }
    }

    /// Schedule the probe sequence for a freshly activated tunnel. Replaces
    /// any earlier sequence for the same tunnel id.
    pub fn schedule(
        &self,
        tunnel_id: String,
        group_id: Option<String>,
        addr: String,
        port: u16,
    ) {
        let cancel = Arc::new(CancellationToken::new());
        if let Some(old) = self.probes.insert(tunnel_id.clone(), Arc::clone(&cancel)) {
            old.cancel();
        }

        let notifier = Arc::clone(&self.notifier);
        let probes = Arc::clone(&self.probes);
        tokio::spawn(async move {
            run_sequence(&notifier, &tunnel_id, group_id.as_deref(), &addr, port, &cancel)
                .await;
            // remove only our own token, a newer schedule may have replaced it
            probes.remove_if(&tunnel_id, |_, token| Arc::ptr_eq(token, &cancel));
        });
    }

    /// Cancel the pending sequence for one tunnel, if any.
    pub fn cancel(&self, tunnel_id: &str) {
        if let Some((_, token)) = self.probes.remove(tunnel_id) {
            token.cancel();
        }
    }

    /// Cancel every pending sequence (shutdown).
    pub fn cancel_all(&self) {
        for entry in self.probes.iter() {
            entry.value().cancel();
        }
        self.probes.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.probes.len()
    }
}

async fn run_sequence(
    notifier: &Arc<dyn Notifier>,
    tunnel_id: &str,
    group_id: Option<&str>,
    addr: &str,
    port: u16,
    cancel: &CancellationToken,
) {
    let mut elapsed = Duration::ZERO;
    for (attempt, offset) in PROBE_DELAYS.iter().enumerate() {
        let wait = offset.saturating_sub(elapsed);
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = cancel.cancelled() => return,
        }
        elapsed = *offset;

        match query(addr, port, PROBE_TIMEOUT).await {
            Ok(info) => {
                log::info!(tunnel = tunnel_id, attempt = attempt + 1, "MOTD probe succeeded");
                if let Some(group_id) = group_id {
                    let text = format!(
                        "隧道 {} 的 Minecraft 服务器已上线: {} ({}/{} 在线, {})",
                        tunnel_id, info.motd, info.online, info.max, info.version
                    );
                    notifier.group_message(group_id, &text).await;
                }
                return;
            }
            Err(e) => {
                log::debug!(
                    tunnel = tunnel_id,
                    attempt = attempt + 1,
                    error = %e,
                    "MOTD probe failed"
                );
            }
        }
    }

    if let Some(group_id) = group_id {
        let text = format!(
            "隧道 {} 的 Minecraft 服务器始终未响应状态查询，请检查本地服务是否已启动",
            tunnel_id
        );
        notifier.group_message(group_id, &text).await;
    }
}

/// One server-list-ping exchange against `(addr, port)`.
pub async fn query(addr: &str, port: u16, timeout: Duration) -> Result<MotdInfo> {
    let exchange = async {
        let mut stream = TcpStream::connect((addr, port)).await?;

        // handshake: protocol=-1 (status), then the status request
        let mut handshake = BytesMut::new();
        handshake.put_u8(0x00);
        put_varint(&mut handshake, -1);
        put_varint(&mut handshake, addr.len() as i32);
        handshake.put_slice(addr.as_bytes());
        handshake.put_u16(port);
        put_varint(&mut handshake, 1);
        write_frame(&mut stream, &handshake).await?;

        write_frame(&mut stream, &[0x00]).await?;

        let frame = read_frame(&mut stream).await?;
        parse_status(&frame)
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| anyhow!("status query timed out"))?
}

async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> Result<()> {
    let mut out = BytesMut::new();
    put_varint(&mut out, payload.len() as i32);
    out.put_slice(payload);
    stream.write_all(&out).await?;
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let len = read_varint(stream).await?;
    if len <= 0 || len as usize > MAX_STATUS_LEN {
        return Err(anyhow!("bad frame length {}", len));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

fn put_varint(buf: &mut BytesMut, value: i32) {
    let mut v = value as u32;
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if v == 0 {
            break;
        }
    }
}

async fn read_varint(stream: &mut TcpStream) -> Result<i32> {
    let mut value: u32 = 0;
    for shift in 0..5 {
        let byte = stream.read_u8().await?;
        value |= ((byte & 0x7f) as u32) << (7 * shift);
        if byte & 0x80 == 0 {
            return Ok(value as i32);
        }
    }
    Err(anyhow!("varint too long"))
}

fn get_varint(buf: &mut impl Buf) -> Result<i32> {
    let mut value: u32 = 0;
    for shift in 0..5 {
        if !buf.has_remaining() {
            return Err(anyhow!("varint truncated"));
        }
        let byte = buf.get_u8();
        value |= ((byte & 0x7f) as u32) << (7 * shift);
        if byte & 0x80 == 0 {
            return Ok(value as i32);
        }
    }
    Err(anyhow!("varint too long"))
}

/// Parse the status response frame: packet id 0x00, then a varint-prefixed
/// JSON document.
fn parse_status(frame: &[u8]) -> Result<MotdInfo> {
    let mut buf = frame;
    let packet_id = get_varint(&mut buf)?;
    if packet_id != 0x00 {
        return Err(anyhow!("unexpected packet id {}", packet_id));
    }
    let json_len = get_varint(&mut buf)? as usize;
    if buf.remaining() < json_len {
        return Err(anyhow!("status JSON truncated"));
    }
    let json: Value = serde_json::from_slice(&buf[..json_len])?;

    // description is either a plain string or a chat object
    let motd = match json.get("description") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(obj)) => obj
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    };
    let online = json
        .pointer("/players/online")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let max = json
        .pointer("/players/max")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let version = json
        .pointer("/version/name")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    Ok(MotdInfo {
        motd,
        online,
        max,
        version,
    })
}
