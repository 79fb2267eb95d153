//! EDCB-like backend: a length-prefixed binary command protocol over TCP.
//!
//! Grounded on `EDCBTuner.py`'s `SetChInfo`/`SendNwTVIDClose` flow: open a
//! control connection, send a set-channel command carrying a logical tuner
//! id ("NetworkTV id" in the original), poll for a process id, then open a
//! second TCP connection for the TS stream body.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{Backend, OpenOutcome, TsReader};
use crate::error::{CoreError, CoreResult};
use crate::model::ChannelCoordinates;

const CMD_SET_CH: u32 = 1;
const CMD_CLOSE_CH: u32 = 2;

/// Monotonic allocator for the logical tuner id sent as part of
/// `SetChInfo`/`CloseChannel`; starts at the same `500` base as
/// `EDCBTuner`'s `500 + len(instances)` scheme, but never reuses an id once
/// handed out. A `u32` counter does not wrap in practice for a single
/// process's lifetime, so closed sessions simply drop their id rather than
/// returning it to a pool.
#[derive(Clone)]
pub struct EdcbAdapter {
    host_port: String,
    next_logical_id: std::sync::Arc<AtomicU32>,
}

impl EdcbAdapter {
    pub fn new(host_port: String) -> Self {
        Self {
            host_port,
            next_logical_id: std::sync::Arc::new(AtomicU32::new(500)),
        }
    }

    pub(super) async fn try_open(
        &self,
        coordinates: ChannelCoordinates,
    ) -> CoreResult<OpenOutcome> {
        let logical_id = self.next_logical_id.fetch_add(1, Ordering::SeqCst);

        let mut ctrl = TcpStream::connect(&self.host_port)
            .await
            .map_err(|e| CoreError::BackendUnreachable(e.to_string()))?;

        let process_id = send_set_ch(&mut ctrl, coordinates, logical_id).await?;

        let stream_port = stream_port_for(&self.host_port);
        let ts_conn = TcpStream::connect(&stream_port)
            .await
            .map_err(|e| CoreError::BackendUnreachable(e.to_string()))?;

        let session = EdcbSession {
            ctrl: Mutex::new(Some(ctrl)),
            stream: Mutex::new(Some(())),
            host_port: self.host_port.clone(),
            logical_id,
            process_id,
        };
        let reader: TsReader = Box::new(ts_conn);
        Ok((Backend::Edcb(session), reader, logical_id))
    }
}

fn stream_port_for(ctrl_host_port: &str) -> String {
    // The control and stream endpoints share a host; the stream port is the
    // control port + 1, matching EDCB's conventional TCPIP-model layout.
    match ctrl_host_port.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port.parse().unwrap_or(4510);
            format!("{host}:{}", port + 1)
        }
        None => format!("{ctrl_host_port}:4511"),
    }
}

pub struct EdcbSession {
    ctrl: Mutex<Option<TcpStream>>,
    stream: Mutex<Option<()>>,
    host_port: String,
    logical_id: u32,
    #[allow(dead_code)]
    process_id: u32,
}

impl EdcbSession {
    pub async fn disconnect_stream(&self) {
        *self.stream.lock().await = None;
    }

    pub async fn close(&self) {
        let mut ctrl_guard = self.ctrl.lock().await;
        if let Some(mut ctrl) = ctrl_guard.take() {
            if let Err(e) = send_close_ch(&mut ctrl, self.logical_id).await {
                warn!(error = %e, "CloseChannel failed, closing socket anyway");
            }
            let _ = ctrl.shutdown().await;
        }
    }
}

/// Sends `SetChInfo` and polls for a process id, retrying up to 5 s at
/// 500 ms intervals, per `EDCBTuner.open()`.
async fn send_set_ch(
    ctrl: &mut TcpStream,
    coordinates: ChannelCoordinates,
    logical_id: u32,
) -> CoreResult<u32> {
    let mut body = BytesMut::with_capacity(16);
    body.put_u16(coordinates.network_id);
    body.put_u16(coordinates.transport_stream_id);
    body.put_u16(coordinates.service_id);
    body.put_u32(logical_id);

    write_frame(ctrl, CMD_SET_CH, &body)
        .await
        .map_err(|e| CoreError::BackendUnreachable(e.to_string()))?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match read_frame(ctrl).await {
            Ok(mut resp) if resp.remaining() >= 4 => {
                let process_id = resp.get_u32();
                if process_id != 0 {
                    return Ok(process_id);
                }
            }
            Ok(_) => {}
            Err(e) => return Err(CoreError::BackendUnreachable(e.to_string())),
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(CoreError::NoTunerAvailable);
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

async fn send_close_ch(ctrl: &mut TcpStream, logical_id: u32) -> io::Result<()> {
    let mut body = BytesMut::with_capacity(4);
    body.put_u32(logical_id);
    write_frame(ctrl, CMD_CLOSE_CH, &body).await
}

async fn write_frame(ctrl: &mut TcpStream, cmd: u32, body: &[u8]) -> io::Result<()> {
    let mut frame = BytesMut::with_capacity(8 + body.len());
    frame.put_u32(cmd);
    frame.put_u32(body.len() as u32);
    frame.extend_from_slice(body);
    ctrl.write_all(&frame).await?;
    debug!(cmd, len = body.len(), "sent EDCB command frame");
    Ok(())
}

async fn read_frame(ctrl: &mut TcpStream) -> io::Result<BytesMut> {
    let mut header = [0u8; 8];
    ctrl.read_exact(&mut header).await?;
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    let mut body = BytesMut::zeroed(len);
    ctrl.read_exact(&mut body).await?;
    Ok(body)
}
