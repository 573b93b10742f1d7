// ABOUTME: Wire protocol between providers and the in-sandbox execution kernel
// ABOUTME: JSON-lines requests on stdin, JSON-lines frames on stdout, one cell in flight at a time

use crate::providers::{CellRequest, CompletionStatus, ExecFrame, FrameStream, ProviderError, Result};
use branchlab_core::{DisplayData, ExecutionError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

pub const KERNEL_SOURCE: &str = include_str!("../kernel/kernel.py");
pub const KERNEL_FILE: &str = "kernel.py";

/// Write the kernel script into `kernel_dir`, replacing any stale copy.
pub async fn install_kernel(kernel_dir: &Path) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(kernel_dir).await?;
    let path = kernel_dir.join(KERNEL_FILE);
    tokio::fs::write(&path, KERNEL_SOURCE).await?;
    Ok(path)
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum KernelRequest<'a> {
    Execute { msg_id: &'a str, code: &'a str },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelFrame {
    Stream {
        #[serde(default)]
        msg_id: Option<String>,
        name: String,
        text: String,
    },
    Display {
        #[serde(default)]
        msg_id: Option<String>,
        data: Map<String, Value>,
    },
    Error {
        #[serde(default)]
        msg_id: Option<String>,
        ename: String,
        #[serde(default)]
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
    Status {
        #[serde(default)]
        msg_id: Option<String>,
        state: String,
        #[serde(default)]
        status: Option<String>,
    },
}

impl KernelFrame {
    /// Parse one stdout line. Anything that is not a protocol frame is treated as raw stdout,
    /// which happens when native code writes straight to the file descriptor.
    pub fn parse_line(line: &str) -> Option<KernelFrame> {
        if line.trim().is_empty() {
            return None;
        }
        match serde_json::from_str::<KernelFrame>(line) {
            Ok(frame) => Some(frame),
            Err(_) => Some(KernelFrame::Stream {
                msg_id: None,
                name: "stdout".to_string(),
                text: format!("{}\n", line),
            }),
        }
    }

    pub fn msg_id(&self) -> Option<&str> {
        match self {
            KernelFrame::Stream { msg_id, .. }
            | KernelFrame::Display { msg_id, .. }
            | KernelFrame::Error { msg_id, .. }
            | KernelFrame::Status { msg_id, .. } => msg_id.as_deref(),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, KernelFrame::Status { state, .. } if state == "ready")
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, KernelFrame::Status { state, .. } if state == "idle")
    }

    pub fn into_exec_frame(self) -> Option<ExecFrame> {
        match self {
            KernelFrame::Stream { name, text, .. } if name == "stderr" => {
                Some(ExecFrame::Stderr(text))
            }
            KernelFrame::Stream { text, .. } => Some(ExecFrame::Stdout(text)),
            KernelFrame::Display { data, .. } => {
                let display = DisplayData::from_mime_bundle(&data);
                (!display.is_empty()).then_some(ExecFrame::Display(display))
            }
            KernelFrame::Error {
                ename,
                evalue,
                traceback,
                ..
            } => Some(ExecFrame::Error(ExecutionError {
                kind: ename,
                message: evalue,
                trace: traceback,
            })),
            KernelFrame::Status { state, status, .. } if state == "idle" => {
                let completion = match status.as_deref() {
                    Some("error") => CompletionStatus::Error,
                    Some("interrupted") => CompletionStatus::Interrupted,
                    _ => CompletionStatus::Ok,
                };
                Some(ExecFrame::Complete(completion))
            }
            KernelFrame::Status { .. } => None,
        }
    }
}

/// Splits a byte stream into lines across arbitrary chunk boundaries.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            lines.push(text.trim_end_matches('\r').to_string());
        }
        lines
    }

    /// Remaining partial line, if any
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.buffer).to_string();
        self.buffer.clear();
        Some(rest)
    }
}

pub type KernelInput = Pin<Box<dyn AsyncWrite + Send>>;

/// Request/response channel to one running kernel.
///
/// The frame receiver is held by whichever cell is in flight until the kernel reports idle
/// for it, so a cell abandoned after a timeout still drains its tail before the next starts.
pub struct KernelChannel {
    input: Mutex<KernelInput>,
    frames: Arc<Mutex<mpsc::UnboundedReceiver<KernelFrame>>>,
}

impl KernelChannel {
    pub fn new(input: KernelInput, frames: mpsc::UnboundedReceiver<KernelFrame>) -> Self {
        Self {
            input: Mutex::new(input),
            frames: Arc::new(Mutex::new(frames)),
        }
    }

    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let mut frames = self.frames.lock().await;
        let wait = async {
            while let Some(frame) = frames.recv().await {
                if frame.is_ready() {
                    return Ok(());
                }
                debug!("Ignoring frame before kernel ready: {:?}", frame);
            }
            Err(ProviderError::KernelError(
                "kernel exited before becoming ready".to_string(),
            ))
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            ProviderError::KernelError(format!("kernel not ready after {:?}", timeout))
        })?
    }

    pub async fn submit(&self, request: CellRequest) -> Result<FrameStream> {
        let mut frames = self.frames.clone().lock_owned().await;
        while let Ok(stale) = frames.try_recv() {
            debug!("Dropping stale kernel frame: {:?}", stale);
        }

        self.send(&KernelRequest::Execute {
            msg_id: &request.msg_id,
            code: &request.code,
        })
        .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let msg_id = request.msg_id;
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                if let Some(id) = frame.msg_id() {
                    if id != msg_id {
                        debug!("Dropping frame for other cell {}", id);
                        continue;
                    }
                }
                let done = frame.is_idle();
                if let Some(exec_frame) = frame.into_exec_frame() {
                    // Receiver may be gone after a timeout; keep draining regardless
                    let _ = tx.send(exec_frame);
                }
                if done {
                    return;
                }
            }
            warn!("Kernel output closed while cell {} was running", msg_id);
        });

        Ok(FrameStream { receiver: rx })
    }

    /// Ask the kernel loop to exit. Errors are ignored; the process is torn down afterwards anyway.
    pub async fn shutdown(&self) {
        if let Err(e) = self.send(&KernelRequest::Shutdown).await {
            debug!("Kernel shutdown request not delivered: {}", e);
        }
    }

    async fn send(&self, request: &KernelRequest<'_>) -> Result<()> {
        let mut line = serde_json::to_string(request)
            .map_err(|e| ProviderError::InternalError(e.to_string()))?;
        line.push('\n');

        let mut input = self.input.lock().await;
        input
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ProviderError::KernelError(format!("kernel input closed: {}", e)))?;
        input
            .flush()
            .await
            .map_err(|e| ProviderError::KernelError(format!("kernel input closed: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[test]
    fn test_line_decoder_handles_split_chunks() {
        let mut decoder = LineDecoder::default();
        assert!(decoder.push(b"{\"type\":").is_empty());
        let lines = decoder.push(b"\"status\"}\r\nsecond\npar");
        assert_eq!(lines, vec!["{\"type\":\"status\"}", "second"]);
        assert_eq!(decoder.finish().as_deref(), Some("par"));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_parse_error_frame() {
        let line = r#"{"type":"error","msg_id":"m1","ename":"ZeroDivisionError","evalue":"division by zero","traceback":["Traceback","  line 1"]}"#;
        let frame = KernelFrame::parse_line(line).unwrap();
        assert_eq!(frame.msg_id(), Some("m1"));
        assert_eq!(
            frame.into_exec_frame(),
            Some(ExecFrame::Error(ExecutionError {
                kind: "ZeroDivisionError".into(),
                message: "division by zero".into(),
                trace: vec!["Traceback".into(), "  line 1".into()],
            }))
        );
    }

    #[test]
    fn test_non_protocol_line_becomes_stdout() {
        let frame = KernelFrame::parse_line("raw output from C").unwrap();
        assert_eq!(frame.msg_id(), None);
        assert_eq!(
            frame.into_exec_frame(),
            Some(ExecFrame::Stdout("raw output from C\n".into()))
        );
        assert!(KernelFrame::parse_line("   ").is_none());
    }

    #[test]
    fn test_status_frames() {
        let ready = KernelFrame::parse_line(r#"{"type":"status","msg_id":null,"state":"ready"}"#)
            .unwrap();
        assert!(ready.is_ready());
        assert_eq!(ready.into_exec_frame(), None);

        let idle = KernelFrame::parse_line(
            r#"{"type":"status","msg_id":"m","state":"idle","status":"interrupted"}"#,
        )
        .unwrap();
        assert!(idle.is_idle());
        assert_eq!(
            idle.into_exec_frame(),
            Some(ExecFrame::Complete(CompletionStatus::Interrupted))
        );
    }

    #[test]
    fn test_display_frame_maps_mime_bundle() {
        let line = r#"{"type":"display","msg_id":"m","data":{"text/plain":"<table>","text/html":"<table></table>"}}"#;
        match KernelFrame::parse_line(line).unwrap().into_exec_frame() {
            Some(ExecFrame::Display(display)) => {
                assert_eq!(display.html.as_deref(), Some("<table></table>"));
                assert_eq!(display.text.as_deref(), Some("<table>"));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_submit_routes_frames_for_current_cell() {
        let (client, server) = tokio::io::duplex(4096);
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let channel = KernelChannel::new(Box::pin(client), frame_rx);

        let request = CellRequest::new("print('hi')");
        let msg_id = request.msg_id.clone();
        let mut stream = channel.submit(request).await.unwrap();

        let mut reader = BufReader::new(server);
        let mut sent = String::new();
        reader.read_line(&mut sent).await.unwrap();
        assert!(sent.contains("\"type\":\"execute\""));
        assert!(sent.contains(&msg_id));

        let stale = r#"{"type":"stream","msg_id":"other","name":"stdout","text":"old"}"#.to_string();
        let out = format!(
            r#"{{"type":"stream","msg_id":"{}","name":"stdout","text":"hi\n"}}"#,
            msg_id
        );
        let idle = format!(
            r#"{{"type":"status","msg_id":"{}","state":"idle","status":"ok"}}"#,
            msg_id
        );
        for line in [stale, out, idle] {
            frame_tx.send(KernelFrame::parse_line(&line).unwrap()).unwrap();
        }

        assert_eq!(stream.next().await, Some(ExecFrame::Stdout("hi\n".into())));
        assert_eq!(
            stream.next().await,
            Some(ExecFrame::Complete(CompletionStatus::Ok))
        );
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_wait_ready_fails_when_kernel_exits() {
        let (client, _server) = tokio::io::duplex(64);
        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<KernelFrame>();
        drop(frame_tx);
        let channel = KernelChannel::new(Box::pin(client), frame_rx);
        let err = channel
            .wait_ready(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::KernelError(_)));
    }
}
