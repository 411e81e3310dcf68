//! CDP Transport Layer
//!
//! Talks to Chrome over a minimal WebSocket client. A reader thread routes
//! responses to waiting callers by id; every command is bounded by the
//! transport's command timeout.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};

use crate::error::{Error, Result};

/// Error object Chrome attached to a response
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    pub code: i64,
    pub message: String,
}

/// A pending request waiting for a response
type PendingRequest = oneshot::Sender<std::result::Result<Value, Fault>>;

type PendingMap = Arc<Mutex<HashMap<u64, PendingRequest>>>;

/// WebSocket opcodes
mod ws {
    pub const OPCODE_TEXT: u8 = 0x1;
    pub const OPCODE_CLOSE: u8 = 0x8;
    pub const OPCODE_PING: u8 = 0x9;
    pub const OPCODE_PONG: u8 = 0xA;
}

/// Encode a masked client frame
pub(crate) fn encode_frame(opcode: u8, data: &[u8]) -> Vec<u8> {
    let len = data.len();
    let mut frame = Vec::with_capacity(14 + len);

    // FIN + opcode
    frame.push(0x80 | opcode);

    // Mask bit set (client must mask), then length
    if len < 126 {
        frame.push(0x80 | len as u8);
    } else if len < 65536 {
        frame.push(0x80 | 126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(0x80 | 127);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }

    // Random masking key per frame (RFC 6455)
    let mask: [u8; 4] = rand::random();
    frame.extend_from_slice(&mask);
    frame.extend(data.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    frame
}

/// Read one frame, returns (opcode, payload)
pub(crate) fn read_frame<R: Read>(stream: &mut R) -> std::io::Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header)?;

    let opcode = header[0] & 0x0F;
    let masked = (header[1] & 0x80) != 0;
    let mut len = (header[1] & 0x7F) as usize;

    if len == 126 {
        let mut ext = [0u8; 2];
        stream.read_exact(&mut ext)?;
        len = u16::from_be_bytes(ext) as usize;
    } else if len == 127 {
        let mut ext = [0u8; 8];
        stream.read_exact(&mut ext)?;
        len = u64::from_be_bytes(ext) as usize;
    }

    let mask = if masked {
        let mut m = [0u8; 4];
        stream.read_exact(&mut m)?;
        Some(m)
    } else {
        None
    };

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;

    if let Some(mask) = mask {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }
    }

    Ok((opcode, payload))
}

/// What a text frame carried
#[derive(Debug, PartialEq)]
pub(crate) enum Incoming {
    Response {
        id: u64,
        result: std::result::Result<Value, Fault>,
    },
    Event {
        method: String,
    },
}

/// Classify a CDP message. `None` for anything unparseable.
pub(crate) fn parse_message(text: &str) -> Option<Incoming> {
    let msg: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("Failed to parse CDP message: {}", e);
            return None;
        }
    };

    if let Some(id) = msg.get("id").and_then(|v| v.as_u64()) {
        let result = match msg.get("error") {
            Some(error) => Err(Fault {
                code: error.get("code").and_then(|c| c.as_i64()).unwrap_or(-1),
                message: error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown")
                    .to_string(),
            }),
            None => Ok(msg.get("result").cloned().unwrap_or(json!({}))),
        };
        return Some(Incoming::Response { id, result });
    }

    msg.get("method")
        .and_then(|m| m.as_str())
        .map(|method| Incoming::Event {
            method: method.to_string(),
        })
}

/// CDP Transport - sends commands and routes responses
pub struct Transport {
    /// The Chrome child process
    child: Mutex<Child>,
    /// WebSocket stream for writing
    writer: Mutex<TcpStream>,
    /// Next message ID
    next_id: AtomicU64,
    /// Requests waiting for responses
    pending: PendingMap,
    /// Set once the reader loop ends
    closed: Arc<AtomicBool>,
    /// Upper bound for a single command
    command_timeout: Duration,
}

impl Transport {
    /// Connect to Chrome's DevTools WebSocket
    pub fn new(child: Child, ws_url: &str, command_timeout: Duration) -> Result<Self> {
        let url = ws_url.trim_start_matches("ws://");
        let (host_port, path) = url.split_once('/').unwrap_or((url, ""));

        let mut stream = TcpStream::connect(host_port)
            .map_err(|e| Error::transport_io("Failed to connect to Chrome", e))?;

        let key = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            rand::random::<[u8; 16]>(),
        );

        let handshake = format!(
            "GET /{} HTTP/1.1\r\n\
             Host: {}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {}\r\n\
             Sec-WebSocket-Version: 13\r\n\
             \r\n",
            path, host_port, key
        );

        stream
            .write_all(handshake.as_bytes())
            .map_err(|e| Error::transport_io("Handshake write failed", e))?;

        let mut response = [0u8; 1024];
        let n = stream
            .read(&mut response)
            .map_err(|e| Error::transport_io("Handshake read failed", e))?;
        let response_str = String::from_utf8_lossy(&response[..n]);

        if !response_str.contains("101") {
            return Err(Error::transport(format!(
                "WebSocket handshake failed: {}",
                response_str
            )));
        }

        tracing::debug!("WebSocket connected to {}", ws_url);

        let reader_stream = stream
            .try_clone()
            .map_err(|e| Error::transport_io("Failed to clone stream", e))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let pending_clone = Arc::clone(&pending);
        let closed_clone = Arc::clone(&closed);
        std::thread::spawn(move || {
            Self::reader_loop(reader_stream, pending_clone, closed_clone);
        });

        Ok(Self {
            child: Mutex::new(child),
            writer: Mutex::new(stream),
            next_id: AtomicU64::new(1),
            pending,
            closed,
            command_timeout,
        })
    }

    /// Reader loop - runs in a separate thread
    fn reader_loop(mut stream: TcpStream, pending: PendingMap, closed: Arc<AtomicBool>) {
        loop {
            let (opcode, payload) = match read_frame(&mut stream) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!("WebSocket read error: {}", e);
                    break;
                }
            };

            match opcode {
                ws::OPCODE_TEXT => {
                    let Ok(text) = String::from_utf8(payload) else {
                        continue;
                    };
                    match parse_message(&text) {
                        Some(Incoming::Response { id, result }) => {
                            if let Some(sender) = pending.blocking_lock().remove(&id) {
                                let _ = sender.send(result);
                            } else {
                                tracing::trace!("Response for unknown id: {}", id);
                            }
                        }
                        Some(Incoming::Event { method }) => {
                            tracing::trace!("CDP event: {}", method);
                        }
                        None => {}
                    }
                }
                ws::OPCODE_PING => {
                    let _ = stream.write_all(&encode_frame(ws::OPCODE_PONG, &payload));
                }
                ws::OPCODE_CLOSE => {
                    tracing::debug!("WebSocket closed by server");
                    break;
                }
                _ => {}
            }
        }

        closed.store(true, Ordering::SeqCst);
        // Dropping the senders fails every in-flight command
        pending.blocking_lock().clear();
        tracing::debug!("CDP reader loop ended");
    }

    /// Whether the connection to Chrome is gone
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send a browser-level command
    pub async fn send<C, R>(&self, method: &str, params: &C) -> Result<R>
    where
        C: Serialize,
        R: DeserializeOwned,
    {
        self.send_inner(None, method, params).await
    }

    /// Send a command to an attached session
    pub async fn send_to_session<C, R>(
        &self,
        session_id: &str,
        method: &str,
        params: &C,
    ) -> Result<R>
    where
        C: Serialize,
        R: DeserializeOwned,
    {
        self.send_inner(Some(session_id), method, params).await
    }

    async fn send_inner<C, R>(&self, session_id: Option<&str>, method: &str, params: &C) -> Result<R>
    where
        C: Serialize,
        R: DeserializeOwned,
    {
        if self.is_closed() {
            return Err(Error::BrowserClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let mut msg = json!({
            "id": id,
            "method": method,
            "params": serde_json::to_value(params)?
        });
        if let Some(session_id) = session_id {
            msg["sessionId"] = json!(session_id);
        }
        let data = serde_json::to_string(&msg)?;

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.write_all(&encode_frame(ws::OPCODE_TEXT, data.as_bytes())) {
                self.pending.lock().await.remove(&id);
                return Err(Error::transport_io("WebSocket write failed", e));
            }
        }

        tracing::trace!("Sent CDP command: {} (id={}, session={:?})", method, id, session_id);

        let result = match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => return Err(Error::transport("Response channel closed")),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(Error::CommandTimeout {
                    method: method.to_string(),
                    timeout: self.command_timeout,
                });
            }
        };

        let value = result.map_err(|fault| Error::cdp(method, fault.code, fault.message))?;
        Ok(serde_json::from_value(value)?)
    }

    /// Close the socket and kill Chrome
    pub async fn close(&self) -> Result<()> {
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.write_all(&encode_frame(ws::OPCODE_CLOSE, &[]));
        }

        let mut child = self.child.lock().await;
        let _ = child.kill();
        let _ = child.wait();
        Ok(())
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Ok(mut child) = self.child.try_lock() {
            let _ = child.kill();
        }
    }
}

/// Launch Chrome and read the DevTools WebSocket URL from its stderr.
///
/// Blocking; call from `spawn_blocking`. Chrome that prints no URL within
/// `timeout` is killed.
pub fn launch_chrome(path: &Path, args: &[String], timeout: Duration) -> Result<(Child, String)> {
    let mut child = Command::new(path)
        .args(args)
        .arg("--remote-debugging-port=0")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Launch(format!("Failed to spawn {}: {}", path.display(), e)))?;

    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Launch("No stderr from Chrome".into()))?;

    // Chrome prints: DevTools listening on ws://127.0.0.1:PORT/devtools/browser/GUID
    // The reader keeps draining afterwards so Chrome never blocks on a full pipe.
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut tx = Some(tx);
        for line in BufReader::new(stderr).lines().map_while(std::result::Result::ok) {
            tracing::trace!("Chrome stderr: {}", line);
            if let Some(url) = devtools_url(&line) {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(url.to_string());
                }
            }
        }
    });

    let ws_url = match rx.recv_timeout(timeout) {
        Ok(url) => url,
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Launch(match e {
                RecvTimeoutError::Timeout => format!(
                    "Chrome printed no DevTools URL within {}ms",
                    timeout.as_millis()
                ),
                RecvTimeoutError::Disconnected => {
                    "Chrome exited without printing a DevTools URL".into()
                }
            }));
        }
    };

    tracing::info!("Chrome DevTools URL: {}", ws_url);
    Ok((child, ws_url))
}

fn devtools_url(line: &str) -> Option<&str> {
    if !line.contains("DevTools listening on") {
        return None;
    }
    line.find("ws://").map(|start| line[start..].trim())
}
