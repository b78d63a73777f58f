//! Thin remote display transport.
//!
//! Clients send one JSON-RPC 2.0 request per line. The server answers with
//! length-prefixed messages, `[u32 BE length][u8 kind][payload]`, where kind
//! `J` carries a JSON-RPC response and kind `F` carries a frame:
//! `[u32 BE header length][JSON header][PNG]`.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::actor::SceneHandle;
use crate::error::{Result, ViewerError};
use crate::router::{ActionParseError, FrameSink, RemoteAction};
use crate::scene::Frame;

pub const JSON_MESSAGE: u8 = b'J';
pub const FRAME_MESSAGE: u8 = b'F';

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

/// JSON-RPC 2.0 request structure.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 response structure.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Option<Value>,
}

/// JSON-RPC error structure following specification.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
            id,
        }
    }
}

/// Prefix `payload` with its length and kind byte.
pub fn encode_message(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(payload.len() + 5);
    message.extend_from_slice(&(payload.len() as u32 + 1).to_be_bytes());
    message.push(kind);
    message.extend_from_slice(payload);
    message
}

pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>> {
    let header = serde_json::to_vec(&frame.header())
        .map_err(|err| ViewerError::FatalResource(format!("frame header encoding failed: {err}")))?;
    let png = frame.encode_png()?;

    let mut payload = Vec::with_capacity(4 + header.len() + png.len());
    payload.extend_from_slice(&(header.len() as u32).to_be_bytes());
    payload.extend_from_slice(&header);
    payload.extend_from_slice(&png);
    Ok(encode_message(FRAME_MESSAGE, &payload))
}

fn encode_response(response: &RpcResponse) -> Vec<u8> {
    // RpcResponse holds only JSON values and strings.
    let payload = serde_json::to_vec(response).unwrap_or_default();
    encode_message(JSON_MESSAGE, &payload)
}

type Message = Arc<Vec<u8>>;

/// Fans encoded frames out to every connection and remembers the latest one
/// for late joiners.
#[derive(Clone)]
pub struct FrameHub {
    sender: broadcast::Sender<Message>,
    latest: Arc<Mutex<Option<Message>>>,
}

impl FrameHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            latest: Arc::new(Mutex::new(None)),
        }
    }

    pub fn latest(&self) -> Option<Message> {
        self.latest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Subscribe before reading the latest frame so nothing falls in between.
    pub fn subscribe(&self) -> (Option<Message>, broadcast::Receiver<Message>) {
        let receiver = self.sender.subscribe();
        (self.latest(), receiver)
    }
}

impl FrameSink for FrameHub {
    fn push_frame(&mut self, frame: Frame) -> Result<()> {
        let message = Arc::new(encode_frame(&frame)?);
        *self.latest.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&message));
        // No receivers is not an error; the latest frame is kept.
        let _ = self.sender.send(message);
        Ok(())
    }
}

/// Decode one request line and run it on the scene. Returns `None` for
/// notifications, which carry no id.
pub async fn handle_line(line: &str, scene: &SceneHandle) -> Option<RpcResponse> {
    let request: RpcRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(err) => return Some(RpcResponse::failure(None, PARSE_ERROR, err.to_string())),
    };
    let RpcRequest {
        jsonrpc,
        method,
        params,
        id,
    } = request;
    if jsonrpc != "2.0" {
        return Some(RpcResponse::failure(
            id,
            INVALID_REQUEST,
            format!("unsupported jsonrpc version {jsonrpc}"),
        ));
    }

    let response = match RemoteAction::parse(&method, params) {
        Ok(action) => match scene.dispatch(action).await {
            Ok(result) => RpcResponse::success(id.clone(), result),
            Err(err) => RpcResponse::failure(id.clone(), INTERNAL_ERROR, err.to_string()),
        },
        Err(err @ ActionParseError::UnknownMethod(_)) => {
            RpcResponse::failure(id.clone(), METHOD_NOT_FOUND, err.to_string())
        }
        Err(err @ ActionParseError::InvalidParams { .. }) => {
            RpcResponse::failure(id.clone(), INVALID_PARAMS, err.to_string())
        }
    };
    id.is_some().then_some(response)
}

/// Accept connections until the listener fails.
pub async fn serve(listener: TcpListener, scene: SceneHandle, hub: FrameHub) -> Result<()> {
    info!(addr = %listener.local_addr()?, "listening for viewers");
    loop {
        let (stream, peer) = listener.accept().await?;
        let scene = scene.clone();
        let hub = hub.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, peer, scene, hub).await {
                warn!(%peer, %err, "connection closed with error");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    scene: SceneHandle,
    hub: FrameHub,
) -> Result<()> {
    info!(%peer, "viewer connected");
    let (reader, writer) = stream.into_split();
    let (outgoing, mut responses) = mpsc::unbounded_channel::<Message>();
    let (latest, mut frames) = hub.subscribe();

    let writer_task = tokio::spawn(async move {
        let mut writer = BufWriter::new(writer);
        if let Some(frame) = latest {
            writer.write_all(&frame).await?;
            writer.flush().await?;
        }
        loop {
            let message = tokio::select! {
                response = responses.recv() => match response {
                    Some(message) => message,
                    None => break,
                },
                frame = frames.recv() => match frame {
                    Ok(message) => message,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(%peer, skipped, "viewer lagging, dropped frames");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            writer.write_all(&message).await?;
            writer.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(response) = handle_line(&line, &scene).await {
            if outgoing.send(Arc::new(encode_response(&response))).is_err() {
                break;
            }
        }
    }

    // Closing the queue lets the writer flush what is left, then stop.
    drop(outgoing);
    match writer_task.await {
        Ok(written) => written?,
        Err(err) => warn!(%peer, %err, "viewer writer task failed"),
    }
    info!(%peer, "viewer disconnected");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::RenderActor;
    use crate::render::cpu::CpuRayCaster;
    use crate::router::RemoteActionRouter;
    use crate::scene::{SceneConfig, SceneHost};
    use crate::volume_source::VolumeSource;
    use serde_json::json;

    fn scene(hub: FrameHub) -> (RenderActor, SceneHandle) {
        let host = SceneHost::new(
            Box::new(CpuRayCaster),
            SceneConfig {
                width: 2,
                height: 2,
                ..SceneConfig::default()
            },
        );
        let source = Arc::new(VolumeSource::dicom(Default::default()));
        RenderActor::spawn(RemoteActionRouter::new(source, host, Box::new(hub))).unwrap()
    }

    #[test]
    fn messages_are_length_prefixed() {
        let message = encode_message(JSON_MESSAGE, b"{}");
        assert_eq!(message, vec![0, 0, 0, 3, b'J', b'{', b'}']);
    }

    #[tokio::test]
    async fn maps_failures_onto_rpc_codes() {
        let (_actor, handle) = scene(FrameHub::new(4));

        let response = handle_line("not json", &handle).await.unwrap();
        assert_eq!(response.error.unwrap().code, PARSE_ERROR);

        let line = r#"{"jsonrpc":"2.0","method":"app.action.nope","id":1}"#;
        let response = handle_line(line, &handle).await.unwrap();
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);

        let line = r#"{"jsonrpc":"2.0","method":"app.action.set_window_level","params":{"window":"x"},"id":2}"#;
        let response = handle_line(line, &handle).await.unwrap();
        assert_eq!(response.error.unwrap().code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn action_errors_are_successful_responses() {
        let (_actor, handle) = scene(FrameHub::new(4));
        let line = r#"{"jsonrpc":"2.0","method":"app.action.set_window_level","params":{"window":10,"level":5},"id":"a"}"#;
        let response = handle_line(line, &handle).await.unwrap();
        assert!(response.error.is_none());
        assert_eq!(response.id, Some(json!("a")));
        assert_eq!(response.result.unwrap()["kind"], "not_initialized");

        let notification = r#"{"jsonrpc":"2.0","method":"app.action.clear_render"}"#;
        assert!(handle_line(notification, &handle).await.is_none());
    }

    #[tokio::test]
    async fn hub_keeps_latest_frame() {
        let hub = FrameHub::new(4);
        let (_actor, handle) = scene(hub.clone());
        handle.dispatch(RemoteAction::ClearRender).await.unwrap();

        let latest = hub.latest().unwrap();
        assert_eq!(latest[4], FRAME_MESSAGE);
        let length = u32::from_be_bytes([latest[0], latest[1], latest[2], latest[3]]) as usize;
        assert_eq!(length, latest.len() - 4);
        let header_len = u32::from_be_bytes([latest[5], latest[6], latest[7], latest[8]]) as usize;
        let header: Value = serde_json::from_slice(&latest[9..9 + header_len]).unwrap();
        assert_eq!(header["width"], 2);
        assert_eq!(&latest[9 + header_len + 1..9 + header_len + 4], b"PNG");
    }

    #[tokio::test]
    async fn queued_responses_survive_half_close() {
        use tokio::io::AsyncReadExt;

        let hub = FrameHub::new(4);
        let (_actor, handle) = scene(hub.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(listener, handle, hub));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let requests = concat!(
            r#"{"jsonrpc":"2.0","method":"app.action.clear_render","id":7}"#,
            "\n",
            r#"{"jsonrpc":"2.0","method":"app.action.get_metadata","id":8}"#,
            "\n",
        );
        client.write_all(requests.as_bytes()).await.unwrap();
        client.shutdown().await.unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();

        let mut responses = Vec::new();
        let mut rest = received.as_slice();
        while rest.len() >= 4 {
            let length = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
            let (message, tail) = rest[4..].split_at(length);
            if message[0] == JSON_MESSAGE {
                let response: RpcResponse = serde_json::from_slice(&message[1..]).unwrap();
                responses.push(response);
            }
            rest = tail;
        }
        assert!(rest.is_empty());
        let ids: Vec<_> = responses.iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec![Some(json!(7)), Some(json!(8))]);
        assert_eq!(responses[0].result.as_ref().unwrap()["status"], "cleared");
        assert_eq!(responses[1].result.as_ref().unwrap()["kind"], "not_initialized");

        server.abort();
    }
}
