//! WebSocket transport over tokio-tungstenite.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http;
use tokio_tungstenite::tungstenite::Message;

use crate::error::RealtimeError;
use crate::types::RealtimeConfig;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub(crate) type WsSink = SplitSink<WsStream, Message>;
pub(crate) type WsRead = SplitStream<WsStream>;

/// Frames the socket loop cares about.
pub(crate) enum WsFrame {
    Text(String),
    Ping(Vec<u8>),
    Close,
}

/// Open the websocket with the configured handshake headers.
pub(crate) async fn connect(
    config: &RealtimeConfig,
    ws_url: &str,
) -> Result<(WsSink, WsRead), RealtimeError> {
    let mut request = ws_url.into_client_request()?;

    for (key, value) in &config.headers {
        let name = http::header::HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| RealtimeError::InvalidConfig(format!("Invalid header name: {}", e)))?;
        let value = http::header::HeaderValue::from_str(value)
            .map_err(|e| RealtimeError::InvalidConfig(format!("Invalid header value: {}", e)))?;
        request.headers_mut().insert(name, value);
    }

    let (ws_stream, _) = tokio_tungstenite::connect_async(request).await?;
    Ok(ws_stream.split())
}

pub(crate) async fn send_text(sink: &mut WsSink, text: String) -> Result<(), RealtimeError> {
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}

pub(crate) async fn send_pong(sink: &mut WsSink, data: Vec<u8>) -> Result<(), RealtimeError> {
    sink.send(Message::Pong(data.into())).await?;
    Ok(())
}

/// Best effort; the connection is going away either way.
pub(crate) async fn send_close(sink: &mut WsSink) {
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

/// Next frame of interest. `None` once the stream has ended.
pub(crate) async fn recv(read: &mut WsRead) -> Option<Result<WsFrame, RealtimeError>> {
    loop {
        match read.next().await? {
            Ok(Message::Text(text)) => return Some(Ok(WsFrame::Text(text.to_string()))),
            Ok(Message::Ping(data)) => return Some(Ok(WsFrame::Ping(data.to_vec()))),
            Ok(Message::Close(_)) => return Some(Ok(WsFrame::Close)),
            Ok(_) => continue, // binary, pong, raw frames
            Err(e) => return Some(Err(RealtimeError::WebSocket(e))),
        }
    }
}
