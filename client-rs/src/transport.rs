//! Streaming transport underneath a bus session
//!
//! A [`Transport`] opens one connection and hands back independent
//! writer/reader halves, so the session loop can wait on inbound frames and
//! its outbound queue at the same time. [`WebSocketTransport`] is the
//! production implementation; anything that delivers ordered, message-framed
//! text can stand in for it.

use crate::error::{BusError, Result};

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens connections to a bus endpoint
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connect to `url`, returning the write and read halves
    async fn connect(&self, url: &str) -> Result<(Box<dyn FrameWriter>, Box<dyn FrameReader>)>;
}

/// Write half of a connection
#[async_trait]
pub trait FrameWriter: Send {
    /// Send one text frame
    async fn send(&mut self, frame: String) -> Result<()>;

    /// Close the connection gracefully
    async fn close(&mut self) -> Result<()>;
}

/// Read half of a connection
#[async_trait]
pub trait FrameReader: Send {
    /// Next text frame, or `None` once the peer has closed the connection
    async fn recv(&mut self) -> Option<Result<String>>;
}

/// WebSocket transport over `tokio-tungstenite`
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &str) -> Result<(Box<dyn FrameWriter>, Box<dyn FrameReader>)> {
        debug!("Connecting to {}", url);
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        let (sink, stream) = stream.split();
        Ok((Box::new(WsWriter { sink }), Box::new(WsReader { stream })))
    }
}

struct WsWriter {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameWriter for WsWriter {
    async fn send(&mut self, frame: String) -> Result<()> {
        self.sink
            .send(Message::Text(frame))
            .await
            .map_err(|e| BusError::Transport(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.sink
            .close()
            .await
            .map_err(|e| BusError::Transport(e.to_string()))
    }
}

struct WsReader {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl FrameReader for WsReader {
    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text)),
                Some(Ok(Message::Binary(data))) => {
                    return Some(Ok(String::from_utf8_lossy(&data).into_owned()));
                }
                // tungstenite queues the pong reply itself
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Frame(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Server sent close frame");
                    return None;
                }
                Some(Err(e)) => return Some(Err(BusError::Transport(e.to_string()))),
                None => return None,
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_websocket_connect_invalid_url_returns_error() {
        let result = WebSocketTransport.connect("not-a-url").await;
        assert!(matches!(result, Err(BusError::Connection(_))));
    }

    #[tokio::test]
    async fn test_websocket_connect_unreachable_host_returns_error() {
        let result = WebSocketTransport.connect("ws://127.0.0.1:1/ws/bus").await;
        assert!(matches!(result, Err(BusError::Connection(_))));
    }

    #[tokio::test]
    async fn test_memory_transport_round_trip() {
        let (transport, mut accepted) = memory::MemoryTransport::new();
        let (mut writer, mut reader) = transport.connect("ws://mem").await.unwrap();
        let mut server = accepted.recv().await.unwrap();

        writer.send(r#"{"action":"ping","from":"a"}"#.into()).await.unwrap();
        assert_eq!(server.next_frame().await["action"], "ping");

        server.push(serde_json::json!({"data": "pong"}));
        assert_eq!(reader.recv().await.unwrap().unwrap(), r#"{"data":"pong"}"#);

        drop(server);
        assert!(reader.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_memory_transport_refuses() {
        let (transport, _accepted) = memory::MemoryTransport::new();
        transport
            .refuse
            .store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(transport.connect("ws://mem").await.is_err());
        assert_eq!(
            transport.attempts.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }
}
