//! WebSocket transport for [`Connection`].

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WsCloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message as WsMsg;
use tokio_tungstenite::{WebSocketStream, accept_hdr_async, connect_async};
use tracing::debug;

use crate::mux::{CloseFrame, ConnectOptions, Connection, Frame, MuxError, Wire};

pub const AUTH_HEADER: &str = "auth-token";

/// What the client asked for during the upgrade request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Handshake {
    pub path: String,
    pub auth_token: Option<String>,
}

/// Dials `url` and multiplexes over the resulting socket.
pub async fn connect(url: &str, options: &ConnectOptions) -> Result<Connection, MuxError> {
    let conn = connect_paused(url, options).await?;
    conn.resume();
    Ok(conn)
}

/// Like [`connect`], for callers that must subscribe before the server's
/// first frames are delivered.
pub async fn connect_paused(url: &str, options: &ConnectOptions) -> Result<Connection, MuxError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| MuxError::Transport(e.to_string()))?;
    if let Some(token) = &options.auth_token {
        let value = HeaderValue::from_str(token).map_err(|e| MuxError::Transport(e.to_string()))?;
        request.headers_mut().insert(AUTH_HEADER, value);
    }
    let (stream, _) = tokio::time::timeout(options.timeout, connect_async(request))
        .await
        .map_err(|_| MuxError::Transport(format!("handshake with {url} timed out")))?
        .map_err(|e| MuxError::Transport(e.to_string()))?;
    debug!(url, "connected");
    Ok(Connection::attach_paused(bridge(stream), options))
}

/// Completes the server side of the upgrade on an accepted socket. The
/// connection comes back paused; call [`Connection::resume`] once routed.
pub async fn accept<S>(stream: S, options: &ConnectOptions) -> Result<(Connection, Handshake), MuxError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut handshake = Handshake::default();
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        handshake.path = request.uri().path().to_string();
        handshake.auth_token = request
            .headers()
            .get(AUTH_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        Ok(response)
    };
    let stream = tokio::time::timeout(options.timeout, accept_hdr_async(stream, callback))
        .await
        .map_err(|_| MuxError::Transport("upgrade timed out".to_string()))?
        .map_err(|e| MuxError::Transport(e.to_string()))?;
    Ok((Connection::attach_paused(bridge(stream), options), handshake))
}

/// Splits a socket into a reader and a writer task joined to a [`Wire`].
pub fn bridge<S>(stream: WebSocketStream<S>) -> Wire
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut source) = stream.split();
    let (outbound, mut to_socket) = mpsc::unbounded_channel::<Frame>();
    let (from_socket, inbound) = mpsc::unbounded_channel::<Frame>();

    tokio::spawn(async move {
        while let Some(frame) = to_socket.recv().await {
            let closing = matches!(frame, Frame::Close(_));
            if let Err(err) = sink.send(to_ws(frame)).await {
                debug!(error = %err, "socket write failed");
                break;
            }
            if closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    tokio::spawn(async move {
        while let Some(message) = source.next().await {
            let frame = match message {
                Ok(WsMsg::Binary(bytes)) => Frame::Binary(bytes.to_vec()),
                // text never carries a valid frame; let the decoder reject it
                Ok(WsMsg::Text(text)) => Frame::Binary(text.as_str().as_bytes().to_vec()),
                Ok(WsMsg::Ping(payload)) => Frame::Ping(payload.to_vec()),
                Ok(WsMsg::Pong(payload)) => Frame::Pong(payload.to_vec()),
                Ok(WsMsg::Close(close)) => Frame::Close(
                    close.map(|close| CloseFrame::new(u16::from(close.code), close.reason.as_str())),
                ),
                Ok(WsMsg::Frame(_)) => continue,
                Err(err) => {
                    debug!(error = %err, "socket read failed");
                    break;
                }
            };
            let last = matches!(frame, Frame::Close(_));
            if from_socket.send(frame).is_err() || last {
                break;
            }
        }
    });

    Wire { outbound, inbound }
}

fn to_ws(frame: Frame) -> WsMsg {
    match frame {
        Frame::Binary(bytes) => WsMsg::Binary(bytes.into()),
        Frame::Ping(payload) => WsMsg::Ping(payload.into()),
        Frame::Pong(payload) => WsMsg::Pong(payload.into()),
        Frame::Close(close) => WsMsg::Close(close.map(|close| WsCloseFrame {
            code: CloseCode::from(close.code),
            reason: close.reason.into(),
        })),
    }
}
