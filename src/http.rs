use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::error::{Result, RpcError};
use crate::server::Server;

/// Path the CONNECT upgrade is served on.
pub const DEFAULT_HANDLE_PATH: &str = "/gingle/handle";
/// Path of the read-only HTML view over the service map.
pub const DEFAULT_DEBUG_PATH: &str = "/gingle/debug";

const CONNECTED_STATUS: &str = "HTTP/1.0 200 Connected to Gingle RPC";
const MAX_HEAD_SIZE: usize = 8 * 1024;

/// Upgrades a fresh client stream with the fixed CONNECT exchange and
/// hands back the raw stream for the RPC session.
pub(crate) async fn client_handshake<S>(mut stream: S) -> Result<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!("CONNECT {DEFAULT_HANDLE_PATH} HTTP/1.0\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let head = read_head(&mut stream).await?;
    let status_line = head.lines().next().unwrap_or_default();
    if status_line != CONNECTED_STATUS {
        return Err(RpcError::HandshakeRejected(format!(
            "unexpected http response {status_line:?}"
        )));
    }
    Ok(stream)
}

/// Reads an HTTP request or response head up to the blank line,
/// byte-wise so nothing past the head is consumed.
async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Result<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(RpcError::HandshakeRejected(
                "connection closed during http handshake".to_string(),
            ));
        }
        head.push(byte[0]);
        if head.ends_with(b"\r\n\r\n") {
            break;
        }
        if head.len() > MAX_HEAD_SIZE {
            return Err(RpcError::HandshakeRejected("http head too large".to_string()));
        }
    }
    String::from_utf8(head).map_err(|e| RpcError::HandshakeRejected(e.to_string()))
}

/// Serves the HTTP face of a server forever: CONNECT on
/// [`DEFAULT_HANDLE_PATH`] upgrades into the RPC pipeline, GET on
/// [`DEFAULT_DEBUG_PATH`] renders the service map, anything else is
/// rejected with 405.
pub async fn serve_http(server: Server, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted http connection");
                let server = server.clone();
                tokio::spawn(async move {
                    handle_http(server, stream).await;
                });
            }
            Err(e) => {
                warn!("failed to accept http connection: {e}");
            }
        }
    }
}

async fn handle_http(server: Server, mut stream: TcpStream) {
    let head = match read_head(&mut stream).await {
        Ok(head) => head,
        Err(e) => {
            debug!("failed to read http request: {e}");
            return;
        }
    };
    let request_line = head.lines().next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let path = parts.next().unwrap_or_default();

    match (method, path) {
        ("CONNECT", DEFAULT_HANDLE_PATH) => {
            let response = format!("{CONNECTED_STATUS}\r\n\r\n");
            if let Err(e) = stream.write_all(response.as_bytes()).await {
                debug!("failed to confirm connect: {e}");
                return;
            }
            server.serve_conn(stream).await;
        }
        ("GET", DEFAULT_DEBUG_PATH) => {
            let body = debug_html(&server);
            write_http_response(stream, "200 OK", "text/html; charset=utf-8", &body).await;
        }
        _ => {
            write_http_response(
                stream,
                "405 Method Not Allowed",
                "text/plain; charset=utf-8",
                "405 must connect\n",
            )
            .await;
        }
    }
}

async fn write_http_response(mut stream: TcpStream, status: &str, content_type: &str, body: &str) {
    let response = format!(
        "HTTP/1.0 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        debug!("failed to write http response: {e}");
        return;
    }
    let _ = stream.shutdown().await;
}

/// One section per service, one table row per method with its
/// signature and call count.
fn debug_html(server: &Server) -> String {
    let mut page = String::from(
        "<html>\n<head><title>GingleRPC Services</title></head>\n<body>\n",
    );
    for service in server.services() {
        page.push_str("<hr>\n");
        page.push_str(&format!("Service {}\n", service.name()));
        page.push_str("<hr>\n<table>\n<tr><th align=center>Method</th><th align=center>Calls</th></tr>\n");

        let mut methods: Vec<_> = service.methods().collect();
        methods.sort_by_key(|method| method.name().to_string());
        for method in methods {
            page.push_str(&format!(
                "<tr><td align=left>{}({}) -&gt; Result&lt;{}&gt;</td><td align=center>{}</td></tr>\n",
                method.name(),
                method.args_type(),
                method.reply_type(),
                method.call_times(),
            ));
        }
        page.push_str("</table>\n");
    }
    page.push_str("</body>\n</html>\n");
    page
}
