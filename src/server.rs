use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::codec::{CodecType, Header, Options, MAGIC_NUMBER};
use crate::error::{Result, RpcError};
use crate::frame::{FrameReader, FrameWriter};
use crate::service::{RpcMethod, Service};

/// The dispatch engine: accepts connections, performs the session
/// handshake and serves decoded requests against registered services,
/// one handler task per request.
#[derive(Clone, Default)]
pub struct Server {
    services: Arc<RwLock<HashMap<String, Arc<Service>>>>,
}

impl Server {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a service under its name. The name must be non-empty
    /// and must not contain a dot.
    pub fn register_service(&self, service: Service) -> Result<()> {
        let name = service.name().to_string();
        if name.is_empty() || name.contains('.') {
            return Err(RpcError::InvalidServiceName(name));
        }

        let mut services = self.services.write();
        if services.contains_key(&name) {
            return Err(RpcError::AlreadyRegistered(name));
        }
        services.insert(name, Arc::new(service));
        Ok(())
    }

    /// Resolves a dotted `"Service.Method"` name. The split is at the
    /// last dot.
    pub fn retrieve_service(&self, service_method: &str) -> Result<(Arc<Service>, Arc<RpcMethod>)> {
        let (service_name, method_name) = service_method
            .rsplit_once('.')
            .ok_or_else(|| RpcError::BadServiceMethod(service_method.to_string()))?;

        let service = self
            .services
            .read()
            .get(service_name)
            .cloned()
            .ok_or_else(|| RpcError::ServiceNotFound(service_method.to_string()))?;

        let method = service
            .method(method_name)
            .cloned()
            .ok_or_else(|| RpcError::MethodNotFound(service_method.to_string()))?;

        Ok((service, method))
    }

    /// Snapshot of registered services, sorted by name.
    pub fn services(&self) -> Vec<Arc<Service>> {
        let mut services: Vec<_> = self.services.read().values().cloned().collect();
        services.sort_by(|a, b| a.name().cmp(b.name()));
        services
    }

    /// Accepts connections forever, spawning one serving task per
    /// connection.
    pub async fn accept(&self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.serve_conn(stream).await;
                    });
                }
                Err(e) => {
                    warn!("failed to accept connection: {e}");
                }
            }
        }
    }

    /// Performs the session handshake on a fresh stream, then serves
    /// requests until the peer goes away.
    pub async fn serve_conn<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FrameReader::new(read_half);

        let preamble = match reader.read_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                warn!("failed to read session preamble: {e}");
                return;
            }
        };
        let options: Options = match serde_json::from_slice(&preamble) {
            Ok(options) => options,
            Err(e) => {
                warn!("malformed session preamble: {e}");
                return;
            }
        };
        if options.magic_number != MAGIC_NUMBER {
            warn!("rejected session with magic number {:#x}", options.magic_number);
            return;
        }

        self.serve_codec(reader, FrameWriter::new(write_half), options).await;
    }

    async fn serve_codec<S>(
        &self,
        mut reader: FrameReader<tokio::io::ReadHalf<S>>,
        writer: FrameWriter<WriteHalf<S>>,
        options: Options,
    ) where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let writer = Arc::new(Mutex::new(writer));
        let codec = options.codec_type;
        let mut handlers = JoinSet::new();

        loop {
            let header_frame = match reader.read_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    warn!("failed to read request header: {e}");
                    break;
                }
            };
            let header: Header = match codec.decode(&header_frame) {
                Ok(header) => header,
                Err(e) => {
                    warn!("failed to decode request header: {e}");
                    break;
                }
            };
            // The body frame is consumed unconditionally so a failed
            // lookup leaves the stream in sync for the next request.
            let body = match reader.read_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    warn!("failed to read request body: {e}");
                    break;
                }
            };

            match self.retrieve_service(&header.service_method) {
                Ok((_, method)) => {
                    handlers.spawn(handle_request(
                        Arc::clone(&writer),
                        codec,
                        header,
                        method,
                        body,
                        options.handle_timeout,
                    ));
                    while handlers.try_join_next().is_some() {}
                }
                Err(e) => {
                    let response = Header {
                        error: e.to_string(),
                        ..header
                    };
                    write_response(&writer, codec, &response, &empty_body(codec)).await;
                }
            }
        }

        while handlers.join_next().await.is_some() {}
    }
}

/// Runs one request to completion: invoke the method in a subtask and
/// race it against the handle timeout. Whichever side responds first
/// wins; the guard makes sure at most one response frame leaves per
/// sequence number.
async fn handle_request<W>(
    writer: Arc<Mutex<FrameWriter<W>>>,
    codec: CodecType,
    header: Header,
    method: Arc<RpcMethod>,
    body: Bytes,
    handle_timeout: Duration,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let responded = Arc::new(AtomicBool::new(false));

    let mut invocation = tokio::spawn({
        let writer = Arc::clone(&writer);
        let responded = Arc::clone(&responded);
        let mut header = header.clone();
        async move {
            match method.invoke(codec, body).await {
                Ok(reply) => {
                    respond_once(&writer, codec, &responded, &header, &reply).await;
                }
                Err(e) => {
                    header.error = e.to_string();
                    respond_once(&writer, codec, &responded, &header, &empty_body(codec)).await;
                }
            }
        }
    });

    if handle_timeout.is_zero() {
        let _ = (&mut invocation).await;
        return;
    }

    tokio::select! {
        _ = tokio::time::sleep(handle_timeout) => {
            let mut response = header;
            response.error = RpcError::HandleTimeout(handle_timeout).to_string();
            respond_once(&writer, codec, &responded, &response, &empty_body(codec)).await;
            // The invocation keeps running detached; its late response
            // is suppressed by the guard.
        }
        _ = &mut invocation => {}
    }
}

async fn respond_once<W>(
    writer: &Mutex<FrameWriter<W>>,
    codec: CodecType,
    responded: &AtomicBool,
    header: &Header,
    body: &[u8],
) where
    W: AsyncWrite + Unpin,
{
    let header_bytes = match codec.encode(header) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("failed to encode response header: {e}");
            return;
        }
    };

    let mut writer = writer.lock().await;
    if responded.swap(true, Ordering::SeqCst) {
        return;
    }
    if let Err(e) = writer.write_message(&header_bytes, body).await {
        warn!("failed to send response: {e}");
    }
}

async fn write_response<W>(
    writer: &Mutex<FrameWriter<W>>,
    codec: CodecType,
    header: &Header,
    body: &[u8],
) where
    W: AsyncWrite + Unpin,
{
    let header_bytes = match codec.encode(header) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("failed to encode response header: {e}");
            return;
        }
    };

    let mut writer = writer.lock().await;
    if let Err(e) = writer.write_message(&header_bytes, body).await {
        warn!("failed to send response: {e}");
    }
}

fn empty_body(codec: CodecType) -> Vec<u8> {
    codec.encode(&()).unwrap_or_default()
}
