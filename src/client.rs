use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::codec::{CodecType, Header, Options, MAGIC_NUMBER};
use crate::error::{Result, RpcError};
use crate::frame::{FrameReader, FrameWriter};
use crate::http;

trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

type BoxConn = Box<dyn Conn>;
type Completion = oneshot::Sender<Result<Bytes>>;

struct CallTable {
    /// Next sequence number; the first call gets 1.
    seq: u64,
    pending: HashMap<u64, Completion>,
    closing: bool,
    shutdown: bool,
}

struct Shared {
    codec: CodecType,
    calls: Mutex<CallTable>,
}

impl Shared {
    fn register(&self, completion: Completion) -> Result<u64> {
        let mut table = self.calls.lock();
        if table.closing || table.shutdown {
            return Err(RpcError::Closed);
        }
        let seq = table.seq;
        table.seq += 1;
        table.pending.insert(seq, completion);
        Ok(seq)
    }

    fn remove(&self, seq: u64) -> Option<Completion> {
        self.calls.lock().pending.remove(&seq)
    }

    fn is_available(&self) -> bool {
        let table = self.calls.lock();
        !table.closing && !table.shutdown
    }

    /// Returns false if the client was already closing or shut down.
    fn mark_closing(&self) -> bool {
        let mut table = self.calls.lock();
        if table.closing || table.shutdown {
            return false;
        }
        table.closing = true;
        true
    }

    fn shutdown_drain(&self) -> Vec<Completion> {
        let mut table = self.calls.lock();
        table.shutdown = true;
        table.pending.drain().map(|(_, completion)| completion).collect()
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.calls.lock().pending.len()
    }
}

/// One in-flight invocation. The handle resolves exactly once — with the
/// response, a transport error, or the shutdown error. Dropping an
/// unresolved handle cancels the call: the pending entry is removed and
/// a late response is discarded by the receive loop.
pub struct Call {
    service_method: String,
    sequence_number: u64,
    done: oneshot::Receiver<Result<Bytes>>,
    shared: Option<Arc<Shared>>,
}

impl Call {
    fn completed(service_method: String, result: Result<Bytes>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self {
            service_method,
            sequence_number: 0,
            done: rx,
            shared: None,
        }
    }

    pub fn service_method(&self) -> &str {
        &self.service_method
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// Waits for the completion signal and returns the raw reply bytes.
    pub async fn wait(mut self) -> Result<Bytes> {
        match (&mut self.done).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Shutdown("client dropped before response".to_string())),
        }
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        if let Some(shared) = &self.shared {
            shared.remove(self.sequence_number);
        }
    }
}

/// A connection to one server, multiplexing concurrent calls over the
/// session by sequence number. A background task demultiplexes
/// responses into the pending-call table.
pub struct Client {
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<FrameWriter<WriteHalf<BoxConn>>>,
    receiver: JoinHandle<()>,
}

impl Client {
    /// Opens a session over an established stream: encodes the options
    /// preamble and spawns the receive loop.
    pub async fn new<S>(stream: S, options: Options) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut options = options;
        options.magic_number = MAGIC_NUMBER;

        let (read_half, write_half) = tokio::io::split(Box::new(stream) as BoxConn);
        let mut writer = FrameWriter::new(write_half);
        let preamble = serde_json::to_vec(&options).map_err(|e| RpcError::Encode(e.to_string()))?;
        writer.write_frame(&preamble).await?;

        let shared = Arc::new(Shared {
            codec: options.codec_type,
            calls: Mutex::new(CallTable {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
        });

        let receiver = tokio::spawn(receive(Arc::clone(&shared), FrameReader::new(read_half)));

        Ok(Self {
            shared,
            writer: tokio::sync::Mutex::new(writer),
            receiver,
        })
    }

    /// Dials a `proto@address` pattern. `http` upgrades a TCP stream
    /// with a CONNECT handshake, `tcp` dials directly and `unix`
    /// connects a Unix socket. The whole dial plus handshake is bounded
    /// by the connect timeout (zero means unbounded).
    pub async fn dial(pattern: &str, options: Options) -> Result<Self> {
        let (proto, address) = pattern
            .split_once('@')
            .ok_or_else(|| RpcError::BadDialPattern(pattern.to_string()))?;

        let connect_timeout = options.connect_timeout;
        let connect = Self::dial_proto(proto.to_string(), address.to_string(), options);
        if connect_timeout.is_zero() {
            return connect.await;
        }
        tokio::time::timeout(connect_timeout, connect)
            .await
            .map_err(|_| RpcError::ConnectTimeout(connect_timeout))?
    }

    async fn dial_proto(proto: String, address: String, options: Options) -> Result<Self> {
        match proto.as_str() {
            "http" => {
                let stream = TcpStream::connect(&address).await?;
                let stream = http::client_handshake(stream).await?;
                Self::new(stream, options).await
            }
            "tcp" => {
                let stream = TcpStream::connect(&address).await?;
                Self::new(stream, options).await
            }
            #[cfg(unix)]
            "unix" => {
                let stream = tokio::net::UnixStream::connect(&address).await?;
                Self::new(stream, options).await
            }
            other => Err(RpcError::BadDialPattern(format!("{other}@{address}"))),
        }
    }

    pub fn is_available(&self) -> bool {
        self.shared.is_available()
    }

    /// Starts closing: no new calls are accepted and the write half is
    /// shut down. The receive loop drains once the server closes its
    /// side.
    pub async fn close(&self) -> Result<()> {
        if !self.shared.mark_closing() {
            return Err(RpcError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }

    /// Sends a request without waiting for the reply. Every failure is
    /// delivered through the returned handle.
    pub async fn go<Args: Serialize>(&self, service_method: &str, args: &Args) -> Call {
        match self.shared.codec.encode(args) {
            Ok(body) => self.go_raw(service_method, body).await,
            Err(e) => Call::completed(service_method.to_string(), Err(e)),
        }
    }

    /// Like [`Client::go`] with pre-encoded argument bytes.
    pub async fn go_raw(&self, service_method: &str, body: Vec<u8>) -> Call {
        let (tx, rx) = oneshot::channel();

        // Sequence assignment and the frame write happen under the one
        // writer lock, so wire order matches sequence order.
        let mut writer = self.writer.lock().await;
        let seq = match self.shared.register(tx) {
            Ok(seq) => seq,
            Err(e) => return Call::completed(service_method.to_string(), Err(e)),
        };

        let header = Header {
            service_method: service_method.to_string(),
            sequence_number: seq,
            error: String::new(),
        };
        let write_result = match self.shared.codec.encode(&header) {
            Ok(header_bytes) => writer.write_message(&header_bytes, &body).await.map_err(RpcError::Io),
            Err(e) => Err(e),
        };
        drop(writer);

        if let Err(e) = write_result {
            if let Some(completion) = self.shared.remove(seq) {
                let _ = completion.send(Err(e));
            }
        }

        Call {
            service_method: service_method.to_string(),
            sequence_number: seq,
            done: rx,
            shared: Some(Arc::clone(&self.shared)),
        }
    }

    /// Invokes a remote method and waits for the typed reply.
    pub async fn call<Args, Reply>(&self, service_method: &str, args: &Args) -> Result<Reply>
    where
        Args: Serialize,
        Reply: DeserializeOwned,
    {
        let reply = self.go(service_method, args).await.wait().await?;
        self.shared.codec.decode(&reply)
    }

    /// Invokes a remote method with pre-encoded arguments and returns
    /// the raw reply bytes.
    pub async fn call_raw(&self, service_method: &str, body: Vec<u8>) -> Result<Bytes> {
        self.go_raw(service_method, body).await.wait().await
    }

    /// Like [`Client::call`] with a deadline. On expiry the pending
    /// entry is removed and a late response is silently discarded.
    pub async fn call_with_timeout<Args, Reply>(
        &self,
        service_method: &str,
        args: &Args,
        timeout: Duration,
    ) -> Result<Reply>
    where
        Args: Serialize,
        Reply: DeserializeOwned,
    {
        if timeout.is_zero() {
            return self.call(service_method, args).await;
        }

        let call = self.go(service_method, args).await;
        tokio::select! {
            _ = tokio::time::sleep(timeout) => Err(RpcError::CallTimeout(timeout)),
            reply = call.wait() => self.shared.codec.decode(&reply?),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.shared.calls.lock();
        f.debug_struct("Client")
            .field("codec", &self.shared.codec)
            .field("pending", &table.pending.len())
            .field("closing", &table.closing)
            .field("shutdown", &table.shutdown)
            .finish()
    }
}

/// The demultiplexing loop: the single reader of the session. Completes
/// pending calls by sequence number and fails every remaining call when
/// the transport goes away.
async fn receive(shared: Arc<Shared>, mut reader: FrameReader<ReadHalf<BoxConn>>) {
    let cause = loop {
        let header_frame = match reader.read_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break "connection closed by server".to_string(),
            Err(e) => break e.to_string(),
        };
        let header: Header = match shared.codec.decode(&header_frame) {
            Ok(header) => header,
            Err(e) => break e.to_string(),
        };
        let body = match reader.read_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break "connection closed mid response".to_string(),
            Err(e) => break e.to_string(),
        };

        match shared.remove(header.sequence_number) {
            // A response for a call that was cancelled; the body frame
            // is already consumed, so just drop it.
            None => debug!(seq = header.sequence_number, "discarding response for unknown call"),
            Some(completion) => {
                let result = if header.error.is_empty() {
                    Ok(body)
                } else {
                    Err(RpcError::ServerError(header.error))
                };
                let _ = completion.send(result);
            }
        }
    };

    for completion in shared.shutdown_drain() {
        let _ = completion.send(Err(RpcError::Shutdown(cause.clone())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::Server;
    use crate::service::Service;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct Args {
        num1: i64,
        num2: i64,
    }

    fn foo_server() -> Server {
        let mut service = Service::new("Foo");
        service.register_method("Sum", |args: Args| async move { Ok(args.num1 + args.num2) });
        service.register_method("Nap", |args: Args| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(args.num1 + args.num2)
        });
        let server = Server::new();
        server.register_service(service).unwrap();
        server
    }

    async fn connect(server: Server, options: Options) -> Client {
        let (client_stream, server_stream) = tokio::io::duplex(4096);
        tokio::spawn(async move { server.serve_conn(server_stream).await });
        Client::new(client_stream, options).await.unwrap()
    }

    #[tokio::test]
    async fn test_call_success() {
        let client = connect(foo_server(), Options::default()).await;
        let reply: i64 = client.call("Foo.Sum", &Args { num1: 3, num2: 4 }).await.unwrap();
        assert_eq!(reply, 7);
    }

    #[tokio::test]
    async fn test_call_json_codec() {
        let options = Options::default().with_codec_type(CodecType::Json);
        let client = connect(foo_server(), options).await;
        let reply: i64 = client.call("Foo.Sum", &Args { num1: 10, num2: 32 }).await.unwrap();
        assert_eq!(reply, 42);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let client = connect(foo_server(), Options::default()).await;
        let result: Result<i64> = client.call("Foo.Nope", &Args { num1: 1, num2: 2 }).await;
        match result {
            Err(RpcError::ServerError(message)) => assert!(message.contains("method not found")),
            other => panic!("expected server error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_calls() {
        let client = Arc::new(connect(foo_server(), Options::default()).await);

        let mut tasks = Vec::new();
        for i in 0..5i64 {
            let client = Arc::clone(&client);
            tasks.push(tokio::spawn(async move {
                let reply: i64 = client
                    .call("Foo.Sum", &Args { num1: i, num2: i * i })
                    .await
                    .unwrap();
                assert_eq!(reply, i + i * i);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_sequence_numbers_are_contiguous() {
        let client = connect(foo_server(), Options::default()).await;

        let mut sequence_numbers = Vec::new();
        for i in 0..3i64 {
            let call = client.go("Foo.Sum", &Args { num1: i, num2: i }).await;
            sequence_numbers.push(call.sequence_number());
            call.wait().await.unwrap();
        }
        assert_eq!(sequence_numbers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_call_timeout_removes_pending() {
        let client = connect(foo_server(), Options::default()).await;

        let result: Result<i64> = client
            .call_with_timeout("Foo.Nap", &Args { num1: 1, num2: 2 }, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(RpcError::CallTimeout(_))));
        assert_eq!(client.shared.pending_len(), 0);

        // A late response for the cancelled sequence number is ignored
        // and the session keeps working.
        tokio::time::sleep(Duration::from_millis(250)).await;
        let reply: i64 = client.call("Foo.Sum", &Args { num1: 2, num2: 2 }).await.unwrap();
        assert_eq!(reply, 4);
    }

    #[tokio::test]
    async fn test_handle_timeout_surfaces_error() {
        let options = Options::default().with_handle_timeout(Duration::from_millis(50));
        let client = connect(foo_server(), options).await;

        let result: Result<i64> = client.call("Foo.Nap", &Args { num1: 1, num2: 2 }).await;
        match result {
            Err(RpcError::ServerError(message)) => {
                assert!(message.contains("handle timeout"), "got {message:?}")
            }
            other => panic!("expected handle timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_rejects_new_calls() {
        let client = connect(foo_server(), Options::default()).await;
        assert!(client.is_available());

        client.close().await.unwrap();
        assert!(!client.is_available());
        assert!(matches!(client.close().await, Err(RpcError::Closed)));

        let result: Result<i64> = client.call("Foo.Sum", &Args { num1: 1, num2: 2 }).await;
        assert!(matches!(result, Err(RpcError::Closed)));
    }

    #[tokio::test]
    async fn test_server_gone_fails_pending_calls() {
        let (client_stream, server_stream) = tokio::io::duplex(4096);
        let client = Client::new(client_stream, Options::default()).await.unwrap();

        // The peer disappears without ever answering.
        let call = client.go("Foo.Nap", &Args { num1: 1, num2: 2 }).await;
        drop(server_stream);

        let result = call.wait().await;
        assert!(matches!(result, Err(RpcError::Shutdown(_))));
        assert!(!client.is_available());
    }

    #[tokio::test]
    async fn test_dial_bad_pattern() {
        let result = Client::dial("127.0.0.1:0", Options::default()).await;
        assert!(matches!(result, Err(RpcError::BadDialPattern(_))));
    }

    #[tokio::test]
    async fn test_dial_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = foo_server();
        tokio::spawn(async move { server.accept(listener).await });

        let client = Client::dial(&format!("tcp@{address}"), Options::default()).await.unwrap();
        let reply: i64 = client.call("Foo.Sum", &Args { num1: 20, num2: 22 }).await.unwrap();
        assert_eq!(reply, 42);
    }
}
