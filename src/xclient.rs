use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::debug;

use crate::balance::{LoadBalance, Mode};
use crate::client::Client;
use crate::codec::Options;
use crate::error::{Result, RpcError};

/// A client over many endpoints: per-endpoint connections are cached
/// and the load balancer picks targets. Cloning is cheap and clones
/// share the cache.
#[derive(Clone)]
pub struct XClient {
    options: Options,
    mode: Mode,
    balancer: Arc<dyn LoadBalance>,
    clients: Arc<Mutex<HashMap<String, Arc<Client>>>>,
}

impl XClient {
    pub fn new(balancer: Arc<dyn LoadBalance>, mode: Mode, options: Options) -> Self {
        Self {
            options,
            mode,
            balancer,
            clients: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns a live cached client for the `proto@address` pattern,
    /// dialing a fresh one when the cache is empty or the cached
    /// connection is no longer available.
    pub async fn dial(&self, pattern: &str) -> Result<Arc<Client>> {
        let mut clients = self.clients.lock().await;

        if let Some(client) = clients.get(pattern) {
            if client.is_available() {
                return Ok(Arc::clone(client));
            }
            debug!(%pattern, "evicting dead client");
            clients.remove(pattern);
        }

        let client = Arc::new(Client::dial(pattern, self.options.clone()).await?);
        clients.insert(pattern.to_string(), Arc::clone(&client));
        Ok(client)
    }

    /// Invokes the method on one server picked by the load balancer.
    pub async fn peer_to_peer<Args, Reply>(&self, service_method: &str, args: &Args) -> Result<Reply>
    where
        Args: Serialize,
        Reply: DeserializeOwned,
    {
        let server = self.balancer.get_one(self.mode).await?;
        let client = self.dial(&server).await?;
        client.call(service_method, args).await
    }

    /// Fans the call out to every known server. The first successful
    /// reply wins and later successes are discarded; the first error
    /// aborts the remaining peers and becomes the overall error when no
    /// peer succeeds. All fan-outs settle before this returns.
    pub async fn broadcast<Args, Reply>(&self, service_method: &str, args: &Args) -> Result<Reply>
    where
        Args: Serialize,
        Reply: DeserializeOwned,
    {
        let servers = self.balancer.get_all().await?;
        if servers.is_empty() {
            return Err(RpcError::NoServers);
        }

        let body = self.options.codec_type.encode(args)?;
        let mut peers = JoinSet::new();
        for server in servers {
            let xclient = self.clone();
            let service_method = service_method.to_string();
            let body = body.clone();
            peers.spawn(async move {
                let client = xclient.dial(&server).await?;
                client.call_raw(&service_method, body).await
            });
        }

        let mut reply: Option<Bytes> = None;
        let mut first_error: Option<RpcError> = None;
        while let Some(joined) = peers.join_next().await {
            match joined {
                Ok(Ok(bytes)) => {
                    if reply.is_none() {
                        reply = Some(bytes);
                    }
                }
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                        peers.abort_all();
                    }
                }
                Err(join_error) => {
                    if !join_error.is_cancelled() && first_error.is_none() {
                        first_error = Some(RpcError::Shutdown(join_error.to_string()));
                    }
                }
            }
        }

        match reply {
            Some(bytes) => self.options.codec_type.decode(&bytes),
            None => Err(first_error.unwrap_or(RpcError::NoServers)),
        }
    }

    /// Closes and drops every cached client.
    pub async fn close(&self) {
        let mut clients = self.clients.lock().await;
        for (_, client) in clients.drain() {
            let _ = client.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::StaticLoadBalancer;
    use crate::server::Server;
    use crate::service::Service;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Serialize, Deserialize)]
    struct Args {
        num1: i64,
        num2: i64,
    }

    async fn spawn_server(service: Service) -> String {
        let server = Server::new();
        server.register_service(service).unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let pattern = format!("tcp@{}", listener.local_addr().unwrap());
        tokio::spawn(async move { server.accept(listener).await });
        pattern
    }

    fn sum_service() -> Service {
        let mut service = Service::new("Foo");
        service.register_method("Sum", |args: Args| async move { Ok(args.num1 + args.num2) });
        service
    }

    fn failing_service() -> Service {
        let mut service = Service::new("Foo");
        service.register_method("Sum", |_args: Args| async move {
            // A short think time keeps this peer from deciding the
            // broadcast before the healthy one has answered.
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err::<i64, _>(RpcError::ServerError("sum is broken here".to_string()))
        });
        service
    }

    fn xclient(servers: Vec<String>, mode: Mode) -> XClient {
        let balancer = Arc::new(StaticLoadBalancer::new(servers));
        XClient::new(balancer, mode, Options::default())
    }

    #[tokio::test]
    async fn test_peer_to_peer_round_robin() {
        let a = spawn_server(sum_service()).await;
        let b = spawn_server(sum_service()).await;
        let xc = xclient(vec![a, b], Mode::RoundRobin);

        for i in 0..4i64 {
            let reply: i64 = xc.peer_to_peer("Foo.Sum", &Args { num1: i, num2: i * i }).await.unwrap();
            assert_eq!(reply, i + i * i);
        }
        // Both endpoints have been dialed and cached.
        assert_eq!(xc.clients.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_dial_reuses_cached_client() {
        let a = spawn_server(sum_service()).await;
        let xc = xclient(vec![a.clone()], Mode::Random);

        let first = xc.dial(&a).await.unwrap();
        let second = xc.dial(&a).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        first.close().await.unwrap();
        let third = xc.dial(&a).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[tokio::test]
    async fn test_broadcast_first_success_wins() {
        let good = spawn_server(sum_service()).await;
        let bad = spawn_server(failing_service()).await;
        let xc = xclient(vec![bad, good], Mode::Random);

        let reply: i64 = xc.broadcast("Foo.Sum", &Args { num1: 3, num2: 4 }).await.unwrap();
        assert_eq!(reply, 7);
    }

    #[tokio::test]
    async fn test_broadcast_all_failures_surfaces_first_error() {
        let bad1 = spawn_server(failing_service()).await;
        let bad2 = spawn_server(failing_service()).await;
        let xc = xclient(vec![bad1, bad2], Mode::Random);

        let result: Result<i64> = xc.broadcast("Foo.Sum", &Args { num1: 1, num2: 2 }).await;
        match result {
            Err(RpcError::ServerError(message)) => assert!(message.contains("sum is broken here")),
            other => panic!("expected the peer error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_broadcast_no_servers() {
        let xc = xclient(Vec::new(), Mode::Random);
        let result: Result<i64> = xc.broadcast("Foo.Sum", &Args { num1: 1, num2: 2 }).await;
        assert!(matches!(result, Err(RpcError::NoServers)));
    }

    #[tokio::test]
    async fn test_close_empties_cache() {
        let a = spawn_server(sum_service()).await;
        let xc = xclient(vec![a.clone()], Mode::Random);
        xc.dial(&a).await.unwrap();

        xc.close().await;
        assert!(xc.clients.lock().await.is_empty());
    }
}
