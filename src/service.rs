use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::CodecType;
use crate::error::Result;

type MethodHandler = Box<dyn Fn(CodecType, Bytes) -> BoxFuture<'static, Result<Vec<u8>>> + Send + Sync>;

/// One invokable method of a registered service: a type-erased handler
/// that decodes the arguments, runs the registered closure and encodes
/// the reply with the session codec.
pub struct RpcMethod {
    name: String,
    args_type: &'static str,
    reply_type: &'static str,
    call_times: AtomicU64,
    handler: MethodHandler,
}

impl RpcMethod {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args_type(&self) -> &'static str {
        self.args_type
    }

    pub fn reply_type(&self) -> &'static str {
        self.reply_type
    }

    pub fn call_times(&self) -> u64 {
        self.call_times.load(Ordering::Relaxed)
    }

    pub async fn invoke(&self, codec: CodecType, args: Bytes) -> Result<Vec<u8>> {
        self.call_times.fetch_add(1, Ordering::Relaxed);
        (self.handler)(codec, args).await
    }
}

impl std::fmt::Debug for RpcMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcMethod")
            .field("name", &self.name)
            .field("args_type", &self.args_type)
            .field("reply_type", &self.reply_type)
            .field("call_times", &self.call_times())
            .finish()
    }
}

/// A named collection of methods registered on a server.
///
/// Registration is typed: a method is any closure of shape
/// `Fn(Args) -> Future<Output = Result<Reply>>` with deserializable
/// arguments and a serializable reply, so the eligibility rules are
/// enforced by the signature at compile time.
#[derive(Debug)]
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<RpcMethod>>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn register_method<Args, Reply, F, Fut>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        Args: DeserializeOwned + Send + 'static,
        Reply: Serialize + Send + 'static,
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply>> + Send + 'static,
    {
        let name = name.into();
        let handler = Arc::new(handler);
        let erased: MethodHandler = Box::new(move |codec, body| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let args: Args = codec.decode(&body)?;
                let reply = handler(args).await?;
                codec.encode(&reply)
            })
        });

        let method = RpcMethod {
            name: name.clone(),
            args_type: std::any::type_name::<Args>(),
            reply_type: std::any::type_name::<Reply>(),
            call_times: AtomicU64::new(0),
            handler: erased,
        };
        self.methods.insert(name, Arc::new(method));
        self
    }

    pub fn method(&self, name: &str) -> Option<&Arc<RpcMethod>> {
        self.methods.get(name)
    }

    pub fn methods(&self) -> impl Iterator<Item = &Arc<RpcMethod>> {
        self.methods.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcError;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct Args {
        num1: i64,
        num2: i64,
    }

    fn sum_service() -> Service {
        let mut service = Service::new("Foo");
        service.register_method("Sum", |args: Args| async move { Ok(args.num1 + args.num2) });
        service
    }

    #[tokio::test]
    async fn test_invoke_sum() {
        let service = sum_service();
        let method = service.method("Sum").unwrap();

        let codec = CodecType::Bincode;
        let body = Bytes::from(codec.encode(&Args { num1: 3, num2: 4 }).unwrap());
        let reply = method.invoke(codec, body).await.unwrap();
        let sum: i64 = codec.decode(&reply).unwrap();
        assert_eq!(sum, 7);
    }

    #[tokio::test]
    async fn test_call_times_counts_invocations() {
        let service = sum_service();
        let method = service.method("Sum").unwrap();
        assert_eq!(method.call_times(), 0);

        let codec = CodecType::Json;
        for _ in 0..3 {
            let body = Bytes::from(codec.encode(&Args { num1: 1, num2: 2 }).unwrap());
            method.invoke(codec, body).await.unwrap();
        }
        assert_eq!(method.call_times(), 3);
    }

    #[tokio::test]
    async fn test_invoke_bad_args() {
        let service = sum_service();
        let method = service.method("Sum").unwrap();

        let result = method.invoke(CodecType::Json, Bytes::from_static(b"not json")).await;
        assert!(matches!(result, Err(RpcError::Decode(_))));
    }

    #[test]
    fn test_method_metadata() {
        let service = sum_service();
        let method = service.method("Sum").unwrap();
        assert!(method.args_type().ends_with("Args"));
        assert_eq!(method.reply_type(), "i64");
        assert!(service.method("Nope").is_none());
    }
}
