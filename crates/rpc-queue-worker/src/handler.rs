use crate::HandlerError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use rpc_queue_core::{decode, decode_raw, Qos, QueueDeclareOptions, Reply};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

/// Result type for queue handlers
pub type HandlerResult = Result<Reply, HandlerError>;

/// Trait for queue handlers
#[async_trait]
pub trait QueueHandler: Send + Sync {
    /// Handle one request body. `raw` is set for queues that skip decoding.
    async fn handle(&self, body: Bytes, raw: bool) -> HandlerResult;
}

/// Decode a request body, either from MessagePack or directly from the bytes
pub fn decode_payload<T: DeserializeOwned>(body: &[u8], raw: bool) -> Result<T, HandlerError> {
    let decoded = if raw { decode_raw(body) } else { decode(body) };
    decoded.map_err(HandlerError::Decode)
}

fn encode_result<T: Serialize>(value: &T) -> HandlerResult {
    Reply::success(value).map_err(HandlerError::Encode)
}

type Invoke = dyn Fn(Bytes, bool) -> BoxFuture<'static, HandlerResult> + Send + Sync;

/// A plain function or closure erased to a [`QueueHandler`].
///
/// Synchronous and asynchronous functions end up behind the same async
/// contract, so the dispatcher never needs to know which one it runs.
pub struct FnHandler {
    invoke: Box<Invoke>,
}

impl FnHandler {
    pub fn from_async<F, Fut, In, Out, E>(f: F) -> Self
    where
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, E>> + Send + 'static,
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + 'static,
        E: Display + 'static,
    {
        let f = Arc::new(f);
        FnHandler {
            invoke: Box::new(move |body: Bytes, raw: bool| -> BoxFuture<'static, HandlerResult> {
                let f = f.clone();
                Box::pin(async move {
                    let input: In = decode_payload(&body, raw)?;
                    let output = match f(input).await {
                        Ok(output) => output,
                        Err(e) => return Err(HandlerError::Failed(e.to_string())),
                    };
                    encode_result(&output)
                })
            }),
        }
    }

    pub fn from_sync<F, In, Out, E>(f: F) -> Self
    where
        F: Fn(In) -> Result<Out, E> + Send + Sync + 'static,
        In: DeserializeOwned + 'static,
        Out: Serialize + 'static,
        E: Display + 'static,
    {
        FnHandler {
            invoke: Box::new(move |body: Bytes, raw: bool| -> BoxFuture<'static, HandlerResult> {
                let outcome = decode_payload(&body, raw).and_then(|input: In| {
                    let output = f(input).map_err(|e| HandlerError::Failed(e.to_string()))?;
                    encode_result(&output)
                });
                Box::pin(futures::future::ready(outcome))
            }),
        }
    }
}

#[async_trait]
impl QueueHandler for FnHandler {
    async fn handle(&self, body: Bytes, raw: bool) -> HandlerResult {
        (self.invoke)(body, raw).await
    }
}

/// Per-queue declaration and consumption settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub prefetch_count: u16,
    pub prefetch_size: u32,
    /// Apply the prefetch limits to the whole connection instead of the channel
    pub global_qos: bool,
    /// Hand the body to the handler without MessagePack decoding
    pub raw: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions {
            durable: true,
            prefetch_count: 1,
            prefetch_size: 0,
            global_qos: false,
            raw: false,
        }
    }
}

impl QueueOptions {
    pub fn raw(mut self) -> Self {
        self.raw = true;
        self
    }

    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch_count = count;
        self
    }

    pub fn qos(&self) -> Qos {
        Qos {
            prefetch_count: self.prefetch_count,
            prefetch_size: self.prefetch_size,
            global: self.global_qos,
        }
    }

    pub fn declare_options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            durable: self.durable,
            ..Default::default()
        }
    }
}

#[derive(Clone)]
pub struct Registration {
    pub handler: Arc<dyn QueueHandler>,
    pub options: QueueOptions,
}

/// Queue name to handler bindings. At most one handler per queue; the last
/// registration wins.
#[derive(Clone, Default)]
pub struct QueueRegistry {
    queues: HashMap<String, Registration>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        queue: impl Into<String>,
        handler: Arc<dyn QueueHandler>,
        options: QueueOptions,
    ) {
        self.queues
            .insert(queue.into(), Registration { handler, options });
    }

    pub fn get(&self, queue: &str) -> Option<&Registration> {
        self.queues.get(queue)
    }

    pub fn has_handler(&self, queue: &str) -> bool {
        self.queues.contains_key(queue)
    }

    /// Registered queue names, sorted
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Registration)> {
        self.queues.iter()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpc_queue_core::{decode_reply, encode};

    fn body<T: Serialize>(value: &T) -> Bytes {
        Bytes::from(encode(value).unwrap())
    }

    #[tokio::test]
    async fn test_async_handler() {
        let handler = FnHandler::from_async(|x: i64| async move { Ok::<_, String>(x * 2) });

        let reply = handler.handle(body(&5i64), false).await.unwrap();
        assert!(!reply.is_failure());
        assert_eq!(decode_reply::<i64>(reply.body()).unwrap(), Ok(10));
    }

    #[tokio::test]
    async fn test_sync_handler() {
        let handler = FnHandler::from_sync(|words: Vec<String>| Ok::<_, String>(words.len()));

        let reply = handler
            .handle(body(&vec!["a".to_string(), "b".to_string()]), false)
            .await
            .unwrap();
        assert_eq!(decode_reply::<usize>(reply.body()).unwrap(), Ok(2));
    }

    #[tokio::test]
    async fn test_handler_failure_keeps_message() {
        let handler =
            FnHandler::from_async(|_: i64| async move { Err::<i64, _>("bad input".to_string()) });

        let err = handler.handle(body(&1i64), false).await.unwrap_err();
        assert!(matches!(err, HandlerError::Failed(_)));
        assert_eq!(err.to_string(), "bad input");
    }

    #[tokio::test]
    async fn test_decode_failure() {
        let handler = FnHandler::from_sync(|x: i64| Ok::<_, String>(x));

        let err = handler
            .handle(Bytes::from_static(b"\xc1"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Decode(_)));
    }

    #[tokio::test]
    async fn test_raw_handler_sees_bytes() {
        let handler = FnHandler::from_sync(|text: String| Ok::<_, String>(text.to_uppercase()));

        let reply = handler
            .handle(Bytes::from_static(b"hello"), true)
            .await
            .unwrap();
        assert_eq!(
            decode_reply::<String>(reply.body()).unwrap(),
            Ok("HELLO".to_string())
        );
    }

    #[tokio::test]
    async fn test_registry_last_write_wins() {
        let mut registry = QueueRegistry::new();
        registry.register(
            "math",
            Arc::new(FnHandler::from_sync(|x: i64| Ok::<_, String>(x + 1))),
            QueueOptions::default(),
        );
        registry.register(
            "math",
            Arc::new(FnHandler::from_sync(|x: i64| Ok::<_, String>(x * 2))),
            QueueOptions::default().prefetch(4),
        );

        assert_eq!(registry.len(), 1);
        assert!(registry.has_handler("math"));
        assert!(!registry.has_handler("other"));

        let registration = registry.get("math").unwrap();
        assert_eq!(registration.options.prefetch_count, 4);
        let reply = registration.handler.handle(body(&5i64), false).await.unwrap();
        assert_eq!(decode_reply::<i64>(reply.body()).unwrap(), Ok(10));
    }

    #[test]
    fn test_queue_options() {
        let options = QueueOptions::default();
        assert!(options.durable);
        assert_eq!(options.qos(), Qos::default());
        assert!(options.declare_options().durable);
        assert!(!options.declare_options().exclusive);

        let transient = QueueOptions::default().transient().raw();
        assert!(!transient.declare_options().durable);
        assert!(transient.raw);
    }
}
