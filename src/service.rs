//! Typed services and their method table.
//!
//! A [`Service`] is a named, ordered table of methods. Each method is stored
//! as a boxed invoker that decodes its arguments, runs the typed handler, and
//! encodes the reply, so dispatch never inspects types at runtime: the server
//! hands raw body bytes to the invoker and writes back whatever bytes come
//! out.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::CodecKind;
use crate::error::Result;

type Invoker = Box<dyn Fn(Bytes, CodecKind) -> BoxFuture<'static, Result<Bytes>> + Send + Sync>;

/// One registered method: its invoker plus a call counter.
pub struct MethodEntry {
    name: String,
    invoker: Invoker,
    num_calls: AtomicU64,
}

impl MethodEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of invocations so far.
    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }

    /// Builds the invocation future for one request. The counter ticks here,
    /// whether or not the handler ends up succeeding.
    pub(crate) fn invoke(&self, args: Bytes, kind: CodecKind) -> BoxFuture<'static, Result<Bytes>> {
        self.num_calls.fetch_add(1, Ordering::Relaxed);
        (self.invoker)(args, kind)
    }
}

/// A named collection of methods, registered with a server as one unit.
///
/// ```rust,ignore
/// let service = Service::new("Arith")
///     .method("Sum", |args: Args| async move { Ok(args.num1 + args.num2) });
/// server.register(service)?;
/// ```
pub struct Service {
    name: String,
    methods: BTreeMap<String, MethodEntry>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: BTreeMap::new(),
        }
    }

    /// Registers a typed method under `name`.
    ///
    /// The handler receives the decoded arguments and returns the reply or an
    /// error; the error's message travels back to the caller in the response
    /// header. Registering the same name twice keeps the later handler.
    pub fn method<A, R, F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let name = name.into();
        let handler = Arc::new(handler);
        let invoker: Invoker = Box::new(move |args: Bytes, kind: CodecKind| {
            let handler = handler.clone();
            Box::pin(async move {
                let args: A = kind.decode(&args)?;
                let reply = handler(args).await?;
                kind.encode(&reply)
            })
        });
        self.methods.insert(
            name.clone(),
            MethodEntry {
                name,
                invoker,
                num_calls: AtomicU64::new(0),
            },
        );
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks a method up by name.
    pub fn lookup(&self, method: &str) -> Option<&MethodEntry> {
        self.methods.get(method)
    }

    /// Methods in name order.
    pub fn methods(&self) -> impl Iterator<Item = &MethodEntry> {
        self.methods.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    struct Args {
        num1: i32,
        num2: i32,
    }

    fn arith() -> Service {
        Service::new("Arith")
            .method("Sum", |args: Args| async move { Ok(args.num1 + args.num2) })
            .method("Swap", |args: Args| async move {
                Ok(Args {
                    num1: args.num2,
                    num2: args.num1,
                })
            })
    }

    #[tokio::test]
    async fn test_service_call() {
        let service = arith();
        let entry = service.lookup("Sum").unwrap();

        let kind = CodecKind::Bincode;
        let args = kind.encode(&Args { num1: 1, num2: 3 }).unwrap();
        let reply = entry.invoke(args, kind).await.unwrap();

        let sum: i32 = kind.decode(&reply).unwrap();
        assert_eq!(sum, 4);
        assert_eq!(entry.num_calls(), 1);
    }

    #[tokio::test]
    async fn test_service_call_swap() {
        let service = arith();
        let entry = service.lookup("Swap").unwrap();

        let kind = CodecKind::Json;
        let args = kind.encode(&Args { num1: 1, num2: 3 }).unwrap();
        let reply = entry.invoke(args, kind).await.unwrap();

        let swapped: Args = kind.decode(&reply).unwrap();
        assert_eq!(swapped, Args { num1: 3, num2: 1 });
    }

    #[tokio::test]
    async fn test_handler_error_propagates() {
        let service = Service::new("Faulty").method("Fail", |_: Args| async move {
            Err::<i32, _>(crate::error::Error::remote("nope"))
        });
        let entry = service.lookup("Fail").unwrap();

        let kind = CodecKind::Bincode;
        let args = kind.encode(&Args { num1: 0, num2: 0 }).unwrap();
        let err = entry.invoke(args, kind).await.unwrap_err();
        assert_eq!(err.to_string(), "nope");
        assert_eq!(entry.num_calls(), 1);
    }

    #[tokio::test]
    async fn test_bad_args_decode_is_error() {
        let service = arith();
        let entry = service.lookup("Sum").unwrap();

        let err = entry
            .invoke(Bytes::from_static(b"{"), CodecKind::Json)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::Json(_)));
    }

    #[test]
    fn test_methods_ordered_by_name() {
        let service = arith();
        let names: Vec<&str> = service.methods().map(|m| m.name()).collect();
        assert_eq!(names, vec!["Sum", "Swap"]);
    }

    #[test]
    fn test_lookup_unknown() {
        assert!(arith().lookup("Mul").is_none());
    }
}
