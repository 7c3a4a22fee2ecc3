use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};

use crate::codec::{AnyCodec, Codec};
use crate::error::*;

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Vec<u8>, RpcError>> + Send>>;

/// A registered method: decodes the argument with the connection's codec,
/// invokes the handler, encodes the reply. The receiver is captured inside.
pub type MethodHandler = Arc<dyn Fn(AnyCodec, Vec<u8>) -> HandlerFuture + Send + Sync>;

/// A named set of methods bound to one receiver, produced by
/// [ServiceBuilder]. Dispatch identity is the author-supplied method name,
/// not any runtime symbol.
pub struct Service {
    name: String,
    methods: HashMap<String, MethodHandler>,
}

impl Service {
    /// Start building a service from a receiver value. The service name
    /// defaults to the receiver's bare type name.
    pub fn builder<S: Send + Sync + 'static>(receiver: S) -> ServiceBuilder<S> {
        let full = std::any::type_name::<S>();
        let name = full.rsplit("::").next().unwrap_or(full);
        ServiceBuilder {
            name: name.to_string(),
            receiver: Arc::new(receiver),
            methods: HashMap::new(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn method(&self, name: &str) -> Option<MethodHandler> {
        self.methods.get(name).cloned()
    }

    /// Method names in sorted order, for the debug page.
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Builds the method table for one receiver.
///
/// A method takes the receiver and one argument value, and returns one
/// `Result<Reply, RpcError>`. The argument starts from its zeroed
/// (`Default`) state on each invocation, so a request with an empty body
/// still dispatches.
pub struct ServiceBuilder<S> {
    name: String,
    receiver: Arc<S>,
    methods: HashMap<String, MethodHandler>,
}

impl<S: Send + Sync + 'static> ServiceBuilder<S> {
    /// Override the service name derived from the receiver type.
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn method<A, R, F, Fut>(mut self, name: &str, f: F) -> Self
    where
        A: DeserializeOwned + Default + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Arc<S>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
    {
        let receiver = self.receiver.clone();
        let handler: MethodHandler = Arc::new(move |codec: AnyCodec, body: Vec<u8>| -> HandlerFuture {
            let argv: A = if body.is_empty() {
                A::default()
            } else {
                match codec.decode::<A>(&body) {
                    Ok(v) => v,
                    Err(()) => return Box::pin(async { Err(RPC_ERR_BODY_DECODE) }),
                }
            };
            let fut = f(receiver.clone(), argv);
            Box::pin(async move {
                let replyv = fut.await?;
                codec.encode(&replyv).map_err(|_| RPC_ERR_ENCODE)
            })
        });
        self.methods.insert(name.to_string(), handler);
        self
    }

    pub fn finish(self) -> Service {
        Service { name: self.name, methods: self.methods }
    }
}

/// Split "Service.Method" at the last dot. Ill-formed names, unknown
/// services and unknown methods yield distinct errors.
pub fn split_service_method(service_method: &str) -> Result<(&str, &str), RpcError> {
    match service_method.rfind('.') {
        None => Err(RpcError::Rpc(ERR_ILL_SERVICE_METHOD)),
        Some(dot) => {
            let (service, method) = (&service_method[..dot], &service_method[dot + 1..]);
            if service.is_empty() || method.is_empty() {
                return Err(RpcError::Rpc(ERR_ILL_SERVICE_METHOD));
            }
            Ok((service, method))
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::codec::CodecKind;

    struct Arith;

    impl Arith {
        async fn mul(&self, args: (i64, i64)) -> Result<i64, RpcError> {
            Ok(args.0 * args.1)
        }
    }

    #[test]
    fn test_split_service_method() {
        assert_eq!(split_service_method("Foo.Sum").unwrap(), ("Foo", "Sum"));
        assert_eq!(split_service_method("a.b.C").unwrap(), ("a.b", "C"));
        assert!(split_service_method("NoDot").is_err());
        assert!(split_service_method("Trailing.").is_err());
        assert!(split_service_method(".Leading").is_err());
    }

    #[test]
    fn test_builder_names() {
        let svc = Service::builder(Arith)
            .method("Mul", |s: Arc<Arith>, args: (i64, i64)| async move { s.mul(args).await })
            .finish();
        assert_eq!(svc.name(), "Arith");
        assert_eq!(svc.method_names(), vec!["Mul".to_string()]);
        assert!(svc.method("Mul").is_some());
        assert!(svc.method("Div").is_none());
    }

    #[tokio::test]
    async fn test_handler_invoke() {
        let svc = Service::builder(Arith)
            .method("Mul", |s: Arc<Arith>, args: (i64, i64)| async move { s.mul(args).await })
            .finish();
        let codec = AnyCodec::new(CodecKind::Gob);
        let handler = svc.method("Mul").unwrap();
        let body = codec.encode(&(6i64, 7i64)).unwrap();
        let reply = handler(codec, body).await.unwrap();
        let v: i64 = codec.decode(&reply).unwrap();
        assert_eq!(v, 42);

        // a garbage body surfaces as a decode error, not a crash
        let err = handler(codec, b"\xc1\xc1".to_vec()).await.unwrap_err();
        assert_eq!(err, RPC_ERR_BODY_DECODE);
    }
}
