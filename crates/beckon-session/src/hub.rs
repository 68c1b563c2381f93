//! Hub method table.
//!
//! A [`Hub`] is the server-resident object whose registered methods clients
//! can invoke. Methods are registered once on a [`HubBuilder`] and indexed
//! by canonical lower-case name; each entry caches its parameter kinds and
//! a type-erased caller so the dispatch path never inspects signatures.
//!
//! The hub instance is shared by every invocation on a connection; per-call
//! mutable state belongs in the method's own captures or the connection
//! context, not on the hub.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use futures_util::Stream;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::bind::{BindError, HubArgument, ParamKind};

/// Future produced by a registered method: binds, runs, and serializes.
pub type MethodFuture = Pin<Box<dyn Future<Output = Result<MethodReply, CallFault>> + Send>>;

/// A streaming method's output as dynamic values. An `Err` item is a
/// serialization failure that terminates the sequence.
pub type ValueStream = Pin<Box<dyn Stream<Item = Result<Value, String>> + Send>>;

/// What a method call produced.
pub enum MethodReply {
    /// A single serialized return value. Unit returns serialize to null.
    Value(Value),
    /// A lazy sequence of serialized values.
    Stream(ValueStream),
}

/// Failure raised by the method machinery itself, as opposed to a panic in
/// user code.
#[derive(Debug)]
pub enum CallFault {
    Bind(BindError),
    Encode(String),
}

impl std::fmt::Display for CallFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallFault::Bind(e) => write!(f, "{e}"),
            CallFault::Encode(detail) => write!(f, "cannot serialize return value: {detail}"),
        }
    }
}

impl std::error::Error for CallFault {}

// ============================================================================
// Streaming returns
// ============================================================================

/// Handle to a finite or infinite sequence of values produced by a hub
/// method. Returned from methods registered with [`HubBuilder::streaming`].
pub struct Streaming<T> {
    rx: mpsc::Receiver<T>,
}

/// Producer half of a [`Streaming`] sequence.
pub struct StreamSender<T> {
    tx: mpsc::Sender<T>,
}

/// The consumer of a stream is gone; the producer should stop.
#[derive(Debug)]
pub struct StreamClosed;

impl std::fmt::Display for StreamClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream consumer is gone")
    }
}

impl std::error::Error for StreamClosed {}

/// Create a bounded stream pair for a streaming hub method.
///
/// The producer keeps the [`StreamSender`]; the [`Streaming`] handle is the
/// method's return value. Dropping the sender ends the sequence.
pub fn stream<T>(capacity: usize) -> (StreamSender<T>, Streaming<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (StreamSender { tx }, Streaming { rx })
}

impl<T> StreamSender<T> {
    /// Send one element, waiting for buffer space.
    pub async fn send(&self, item: T) -> Result<(), StreamClosed> {
        self.tx.send(item).await.map_err(|_| StreamClosed)
    }
}

impl<T> Streaming<T>
where
    T: Serialize + Send + 'static,
{
    fn into_value_stream(self) -> ValueStream {
        Box::pin(futures_util::stream::unfold(self.rx, |mut rx| async move {
            match rx.recv().await {
                Some(item) => {
                    let value = serde_json::to_value(&item).map_err(|e| e.to_string());
                    Some((value, rx))
                }
                None => None,
            }
        }))
    }
}

// ============================================================================
// Registration traits
// ============================================================================

/// A closure registrable as a non-streaming hub method.
///
/// Implemented for `Fn` closures of up to four parameters whose parameter
/// types implement [`HubArgument`] and whose future resolves to any
/// serializable value (unit and tuples included).
pub trait HubMethod<Args>: Send + Sync + 'static {
    fn param_kinds() -> Vec<ParamKind>;
    fn invoke(&self, args: Vec<Value>) -> MethodFuture;
}

/// A closure registrable as a streaming hub method: its future resolves to
/// a [`Streaming`] handle.
pub trait StreamingHubMethod<Args>: Send + Sync + 'static {
    fn param_kinds() -> Vec<ParamKind>;
    fn invoke(&self, args: Vec<Value>) -> MethodFuture;
}

macro_rules! bind_args {
    ($args:ident, $($idx:tt $arg:ident),*) => {{
        let expected = 0usize $(+ {
            let _ = stringify!($arg);
            1usize
        })*;
        if $args.len() != expected {
            return Box::pin(std::future::ready(Err(CallFault::Bind(
                BindError::CountMismatch {
                    expected,
                    got: $args.len(),
                },
            ))));
        }
        let bound: Result<($($arg,)*), BindError> = (|| {
            Ok(($(
                <$arg as HubArgument>::bind(&$args[$idx])
                    .map_err(|detail| BindError::Argument { index: $idx, detail })?,
            )*))
        })();
        match bound {
            Ok(tuple) => tuple,
            Err(e) => {
                return Box::pin(std::future::ready(Err(CallFault::Bind(e))));
            }
        }
    }};
}

macro_rules! impl_hub_method {
    ($($idx:tt $arg:ident $var:ident),*) => {
        impl<F, Fut, R, $($arg,)*> HubMethod<($($arg,)*)> for F
        where
            F: Fn($($arg),*) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = R> + Send + 'static,
            R: Serialize + Send + 'static,
            $($arg: HubArgument + 'static,)*
        {
            fn param_kinds() -> Vec<ParamKind> {
                vec![$(<$arg as HubArgument>::KIND),*]
            }

            #[allow(unused_variables)]
            fn invoke(&self, args: Vec<Value>) -> MethodFuture {
                let ($($var,)*) = bind_args!(args, $($idx $arg),*);
                let fut = (self)($($var),*);
                Box::pin(async move {
                    let value = fut.await;
                    let json = serde_json::to_value(&value)
                        .map_err(|e| CallFault::Encode(e.to_string()))?;
                    Ok(MethodReply::Value(json))
                })
            }
        }

        impl<F, Fut, T, $($arg,)*> StreamingHubMethod<($($arg,)*)> for F
        where
            F: Fn($($arg),*) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Streaming<T>> + Send + 'static,
            T: Serialize + Send + 'static,
            $($arg: HubArgument + 'static,)*
        {
            fn param_kinds() -> Vec<ParamKind> {
                vec![$(<$arg as HubArgument>::KIND),*]
            }

            #[allow(unused_variables)]
            fn invoke(&self, args: Vec<Value>) -> MethodFuture {
                let ($($var,)*) = bind_args!(args, $($idx $arg),*);
                let fut = (self)($($var),*);
                Box::pin(async move {
                    let streaming = fut.await;
                    Ok(MethodReply::Stream(streaming.into_value_stream()))
                })
            }
        }
    };
}

impl_hub_method!();
impl_hub_method!(0 A0 a0);
impl_hub_method!(0 A0 a0, 1 A1 a1);
impl_hub_method!(0 A0 a0, 1 A1 a1, 2 A2 a2);
impl_hub_method!(0 A0 a0, 1 A1 a1, 2 A2 a2, 3 A3 a3);

// ============================================================================
// Hub and builder
// ============================================================================

pub(crate) struct MethodEntry {
    /// Name as registered, for error messages.
    name: String,
    param_kinds: Vec<ParamKind>,
    streaming: bool,
    invoke: Box<dyn Fn(Vec<Value>) -> MethodFuture + Send + Sync>,
}

impl MethodEntry {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    #[allow(dead_code)]
    pub(crate) fn param_kinds(&self) -> &[ParamKind] {
        &self.param_kinds
    }

    pub(crate) fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub(crate) fn invoke(&self, args: Vec<Value>) -> MethodFuture {
        (self.invoke)(args)
    }
}

/// An immutable table of invokable methods.
pub struct Hub {
    methods: HashMap<String, MethodEntry>,
}

impl Hub {
    pub fn builder() -> HubBuilder {
        HubBuilder {
            methods: HashMap::new(),
        }
    }

    /// Look up a method by wire name. Matching is case-insensitive.
    pub(crate) fn method(&self, target: &str) -> Option<&MethodEntry> {
        self.methods.get(&target.to_lowercase())
    }

    /// Whether a method with this name is registered.
    pub fn contains(&self, target: &str) -> bool {
        self.methods.contains_key(&target.to_lowercase())
    }
}

/// Builder for a [`Hub`].
///
/// # Example
///
/// ```ignore
/// let hub = Hub::builder()
///     .method("Add", |a: i64, b: i64| async move { a + b })
///     .streaming("Counter", |n: u32| async move {
///         let (tx, rx) = beckon_session::stream(8);
///         tokio::spawn(async move {
///             for i in 0..n {
///                 if tx.send(i).await.is_err() {
///                     break;
///                 }
///             }
///         });
///         rx
///     })
///     .build();
/// ```
pub struct HubBuilder {
    methods: HashMap<String, MethodEntry>,
}

impl HubBuilder {
    /// Register a non-streaming method.
    ///
    /// # Panics
    ///
    /// Panics if a method with the same canonical name is already
    /// registered.
    pub fn method<F, Args>(mut self, name: &str, f: F) -> Self
    where
        F: HubMethod<Args>,
    {
        self.insert(
            name,
            MethodEntry {
                name: name.to_string(),
                param_kinds: F::param_kinds(),
                streaming: false,
                invoke: Box::new(move |args| f.invoke(args)),
            },
        );
        self
    }

    /// Register a streaming method: one whose future resolves to a
    /// [`Streaming`] handle.
    ///
    /// # Panics
    ///
    /// Panics if a method with the same canonical name is already
    /// registered.
    pub fn streaming<F, Args>(mut self, name: &str, f: F) -> Self
    where
        F: StreamingHubMethod<Args>,
    {
        self.insert(
            name,
            MethodEntry {
                name: name.to_string(),
                param_kinds: F::param_kinds(),
                streaming: true,
                invoke: Box::new(move |args| f.invoke(args)),
            },
        );
        self
    }

    pub fn build(self) -> Hub {
        Hub {
            methods: self.methods,
        }
    }

    fn insert(&mut self, name: &str, entry: MethodEntry) {
        let previous = self.methods.insert(name.to_lowercase(), entry);
        assert!(previous.is_none(), "hub method {name:?} registered twice");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use serde_json::json;

    #[test]
    fn lookup_is_case_insensitive() {
        let hub = Hub::builder()
            .method("SimpleInt", |v: i64| async move { v + 1 })
            .build();
        assert!(hub.method("simpleint").is_some());
        assert!(hub.method("SIMPLEINT").is_some());
        assert!(hub.method("missing").is_none());
    }

    #[test]
    fn entries_record_kinds_and_streaming_flag() {
        let hub = Hub::builder()
            .method("Concat", |a: String, b: String| async move { a + &b })
            .streaming("Ticks", || async {
                let (_tx, rx) = stream::<u32>(1);
                rx
            })
            .build();

        let concat = hub.method("concat").unwrap();
        assert_eq!(
            concat.param_kinds(),
            &[ParamKind::String, ParamKind::String]
        );
        assert!(!concat.is_streaming());

        let ticks = hub.method("ticks").unwrap();
        assert!(ticks.param_kinds().is_empty());
        assert!(ticks.is_streaming());
    }

    #[tokio::test]
    async fn invoke_binds_and_serializes() {
        let hub = Hub::builder()
            .method("SimpleFloat", |v: f64| async move { (v * 10.0, v * 100.0) })
            .build();
        let entry = hub.method("simplefloat").unwrap();

        let reply = entry.invoke(vec![json!(3.1415)]).await.unwrap();
        match reply {
            MethodReply::Value(v) => {
                assert_eq!(v, json!([3.1415 * 10.0, 3.1415 * 100.0]));
            }
            MethodReply::Stream(_) => panic!("unexpected stream reply"),
        }
    }

    #[tokio::test]
    async fn invoke_reports_arity_and_index() {
        let hub = Hub::builder()
            .method("SimpleInt", |v: i64| async move { v + 1 })
            .build();
        let entry = hub.method("simpleint").unwrap();

        match entry.invoke(vec![]).await {
            Err(CallFault::Bind(BindError::CountMismatch { expected: 1, got: 0 })) => {}
            other => panic!("unexpected outcome: {:?}", other.err()),
        }

        match entry.invoke(vec![json!("CantParse")]).await {
            Err(CallFault::Bind(BindError::Argument { index: 0, .. })) => {}
            other => panic!("unexpected outcome: {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn unit_returns_serialize_to_null() {
        let hub = Hub::builder().method("Simple", || async {}).build();
        let entry = hub.method("simple").unwrap();
        match entry.invoke(vec![]).await.unwrap() {
            MethodReply::Value(v) => assert!(v.is_null()),
            MethodReply::Stream(_) => panic!("unexpected stream reply"),
        }
    }

    #[tokio::test]
    async fn streaming_invoke_yields_values_then_ends() {
        let hub = Hub::builder()
            .streaming("Counter", |n: u32| async move {
                let (tx, rx) = stream(4);
                tokio::spawn(async move {
                    for i in 0..n {
                        if tx.send(i).await.is_err() {
                            break;
                        }
                    }
                });
                rx
            })
            .build();
        let entry = hub.method("counter").unwrap();

        let mut out = match entry.invoke(vec![json!(3)]).await.unwrap() {
            MethodReply::Stream(s) => s,
            MethodReply::Value(_) => panic!("unexpected value reply"),
        };
        let mut seen = Vec::new();
        while let Some(item) = out.next().await {
            seen.push(item.unwrap());
        }
        assert_eq!(seen, vec![json!(0), json!(1), json!(2)]);
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_registration_panics() {
        let _ = Hub::builder()
            .method("Ping", || async { "Pong" })
            .method("ping", || async { "pong" });
    }
}
