//! Handler shapes: the four transform flavors supported by a transfer.
//!
//! The shape is bound once when the handler is constructed, not inspected
//! per item, so the hot path is a single match on a closed enum. A map
//! handler returning `None` produces nothing downstream; pipes whose item
//! type is itself an `Option` forward an absent value as `Some(None)`.

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use snafu::prelude::*;

use crate::error::{BoxError, DataTransformerSnafu, TransferError};

type MapFn<In, Out> = Box<dyn FnMut(In) -> Result<Option<Out>, BoxError> + Send>;
type AsyncMapFn<In, Out> =
    Box<dyn FnMut(In) -> BoxFuture<'static, Result<Option<Out>, BoxError>> + Send>;
type ExpandFn<In, Out> = Box<dyn FnMut(In) -> Result<Vec<Out>, BoxError> + Send>;
type StreamFn<In, Out> = Box<dyn FnMut(In) -> BoxStream<'static, Result<Out, BoxError>> + Send>;

enum Shape<In, Out> {
    /// One item in, at most one item out.
    Map(MapFn<In, Out>),
    /// One item in, a future resolving to at most one item out.
    AsyncMap(AsyncMapFn<In, Out>),
    /// One item in, a finite sequence out.
    Expand(ExpandFn<In, Out>),
    /// One item in, a sequence delivered over time.
    Stream(StreamFn<In, Out>),
}

/// What a handler produced for one input item.
pub(crate) enum Applied<Out> {
    /// The handler produced nothing for this item.
    Skipped,
    One(Out),
    Many(Vec<Out>),
    Stream(BoxStream<'static, Result<Out, BoxError>>),
}

impl<Out: std::fmt::Debug> std::fmt::Debug for Applied<Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Applied::Skipped => f.write_str("Skipped"),
            Applied::One(out) => f.debug_tuple("One").field(out).finish(),
            Applied::Many(items) => f.debug_tuple("Many").field(items).finish(),
            Applied::Stream(_) => f.debug_struct("Stream").finish_non_exhaustive(),
        }
    }
}

/// A transform bound to one of the four supported shapes.
pub struct Handler<In, Out> {
    shape: Shape<In, Out>,
}

impl<In, Out> Handler<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    /// One-to-one transform.
    pub fn map<F>(mut transform: F) -> Self
    where
        F: FnMut(In) -> Out + Send + 'static,
    {
        Self {
            shape: Shape::Map(Box::new(move |item| Ok(Some(transform(item))))),
        }
    }

    /// One-to-one transform that may skip items.
    pub fn filter_map<F>(mut transform: F) -> Self
    where
        F: FnMut(In) -> Option<Out> + Send + 'static,
    {
        Self {
            shape: Shape::Map(Box::new(move |item| Ok(transform(item)))),
        }
    }

    /// Fallible one-to-one transform that may skip items.
    pub fn try_map<F>(transform: F) -> Self
    where
        F: FnMut(In) -> Result<Option<Out>, BoxError> + Send + 'static,
    {
        Self {
            shape: Shape::Map(Box::new(transform)),
        }
    }

    /// Suspending one-to-one transform.
    pub fn then<F, Fut>(mut transform: F) -> Self
    where
        F: FnMut(In) -> Fut + Send + 'static,
        Fut: Future<Output = Out> + Send + 'static,
    {
        Self {
            shape: Shape::AsyncMap(Box::new(move |item| {
                let future = transform(item);
                Box::pin(async move { Ok(Some(future.await)) })
            })),
        }
    }

    /// Fallible suspending transform that may skip items.
    pub fn try_then<F, Fut>(mut transform: F) -> Self
    where
        F: FnMut(In) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<Out>, BoxError>> + Send + 'static,
    {
        Self {
            shape: Shape::AsyncMap(Box::new(move |item| Box::pin(transform(item)))),
        }
    }

    /// One-to-many transform producing a finite sequence.
    pub fn expand<F, I>(mut transform: F) -> Self
    where
        F: FnMut(In) -> I + Send + 'static,
        I: IntoIterator<Item = Out>,
    {
        Self {
            shape: Shape::Expand(Box::new(move |item| {
                Ok(transform(item).into_iter().collect())
            })),
        }
    }

    /// Fallible one-to-many transform producing a finite sequence.
    pub fn try_expand<F>(transform: F) -> Self
    where
        F: FnMut(In) -> Result<Vec<Out>, BoxError> + Send + 'static,
    {
        Self {
            shape: Shape::Expand(Box::new(transform)),
        }
    }

    /// One-to-many transform producing items over time.
    pub fn stream<F>(transform: F) -> Self
    where
        F: FnMut(In) -> BoxStream<'static, Result<Out, BoxError>> + Send + 'static,
    {
        Self {
            shape: Shape::Stream(Box::new(transform)),
        }
    }

    /// Apply the handler to one item.
    ///
    /// Failures invoking the handler are [`TransferError::DataTransformer`];
    /// failures while the caller drains an expanded result surface as
    /// [`TransferError::DataGenerator`].
    pub(crate) async fn apply(&mut self, item: In) -> Result<Applied<Out>, TransferError> {
        match &mut self.shape {
            Shape::Map(transform) => match transform(item).context(DataTransformerSnafu)? {
                Some(out) => Ok(Applied::One(out)),
                None => Ok(Applied::Skipped),
            },
            Shape::AsyncMap(transform) => {
                match transform(item).await.context(DataTransformerSnafu)? {
                    Some(out) => Ok(Applied::One(out)),
                    None => Ok(Applied::Skipped),
                }
            }
            Shape::Expand(transform) => {
                let items = transform(item).context(DataTransformerSnafu)?;
                Ok(Applied::Many(items))
            }
            Shape::Stream(transform) => Ok(Applied::Stream(transform(item))),
        }
    }
}

impl<T> Handler<T, T>
where
    T: Send + 'static,
{
    /// Pass items through unchanged.
    pub fn identity() -> Self {
        Self::map(|item| item)
    }
}

impl<In, Out> std::fmt::Debug for Handler<In, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shape = match self.shape {
            Shape::Map(_) => "map",
            Shape::AsyncMap(_) => "async_map",
            Shape::Expand(_) => "expand",
            Shape::Stream(_) => "stream",
        };
        f.debug_struct("Handler").field("shape", &shape).finish()
    }
}
