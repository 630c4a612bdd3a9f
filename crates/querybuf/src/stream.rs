//! Related-row streams and per-navigation loaders.
//!
//! Merge inclusion consumes a single stream per include site, correlated and
//! sorted by the outer key. The legacy includer instead asks a loader for the
//! rows matching one outer entity at a time.

use crate::identity_map::IncludeKeyComparer;
use querybuf_core::{Cx, EntityLoadInfo, Error, Outcome, Result};
use std::future::Future;
use std::pin::Pin;

/// A boxed future borrowing from its stream and context.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// A synchronous related-row stream.
pub type RelatedStream = Box<dyn Iterator<Item = Result<EntityLoadInfo>> + Send>;

/// An asynchronous related-row stream.
///
/// `next` is the only point at which async inclusion suspends.
pub trait AsyncRelatedStream: Send {
    /// Fetch the next element, `Ok(None)` once drained.
    fn next<'a>(&'a mut self, cx: &'a Cx) -> BoxFuture<'a, Outcome<Option<EntityLoadInfo>, Error>>;
}

/// Adapts a synchronous iterator into an [`AsyncRelatedStream`].
pub struct IterStream<I> {
    inner: I,
}

impl<I> IterStream<I>
where
    I: Iterator<Item = Result<EntityLoadInfo>> + Send,
{
    pub fn new(inner: I) -> Self {
        Self { inner }
    }
}

impl<I> AsyncRelatedStream for IterStream<I>
where
    I: Iterator<Item = Result<EntityLoadInfo>> + Send,
{
    fn next<'a>(&'a mut self, _cx: &'a Cx) -> BoxFuture<'a, Outcome<Option<EntityLoadInfo>, Error>> {
        let item = match self.inner.next() {
            None => Outcome::Ok(None),
            Some(Ok(info)) => Outcome::Ok(Some(info)),
            Some(Err(e)) => Outcome::Err(e),
        };
        Box::pin(async move { item })
    }
}

/// Loads the related rows for one outer entity (legacy inclusion).
pub trait RelatedEntitiesLoader: Send {
    fn load(&mut self, comparer: IncludeKeyComparer) -> RelatedStream;
}

/// Asynchronous counterpart of [`RelatedEntitiesLoader`].
pub trait AsyncRelatedEntitiesLoader: Send {
    fn load(&mut self, comparer: IncludeKeyComparer) -> Box<dyn AsyncRelatedStream>;
}

/// A loader over an in-memory result set, filtered per outer entity.
#[derive(Clone, Default)]
pub struct RowsLoader {
    rows: Vec<EntityLoadInfo>,
}

impl RowsLoader {
    pub fn new(rows: Vec<EntityLoadInfo>) -> Self {
        Self { rows }
    }

    fn matching(&self, comparer: IncludeKeyComparer) -> RelatedStream {
        let rows = self.rows.clone();
        Box::new(rows.into_iter().filter_map(move |info| {
            match comparer.should_include(info.row()) {
                Ok(true) => Some(Ok(info)),
                Ok(false) => None,
                Err(e) => Some(Err(e)),
            }
        }))
    }
}

impl RelatedEntitiesLoader for RowsLoader {
    fn load(&mut self, comparer: IncludeKeyComparer) -> RelatedStream {
        self.matching(comparer)
    }
}

impl AsyncRelatedEntitiesLoader for RowsLoader {
    fn load(&mut self, comparer: IncludeKeyComparer) -> Box<dyn AsyncRelatedStream> {
        Box::new(IterStream::new(self.matching(comparer)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use querybuf_core::{EntityRef, Materializer, Row, Value, new_entity};
    use std::sync::Arc;

    use asupersync::runtime::RuntimeBuilder;

    fn info(v: i64) -> EntityLoadInfo {
        let materializer: Materializer =
            Arc::new(|_row: &Row| -> Result<EntityRef> { Ok(new_entity(())) });
        EntityLoadInfo::new(Row::from_values(vec![Value::BigInt(v)]), materializer)
    }

    #[test]
    fn iter_stream_yields_then_drains() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        rt.block_on(async {
            let mut stream = IterStream::new(vec![Ok(info(1)), Ok(info(2))].into_iter());
            let mut seen = Vec::new();
            loop {
                match stream.next(&cx).await {
                    Outcome::Ok(Some(i)) => seen.push(i.row().get(0).cloned()),
                    Outcome::Ok(None) => break,
                    _ => panic!("unexpected outcome"),
                }
            }
            assert_eq!(seen, vec![Some(Value::BigInt(1)), Some(Value::BigInt(2))]);
        });
    }

    #[test]
    fn iter_stream_surfaces_errors() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        rt.block_on(async {
            let mut stream = IterStream::new(
                vec![Err(Error::Custom("reader reset".into()))].into_iter(),
            );
            assert!(matches!(stream.next(&cx).await, Outcome::Err(Error::Custom(_))));
        });
    }
}
