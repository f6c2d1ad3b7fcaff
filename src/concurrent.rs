//! Run independent analytics on every tuple concurrently.
//!
//! ```text
//!           |-> isolate(1) -> pipeline 0 -> |
//! stream -> |-> isolate(1) -> pipeline 1 -> |-> barrier(10) -> combiner
//!           |-> isolate(1) -> pipeline 2 -> |
//! ```
//!
//! Each pipeline runs on its own isolate worker. The barrier pairs the n-th
//! result of every pipeline, so each pipeline must emit exactly one tuple per
//! input tuple. A pipeline that filters or duplicates tuples is not detected:
//! its slot drains or fills out of step with the others and every round
//! eventually stalls.

use tracing::debug;

use crate::barrier::barrier;
use crate::config::{CONCURRENT_BARRIER_CAPACITY, CONCURRENT_ISOLATE_CAPACITY};
use crate::error::{PlumbingError, Result};
use crate::isolate::isolate_bounded;
use crate::stream::{Stream, Tuple};

/// Builds one pipeline onto the stream it is given
pub type Pipeline<T, U> = Box<dyn FnOnce(Stream<T>) -> Stream<U>>;

/// A per-tuple function for [`concurrent_map`]. `None` means the mapper
/// produced no result, which fails that tuple.
pub type Mapper<T, U> = Box<dyn Fn(T) -> Option<U> + Send + Sync>;

/// Perform analytics concurrently.
///
/// Every tuple of `stream` is handed to each of `pipelines`, each pipeline
/// running on its own worker. The pipelines' results are joined into a list,
/// position i holding the result of `pipelines[i]`, and `combiner` builds the
/// result stream from the stream of lists.
///
/// Tuples are shared between the pipelines by cloning, so pipelines never see
/// each other's modifications.
pub fn concurrent<T, U, R, C>(
    stream: &Stream<T>,
    pipelines: Vec<Pipeline<T, U>>,
    combiner: C,
) -> Result<Stream<R>>
where
    T: Tuple,
    U: Tuple,
    R: Tuple,
    C: FnOnce(Stream<Vec<U>>) -> Stream<R>,
{
    if pipelines.is_empty() {
        return Err(PlumbingError::NoPipelines);
    }
    debug!(pipelines = pipelines.len(), "wiring concurrent pipelines");

    let results: Vec<Stream<U>> = pipelines
        .into_iter()
        .enumerate()
        .map(|(ch, pipeline)| {
            let fanout = isolate_bounded(stream, CONCURRENT_ISOLATE_CAPACITY)
                .tag(format!("concurrent.isolated-ch{ch}"));
            pipeline(fanout).tag(format!("concurrent-ch{ch}"))
        })
        .collect();

    let joined = barrier(&results, CONCURRENT_BARRIER_CAPACITY)?.tag("concurrent.barrier");
    Ok(combiner(joined))
}

/// Perform per-tuple analytics concurrently.
///
/// Logically the same as [`concurrent`] with one `s.try_map(mapper)` pipeline
/// per mapper and `s.map(combiner)` as the combiner. The combiner receives the
/// mapper results in mapper order.
///
/// Each mapper must return a result. A mapper returning `None` fails that
/// tuple with [`PlumbingError::MissingResult`] on the mapper's worker, which
/// stops that pipeline.
pub fn concurrent_map<T, U, R, C>(
    stream: &Stream<T>,
    mappers: Vec<Mapper<T, U>>,
    combiner: C,
) -> Result<Stream<R>>
where
    T: Tuple,
    U: Tuple,
    R: Tuple,
    C: Fn(Vec<U>) -> R + Send + Sync + 'static,
{
    let pipelines: Vec<Pipeline<T, U>> = mappers
        .into_iter()
        .enumerate()
        .map(|(index, mapper)| -> Pipeline<T, U> {
            Box::new(move |s: Stream<T>| {
                s.try_map(move |tuple| mapper(tuple).ok_or(PlumbingError::MissingResult { index }))
            })
        })
        .collect();

    concurrent(stream, pipelines, move |joined| joined.map(combiner))
}
