//! Input partitioning.
//!
//! A split strategy reads the input in consecutive chunks of `partition_size` items, sorts every
//! chunk in memory and spills it through the serializer. Only one chunk is kept in memory at a time.

use std::cmp::Ordering;
use std::error::Error;

use log;
use rayon::slice::ParallelSliceMut;

use crate::serializer::Serializer;
use crate::SortError;

/// Split strategy.
pub trait Split<T, S, K, F>
where
    S: Serializer<T>,
{
    /// Splits the input into sorted partitions returning their handles in input order.
    ///
    /// # Arguments
    /// * `serializer` - Serializer the partitions are spilled with
    /// * `partition_size` - Maximum number of items in a partition
    /// * `input` - Input stream data to be fetched from
    /// * `key` - Function extracting the comparison key of an item
    /// * `reverse` - Sort partitions in descending order
    fn split<I, E>(
        &self,
        serializer: &mut S,
        partition_size: usize,
        input: I,
        key: &F,
        reverse: bool,
    ) -> Result<Vec<S::Handle>, SortError>
    where
        I: IntoIterator<Item = Result<T, E>>,
        E: Error + Send + Sync + 'static;
}

/// Returns a stable comparator consistent with the key and the direction.
fn comparator<T, K, F>(key: &F, reverse: bool) -> impl Fn(&T, &T) -> Ordering + '_
where
    K: Ord,
    F: Fn(&T) -> K,
{
    move |a: &T, b: &T| {
        let ordering = key(a).cmp(&key(b));
        if reverse {
            ordering.reverse()
        } else {
            ordering
        }
    }
}

/// Partitioning loop shared by the strategies. `sort` is called for every chunk before it is spilled.
fn split_with<T, S, I, E>(
    serializer: &mut S,
    partition_size: usize,
    input: I,
    mut sort: impl FnMut(&mut Vec<T>),
) -> Result<Vec<S::Handle>, SortError>
where
    S: Serializer<T>,
    I: IntoIterator<Item = Result<T, E>>,
    E: Error + Send + Sync + 'static,
{
    if partition_size == 0 {
        return Err(SortError::Configuration("partition size must be positive".to_string()));
    }

    let mut chunk_buf = Vec::new();
    let mut handles = Vec::new();

    for item in input.into_iter() {
        match item {
            Ok(item) => chunk_buf.push(item),
            Err(err) => return Err(SortError::Input(Box::new(err))),
        }

        if chunk_buf.len() >= partition_size {
            handles.push(spill(serializer, &mut chunk_buf, &mut sort)?);
        }
    }

    if !chunk_buf.is_empty() {
        handles.push(spill(serializer, &mut chunk_buf, &mut sort)?);
    }

    log::debug!("input split into {} partitions", handles.len());

    return Ok(handles);
}

fn spill<T, S>(
    serializer: &mut S,
    chunk_buf: &mut Vec<T>,
    sort: &mut impl FnMut(&mut Vec<T>),
) -> Result<S::Handle, SortError>
where
    S: Serializer<T>,
{
    log::debug!("sorting partition data ({} items) ...", chunk_buf.len());
    sort(chunk_buf);

    log::debug!("saving partition data");
    // draining keeps the buffer allocation for the next partition
    serializer.dump(chunk_buf.drain(..))
}

/// Default split strategy. Partitions are sorted in the calling thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChunkSplitter;

impl<T, S, K, F> Split<T, S, K, F> for ChunkSplitter
where
    S: Serializer<T>,
    K: Ord,
    F: Fn(&T) -> K,
{
    fn split<I, E>(
        &self,
        serializer: &mut S,
        partition_size: usize,
        input: I,
        key: &F,
        reverse: bool,
    ) -> Result<Vec<S::Handle>, SortError>
    where
        I: IntoIterator<Item = Result<T, E>>,
        E: Error + Send + Sync + 'static,
    {
        let compare = comparator(key, reverse);
        split_with(serializer, partition_size, input, |chunk| chunk.sort_by(&compare))
    }
}

/// Split strategy sorting every partition in parallel using a dedicated thread pool.
/// Partitions are still produced one at a time.
pub struct ParallelChunkSplitter {
    thread_pool: rayon::ThreadPool,
}

impl ParallelChunkSplitter {
    /// Creates a new splitter.
    ///
    /// # Arguments
    /// * `threads_number` - Number of threads to be used to sort data in parallel. If the parameter is [`None`]
    ///   threads number will be selected based on available CPU core number.
    pub fn new(threads_number: Option<usize>) -> Result<Self, SortError> {
        let mut thread_pool_builder = rayon::ThreadPoolBuilder::new();

        if let Some(threads_number) = threads_number {
            log::info!("initializing thread-pool (threads: {})", threads_number);
            thread_pool_builder = thread_pool_builder.num_threads(threads_number);
        } else {
            log::info!("initializing thread-pool (threads: default)");
        }
        let thread_pool = thread_pool_builder.build().map_err(SortError::ThreadPoolBuild)?;

        return Ok(ParallelChunkSplitter { thread_pool });
    }
}

impl<T, S, K, F> Split<T, S, K, F> for ParallelChunkSplitter
where
    T: Send,
    S: Serializer<T>,
    K: Ord,
    F: Fn(&T) -> K + Sync,
{
    fn split<I, E>(
        &self,
        serializer: &mut S,
        partition_size: usize,
        input: I,
        key: &F,
        reverse: bool,
    ) -> Result<Vec<S::Handle>, SortError>
    where
        I: IntoIterator<Item = Result<T, E>>,
        E: Error + Send + Sync + 'static,
    {
        let compare = comparator(key, reverse);
        split_with(serializer, partition_size, input, |chunk| {
            self.thread_pool.install(|| chunk.par_sort_by(&compare))
        })
    }
}
