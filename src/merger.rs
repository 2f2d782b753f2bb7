//! Binary heap merger.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::marker::PhantomData;

use log;

use crate::serializer::Serializer;
use crate::SortError;

/// Merge strategy. Reopens spilled partitions and merges them into a single sorted stream.
pub trait Merge<T, S, K, F>
where
    S: Serializer<T>,
{
    type Merged: Iterator<Item = Result<T, SortError>>;

    /// Merges partitions sorted by `key` (in descending order if `reverse` is set).
    fn merge(
        &self,
        serializer: &mut S,
        handles: Vec<S::Handle>,
        key: F,
        reverse: bool,
    ) -> Result<Self::Merged, SortError>;
}

/// Default merge strategy: every partition is loaded up front and merged by a [`BinaryHeapMerger`].
#[derive(Clone, Copy, Debug, Default)]
pub struct HeapMerge;

impl<T, S, K, F> Merge<T, S, K, F> for HeapMerge
where
    S: Serializer<T>,
    K: Ord,
    F: Fn(&T) -> K,
{
    type Merged = BinaryHeapMerger<T, SortError, K, F, S::Reader>;

    fn merge(
        &self,
        serializer: &mut S,
        handles: Vec<S::Handle>,
        key: F,
        reverse: bool,
    ) -> Result<Self::Merged, SortError> {
        log::debug!("merging {} partitions", handles.len());

        let mut sources = Vec::with_capacity(handles.len());
        for handle in handles {
            sources.push(serializer.load(handle)?);
        }

        return Ok(BinaryHeapMerger::new(sources, key, reverse));
    }
}

/// Heap entry: the current head of a source and its comparison key.
struct MergeSource<T, K> {
    key: K,
    /// Source position, used as a tie-break so that equal keys keep the source order.
    index: usize,
    reverse: bool,
    head: T,
}

impl<T, K: Ord> Ord for MergeSource<T, K> {
    fn cmp(&self, other: &Self) -> Ordering {
        // binary heap is max-heap by default so the key order is reversed for ascending output
        let by_key = if self.reverse {
            self.key.cmp(&other.key)
        } else {
            other.key.cmp(&self.key)
        };

        by_key.then_with(|| other.index.cmp(&self.index))
    }
}

impl<T, K: Ord> PartialOrd for MergeSource<T, K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T, K: Ord> PartialEq for MergeSource<T, K> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T, K: Ord> Eq for MergeSource<T, K> {}

/// Binary heap merger implementation.
/// Merges multiple sorted inputs into a single sorted output.
/// Time complexity is *m* \* log(*n*) in worst case where *m* is the number of items,
/// *n* is the number of chunks (inputs).
///
/// The merger is a single-pass iterator: once it returned [`None`] or an error it stays exhausted.
pub struct BinaryHeapMerger<T, E, K, F, C>
where
    K: Ord,
    F: Fn(&T) -> K,
    C: Iterator<Item = Result<T, E>>,
{
    items: BinaryHeap<MergeSource<T, K>>,
    // exhausted sources are dropped
    sources: Vec<Option<C>>,
    key: F,
    reverse: bool,
    initiated: bool,
    finished: bool,

    error_type: PhantomData<fn() -> E>,
}

impl<T, E, K, F, C> BinaryHeapMerger<T, E, K, F, C>
where
    K: Ord,
    F: Fn(&T) -> K,
    C: Iterator<Item = Result<T, E>>,
{
    /// Creates an instance of a binary heap merger using chunks as inputs.
    /// Chunk items should be sorted by `key` in ascending order (descending if `reverse` is set)
    /// otherwise the result is undefined.
    ///
    /// # Arguments
    /// * `chunks` - Chunks to be merged in a single sorted one
    /// * `key` - Function extracting the comparison key of an item
    /// * `reverse` - Merge in descending order
    pub fn new<I>(chunks: I, key: F, reverse: bool) -> Self
    where
        I: IntoIterator,
        I::Item: IntoIterator<IntoIter = C, Item = Result<T, E>>,
    {
        let sources = Vec::from_iter(chunks.into_iter().map(|c| Some(c.into_iter())));
        let items = BinaryHeap::with_capacity(sources.len());

        return BinaryHeapMerger {
            items,
            sources,
            key,
            reverse,
            initiated: false,
            finished: false,
            error_type: PhantomData,
        };
    }

    /// Returns the number of sources that still have items, i.e. the current heap size.
    pub fn active_sources(&self) -> usize {
        self.items.len()
    }

    /// Pulls the next item of a source into the heap. Returns an error if the source failed.
    fn advance(&mut self, index: usize) -> Result<(), E> {
        let next = match self.sources[index].as_mut() {
            Some(source) => source.next(),
            None => return Ok(()),
        };

        match next {
            Some(Ok(head)) => {
                self.items.push(MergeSource {
                    key: (self.key)(&head),
                    index,
                    reverse: self.reverse,
                    head,
                });
            }
            Some(Err(err)) => return Err(err),
            None => self.sources[index] = None,
        }

        return Ok(());
    }

    fn fail(&mut self, err: E) -> Option<Result<T, E>> {
        self.finished = true;
        self.items.clear();
        self.sources.clear();

        Some(Err(err))
    }
}

impl<T, E, K, F, C> Iterator for BinaryHeapMerger<T, E, K, F, C>
where
    K: Ord,
    F: Fn(&T) -> K,
    C: Iterator<Item = Result<T, E>>,
{
    type Item = Result<T, E>;

    /// Returns the next item from the inputs in sorted order.
    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        if !self.initiated {
            self.initiated = true;
            for idx in 0..self.sources.len() {
                if let Err(err) = self.advance(idx) {
                    return self.fail(err);
                }
            }
        }

        let result = match self.items.pop() {
            Some(result) => result,
            None => {
                self.finished = true;
                self.sources.clear();
                return None;
            }
        };

        if let Err(err) = self.advance(result.index) {
            return self.fail(err);
        }

        return Some(Ok(result.head));
    }
}
