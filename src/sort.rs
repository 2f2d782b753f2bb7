//! External sorter.

use std::convert::Infallible;
use std::error::Error;

use log;

use crate::merger::{HeapMerge, Merge};
use crate::serializer::{RmpSerializerBuilder, Scope, Serializer, SerializerBuilder};
use crate::split::{ChunkSplitter, Split};
use crate::SortError;

/// Default number of items in a partition.
pub const DEFAULT_PARTITION_SIZE: usize = 8192;

/// External sorter builder. Provides methods for [`ExternalSorter`] initialization.
#[derive(Clone, Debug)]
pub struct ExternalSorterBuilder<B = RmpSerializerBuilder, P = ChunkSplitter, M = HeapMerge> {
    /// Maximum number of items sorted in memory at once.
    partition_size: usize,
    /// Serializer builder.
    serializer_builder: B,
    /// Split strategy.
    splitter: P,
    /// Merge strategy.
    merger: M,
}

impl ExternalSorterBuilder {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        ExternalSorterBuilder::default()
    }
}

impl Default for ExternalSorterBuilder {
    fn default() -> Self {
        ExternalSorterBuilder {
            partition_size: DEFAULT_PARTITION_SIZE,
            serializer_builder: RmpSerializerBuilder::default(),
            splitter: ChunkSplitter,
            merger: HeapMerge,
        }
    }
}

impl<B, P, M> ExternalSorterBuilder<B, P, M> {
    /// Builds an [`ExternalSorter`] instance using provided configuration.
    pub fn build(self) -> Result<ExternalSorter<B, P, M>, SortError> {
        ExternalSorter::new(self.partition_size, self.serializer_builder, self.splitter, self.merger)
    }

    /// Sets the maximum number of items in a partition.
    pub fn with_partition_size(mut self, partition_size: usize) -> ExternalSorterBuilder<B, P, M> {
        self.partition_size = partition_size;
        return self;
    }

    /// Sets serializer builder.
    pub fn with_serializer<B2>(self, serializer_builder: B2) -> ExternalSorterBuilder<B2, P, M> {
        ExternalSorterBuilder {
            partition_size: self.partition_size,
            serializer_builder,
            splitter: self.splitter,
            merger: self.merger,
        }
    }

    /// Sets split strategy.
    pub fn with_splitter<P2>(self, splitter: P2) -> ExternalSorterBuilder<B, P2, M> {
        ExternalSorterBuilder {
            partition_size: self.partition_size,
            serializer_builder: self.serializer_builder,
            splitter,
            merger: self.merger,
        }
    }

    /// Sets merge strategy.
    pub fn with_merger<M2>(self, merger: M2) -> ExternalSorterBuilder<B, P, M2> {
        ExternalSorterBuilder {
            partition_size: self.partition_size,
            serializer_builder: self.serializer_builder,
            splitter: self.splitter,
            merger,
        }
    }
}

/// External sorter.
///
/// Every sort call runs through `Splitting -> Merging -> Exhausted | Abandoned`:
/// the input is split into sorted partitions eagerly, then a lazy [`Sorted`] stream merges them.
/// Spilled partitions live until the stream is exhausted or dropped.
pub struct ExternalSorter<B = RmpSerializerBuilder, P = ChunkSplitter, M = HeapMerge> {
    /// Maximum number of items sorted in memory at once.
    partition_size: usize,
    /// Serializer builder.
    serializer_builder: B,
    /// Split strategy.
    splitter: P,
    /// Merge strategy.
    merger: M,
}

impl<B, P, M> ExternalSorter<B, P, M> {
    /// Creates a new external sorter instance.
    ///
    /// # Arguments
    /// * `partition_size` - Maximum number of items sorted in memory at once, must be positive.
    /// * `serializer_builder` - Builder of the serializer partitions are spilled with.
    /// * `splitter` - Split strategy.
    /// * `merger` - Merge strategy.
    pub fn new(partition_size: usize, serializer_builder: B, splitter: P, merger: M) -> Result<Self, SortError> {
        if partition_size == 0 {
            return Err(SortError::Configuration("partition size must be positive".to_string()));
        }

        return Ok(ExternalSorter {
            partition_size,
            serializer_builder,
            splitter,
            merger,
        });
    }

    /// Returns the maximum number of items in a partition.
    pub fn partition_size(&self) -> usize {
        self.partition_size
    }

    /// Sorts data from the input in ascending order.
    /// Returns an iterator that can be used to get sorted data stream.
    ///
    /// # Arguments
    /// * `input` - Input stream data to be fetched from
    pub fn sort<T, I>(&self, input: I) -> Result<Sorted<T, B::Serializer, M::Merged>, SortError>
    where
        T: Ord + Clone,
        I: IntoIterator<Item = T>,
        B: SerializerBuilder<T>,
        P: Split<T, B::Serializer, T, fn(&T) -> T>,
        M: Merge<T, B::Serializer, T, fn(&T) -> T>,
    {
        self.sort_by_key(input, T::clone as fn(&T) -> T, false)
    }

    /// Sorts data from the input using a key extraction function.
    /// Items with equal keys keep their input order.
    ///
    /// # Arguments
    /// * `input` - Input stream data to be fetched from
    /// * `key` - Function extracting the comparison key of an item
    /// * `reverse` - Sort in descending order
    pub fn sort_by_key<T, I, K, F>(
        &self,
        input: I,
        key: F,
        reverse: bool,
    ) -> Result<Sorted<T, B::Serializer, M::Merged>, SortError>
    where
        I: IntoIterator<Item = T>,
        K: Ord,
        F: Fn(&T) -> K,
        B: SerializerBuilder<T>,
        P: Split<T, B::Serializer, K, F>,
        M: Merge<T, B::Serializer, K, F>,
    {
        self.try_sort_by_key(input.into_iter().map(Ok::<T, Infallible>), key, reverse)
    }

    /// Sorts fallible data from the input in ascending order.
    /// The first input error aborts the sort with [`SortError::Input`].
    pub fn try_sort<T, I, E>(&self, input: I) -> Result<Sorted<T, B::Serializer, M::Merged>, SortError>
    where
        T: Ord + Clone,
        I: IntoIterator<Item = Result<T, E>>,
        E: Error + Send + Sync + 'static,
        B: SerializerBuilder<T>,
        P: Split<T, B::Serializer, T, fn(&T) -> T>,
        M: Merge<T, B::Serializer, T, fn(&T) -> T>,
    {
        self.try_sort_by_key(input, T::clone as fn(&T) -> T, false)
    }

    /// Sorts fallible data from the input using a key extraction function.
    ///
    /// # Arguments
    /// * `input` - Input stream data to be fetched from
    /// * `key` - Function extracting the comparison key of an item
    /// * `reverse` - Sort in descending order
    pub fn try_sort_by_key<T, I, E, K, F>(
        &self,
        input: I,
        key: F,
        reverse: bool,
    ) -> Result<Sorted<T, B::Serializer, M::Merged>, SortError>
    where
        I: IntoIterator<Item = Result<T, E>>,
        E: Error + Send + Sync + 'static,
        K: Ord,
        F: Fn(&T) -> K,
        B: SerializerBuilder<T>,
        P: Split<T, B::Serializer, K, F>,
        M: Merge<T, B::Serializer, K, F>,
    {
        // released on every early return below
        let mut scope = Scope::acquire(self.serializer_builder.build()?)?;

        log::debug!("splitting input (partition size: {})", self.partition_size);
        let handles = self
            .splitter
            .split(scope.serializer(), self.partition_size, input, &key, reverse)?;

        log::debug!("external sort preparation done");
        let merged = self.merger.merge(scope.serializer(), handles, key, reverse)?;

        return Ok(Sorted::new(merged, scope));
    }
}

/// Lazily sorted data stream.
///
/// The stream is single-pass. It owns the serializer scope: spilled partitions are removed once the
/// stream is exhausted, fails, is closed or is dropped, whichever happens first.
pub struct Sorted<T, S, I>
where
    S: Serializer<T>,
    I: Iterator<Item = Result<T, SortError>>,
{
    // declared before the scope so that open partitions are dropped before the release
    merged: Option<I>,
    scope: Scope<T, S>,
}

impl<T, S, I> Sorted<T, S, I>
where
    S: Serializer<T>,
    I: Iterator<Item = Result<T, SortError>>,
{
    fn new(merged: I, scope: Scope<T, S>) -> Self {
        Sorted {
            merged: Some(merged),
            scope,
        }
    }

    /// Checks if the stream has been fully consumed or has failed.
    pub fn is_exhausted(&self) -> bool {
        self.merged.is_none()
    }

    /// Returns the merged stream.
    pub fn merged(&self) -> Option<&I> {
        self.merged.as_ref()
    }

    /// Abandons the stream removing all spilled partitions.
    pub fn close(mut self) -> Result<(), SortError> {
        if self.merged.take().is_some() {
            log::debug!("sorted stream closed before exhaustion");
        }
        self.scope.release()
    }
}

impl<T, S, I> Iterator for Sorted<T, S, I>
where
    S: Serializer<T>,
    I: Iterator<Item = Result<T, SortError>>,
{
    type Item = Result<T, SortError>;

    fn next(&mut self) -> Option<Self::Item> {
        let merged = self.merged.as_mut()?;

        match merged.next() {
            Some(Ok(item)) => Some(Ok(item)),
            Some(Err(err)) => {
                self.merged = None;
                if let Err(release_err) = self.scope.release() {
                    log::warn!("serializer release failed: {}", release_err);
                }
                Some(Err(err))
            }
            None => {
                self.merged = None;
                log::debug!("sorted stream exhausted");
                self.scope.release().err().map(Err)
            }
        }
    }
}

impl<T, S, I> Drop for Sorted<T, S, I>
where
    S: Serializer<T>,
    I: Iterator<Item = Result<T, SortError>>,
{
    fn drop(&mut self) {
        if self.merged.take().is_some() {
            log::debug!("sorted stream abandoned before exhaustion");
        }
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io::{self, ErrorKind};
    use std::path::Path;

    use rand::seq::SliceRandom;
    use rstest::*;

    use super::{ExternalSorter, ExternalSorterBuilder};
    use crate::merger::HeapMerge;
    use crate::serializer::testing::MemorySerializerBuilder;
    use crate::serializer::RmpSerializerBuilder;
    use crate::split::{ChunkSplitter, ParallelChunkSplitter};
    use crate::SortError;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir_in("./").unwrap()
    }

    fn rmp_sorter(tmp_dir: &Path, partition_size: usize) -> ExternalSorter {
        ExternalSorterBuilder::new()
            .with_partition_size(partition_size)
            .with_serializer(RmpSerializerBuilder::new().with_tmp_dir(tmp_dir))
            .build()
            .unwrap()
    }

    fn is_empty_dir(dir: &Path) -> bool {
        fs::read_dir(dir).unwrap().count() == 0
    }

    #[rstest]
    #[case(false)]
    #[case(true)]
    fn test_external_sorter(tmp_dir: tempfile::TempDir, #[case] reversed: bool) {
        let input_sorted = 0..100;

        let mut input_shuffled = Vec::from_iter(input_sorted.clone());
        input_shuffled.shuffle(&mut rand::thread_rng());

        let sorter = rmp_sorter(tmp_dir.path(), 8);
        let result = sorter.sort_by_key(input_shuffled, |item: &i32| *item, reversed).unwrap();

        let actual_result: Result<Vec<i32>, _> = result.collect();
        let actual_result = actual_result.unwrap();
        let expected_result = if reversed {
            Vec::from_iter(input_sorted.clone().rev())
        } else {
            Vec::from_iter(input_sorted.clone())
        };

        assert_eq!(actual_result, expected_result);
        assert!(is_empty_dir(tmp_dir.path()));
    }

    #[rstest]
    #[case(false)]
    #[case(true)]
    fn test_external_sorter_stability(tmp_dir: tempfile::TempDir, #[case] reversed: bool) {
        let input_sorted = (0..20).flat_map(|x| (0..5).map(move |y| (x, y)));

        let mut input_shuffled = Vec::from_iter(input_sorted.clone());
        input_shuffled.shuffle(&mut rand::thread_rng());
        // sort input by the second field to check sorting stability
        input_shuffled.sort_by(|a: &(i32, i32), b: &(i32, i32)| a.1.cmp(&b.1));

        let sorter = rmp_sorter(tmp_dir.path(), 8);
        let result = sorter
            .sort_by_key(input_shuffled, |item: &(i32, i32)| item.0, reversed)
            .unwrap();

        let actual_result: Result<Vec<(i32, i32)>, _> = result.collect();
        let actual_result = actual_result.unwrap();
        let expected_result = if reversed {
            // equal keys keep the input order in both directions
            Vec::from_iter((0..20).rev().flat_map(|x| (0..5).map(move |y| (x, y))))
        } else {
            Vec::from_iter(input_sorted.clone())
        };

        assert_eq!(actual_result, expected_result)
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(7)]
    #[case(64)]
    #[case(1000)]
    fn test_matches_std_stable_sort(tmp_dir: tempfile::TempDir, #[case] partition_size: usize) {
        let input: Vec<String> = (0..300).map(|i| format!("{:x}", (i * 7919) % 503)).collect();
        let key = |item: &String| item.len();

        for reverse in [false, true] {
            let mut expected = input.clone();
            if reverse {
                expected.sort_by(|a, b| key(b).cmp(&key(a)));
            } else {
                expected.sort_by_key(key);
            }

            let sorter = rmp_sorter(tmp_dir.path(), partition_size);
            let actual: Vec<String> = sorter
                .sort_by_key(input.clone(), key, reverse)
                .unwrap()
                .map(Result::unwrap)
                .collect();

            assert_eq!(actual, expected);
        }
        assert!(is_empty_dir(tmp_dir.path()));
    }

    #[rstest]
    #[case(false, vec![1, 3, 3, 5])]
    #[case(true, vec![5, 3, 3, 1])]
    fn test_small_partitions(#[case] reverse: bool, #[case] expected: Vec<i32>) {
        let builder = MemorySerializerBuilder::default();
        let stats = builder.stats.clone();
        let sorter = ExternalSorterBuilder::new()
            .with_partition_size(2)
            .with_serializer(builder)
            .build()
            .unwrap();

        let actual: Vec<i32> = sorter
            .sort_by_key(vec![5, 3, 3, 1], |item: &i32| *item, reverse)
            .unwrap()
            .map(Result::unwrap)
            .collect();

        assert_eq!(actual, expected);
        assert_eq!(stats.borrow().dumped, 2);
        assert_eq!(stats.borrow().loaded, 2);
    }

    #[rstest]
    fn test_empty_input(tmp_dir: tempfile::TempDir) {
        let sorter = rmp_sorter(tmp_dir.path(), 8192);

        let mut result = sorter.sort(Vec::<u64>::new()).unwrap();
        assert!(is_empty_dir(tmp_dir.path()));
        assert_eq!(result.merged().map(|merged| merged.active_sources()), Some(0));

        assert!(result.next().is_none());
        assert!(result.is_exhausted());
        assert!(is_empty_dir(tmp_dir.path()));
    }

    #[test]
    fn test_single_partition() {
        let builder = MemorySerializerBuilder::default();
        let stats = builder.stats.clone();
        let sorter = ExternalSorterBuilder::new()
            .with_partition_size(5)
            .with_serializer(builder)
            .build()
            .unwrap();

        let actual: Vec<char> = sorter
            .sort(vec!['d', 'a', 'e', 'c', 'b'])
            .unwrap()
            .map(Result::unwrap)
            .collect();

        assert_eq!(actual, vec!['a', 'b', 'c', 'd', 'e']);
        assert_eq!(stats.borrow().dumped, 1);
    }

    #[test]
    fn test_zero_partition_size() {
        let result = ExternalSorterBuilder::new().with_partition_size(0).build();

        assert!(matches!(result, Err(SortError::Configuration(_))));
    }

    #[test]
    fn test_scope_released_on_exhaustion() {
        let builder = MemorySerializerBuilder::default();
        let stats = builder.stats.clone();
        let sorter = ExternalSorterBuilder::new()
            .with_partition_size(3)
            .with_serializer(builder)
            .build()
            .unwrap();

        let mut sorted = sorter.sort(Vec::from_iter((0..10).rev())).unwrap();
        assert_eq!(stats.borrow().acquired, 1);
        assert_eq!(stats.borrow().released, 0);

        assert_eq!(sorted.by_ref().count(), 10);
        assert_eq!(stats.borrow().released, 1);
        assert_eq!(stats.borrow().leaked, 0);

        drop(sorted);
        assert_eq!(stats.borrow().released, 1);
    }

    #[test]
    fn test_scope_released_on_abandon() {
        let builder = MemorySerializerBuilder::default();
        let stats = builder.stats.clone();
        let sorter = ExternalSorterBuilder::new()
            .with_partition_size(3)
            .with_serializer(builder)
            .build()
            .unwrap();

        let mut sorted = sorter.sort(Vec::from_iter(0..10)).unwrap();
        assert_eq!(sorted.next().unwrap().unwrap(), 0);
        assert_eq!(stats.borrow().released, 0);

        drop(sorted);
        assert_eq!(stats.borrow().released, 1);
    }

    #[rstest]
    fn test_partitions_removed_on_abandon(tmp_dir: tempfile::TempDir) {
        let sorter = rmp_sorter(tmp_dir.path(), 4);

        let mut sorted = sorter.sort(Vec::from_iter((0..100).rev())).unwrap();
        assert_eq!(sorted.next().unwrap().unwrap(), 0);
        assert!(!is_empty_dir(tmp_dir.path()));

        sorted.close().unwrap();
        assert!(is_empty_dir(tmp_dir.path()));
    }

    #[rstest]
    fn test_input_error_releases_scope(tmp_dir: tempfile::TempDir) {
        let sorter = rmp_sorter(tmp_dir.path(), 2);
        let input = vec![Ok(3), Ok(1), Ok(2), Err(io::Error::new(ErrorKind::Other, "broken input"))];

        let result = sorter.try_sort(input);

        assert!(matches!(result, Err(SortError::Input(_))));
        assert!(is_empty_dir(tmp_dir.path()));
    }

    #[test]
    fn test_key_panic_releases_scope() {
        let builder = MemorySerializerBuilder::default();
        let stats = builder.stats.clone();
        let sorter = ExternalSorterBuilder::new()
            .with_partition_size(2)
            .with_serializer(builder)
            .build()
            .unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = sorter.sort_by_key(
                vec![3, 1, 2],
                |item: &i32| if *item == 3 { panic!("bad key") } else { *item },
                false,
            );
        }));

        assert!(result.is_err());
        assert_eq!(stats.borrow().released, 1);
    }

    #[rstest]
    fn test_parallel_splitter(tmp_dir: tempfile::TempDir) {
        let sorter = ExternalSorterBuilder::new()
            .with_partition_size(16)
            .with_serializer(RmpSerializerBuilder::new().with_tmp_dir(tmp_dir.path()))
            .with_splitter(ParallelChunkSplitter::new(Some(2)).unwrap())
            .build()
            .unwrap();

        let mut input = Vec::from_iter(0..500u32);
        input.shuffle(&mut rand::thread_rng());

        let actual: Vec<u32> = sorter.sort(input).unwrap().map(Result::unwrap).collect();

        assert_eq!(actual, Vec::from_iter(0..500u32));
        assert!(is_empty_dir(tmp_dir.path()));
    }

    #[test]
    fn test_sorter_is_reusable() {
        let sorter: ExternalSorter<MemorySerializerBuilder, ChunkSplitter, HeapMerge> =
            ExternalSorter::new(2, MemorySerializerBuilder::default(), ChunkSplitter, HeapMerge).unwrap();

        let first = sorter.sort(vec![2, 1]).unwrap();
        let second = sorter.sort(vec![4, 3]).unwrap();

        let second: Vec<i32> = second.map(Result::unwrap).collect();
        let first: Vec<i32> = first.map(Result::unwrap).collect();

        assert_eq!(first, vec![1, 2]);
        assert_eq!(second, vec![3, 4]);
    }
}
