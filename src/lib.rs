//! `xsorted` is a lazy external sort for iterators that do not fit into memory.
//!
//! External sorting is a class of sorting algorithms that can handle massive amounts of data. External sorting
//! is required when the data being sorted do not fit into the main memory (RAM) of a computer and instead must be
//! resided in slower external memory, usually a hard disk drive. Sorting is achieved in two passes. During the
//! first pass it sorts partitions of data that each fit in RAM and spills them to temporary files, during the
//! second pass it merges the sorted partitions together. For more information see
//! [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! `xsorted` behaves like a stable `sort_by_key` returning an iterator:
//!
//! * **Bounded memory:**
//!   at most one partition is held in memory while splitting and one item per partition while merging.
//! * **Stable:**
//!   items with equal keys keep their input order, in ascending and descending sorts alike.
//! * **Lazy:**
//!   the result is a single-pass iterator. Temporary files are removed once it is exhausted or dropped.
//! * **Pluggable:**
//!   the serializer (`MessagePack` over temporary files by default), the split and the merge strategies
//!   can be replaced.
//!
//! # Example
//!
//! ```no_run
//! use std::fs;
//! use std::io::{self, prelude::*};
//! use std::path;
//!
//! use xsorted::{ExternalSorter, ExternalSorterBuilder, RmpSerializerBuilder};
//!
//! fn main() {
//!     let input_reader = io::BufReader::new(fs::File::open("input.txt").unwrap());
//!     let mut output_writer = io::BufWriter::new(fs::File::create("output.txt").unwrap());
//!
//!     let sorter: ExternalSorter = ExternalSorterBuilder::new()
//!         .with_partition_size(100_000)
//!         .with_serializer(RmpSerializerBuilder::new().with_tmp_dir(path::Path::new("./")))
//!         .build()
//!         .unwrap();
//!
//!     let sorted = sorter.try_sort(input_reader.lines()).unwrap();
//!
//!     for item in sorted.map(Result::unwrap) {
//!         output_writer.write_all(format!("{}\n", item).as_bytes()).unwrap();
//!     }
//!     output_writer.flush().unwrap();
//! }
//! ```

pub mod error;
pub mod merger;
pub mod serializer;
pub mod sort;
pub mod split;

pub use error::SortError;
pub use merger::{BinaryHeapMerger, HeapMerge, Merge};
pub use serializer::{
    PartitionId, RmpPartitionReader, RmpSerializer, RmpSerializerBuilder, Scope, Serializer, SerializerBuilder,
};
pub use sort::{ExternalSorter, ExternalSorterBuilder, Sorted, DEFAULT_PARTITION_SIZE};
pub use split::{ChunkSplitter, ParallelChunkSplitter, Split};

/// Sorted stream produced by the default sorter.
pub type DefaultSorted<T, K, F> =
    Sorted<T, RmpSerializer<T>, BinaryHeapMerger<T, SortError, K, F, RmpPartitionReader<T>>>;

/// Sorts the input in ascending order using the default configuration
/// (partitions of [`DEFAULT_PARTITION_SIZE`] items spilled to the OS temporary directory).
///
/// ```
/// let sorted: Vec<i32> = xsorted::sort(vec![5, 3, 3, 1]).unwrap().map(Result::unwrap).collect();
/// assert_eq!(sorted, vec![1, 3, 3, 5]);
/// ```
pub fn sort<T, I>(input: I) -> Result<DefaultSorted<T, T, fn(&T) -> T>, SortError>
where
    T: Ord + Clone + serde::ser::Serialize + serde::de::DeserializeOwned,
    I: IntoIterator<Item = T>,
{
    ExternalSorterBuilder::new().build()?.sort(input)
}

/// Sorts the input by a key using the default configuration.
/// Items with equal keys keep their input order; `reverse` sorts in descending order.
///
/// ```
/// let words = vec!["pear", "fig", "apple", "kiwi"];
/// let sorted: Vec<String> = xsorted::sort_by_key(words.into_iter().map(String::from), |w: &String| w.len(), true)
///     .unwrap()
///     .map(Result::unwrap)
///     .collect();
/// assert_eq!(sorted, vec!["apple", "pear", "kiwi", "fig"]);
/// ```
pub fn sort_by_key<T, I, K, F>(input: I, key: F, reverse: bool) -> Result<DefaultSorted<T, K, F>, SortError>
where
    T: serde::ser::Serialize + serde::de::DeserializeOwned,
    I: IntoIterator<Item = T>,
    K: Ord,
    F: Fn(&T) -> K,
{
    ExternalSorterBuilder::new().build()?.sort_by_key(input, key, reverse)
}
