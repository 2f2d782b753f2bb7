//! Partition serializers.
//!
//! A serializer spills a sorted partition to external storage and streams it back later.
//! Each sort invocation gets its own serializer instance built by a [`SerializerBuilder`],
//! so concurrent sorts never share spilled state.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{self, prelude::*};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use log;
use tempfile::{self, TempPath};

use crate::SortError;

/// Partition serializer interface.
///
/// `dump` and `load` are mandatory. `acquire` and `release` form an optional scoped-resource
/// protocol: the sorter calls `acquire` before the first `dump` and `release` once the sorted stream
/// is exhausted, failed or dropped. `release` must remove every partition that has not been
/// consumed yet.
pub trait Serializer<T> {
    /// Opaque reference to a spilled partition.
    type Handle;
    /// Lazy single-pass stream over a spilled partition.
    type Reader: Iterator<Item = Result<T, SortError>>;

    /// Writes items to external storage returning a handle the items can be reloaded with.
    fn dump<I>(&mut self, items: I) -> Result<Self::Handle, SortError>
    where
        I: IntoIterator<Item = T>;

    /// Opens a stream over previously dumped items.
    /// Loading a handle that has already been consumed or released fails with [`SortError::Exhausted`].
    fn load(&mut self, handle: Self::Handle) -> Result<Self::Reader, SortError>;

    /// Begins tracking created partitions.
    fn acquire(&mut self) -> Result<(), SortError> {
        Ok(())
    }

    /// Removes all partitions that have not been consumed yet.
    fn release(&mut self) -> Result<(), SortError> {
        Ok(())
    }
}

/// Serializer builder. Creates a fresh serializer for every sort invocation.
pub trait SerializerBuilder<T> {
    type Serializer: Serializer<T>;

    /// Creates a new serializer.
    fn build(&self) -> Result<Self::Serializer, SortError>;
}

/// Scoped serializer guard.
/// Acquires the serializer on creation and releases it either explicitly or when dropped.
pub struct Scope<T, S>
where
    S: Serializer<T>,
{
    serializer: S,
    acquired: bool,

    item_type: PhantomData<fn() -> T>,
}

impl<T, S> Scope<T, S>
where
    S: Serializer<T>,
{
    /// Acquires the serializer.
    pub fn acquire(mut serializer: S) -> Result<Self, SortError> {
        serializer.acquire()?;

        return Ok(Scope {
            serializer,
            acquired: true,
            item_type: PhantomData,
        });
    }

    /// Returns the guarded serializer.
    pub fn serializer(&mut self) -> &mut S {
        &mut self.serializer
    }

    /// Checks if the scope has not been released yet.
    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    /// Releases the serializer. Subsequent calls are no-ops.
    pub fn release(&mut self) -> Result<(), SortError> {
        if !self.acquired {
            return Ok(());
        }
        self.acquired = false;

        self.serializer.release()
    }
}

impl<T, S> Drop for Scope<T, S>
where
    S: Serializer<T>,
{
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            log::warn!("serializer release failed: {}", err);
        }
    }
}

static NEXT_PARTITION_ID: AtomicU64 = AtomicU64::new(0);

/// Handle of a partition spilled by [`RmpSerializer`].
/// Identifiers are unique within the process.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct PartitionId(u64);

impl PartitionId {
    fn next() -> Self {
        PartitionId(NEXT_PARTITION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition #{}", self.0)
    }
}

/// [`RmpSerializer`] builder.
#[derive(Clone, Debug, Default)]
pub struct RmpSerializerBuilder {
    /// Directory the per-sort temporary directory is created in.
    tmp_dir: Option<PathBuf>,
    /// Partition file read/write buffer size.
    rw_buf_size: Option<usize>,
}

impl RmpSerializerBuilder {
    pub fn new() -> Self {
        RmpSerializerBuilder::default()
    }

    /// Sets directory to be used to store temporary data. The OS temporary directory is used otherwise.
    pub fn with_tmp_dir(mut self, path: &Path) -> Self {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets partition file read/write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> Self {
        self.rw_buf_size = Some(buf_size);
        return self;
    }
}

impl<T> SerializerBuilder<T> for RmpSerializerBuilder
where
    T: serde::ser::Serialize + serde::de::DeserializeOwned,
{
    type Serializer = RmpSerializer<T>;

    fn build(&self) -> Result<Self::Serializer, SortError> {
        Ok(RmpSerializer::new(self.tmp_dir.clone(), self.rw_buf_size))
    }
}

/// RMP (Rust MessagePack) serializer.
/// Spills every partition to its own temporary file using MessagePack as a data serialization format.
/// For more information see https://msgpack.org/.
pub struct RmpSerializer<T> {
    base_dir: Option<PathBuf>,
    rw_buf_size: Option<usize>,
    /// Set between `acquire` and `release`.
    scoped: bool,
    /// Per-sort directory, created by the first scoped `dump`.
    tmp_dir: Option<tempfile::TempDir>,
    /// Dumped partitions not yet handed over to a reader.
    partitions: HashMap<u64, TempPath>,

    item_type: PhantomData<fn() -> T>,
}

impl<T> RmpSerializer<T> {
    /// Creates a serializer storing partitions in `base_dir`
    /// (or in the OS temporary directory if [`None`]).
    pub fn new(base_dir: Option<PathBuf>, rw_buf_size: Option<usize>) -> Self {
        RmpSerializer {
            base_dir,
            rw_buf_size,
            scoped: false,
            tmp_dir: None,
            partitions: HashMap::new(),
            item_type: PhantomData,
        }
    }

    /// Returns the number of dumped partitions that have not been loaded yet.
    pub fn pending(&self) -> usize {
        self.partitions.len()
    }

    fn dir(&mut self) -> io::Result<PathBuf> {
        if !self.scoped {
            return Ok(self.base_dir.clone().unwrap_or_else(std::env::temp_dir));
        }

        if let Some(tmp_dir) = &self.tmp_dir {
            return Ok(tmp_dir.path().to_path_buf());
        }

        let mut builder = tempfile::Builder::new();
        builder.prefix("xsorted-");
        let tmp_dir = match &self.base_dir {
            Some(base_dir) => builder.tempdir_in(base_dir),
            None => builder.tempdir(),
        }?;

        log::info!("using {} as a temporary directory", tmp_dir.path().display());
        let path = tmp_dir.path().to_path_buf();
        self.tmp_dir = Some(tmp_dir);

        return Ok(path);
    }
}

impl<T> Serializer<T> for RmpSerializer<T>
where
    T: serde::ser::Serialize + serde::de::DeserializeOwned,
{
    type Handle = PartitionId;
    type Reader = RmpPartitionReader<T>;

    fn dump<I>(&mut self, items: I) -> Result<Self::Handle, SortError>
    where
        I: IntoIterator<Item = T>,
    {
        // the file is removed on drop if anything below fails
        let mut tmp_file = self
            .dir()
            .and_then(|dir| {
                tempfile::Builder::new()
                    .prefix("partition-")
                    .suffix(".msgpack")
                    .tempfile_in(dir)
            })
            .map_err(SortError::serialization)?;

        {
            let mut partition_writer = match self.rw_buf_size {
                Some(buf_size) => io::BufWriter::with_capacity(buf_size, &mut tmp_file),
                None => io::BufWriter::new(&mut tmp_file),
            };
            for item in items.into_iter() {
                rmp_serde::encode::write(&mut partition_writer, &item).map_err(SortError::serialization)?;
            }
            partition_writer.flush().map_err(SortError::serialization)?;
        }

        let handle = PartitionId::next();
        log::trace!("{} saved to {}", handle, tmp_file.path().display());
        self.partitions.insert(handle.0, tmp_file.into_temp_path());

        Ok(handle)
    }

    fn load(&mut self, handle: Self::Handle) -> Result<Self::Reader, SortError> {
        let path = self
            .partitions
            .remove(&handle.0)
            .ok_or_else(|| SortError::Exhausted(format!("{} is unknown or already consumed", handle)))?;

        let file = fs::File::open(&path).map_err(SortError::serialization)?;
        let file_len = file.metadata().map_err(SortError::serialization)?.len();
        let partition_reader = match self.rw_buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
            None => io::BufReader::new(file),
        };

        return Ok(RmpPartitionReader::new(partition_reader.take(file_len), path));
    }

    fn acquire(&mut self) -> Result<(), SortError> {
        self.scoped = true;
        Ok(())
    }

    fn release(&mut self) -> Result<(), SortError> {
        let mut result = Ok(());
        self.scoped = false;

        if !self.partitions.is_empty() {
            log::debug!("removing {} unconsumed partitions", self.partitions.len());
        }
        for (_, path) in self.partitions.drain() {
            if let Err(err) = path.close() {
                result = result.and(Err(SortError::IO(err)));
            }
        }

        if let Some(tmp_dir) = self.tmp_dir.take() {
            log::debug!("removing temporary directory {}", tmp_dir.path().display());
            if let Err(err) = tmp_dir.close() {
                result = result.and(Err(SortError::TempDir(err)));
            }
        }

        return result;
    }
}

/// Stream over a partition spilled by [`RmpSerializer`].
/// The partition file is removed once the stream is exhausted or dropped.
pub struct RmpPartitionReader<T> {
    reader: Option<io::Take<io::BufReader<fs::File>>>,
    path: Option<TempPath>,

    item_type: PhantomData<fn() -> T>,
}

impl<T> RmpPartitionReader<T> {
    fn new(reader: io::Take<io::BufReader<fs::File>>, path: TempPath) -> Self {
        RmpPartitionReader {
            reader: Some(reader),
            path: Some(path),
            item_type: PhantomData,
        }
    }

    fn finish(&mut self) -> Result<(), SortError> {
        // the file has to be closed before it is removed
        self.reader = None;
        match self.path.take() {
            Some(path) => path.close().map_err(SortError::IO),
            None => Ok(()),
        }
    }
}

impl<T> Iterator for RmpPartitionReader<T>
where
    T: serde::de::DeserializeOwned,
{
    type Item = Result<T, SortError>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.reader.as_mut()?;

        if reader.limit() == 0 {
            return self.finish().err().map(Err);
        }

        match rmp_serde::decode::from_read(reader) {
            Ok(result) => Some(Ok(result)),
            Err(err) => {
                self.reader = None;
                Some(Err(SortError::serialization(err)))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    use super::{Serializer, SerializerBuilder};
    use crate::SortError;

    /// Lifecycle counters shared between a test and the serializers it builds.
    #[derive(Debug, Default)]
    pub struct Stats {
        pub acquired: usize,
        pub released: usize,
        pub dumped: usize,
        pub loaded: usize,
        /// Partitions left in the store at release time.
        pub leaked: usize,
    }

    /// Serializer keeping partitions in memory.
    pub struct MemorySerializer<T> {
        store: HashMap<u64, Vec<T>>,
        next_id: u64,
        stats: Rc<RefCell<Stats>>,
    }

    impl<T> MemorySerializer<T> {
        pub fn new(stats: Rc<RefCell<Stats>>) -> Self {
            MemorySerializer {
                store: HashMap::new(),
                next_id: 0,
                stats,
            }
        }
    }

    impl<T> Serializer<T> for MemorySerializer<T> {
        type Handle = u64;
        type Reader = std::iter::Map<std::vec::IntoIter<T>, fn(T) -> Result<T, SortError>>;

        fn dump<I>(&mut self, items: I) -> Result<Self::Handle, SortError>
        where
            I: IntoIterator<Item = T>,
        {
            let id = self.next_id;
            self.next_id += 1;
            self.store.insert(id, items.into_iter().collect());
            self.stats.borrow_mut().dumped += 1;
            Ok(id)
        }

        fn load(&mut self, handle: Self::Handle) -> Result<Self::Reader, SortError> {
            let items = self
                .store
                .remove(&handle)
                .ok_or_else(|| SortError::Exhausted(format!("partition {}", handle)))?;
            self.stats.borrow_mut().loaded += 1;
            Ok(items.into_iter().map(Ok as fn(T) -> Result<T, SortError>))
        }

        fn acquire(&mut self) -> Result<(), SortError> {
            self.stats.borrow_mut().acquired += 1;
            Ok(())
        }

        fn release(&mut self) -> Result<(), SortError> {
            let mut stats = self.stats.borrow_mut();
            stats.released += 1;
            stats.leaked += self.store.len();
            self.store.clear();
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct MemorySerializerBuilder {
        pub stats: Rc<RefCell<Stats>>,
    }

    impl<T> SerializerBuilder<T> for MemorySerializerBuilder {
        type Serializer = MemorySerializer<T>;

        fn build(&self) -> Result<Self::Serializer, SortError> {
            Ok(MemorySerializer::new(self.stats.clone()))
        }
    }
}
