use std::collections::HashMap;
use std::vec;

use env_logger;
use log;

use xsorted::{ExternalSorterBuilder, Serializer, SerializerBuilder, SortError};

/// Keeps partitions in memory. Useful to see how a serializer plugs in, not to save memory.
#[derive(Default)]
struct MemorySerializer {
    store: HashMap<usize, Vec<u32>>,
    next_id: usize,
}

impl Serializer<u32> for MemorySerializer {
    type Handle = usize;
    type Reader = vec::IntoIter<Result<u32, SortError>>;

    fn dump<I>(&mut self, items: I) -> Result<Self::Handle, SortError>
    where
        I: IntoIterator<Item = u32>,
    {
        let id = self.next_id;
        self.next_id += 1;
        self.store.insert(id, items.into_iter().collect());

        return Ok(id);
    }

    fn load(&mut self, handle: Self::Handle) -> Result<Self::Reader, SortError> {
        let items = self
            .store
            .remove(&handle)
            .ok_or_else(|| SortError::Exhausted(format!("partition {}", handle)))?;

        return Ok(Vec::from_iter(items.into_iter().map(Ok)).into_iter());
    }

    fn acquire(&mut self) -> Result<(), SortError> {
        log::info!("memory serializer acquired");
        Ok(())
    }

    fn release(&mut self) -> Result<(), SortError> {
        log::info!("memory serializer released ({} partitions left)", self.store.len());
        self.store.clear();
        Ok(())
    }
}

struct MemorySerializerBuilder;

impl SerializerBuilder<u32> for MemorySerializerBuilder {
    type Serializer = MemorySerializer;

    fn build(&self) -> Result<Self::Serializer, SortError> {
        Ok(MemorySerializer::default())
    }
}

fn main() {
    env_logger::Builder::new().filter_level(log::LevelFilter::Debug).init();

    let sorter = ExternalSorterBuilder::new()
        .with_partition_size(1_000)
        .with_serializer(MemorySerializerBuilder)
        .build()
        .unwrap();

    let input = (0..10_000u32).map(|i| i.wrapping_mul(2_654_435_761) % 10_000);
    let sorted = sorter.sort(input).unwrap();

    let mut previous = None;
    for item in sorted.map(Result::unwrap) {
        assert!(previous <= Some(item));
        previous = Some(item);
    }
    println!("largest item: {:?}", previous);
}
