use std::fs;
use std::io::{self, prelude::*};
use std::path;

use env_logger;
use log;
use serde;

use xsorted::{ExternalSorter, ExternalSorterBuilder, RmpSerializerBuilder};

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct WordFrequency {
    word: String,
    frequency: u64,
}

impl WordFrequency {
    fn from_line(line: &str) -> Option<Self> {
        let (word, frequency) = line.split_once(',')?;
        Some(WordFrequency {
            word: word.to_string(),
            frequency: frequency.trim().parse().ok()?,
        })
    }
}

fn main() {
    env_logger::Builder::new().filter_level(log::LevelFilter::Debug).init();

    let input_reader = io::BufReader::new(fs::File::open("wordfreq.csv").unwrap());
    let mut output_writer = io::BufWriter::new(fs::File::create("wordfreq-sorted.csv").unwrap());

    let sorter: ExternalSorter = ExternalSorterBuilder::new()
        .with_partition_size(100_000)
        .with_serializer(RmpSerializerBuilder::new().with_tmp_dir(path::Path::new("./")))
        .build()
        .unwrap();

    let records = input_reader
        .lines()
        .map(Result::unwrap)
        .filter_map(|line| WordFrequency::from_line(&line));

    // most frequent words first, words with equal frequency keep the input order
    let sorted = sorter
        .sort_by_key(records, |record: &WordFrequency| record.frequency, true)
        .unwrap();

    for record in sorted.map(Result::unwrap) {
        output_writer
            .write_all(format!("{},{}\n", record.word, record.frequency).as_bytes())
            .unwrap();
    }
    output_writer.flush().unwrap();
}
