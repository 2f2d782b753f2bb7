use std::fs;
use std::io::{self, prelude::*};
use std::path;
use std::process;

use clap::ArgEnum;
use env_logger;
use log;

use xsorted::{ExternalSorterBuilder, ParallelChunkSplitter, RmpSerializerBuilder};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = enum_arg(&arg_parser, "log_level");
    env_logger::Builder::new()
        .filter_level(log_level.into())
        .format_timestamp_millis()
        .init();

    let order: Order = enum_arg(&arg_parser, "sort");
    let tmp_dir: Option<&str> = arg_parser.value_of("tmp_dir");
    let partition_size: usize = arg_parser.value_of_t_or_exit("partition_size");
    let threads: Option<usize> = arg_parser
        .is_present("threads")
        .then(|| arg_parser.value_of_t_or_exit("threads"));
    let key_spec = KeySpec {
        field: arg_parser
            .is_present("field")
            .then(|| arg_parser.value_of_t_or_exit("field")),
        delimiter: arg_parser.value_of("delimiter").expect("value has default").to_string(),
        numeric: arg_parser.is_present("numeric"),
    };

    let input = arg_parser.value_of("input").expect("value is required");
    let input_stream = match fs::File::open(input) {
        Ok(file) => io::BufReader::new(file),
        Err(err) => {
            log::error!("input file opening error: {}", err);
            process::exit(1);
        }
    };

    let output = arg_parser.value_of("output").expect("value is required");
    let mut output_stream = match fs::File::create(output) {
        Ok(file) => io::BufWriter::new(file),
        Err(err) => {
            log::error!("output file creation error: {}", err);
            process::exit(1);
        }
    };

    let mut lines = input_stream.lines();
    if arg_parser.is_present("header") {
        match lines.next() {
            Some(Ok(header)) => write_line(&mut output_stream, &header),
            Some(Err(err)) => {
                log::error!("header reading error: {}", err);
                process::exit(1);
            }
            None => {}
        }
    }

    let mut serializer_builder = RmpSerializerBuilder::new();
    if let Some(tmp_dir) = tmp_dir {
        serializer_builder = serializer_builder.with_tmp_dir(path::Path::new(tmp_dir));
    }

    let splitter = match ParallelChunkSplitter::new(threads) {
        Ok(splitter) => splitter,
        Err(err) => {
            log::error!("sorter initialization error: {}", err);
            process::exit(1);
        }
    };

    let sorter = match ExternalSorterBuilder::new()
        .with_partition_size(partition_size)
        .with_serializer(serializer_builder)
        .with_splitter(splitter)
        .build()
    {
        Ok(sorter) => sorter,
        Err(err) => {
            log::error!("sorter initialization error: {}", err);
            process::exit(1);
        }
    };

    let reverse = matches!(order, Order::Desc);
    let sorted_stream = match sorter.try_sort_by_key(lines, move |line: &String| key_spec.key(line), reverse) {
        Ok(sorted_stream) => sorted_stream,
        Err(err) => {
            log::error!("data sorting error: {}", err);
            process::exit(1);
        }
    };

    for line in sorted_stream {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                log::error!("sorting stream error: {}", err);
                process::exit(1);
            }
        };
        write_line(&mut output_stream, &line);
    }

    if let Err(err) = output_stream.flush() {
        log::error!("data flushing error: {}", err);
        process::exit(1);
    }
}

fn write_line(output_stream: &mut impl Write, line: &str) {
    if let Err(err) = output_stream.write_all(format!("{}\n", line).as_bytes()) {
        log::error!("data saving error: {}", err);
        process::exit(1);
    };
}

/// Comparison key of a line.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum LineKey {
    /// Lines whose field is not a number go first.
    Number(Option<i64>),
    Text(String),
}

/// Describes how a line key is extracted.
struct KeySpec {
    /// Zero-based field index, the whole line is the key if [`None`].
    field: Option<usize>,
    delimiter: String,
    numeric: bool,
}

impl KeySpec {
    fn key(&self, line: &str) -> LineKey {
        let value = match self.field {
            Some(field) => line.split(self.delimiter.as_str()).nth(field).unwrap_or(""),
            None => line,
        };

        if self.numeric {
            LineKey::Number(value.trim().parse().ok())
        } else {
            LineKey::Text(value.to_string())
        }
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Output order of the lines.
#[derive(Copy, Clone, clap::ArgEnum)]
enum Order {
    Asc,
    Desc,
}

/// Lists the values accepted for an enum argument.
fn choices<E: ArgEnum + 'static>() -> impl Iterator<Item = clap::PossibleValue<'static>> {
    E::value_variants().iter().filter_map(|v| v.to_possible_value())
}

/// Parses an enum argument. Values are validated against [`choices`] by clap beforehand.
fn enum_arg<E: ArgEnum>(arg_parser: &clap::ArgMatches, name: &str) -> E {
    let value = arg_parser.value_of(name).expect("value has default");
    match E::from_str(value, false) {
        Ok(value) => value,
        Err(err) => {
            eprintln!("invalid value of '{}': {}", name, err);
            process::exit(2);
        }
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("xsorted")
        .version(clap::crate_version!())
        .about("sorts lines of files that do not fit into memory")
        .arg(
            clap::Arg::new("input")
                .short('i')
                .long("input")
                .help("file to be sorted")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("output")
                .help("result file")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("sort")
                .short('s')
                .long("sort")
                .help("sorting order")
                .takes_value(true)
                .default_value("asc")
                .possible_values(choices::<Order>()),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(choices::<LogLevel>()),
        )
        .arg(
            clap::Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of threads to use for parallel partition sorting")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("tmp_dir")
                .short('d')
                .long("tmp-dir")
                .help("directory to be used to store temporary data")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("partition_size")
                .short('p')
                .long("partition-size")
                .help("number of lines sorted in memory at once")
                .takes_value(true)
                .default_value(DEFAULT_PARTITION_SIZE_STR)
                .validator(|v| match v.parse::<usize>() {
                    Ok(size) if size > 0 => Ok(()),
                    Ok(_) => Err("partition size must be positive".to_string()),
                    Err(err) => Err(format!("partition size format incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("field")
                .short('f')
                .long("field")
                .help("zero-based index of the field to sort by (whole line by default)")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("delimiter")
                .long("delimiter")
                .help("field delimiter")
                .takes_value(true)
                .default_value(","),
        )
        .arg(
            clap::Arg::new("numeric")
                .short('n')
                .long("numeric")
                .help("compare keys as integers"),
        )
        .arg(
            clap::Arg::new("header")
                .long("header")
                .help("copy the first line to the output unsorted"),
        )
        .get_matches()
}

// clap 3 needs a static string for the default value
const DEFAULT_PARTITION_SIZE_STR: &str = "8192";
