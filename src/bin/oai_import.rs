//! Rebuild an OAI store directory from a dump file.
//!
//! Usage: oai-import <dump-file> <store-dir>
//!
//! The target directory must be an empty (or freshly initialized) store.

use std::io::BufReader;

use oai_jazz::store::FsStorage;
use oai_jazz::{OaiJazz, StoreConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(dump_file), Some(store_dir)) = (args.next(), args.next()) else {
        eprintln!("usage: oai-import <dump-file> <store-dir>");
        std::process::exit(2);
    };

    let reader = BufReader::new(std::fs::File::open(&dump_file)?);
    let storage = FsStorage::open(&store_dir)?;
    let jazz = OaiJazz::import_dump(reader, Box::new(storage), StoreConfig::default())?;
    println!("imported {} records from {} into {}", jazz.total_records(), dump_file, store_dir);
    Ok(())
}
