//! Dump an OAI store directory to a file (or stdout).
//!
//! Usage: oai-export <store-dir> [dump-file]

use std::io::{BufWriter, Write};

use oai_jazz::{OaiJazz, StoreConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let mut args = std::env::args().skip(1);
    let Some(store_dir) = args.next() else {
        eprintln!("usage: oai-export <store-dir> [dump-file]");
        std::process::exit(2);
    };
    let dump_file = args.next();

    let jazz = OaiJazz::open(&store_dir, StoreConfig::default())?;
    match dump_file {
        Some(path) => {
            let file = std::fs::File::create(&path)?;
            let mut writer = BufWriter::new(file);
            jazz.export_dump(&mut writer)?;
            writer.flush()?;
            println!("exported {} records from {} to {}", jazz.total_records(), store_dir, path);
        }
        None => {
            let stdout = std::io::stdout();
            jazz.export_dump(stdout.lock())?;
        }
    }
    Ok(())
}
