use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use tick_recorder::codec::Decoder;
use tick_recorder::record::Side;
use tick_recorder::stream::open_capture;

#[derive(Debug, Parser)]
#[command(about = "Replay a recorded tick stream and reconstruct the book")]
struct Args {
    /// Input capture path (.tick, optionally zstd-compressed)
    #[arg(long, short = 'i')]
    input: PathBuf,

    /// Print each reconstructed update event as NDJSON on stdout
    #[arg(long, default_value_t = false)]
    ndjson: bool,

    /// Dump top-of-book after each record
    #[arg(long, default_value_t = false)]
    dump: bool,

    /// Number of levels to print when dumping
    #[arg(long, default_value_t = 5)]
    top: usize,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut reader = open_capture(&args.input)
        .with_context(|| format!("open {}", args.input.display()))?;

    let header = reader.read_header().context("read stream header")?;
    eprintln!(
        "Header: v{} asset={} base_ts={}ms created={}ns",
        header.version, header.asset_id, header.base_timestamp_ms, header.created_unix_ns
    );

    let mut decoder = Decoder::for_header(&header);
    let mut records = 0usize;
    loop {
        let record = match reader.next_record() {
            Ok(Some(r)) => r,
            Ok(None) => break,
            Err(e) => {
                // everything printed so far is the valid prefix
                return Err(e).with_context(|| format!("read record {records}"));
            }
        };
        let event = decoder
            .decode(&record)
            .with_context(|| format!("decode record {records}"))?;
        records += 1;

        if args.ndjson {
            println!("{}", serde_json::to_string(&event)?);
        }
        if args.dump {
            let book = decoder.snapshot();
            let bids = book.levels(Side::Bid);
            let asks = book.levels(Side::Ask);
            println!(
                "t={}ms entries={} | top{} bids / asks:",
                event.timestamp_ms,
                record.entries.len(),
                args.top
            );
            for i in 0..args.top.min(bids.len().max(asks.len())) {
                let b = bids
                    .get(i)
                    .map(|(p, s)| format!("{i:>3}: {p:>10} x {s:>10}"))
                    .unwrap_or_else(|| format!("{i:>3}: -"));
                let a = asks
                    .get(i)
                    .map(|(p, s)| format!("{p:>10} x {s:>10}"))
                    .unwrap_or_else(|| "-".to_string());
                println!("{b} | {a}");
            }
            println!("---");
        }
    }

    let book = decoder.snapshot();
    eprintln!(
        "Read {} records. Final book: {} bids, {} asks.",
        records,
        book.depth(Side::Bid),
        book.depth(Side::Ask)
    );
    Ok(())
}
