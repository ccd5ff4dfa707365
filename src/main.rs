use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use tick_recorder::client::{DEFAULT_WS_URL, MarketClient, MarketMessage};
use tick_recorder::codec::Encoder;
use tick_recorder::record::{FORMAT_VERSION, StreamHeader};
use tick_recorder::stream::create_capture;

#[derive(Debug, Parser)]
#[command(version, about = "Polymarket order-book tick recorder (delta codec)")]
struct Args {
    /// Asset id (CLOB token id) to subscribe to
    #[arg(long, env = "ASSET_ID")]
    asset: String,

    /// Market-channel websocket URL
    #[arg(long, env = "WS_URL", default_value = DEFAULT_WS_URL)]
    ws_url: String,

    /// Output capture path; defaults to captures/<asset>_YYYY_MM_DD.tick
    #[arg(long, env = "OUT_FILE")]
    out: Option<PathBuf>,

    /// Compress the whole stream with zstd (transparent on replay)
    #[arg(long, default_value_t = false)]
    zstd: bool,

    /// Drop records that collapse to zero entries. Saves space on chatty
    /// feeds but changes replay timestamp spacing.
    #[arg(long, default_value_t = false)]
    drop_empty: bool,
}

fn now_unix_ns() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

fn default_out_path(asset: &str) -> PathBuf {
    let (yy, mm, dd) = if let Ok(now) = time::OffsetDateTime::now_local() {
        let d = now.date();
        (d.year(), d.month() as u8, d.day())
    } else {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let odt = time::OffsetDateTime::from_unix_timestamp(secs)
            .unwrap_or(time::OffsetDateTime::UNIX_EPOCH);
        let d = odt.date();
        (d.year(), d.month() as u8, d.day())
    };
    // asset ids are long numeric strings; a prefix keeps filenames sane
    let prefix: String = asset.chars().take(12).collect();
    let mut p = PathBuf::from("captures");
    p.push(format!("{prefix}_{yy}_{mm:02}_{dd:02}.tick"));
    p
}

fn main() -> Result<()> {
    let _ = dotenv();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).compact().init();

    let args = Args::parse();
    let out_path = args.out.clone().unwrap_or_else(|| default_out_path(&args.asset));
    info!(asset = %args.asset, out = %out_path.display(), zstd = args.zstd, "starting capture");

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::Relaxed);
        })
        .context("install ctrl-c handler")?;
    }

    let (tx, rx) = crossbeam_channel::bounded::<MarketMessage>(8192);
    let client = MarketClient::new(args.ws_url.clone(), args.asset.clone(), stop.clone());
    let client_thread = std::thread::spawn(move || client.run(tx));

    let mut writer = create_capture(&out_path, args.zstd)
        .with_context(|| format!("create capture {}", out_path.display()))?;
    let mut encoder = Encoder::new().drop_empty_records(args.drop_empty);

    let mut header_written = false;
    let mut records = 0u64;
    let mut entries = 0u64;
    let mut dropped = 0u64;
    for msg in rx {
        let (timestamp_ms, encoded) = match msg {
            MarketMessage::Snapshot { timestamp_ms, bids, asks } => {
                (timestamp_ms, encoder.encode_snapshot(timestamp_ms, &bids, &asks))
            }
            MarketMessage::Update(ev) => (ev.timestamp_ms, encoder.encode(&ev)),
        };
        // Ordering violations are fatal for the stream: the delta chain is
        // broken and retrying cannot re-sequence the feed.
        let record = encoded.context("encode update event")?;
        let Some(record) = record else {
            dropped += 1;
            continue;
        };
        if !header_written {
            writer.write_header(&StreamHeader {
                version: FORMAT_VERSION,
                created_unix_ns: now_unix_ns(),
                asset_id: args.asset.clone(),
                base_timestamp_ms: timestamp_ms,
            })?;
            header_written = true;
        }
        debug!(delta_ms = record.timestamp_delta_ms, entries = record.entries.len(), "record");
        writer.write_record(&record)?;
        records += 1;
        entries += record.entries.len() as u64;
    }

    writer.flush()?;
    client_thread.join().ok();
    if header_written {
        info!(records, entries, dropped, "capture finished");
    } else {
        warn!("no records captured");
    }
    Ok(())
}
