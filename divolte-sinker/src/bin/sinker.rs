use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::{error, info};
use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};

use divolte_core::tool::init_log;
use divolte_sinker::config::SessionBinningConfig;
use divolte_sinker::flusher::Flusher;
use divolte_sinker::record_reader::RecordFileReader;
use divolte_sinker::remote_fs::LocalFileSystem;
use divolte_sinker::session_binning::SessionBinningSink;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Feed files with one encoded record per line.
    #[arg(short, long, required = true)]
    input: Vec<String>,

    /// Destination directory for round files.
    #[arg(short, long, default_value = "divolte-tracking")]
    dir: String,

    /// Session timeout in seconds; also the round width.
    #[arg(long, default_value_t = 1800)]
    session_timeout_secs: u64,

    /// Sync a file holding unsynced records after this many seconds.
    #[arg(long, default_value_t = 30)]
    sync_after_secs: u64,

    /// Sync a file after this many records.
    #[arg(long, default_value_t = 1000)]
    sync_after_records: u32,

    /// Replication factor passed through to file creation.
    #[arg(long, default_value_t = 1)]
    replication: u16,

    /// Heartbeat interval in milliseconds when the queue is idle.
    #[arg(long, default_value_t = 1000)]
    heartbeat_millis: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_log();

    let config = SessionBinningConfig {
        session_timeout: Duration::from_secs(args.session_timeout_secs),
        dir: PathBuf::from(&args.dir),
        sync_file_after_duration: Duration::from_secs(args.sync_after_secs),
        sync_file_after_records: args.sync_after_records,
        replication: args.replication,
        ..SessionBinningConfig::default()
    };

    let sink = SessionBinningSink::new(LocalFileSystem, config);

    let (sender, receiver) = async_channel::bounded(256);
    let flusher = Flusher::new(sink, receiver, Duration::from_millis(args.heartbeat_millis));

    let reader = RecordFileReader::new(&args.input)?;

    tokio::spawn(async move {
        for record in reader {
            match record {
                Ok(record) => {
                    if sender.send(record).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("skipping bad record line, error: {}", e);
                }
            }
        }

        sender.close();
    });

    Toplevel::new(|s| async move {
        s.start(SubsystemBuilder::new("flusher", |handle| {
            flusher.run(handle)
        }));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_millis(1000))
    .await?;

    info!("sinker done");

    Ok(())
}
