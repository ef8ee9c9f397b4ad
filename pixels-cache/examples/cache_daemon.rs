use clap::{Args, Parser, Subcommand};
use pixels_cache::config::CacheConfig;
use pixels_cache::coord::{CompactLayout, MemCoordStore};
use pixels_cache::daemon::{spawn_named, CacheDaemon, RebuildRequest};
use pixels_cache::error::{Error, Result};
use pixels_cache::mem::MappedRegion;
use pixels_cache::mq::{MappedBusReader, MappedBusWriter};
use pixels_cache::physical::{ChunkExtent, RowGroupFooter, SourceReader, SourceReaderFactory};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

const BUS_RECORD_SIZE: usize = 16;
/// Bus record type asking a running daemon to shut down.
const MSG_DAEMON_STOP: u32 = 0xD1E;

#[derive(Debug, Parser)]
#[command(version, about = "Pixels cache writer daemon")]
struct Cli {
    #[command(flatten)]
    files: FileArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct FileArgs {
    /// Cache file location, typically on tmpfs.
    #[arg(long, default_value = "/dev/shm/pixels.cache")]
    cache_location: String,
    /// Fixed cache file size in bytes.
    #[arg(long, default_value_t = 256 * 1024 * 1024)]
    cache_size: usize,
    /// Index file location.
    #[arg(long, default_value = "/dev/shm/pixels.index")]
    index_location: String,
    /// Fixed index file size in bytes.
    #[arg(long, default_value_t = 16 * 1024 * 1024)]
    index_size: usize,
    /// Bus file used for daemon coordination.
    #[arg(long, default_value = "/dev/shm/pixels.bus")]
    bus_location: String,
    /// Fixed bus file size in bytes.
    #[arg(long, default_value_t = 64 * 1024)]
    bus_size: usize,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the writer daemon and serve until a stop record arrives on
    /// the bus or the run time passes.
    Start {
        #[arg(long, default_value = "localhost")]
        host: String,
        #[arg(long, default_value_t = 300)]
        run_secs: u64,
    },
    /// Ask a running daemon on this host to shut down.
    Stop,
}

/// Treats each source path as a plain local file holding one columnlet.
/// Stands in for the columnar file reader of the real deployment.
struct LocalFileFactory;

struct LocalFile {
    block_id: u64,
    data: Vec<u8>,
}

impl SourceReader for LocalFile {
    fn block_id(&self) -> u64 {
        self.block_id
    }

    fn row_group_footer(&self, _row_group_id: u16) -> Result<RowGroupFooter> {
        Ok(RowGroupFooter::new(vec![ChunkExtent {
            offset: 0,
            length: self.data.len() as u32,
        }]))
    }

    fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let start = offset as usize;
        self.data
            .get(start..start + length)
            .map(|slice| slice.to_vec())
            .ok_or(Error::SourceIOFailure("read past end of file".to_string()))
    }
}

impl SourceReaderFactory for LocalFileFactory {
    fn open(&self, path: &str) -> Result<Box<dyn SourceReader + '_>> {
        let data = std::fs::read(path).map_err(|e| Error::SourceIOFailure(e.to_string()))?;
        let mut hasher = DefaultHasher::new();
        path.hash(&mut hasher);
        Ok(Box::new(LocalFile {
            block_id: hasher.finish(),
            data,
        }))
    }
}

fn start(files: &FileArgs, host: String, run_secs: u64) -> Result<()> {
    let bus_region = MappedRegion::map(files.bus_location.as_str(), files.bus_size)?;
    // fresh bus per daemon run: stale stop records must not kill us.
    let bus = MappedBusWriter::open(bus_region, BUS_RECORD_SIZE, false)?;

    let config = CacheConfig::default()
        .cache_location(files.cache_location.as_str())
        .cache_size(files.cache_size as u64)
        .index_location(files.index_location.as_str())
        .index_size(files.index_size as u64);
    let writer = config
        .writer_builder()
        .host(host)
        .source_factory(Arc::new(LocalFileFactory))
        .coord_store(Arc::new(MemCoordStore::new()))
        .bus(bus)
        .build()?;
    let daemon = Arc::new(CacheDaemon::start(writer));

    // install an empty first generation so readers see a valid header.
    daemon.submit(RebuildRequest {
        version: 1,
        layout: CompactLayout::new(0, vec![]),
    })?;

    let watch_region = MappedRegion::map(files.bus_location.as_str(), files.bus_size)?;
    let watcher_daemon = Arc::clone(&daemon);
    let watcher = spawn_named("PixelsCacheBusWatcher", move || {
        let mut bus_reader =
            MappedBusReader::open(&watch_region, BUS_RECORD_SIZE, Duration::from_millis(100));
        let deadline = Instant::now() + Duration::from_secs(run_secs);
        while Instant::now() < deadline {
            match bus_reader.recv() {
                Ok(Some(msg)) if msg.msg_type == MSG_DAEMON_STOP => {
                    println!("stop record received, shutting down");
                    break;
                }
                Ok(_) => std::thread::sleep(Duration::from_millis(100)),
                Err(e) => {
                    eprintln!("bus unreadable ({e}), shutting down");
                    break;
                }
            }
        }
        watcher_daemon.stop();
    });

    println!(
        "cache writer daemon running (cache: {}, index: {})",
        files.cache_location, files.index_location
    );
    let _ = watcher.join();
    daemon.stop();
    Ok(())
}

fn stop(files: &FileArgs) -> Result<()> {
    let bus_region = MappedRegion::map(files.bus_location.as_str(), files.bus_size)?;
    let bus = MappedBusWriter::open(bus_region, BUS_RECORD_SIZE, true)?;
    bus.write(MSG_DAEMON_STOP, b"stop")?;
    println!("stop record published on {}", files.bus_location);
    Ok(())
}

fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Start { host, run_secs } => start(&cli.files, host, run_secs),
        Command::Stop => stop(&cli.files),
    };
    if let Err(e) = result {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
