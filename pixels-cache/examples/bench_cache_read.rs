use clap::Parser;
use pixels_cache::config::CacheConfig;
use pixels_cache::coord::MemCoordStore;
use pixels_cache::error::{Error, Result};
use pixels_cache::physical::{SourceReader, SourceReaderFactory};
use pixels_cache::radix::CacheKey;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;

#[derive(Debug, Parser)]
#[command(version, about = "Cache read-path micro benchmark")]
struct Args {
    /// Number of cached columnlets.
    #[arg(long, default_value_t = 4096)]
    entries: usize,
    /// Size of each columnlet in bytes.
    #[arg(long, default_value_t = 1024)]
    entry_size: usize,
    /// Number of concurrent reader threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
    /// Benchmark duration in seconds.
    #[arg(long, default_value_t = 5)]
    seconds: u64,
    /// Measure the copying path instead of the zero-copy path.
    #[arg(long, default_value_t = false)]
    direct: bool,
}

/// The benchmark fills the cache through the writer's append hook, so the
/// factory is never asked to open anything.
struct NullFactory;

impl SourceReaderFactory for NullFactory {
    fn open(&self, path: &str) -> Result<Box<dyn SourceReader + '_>> {
        Err(Error::SourceIOFailure(format!("no source files here: {path}")))
    }
}

fn main() {
    let args = Args::parse();
    let temp_dir = TempDir::new().unwrap();
    let cache_path = temp_dir.path().join("pixels.cache");
    let index_path = temp_dir.path().join("pixels.index");
    let cache_size = 6 + args.entries * args.entry_size + 4096;
    let index_size = 1024 + args.entries * 128;

    let config = CacheConfig::default()
        .cache_location(cache_path.to_str().unwrap())
        .cache_size(cache_size as u64)
        .index_location(index_path.to_str().unwrap())
        .index_size(index_size as u64)
        .read_direct(args.direct);
    let mut writer = config
        .writer_builder()
        .host("bench")
        .source_factory(Arc::new(NullFactory))
        .coord_store(Arc::new(MemCoordStore::new()))
        .build()
        .unwrap();

    let keys: Vec<CacheKey> = (0..args.entries)
        .map(|i| CacheKey::new((i >> 16) as u64, ((i >> 8) & 0xFF) as u16, (i & 0xFF) as u16))
        .collect();
    let fill_start = Instant::now();
    let payload = vec![0x5Au8; args.entry_size];
    for key in &keys {
        writer.write(*key, &payload).unwrap();
    }
    writer.flush().unwrap();
    println!(
        "filled {} entries x {} B in {:?}",
        args.entries,
        args.entry_size,
        fill_start.elapsed()
    );

    let stop = Arc::new(AtomicBool::new(false));
    let keys = Arc::new(keys);
    let mut handles = Vec::new();
    for _ in 0..args.threads {
        let reader = config.reader_builder().build().unwrap();
        let stop = Arc::clone(&stop);
        let keys = Arc::clone(&keys);
        let direct = config.is_read_direct();
        handles.push(std::thread::spawn(move || {
            let mut rng = rand::rng();
            let mut hits = 0u64;
            let mut bytes = 0u64;
            while !stop.load(Ordering::Relaxed) {
                let key = keys[rng.random_range(0..keys.len())];
                let len = if direct {
                    reader.get_direct(key).map(|b| b.len())
                } else {
                    reader.get(key).map(|s| s.len())
                };
                if let Some(len) = len {
                    hits += 1;
                    bytes += len as u64;
                }
            }
            (hits, bytes)
        }));
    }

    let bench_start = Instant::now();
    std::thread::sleep(std::time::Duration::from_secs(args.seconds));
    stop.store(true, Ordering::Relaxed);
    let mut total_hits = 0u64;
    let mut total_bytes = 0u64;
    for handle in handles {
        let (hits, bytes) = handle.join().unwrap();
        total_hits += hits;
        total_bytes += bytes;
    }
    let elapsed = bench_start.elapsed();
    let per_sec = total_hits as f64 / elapsed.as_secs_f64();
    let mib_per_sec = total_bytes as f64 / (1024.0 * 1024.0) / elapsed.as_secs_f64();
    println!(
        "{} threads, {} path: {:.0} lookups/s, {:.1} MiB/s",
        args.threads,
        if args.direct { "direct" } else { "mapped" },
        per_sec,
        mib_per_sec
    );
}
