//! shardstore bench - load driver for the in-memory engine
//!
//! Opens a store, fills it from many concurrent tasks, reads everything
//! back, and reports throughput.

use anyhow::{Context, Result, bail, ensure};
use bytes::Bytes;
use clap::Parser;
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use shardstore_common::{AttrNamespace, ByteRange, CollectionId, Config, ObjectId};
use shardstore_storage::{Collection, MemCollection, MemStore, Object, ObjectStore};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "shardstore-bench")]
#[command(about = "Drive a concurrent workload against the in-memory object store")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Number of shards
    #[arg(long)]
    shards: Option<usize>,

    /// Page size in bytes
    #[arg(long)]
    page_size: Option<usize>,

    /// Number of collections
    #[arg(long)]
    collections: Option<usize>,

    /// Objects per collection
    #[arg(long)]
    objects: Option<usize>,

    /// Writes per object
    #[arg(long)]
    writes: Option<usize>,

    /// Size of each write in bytes
    #[arg(long)]
    write_size: Option<usize>,

    /// RNG seed for write offsets
    #[arg(long)]
    seed: Option<u64>,

    /// Log level
    #[arg(long, env = "SHARDSTORE_LOG_LEVEL")]
    log_level: Option<String>,
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    #[serde(flatten)]
    base: Config,
    #[serde(default)]
    workload: WorkloadConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct WorkloadConfig {
    collections: usize,
    objects: usize,
    writes: usize,
    write_size: usize,
    /// Highest offset a write may reach
    object_span: u64,
    seed: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            collections: 4,
            objects: 64,
            writes: 32,
            write_size: 4096,
            object_span: 1 << 20,
            seed: 0x5eed,
        }
    }
}

/// Outcome of one object's workload
struct ObjectReport {
    bytes_written: u64,
    bytes_read: u64,
    extents: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load config file if given
    let config: FileConfig = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {path}"))?;
            toml::from_str(&text).with_context(|| format!("failed to parse config file {path}"))?
        }
        None => FileConfig::default(),
    };

    // Merge CLI args with config file (CLI takes precedence)
    let mut store_config = config.base.store;
    if let Some(shards) = args.shards {
        store_config.shards = shards;
    }
    if let Some(page_size) = args.page_size {
        store_config.page_size = page_size;
    }
    let mut workload = config.workload;
    workload.collections = args.collections.unwrap_or(workload.collections);
    workload.objects = args.objects.unwrap_or(workload.objects);
    workload.writes = args.writes.unwrap_or(workload.writes);
    workload.write_size = args.write_size.unwrap_or(workload.write_size);
    workload.seed = args.seed.unwrap_or(workload.seed);
    let log_level = args.log_level.unwrap_or(config.base.logging.level);

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    ensure!(
        workload.write_size > 0 && (workload.write_size as u64) <= workload.object_span,
        "write size {} must be positive and at most the object span {}",
        workload.write_size,
        workload.object_span
    );

    info!("Starting shardstore bench");
    info!(
        "Shards: {}, page size: {} bytes",
        store_config.shards, store_config.page_size
    );
    info!(
        "Workload: {} collections x {} objects x {} writes of {} bytes",
        workload.collections, workload.objects, workload.writes, workload.write_size
    );

    let store = MemStore::open(store_config).context("failed to open store")?;

    let mut collections = Vec::with_capacity(workload.collections);
    for index in 0..workload.collections {
        let cid = CollectionId::new(format!("bench_{index}.0_head"))?;
        collections.push(store.create_collection(cid).await?);
    }

    let started = Instant::now();
    let tasks: Vec<_> = collections
        .iter()
        .flat_map(|coll| (0..workload.objects).map(move |index| (coll.clone(), index)))
        .enumerate()
        .map(|(task, (coll, index))| {
            let workload = workload.clone();
            tokio::spawn(async move { run_object(coll, index, task as u64, &workload).await })
        })
        .collect();

    let mut failures = 0usize;
    let mut written = 0u64;
    let mut read = 0u64;
    let mut extents = 0usize;
    for result in join_all(tasks).await {
        match result.context("workload task panicked")? {
            Ok(report) => {
                written += report.bytes_written;
                read += report.bytes_read;
                extents += report.extents;
            }
            Err(e) => {
                error!("Object workload failed: {:#}", e);
                failures += 1;
            }
        }
    }
    let elapsed = started.elapsed();

    info!(
        "Wrote {} bytes, read {} bytes in {:?} ({:.1} MiB/s)",
        written,
        read,
        elapsed,
        mib_per_sec(written + read, elapsed)
    );
    info!(
        "Objects: {}, extents: {}",
        store.object_count().await?,
        extents
    );

    for coll in &collections {
        cleanup(coll).await?;
    }
    ensure!(store.object_count().await? == 0, "objects left after cleanup");

    if failures > 0 {
        bail!("{failures} object workloads failed verification");
    }
    info!("All objects verified");
    Ok(())
}

/// Write, tag and read back one object
async fn run_object(
    coll: MemCollection,
    index: usize,
    task: u64,
    workload: &WorkloadConfig,
) -> Result<ObjectReport> {
    let oid = ObjectId::new(format!("obj_{index:06}"))?;
    let obj = coll.create_object(oid).await?;
    obj.set_alloc_hint(workload.object_span, workload.write_size as u64)
        .await?;

    let mut rng = StdRng::seed_from_u64(workload.seed ^ task);
    let mut expected = vec![0u8; workload.object_span as usize];
    let mut end = 0usize;
    let mut bytes_written = 0u64;

    for write in 0..workload.writes {
        let offset = rng.gen_range(0..=expected.len() - workload.write_size);
        let fill = rng.r#gen::<u8>() | 1;
        obj.write(offset as u64, Bytes::from(vec![fill; workload.write_size]))
            .await?;
        expected[offset..offset + workload.write_size].fill(fill);
        end = end.max(offset + workload.write_size);
        bytes_written += workload.write_size as u64;

        obj.setattr(
            AttrNamespace::Omap,
            format!("write_{write:06}"),
            Bytes::from(offset.to_string()),
        )
        .await?;
    }
    obj.setattr(
        AttrNamespace::Xattr,
        "_writes".to_string(),
        Bytes::from(workload.writes.to_string()),
    )
    .await?;
    obj.commit().await?;

    let whole = ByteRange::new(0, end as u64);
    let data = obj.read(whole).await?;
    if data[..] != expected[..end] {
        bail!("{}/{}: data mismatch", coll.id(), obj.oid());
    }

    let (keys, more) = obj
        .enumerate_attr_keys(AttrNamespace::Omap, None, workload.writes)
        .await?;
    ensure!(
        keys.len() == workload.writes && more.is_none(),
        "{}/{}: expected {} omap keys, found {}",
        coll.id(),
        obj.oid(),
        workload.writes,
        keys.len()
    );

    let extents = obj.get_extents(whole).await?;
    let covered: u64 = extents.iter().map(|r| r.length).sum();
    let stat = obj.stat().await?;
    ensure!(
        covered == stat.allocated,
        "{}/{}: extents cover {} bytes, {} allocated",
        coll.id(),
        obj.oid(),
        covered,
        stat.allocated
    );
    debug!(
        oid = %obj.oid(),
        shard = %obj.home_shard(),
        size = stat.size,
        pages = stat.pages,
        "object verified"
    );

    Ok(ObjectReport {
        bytes_written,
        bytes_read: data.len() as u64,
        extents: extents.len(),
    })
}

/// Remove every object of a collection
async fn cleanup(coll: &MemCollection) -> Result<()> {
    let mut after = None;
    loop {
        let (page, more) = coll.list_objects(after.clone(), 256).await?;
        after = page.last().cloned();
        for oid in page {
            coll.remove_object(oid).await?;
        }
        if !more {
            return Ok(());
        }
    }
}

fn mib_per_sec(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        return 0.0;
    }
    bytes as f64 / (1024.0 * 1024.0) / secs
}
