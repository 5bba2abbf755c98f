use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{info, warn};
use rand::Rng;

use mana_rx::api::Mempool;
use mana_rx::buffer_pool::HeapPool;
use mana_rx::config::DEFAULT_RXQ_NUM;
use mana_rx::errors::{PostError, RefillError};
use mana_rx::registry::{AdapterRegistry, MAX_VPORTS};
use mana_rx::rss::{RssConf, RssHf, parse_rss_hf};
use mana_rx::sim::SimDevice;
use mana_rx::{RxFlags, RxPort};

const ADAPTER: &str = "mana0";

/// Brings up rx queues on a simulated adapter and cycles buffers through
/// them.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Number of rx queues.
    #[clap(short, long, default_value_t = DEFAULT_RXQ_NUM)]
    queues: u16,

    /// Descriptors per queue (power of two).
    #[clap(short, long, default_value_t = 256)]
    ring_size: u32,

    /// Buffers in the pool. Defaults to twice what the rings hold.
    #[clap(short, long)]
    pool_size: Option<usize>,

    /// Bytes per buffer, headroom included.
    #[clap(short, long, default_value_t = 2048)]
    buf_size: u32,

    /// Hash types, comma separated: ipv4,ipv6,tcp,udp.
    #[clap(long, value_parser = parse_rss_hf)]
    rss: Option<RssHf>,

    /// Completion/refill rounds to run per queue.
    #[clap(long, default_value_t = 4)]
    bursts: usize,

    /// Debug logging.
    #[clap(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut registry = AdapterRegistry::new();
    let adapter = registry.register(ADAPTER, Arc::new(SimDevice::new()), MAX_VPORTS)?;
    let vport = adapter
        .alloc_vport()
        .context("no free vport on adapter")?;
    let device = adapter.device();
    info!("using {ADAPTER} vport {vport}");

    let pool_size = args
        .pool_size
        .unwrap_or(2 * args.queues as usize * args.ring_size as usize);
    let pool = Arc::new(HeapPool::new(pool_size, args.buf_size)?);

    let flags = RxFlags {
        num_queues: args.queues,
        ring_size: args.ring_size,
        rss: RssConf {
            key: None,
            hf: args.rss.unwrap_or_else(RssHf::empty),
        },
        ..Default::default()
    };

    let mut port = RxPort::new(device, pool.clone(), &flags)?;
    port.start().context("rx start failed")?;
    info!("port running, {} buffers in use", pool.in_use());

    let mut rng = rand::rng();
    for burst in 0..args.bursts {
        for qid in 0..args.queues as usize {
            let Some(q) = port.queue_mut(qid) else {
                bail!("queue {qid} missing");
            };
            let done = rng.random_range(0..=q.outstanding());
            for _ in 0..done {
                if let Some(mbuf) = q.pop_completed() {
                    pool.free(mbuf);
                }
            }
            match q.refill() {
                Ok(_) => {}
                Err(RefillError::Post(p)) if matches!(p.source, PostError::OutOfBuffers) => {
                    warn!("burst {burst} rxq {qid}: pool ran dry after {}", p.posted);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    for q in port.queues() {
        let s = q.stats();
        println!(
            "rxq {:2}: posted {} completed {} nombuf {} doorbells {} outstanding {}",
            q.id(),
            s.posted,
            s.completed,
            s.nombuf,
            s.doorbells,
            q.outstanding()
        );
    }

    port.stop();
    println!("after stop: {} buffers in use", pool.in_use());

    if let Some(adapter) = registry.find_mut(ADAPTER) {
        adapter.release_vport(vport);
    }
    Ok(())
}
