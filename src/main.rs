use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use forgekernel::config::NodeConfig;
use forgekernel::core::chainstate::ChainstateManager;
use forgekernel::core::params::{ChainParams, Network, COIN};
use forgekernel::core::script::p2pkh_script;
use forgekernel::core::types::{encode_wire, Hash256, OutPoint, MAX_WIRE_SIZE};
use forgekernel::crypto::Keypair;
use forgekernel::index::TxIndex;
use forgekernel::miner::{self, MineResult, MinerConfig};
use forgekernel::storage::{MemoryStore, SharedStore, SledStore};

#[derive(Parser)]
#[command(name = "forgekernel", version)]
#[command(about = "EquiForge validation and chainstate engine")]
struct Cli {
    /// JSON config file (default: ./forgekernel.json when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// main, test or regtest
    #[arg(long, global = true)]
    network: Option<Network>,
    /// Script verification threads (0 = one per CPU)
    #[arg(long, global = true)]
    threads: Option<usize>,
    /// Maintain the transaction index
    #[arg(long, global = true)]
    txindex: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the chainstate at genesis
    Init,
    /// Show chainstate info
    Info,
    /// Import blocks from a file of length-prefixed wire blocks
    Import {
        #[arg(short, long)]
        input: PathBuf,
    },
    /// Rebuild the coin set from the stored blocks
    Reindex,
    /// Look up an unspent output
    GetCoin { txid: String, vout: u32 },
    /// Find the block that confirmed a transaction (needs --txindex)
    GetTx { txid: String },
    /// Export the coin set at the tip as a UTXO snapshot
    ExportSnapshot {
        #[arg(short, long, default_value = "utxo-snapshot.bin")]
        output: PathBuf,
    },
    /// Load a trusted UTXO snapshot
    LoadSnapshot {
        #[arg(short, long, default_value = "utxo-snapshot.bin")]
        input: PathBuf,
    },
    /// Mine blocks for testing (in-memory)
    TestMine {
        #[arg(default_value_t = 5)]
        count: u64,
        /// Also write the mined blocks to this file, ready for `import`
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

fn fail(msg: impl std::fmt::Display) -> ! {
    eprintln!("❌ {}", msg);
    std::process::exit(1);
}

fn format_amount(base_units: u128) -> String {
    let coin = COIN as u128;
    let whole = base_units / coin;
    let frac = base_units % coin;
    if frac == 0 {
        format!("{}", whole)
    } else {
        format!("{}.{:08}", whole, frac).trim_end_matches('0').to_string()
    }
}

fn parse_txid(s: &str) -> Hash256 {
    let bytes = hex::decode(s).unwrap_or_else(|e| fail(format!("invalid txid hex: {}", e)));
    <Hash256>::try_from(bytes.as_slice()).unwrap_or_else(|_| fail("txid must be 32 bytes"))
}

fn open_store(config: &NodeConfig) -> SharedStore {
    let dir = config.chain_dir();
    std::fs::create_dir_all(&dir).unwrap_or_else(|e| fail(format!("cannot create {}: {}", dir.display(), e)));
    let store = SledStore::open(dir.join("chainstate")).unwrap_or_else(|e| fail(e));
    Arc::new(store)
}

fn open_manager(store: &SharedStore, config: &NodeConfig) -> Arc<ChainstateManager> {
    let params = ChainParams::for_network(config.network);
    let manager = ChainstateManager::open(store.clone(), params, config.manager_options()).unwrap_or_else(|e| fail(e));
    Arc::new(manager)
}

/// Open the tx index, follow the manager from here on and catch up.
fn attach_index(store: &SharedStore, manager: &ChainstateManager, cancel: &AtomicBool) -> Arc<TxIndex> {
    let index = Arc::new(TxIndex::open(store.clone()).unwrap_or_else(|e| fail(e)));
    manager.register_sink(index.clone());
    index.sync_to(manager, cancel).unwrap_or_else(|e| fail(e));
    index
}

fn read_block_file(path: &Path) -> std::io::Result<Vec<Vec<u8>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut blocks = Vec::new();
    let mut len_buf = [0u8; 4];
    loop {
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        let len = u32::from_le_bytes(len_buf) as u64;
        if len > MAX_WIRE_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("block record of {} bytes", len),
            ));
        }
        let mut block = vec![0u8; len as usize];
        reader.read_exact(&mut block)?;
        blocks.push(block);
    }
    Ok(blocks)
}

fn write_block_file(path: &Path, blocks: &[Vec<u8>]) -> std::io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for block in blocks {
        writer.write_all(&(block.len() as u32).to_le_bytes())?;
        writer.write_all(block)?;
    }
    writer.flush()
}

fn init_logging(config: &NodeConfig) {
    let directive = config.log_filter.as_deref().unwrap_or("forgekernel=info");
    let mut filter = EnvFilter::from_default_env();
    for part in directive.split(',').filter(|p| !p.trim().is_empty()) {
        match part.trim().parse() {
            Ok(d) => filter = filter.add_directive(d),
            Err(e) => eprintln!("⚠️  Ignoring log directive '{}': {}", part, e),
        }
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() {
    let cli = Cli::parse();

    let mut config = NodeConfig::load(cli.config.as_deref()).unwrap_or_else(|e| fail(e));
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(network) = cli.network {
        config.network = network;
    }
    if let Some(threads) = cli.threads {
        config.script_threads = threads;
    }
    init_logging(&config);

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            println!("\n🛑 Stopping after the current block...");
            cancel.store(true, Ordering::SeqCst);
        }) {
            eprintln!("⚠️  Could not install Ctrl-C handler: {}", e);
        }
    }

    if config.network != Network::Main {
        println!("⚠️  Running on {} (data: {})", config.network, config.chain_dir().display());
    }

    match cli.command {
        Commands::Init => {
            let store = open_store(&config);
            let manager = open_manager(&store, &config);
            let tip = manager.best_tip().unwrap_or_else(|e| fail(e));
            println!("🔨 forgekernel initialized!");
            println!("  Data:    {}", config.chain_dir().display());
            println!("  Network: {}", config.network);
            println!("  Height:  {}", tip.height);
            println!("  Tip:     {}", hex::encode(tip.hash));
        }

        Commands::Info => {
            let store = open_store(&config);
            let manager = open_manager(&store, &config);
            let tip = manager.best_tip().unwrap_or_else(|e| fail(e));
            let stats = manager.utxo_stats().unwrap_or_else(|e| fail(e));
            println!("📊 forgekernel ({})", config.network);
            println!("  Height:     {}", tip.height);
            println!("  Tip:        {}", hex::encode(tip.hash));
            println!("  Chain work: {}", tip.chain_work);
            println!("  Next diff:  {} bits", manager.next_difficulty());
            println!("  MTP:        {}", manager.median_time_past());
            println!("  Tips:       {}", manager.tips().len());
            println!("  UTXOs:      {}", stats.coin_count);
            println!("  Supply:     {} EQF", format_amount(stats.total_amount));
            println!("  Digest:     {}", hex::encode(stats.digest));
            if cli.txindex {
                let index = attach_index(&store, &manager, &cancel);
                let summary = index.summary(&manager);
                println!(
                    "  Tx index:   {} (height {})",
                    if summary.synced { "synced" } else { "behind" },
                    summary.best_block_height.map_or("-".to_string(), |h| h.to_string())
                );
            }
        }

        Commands::Import { input } => {
            let blocks = read_block_file(&input).unwrap_or_else(|e| fail(format!("{}: {}", input.display(), e)));
            let store = open_store(&config);
            let manager = open_manager(&store, &config);
            if cli.txindex {
                attach_index(&store, &manager, &cancel);
            }
            println!("📥 Importing {} blocks from {}...", blocks.len(), input.display());
            let summary = manager
                .spawn_import(blocks, cancel.clone())
                .join()
                .unwrap_or_else(|_| fail("import thread panicked"))
                .unwrap_or_else(|e| fail(e));
            let tip = manager.best_tip().unwrap_or_else(|e| fail(e));
            println!(
                "  ✅ {} accepted, {} already known, {} rejected, {} orphans{}",
                summary.accepted,
                summary.duplicates,
                summary.rejected,
                summary.orphans,
                if summary.interrupted { " (interrupted)" } else { "" }
            );
            println!("  Tip: #{} {}", tip.height, hex::encode(tip.hash));
        }

        Commands::Reindex => {
            let store = open_store(&config);
            let manager = open_manager(&store, &config);
            println!("🔄 Reindexing chainstate...");
            let summary = manager.reindex_chainstate(&cancel).unwrap_or_else(|e| fail(e));
            if summary.interrupted {
                println!("  ⏸️  Interrupted after {} blocks; reopening resumes", summary.connected);
            } else {
                println!("  ✅ Reconnected {} blocks", summary.connected);
            }
        }

        Commands::GetCoin { txid, vout } => {
            let store = open_store(&config);
            let manager = open_manager(&store, &config);
            let outpoint = OutPoint::new(parse_txid(&txid), vout);
            match manager.get_coin(&outpoint).unwrap_or_else(|e| fail(e)) {
                Some(coin) => {
                    println!("💰 {}", outpoint);
                    println!("  Amount:   {} EQF", format_amount(coin.output.amount as u128));
                    println!("  Height:   {}", coin.height);
                    println!("  Coinbase: {}", coin.is_coinbase);
                    println!("  Script:   {}", hex::encode(&coin.output.script_pubkey));
                }
                None => println!("No unspent output {}", outpoint),
            }
        }

        Commands::GetTx { txid } => {
            if !cli.txindex {
                fail("get-tx needs --txindex");
            }
            let store = open_store(&config);
            let manager = open_manager(&store, &config);
            let index = attach_index(&store, &manager, &cancel);
            match index.lookup(&parse_txid(&txid)).unwrap_or_else(|e| fail(e)) {
                Some(location) => println!(
                    "📍 Block #{} {} position {}",
                    location.height,
                    hex::encode(location.block_hash),
                    location.position
                ),
                None => println!("Transaction not in the active chain"),
            }
        }

        Commands::ExportSnapshot { output } => {
            let store = open_store(&config);
            let manager = open_manager(&store, &config);
            println!("📸 Exporting UTXO snapshot...");
            let meta = manager.export_snapshot(&output).unwrap_or_else(|e| fail(e));
            let file_size = std::fs::metadata(&output).map(|m| m.len()).unwrap_or(0);
            println!("  ✅ {} coins at #{} written to {}", meta.coin_count, meta.base_height, output.display());
            println!("  📦 File size: {:.1} MB", file_size as f64 / 1_048_576.0);
            println!("  Base:   {}", hex::encode(meta.base_hash));
            println!("  Digest: {}", hex::encode(meta.digest));
        }

        Commands::LoadSnapshot { input } => {
            if !input.exists() {
                fail(format!("Snapshot file not found: {}", input.display()));
            }
            let store = open_store(&config);
            let manager = open_manager(&store, &config);
            println!("📸 Loading UTXO snapshot from {}...", input.display());
            let meta = manager.load_snapshot(&input).unwrap_or_else(|e| fail(e));
            println!("  ✅ {} coins loaded, tip now #{}", meta.coin_count, meta.base_height);
        }

        Commands::TestMine { count, out } => {
            let store: SharedStore = Arc::new(MemoryStore::new());
            let manager = open_manager(&store, &config);
            let payout = Keypair::generate();
            let miner_config = MinerConfig {
                payout_script: p2pkh_script(&payout.pubkey_hash()),
                threads: config.resolved_script_threads(),
                ..MinerConfig::default()
            };
            let algorithm = manager.params().pow_algorithm;
            println!("⛏️  Test mining {} blocks ({}, in memory)...", count, algorithm.name());

            let mut mined = Vec::new();
            for _ in 0..count {
                let template = miner::create_block_template(&manager, None, &miner_config).unwrap_or_else(|e| fail(e));
                let block = match miner::mine_block_parallel(template.block, algorithm, miner_config.threads, cancel.clone()) {
                    MineResult::Found(block) => block,
                    MineResult::Cancelled => break,
                };
                let bytes = encode_wire(&block).unwrap_or_else(|e| fail(e));
                match manager.process_block(&bytes) {
                    Ok(_) => println!("  ✅ Block #{} {}", template.height, hex::encode(block.hash())),
                    Err(e) => fail(format!("mined block rejected: {}", e)),
                }
                mined.push(bytes);
            }

            if let Some(path) = out {
                write_block_file(&path, &mined).unwrap_or_else(|e| fail(format!("{}: {}", path.display(), e)));
                println!("  📦 Wrote {} blocks to {}", mined.len(), path.display());
            }
        }
    }
}
