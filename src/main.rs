use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use tokio::sync::mpsc;

use memcard_recovery::cli::{Args, Command, ScanArgs};
use memcard_recovery::{
    CancelToken, CardImage, ChainStatus, DescriptorSet, ScanProgress, ScanReport, ScanStatus, Validity,
};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(e) = args.validate() {
        eprintln!("Invalid arguments: {}", e);
        std::process::exit(2);
    }

    if let Err(e) = run(args).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp(None)
        .init();
}

async fn run(args: Args) -> Result<()> {
    let mut card = CardImage::open_path_with_format(&args.image, args.card_format())
        .with_context(|| format!("opening {}", args.image.display()))?;

    if args.use_directory.is_some() || args.use_block_table.is_some() {
        let tables = card.tables();
        let directory = args
            .use_directory
            .map(Into::into)
            .or(tables.active_directory_copy())
            .context("no valid directory copy to keep")?;
        let block_table = args
            .use_block_table
            .map(Into::into)
            .or(tables.active_block_table_copy())
            .context("no valid block table copy to keep")?;
        card.reselect(directory, block_table)?;
    }

    match &args.command {
        Command::Info => print_info(&card),
        Command::List => print_list(&card)?,
        Command::Scan(scan) => run_scan(card, &args.image, scan).await?,
        Command::Export { slot, output } => {
            let file = card.active_file(*slot)?;
            let exported = card.export_file(&file)?;
            fs::write(output, &exported.data).with_context(|| format!("writing {}", output.display()))?;
            println!(
                "Exported slot {} ({} blocks, sha256 {}) to {}",
                slot,
                exported.blocks.len(),
                exported.sha256,
                output.display()
            );
        }
    }

    Ok(())
}

fn print_info(card: &CardImage) {
    let geometry = card.geometry();
    println!("Card image");
    println!("{}", "=".repeat(60));
    println!(
        "  Size:             {} KiB ({} Mbit, {} blocks)",
        geometry.image_size() / 1024,
        geometry.size_mbits(),
        geometry.block_count()
    );
    match card.header() {
        Some(header) => {
            println!("  Encoding:         {:?}", header.encoding);
            println!("  Header checksum:  {}", if header.checksum_valid { "ok" } else { "BAD" });
        }
        None => println!("  Header:           unreadable"),
    }
    println!("  Region:           {:?}", card.region());
    println!("  Directory:        {:?}", card.directory_selection());
    println!("  Block table:      {:?}", card.block_table_selection());
    println!(
        "  Blocks:           {} claimed, {} free",
        card.usage().claimed_count(),
        card.usage().free_blocks().len()
    );

    if card.diagnostics().is_empty() {
        println!("  Diagnostics:      none");
    } else {
        println!("  Diagnostics:");
        for issue in card.diagnostics() {
            println!("    - {}", issue);
        }
    }
}

fn print_list(card: &CardImage) -> Result<()> {
    let files = card.list_active_files().context("listing files")?;
    println!("{:>4}  {:<4} {:<2}  {:<32} {:>5} {:>6}  {}", "SLOT", "GAME", "MK", "FILENAME", "FIRST", "BLOCKS", "CHAIN");
    for file in &files {
        let chain = match &file.chain {
            ChainStatus::Verified(_) => "verified".to_string(),
            ChainStatus::Unverified(_) => "unverified".to_string(),
            ChainStatus::Corrupt(fault) => format!("corrupt ({})", fault),
        };
        println!(
            "{:>4}  {:<4} {:<2}  {:<32} {:>5} {:>6}  {}",
            file.entry.slot,
            file.entry.game_code_str(),
            file.entry.maker_code_str(),
            file.entry.filename_str(),
            file.entry.first_block,
            file.entry.block_count,
            chain
        );
    }
    println!("{} file(s)", files.len());
    Ok(())
}

async fn run_scan(card: CardImage, image_path: &Path, scan: &ScanArgs) -> Result<()> {
    let variables = scan.variables().map_err(anyhow::Error::msg)?;
    let text = fs::read_to_string(&scan.descriptors)
        .with_context(|| format!("reading {}", scan.descriptors.display()))?;
    let descriptors = DescriptorSet::from_json(&text, &variables)?;
    info!("loaded {} descriptors", descriptors.len());

    let card = Arc::new(card);
    let cancel = CancelToken::new();
    let (sender, mut receiver) = mpsc::channel::<ScanProgress>(256);

    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, stopping scan after the current block");
                cancel.cancel();
            }
        })
    };

    let worker = {
        let card = Arc::clone(&card);
        let config = scan.scan_config();
        tokio::task::spawn_blocking(move || card.scan_with_config(&descriptors, config, &sender, &cancel))
    };

    while let Some(progress) = receiver.recv().await {
        match progress {
            ScanProgress::Blocks { scanned, total } => {
                if scanned % 256 == 0 || scanned == total {
                    info!("scanned {}/{} free blocks", scanned, total);
                }
            }
            ScanProgress::Recovered(entry) => debug!("found {} at block {}", entry.filename, entry.start_block),
            ScanProgress::Finished { found, status } => debug!("scan finished ({:?}), {} found", status, found),
        }
    }

    let outcome = worker.await.context("scan worker failed")?;
    interrupt.abort();
    if outcome.status == ScanStatus::Cancelled {
        warn!("scan cancelled; results are partial");
    }
    for entry in &outcome.entries {
        println!(
            "  block {:>4}: {} {} ({} blocks, {})",
            entry.start_block,
            entry.game_id,
            entry.filename,
            entry.block_count,
            match entry.validity {
                Validity::Verified => "verified",
                Validity::Heuristic => "heuristic",
            }
        );
    }
    println!(
        "Recovered {} file(s): {} verified, {} heuristic",
        outcome.stats.recovered, outcome.stats.verified, outcome.stats.heuristic
    );

    if let Some(dir) = &scan.export_dir {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        for entry in &outcome.entries {
            let exported = card.export_file(entry)?;
            let path = dir.join(format!("{:04}-{}", entry.start_block, exported.suggested_name()));
            fs::write(&path, &exported.data).with_context(|| format!("writing {}", path.display()))?;
        }
        info!("exported {} file(s) to {}", outcome.entries.len(), dir.display());
    }

    if let Some(path) = &scan.report {
        ScanReport::new(&card, &image_path.display().to_string(), Some(&outcome))
            .write_json(path)
            .with_context(|| format!("writing report {}", path.display()))?;
        info!("report written to {}", path.display());
    }

    Ok(())
}
