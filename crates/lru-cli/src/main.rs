#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use lru_core::{
    DataType, FixPolicy, HostConfig, HostImage, LruHost, LruId, LruKind, MemHost, PolicySink,
    commit_do, lru_key_to_text, lru_walk, run_lru_fsck,
};
use serde::Serialize;
use std::env;
use std::fs;
use std::path::Path;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_OLDEST: usize = 10;

#[derive(Debug, Serialize)]
struct OldestEntry {
    time: u64,
    dev: u16,
    bucket: u64,
    data_type: DataType,
}

fn main() {
    init_tracing();
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "check" => {
            let Some(path) = args.next() else {
                bail!("check requires an image path");
            };
            let flags: Vec<String> = args.collect();
            let fix = flags.iter().any(|a| a == "--fix");
            let json = flags.iter().any(|a| a == "--json");
            check(Path::new(&path), fix, json)
        }
        "dump" => {
            let Some(path) = args.next() else {
                bail!("dump requires an image path");
            };
            dump(Path::new(&path))
        }
        "oldest" => {
            let Some(path) = args.next() else {
                bail!("oldest requires <image-path> <read:DEV|fragmentation> [count]");
            };
            let Some(lru) = args.next() else {
                bail!("oldest requires <image-path> <read:DEV|fragmentation> [count]");
            };
            let lru_id = parse_lru(&lru)?;
            let count = match args.next() {
                Some(raw) => raw
                    .parse()
                    .with_context(|| format!("invalid count: {raw}"))?,
                None => DEFAULT_OLDEST,
            };
            let json = args.any(|a| a == "--json");
            oldest(Path::new(&path), lru_id, count, json)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("lru-cli\n");
    println!("USAGE:");
    println!("  lru-cli check <image.json> [--fix] [--json]");
    println!("  lru-cli dump <image.json>");
    println!("  lru-cli oldest <image.json> <read:DEV|fragmentation> [count] [--json]");
}

fn parse_lru(raw: &str) -> Result<LruId> {
    if raw == "fragmentation" {
        return Ok(LruId::FRAGMENTATION);
    }
    let Some(dev) = raw.strip_prefix("read:") else {
        bail!("invalid lru {raw:?}: expected read:DEV or fragmentation");
    };
    let dev: u16 = dev
        .parse()
        .with_context(|| format!("invalid device index in {raw:?}"))?;
    let lru_id = LruId::read(dev);
    if lru_id.kind() != LruKind::Read {
        bail!("device index {dev} is reserved");
    }
    Ok(lru_id)
}

fn load(path: &Path) -> Result<MemHost> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let image: HostImage = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse host image {}", path.display()))?;
    MemHost::from_image(&image, HostConfig::default())
        .with_context(|| format!("invalid host image {}", path.display()))
}

fn store(path: &Path, host: &MemHost) -> Result<()> {
    let text = serde_json::to_string_pretty(&host.image()).context("serialize host image")?;
    fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
}

fn check(path: &Path, fix: bool, json: bool) -> Result<()> {
    let host = load(path)?;
    let policy = if fix {
        FixPolicy::Repair
    } else {
        FixPolicy::ReadOnly
    };
    let sink = PolicySink::new(policy);
    let report = run_lru_fsck(&host, &sink).context("lru fsck failed")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize report")?
        );
    } else {
        print!("{report}");
    }

    if report.fixes() > 0 {
        store(path, &host)?;
        info!(
            target: "lru::cli",
            event = "image_written",
            fixes = report.fixes(),
            path = %path.display()
        );
    }
    let unfixed = report
        .lrus
        .findings
        .iter()
        .chain(&report.alloc_refs.findings)
        .filter(|f| !f.fixed)
        .count();
    if unfixed > 0 {
        bail!("{unfixed} lru inconsistencies left unfixed");
    }
    Ok(())
}

fn dump(path: &Path) -> Result<()> {
    let host = load(path)?;
    let image = host.image();
    println!("devices:");
    for device in &image.devices {
        println!(
            "  {}: bucket_size {} nbuckets {}",
            device.index, device.bucket_size, device.nbuckets
        );
    }
    println!("alloc:");
    for record in &image.alloc {
        println!("  {}: {}", record.bucket, record.entry);
    }
    println!("lru:");
    for key in &image.lru {
        println!("  {}", lru_key_to_text(key));
    }
    Ok(())
}

fn oldest(path: &Path, lru_id: LruId, count: usize, json: bool) -> Result<()> {
    let host = load(path)?;
    host.flush_write_buffer()?;
    let walk = commit_do(&host, |trans| {
        let entries = lru_walk(trans, lru_id, count)?;
        let mut out = Vec::with_capacity(entries.len());
        for (time, bucket) in entries {
            let data_type = trans.alloc_entry(bucket)?.unwrap_or_default().data_type;
            out.push(OldestEntry {
                time: time.get(),
                dev: bucket.dev,
                bucket: bucket.bucket,
                data_type,
            });
        }
        Ok(out)
    })
    .context("lru walk failed")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&walk).context("serialize walk")?
        );
    } else {
        for entry in &walk {
            println!(
                "{:>16} {}:{} {}",
                entry.time, entry.dev, entry.bucket, entry.data_type
            );
        }
    }
    Ok(())
}
