//! GRIDCORE - Region Entry Storage Core
//! Interactive shell over a single versioned region with LRU overflow to disk.

use std::io::{self, BufRead, Write};

use gridcore::config::{EvictionConfig, RegionConfig};
use gridcore::engine::{Region, RemoteUpdate, VersionStamp};
use gridcore::types::{now_ms, Key, MemberId, Value};
use uuid::Uuid;

/// Resident values kept in memory before the shell starts overflowing.
const SHELL_EVICTION_LIMIT: usize = 4;

/// Integers first, then UUIDs, then plain strings.
fn parse_key(raw: &str) -> Key {
    if let Ok(v) = raw.parse::<i32>() {
        return Key::Int(v);
    }
    if let Ok(v) = raw.parse::<i64>() {
        return Key::Long(v);
    }
    if let Ok(u) = Uuid::parse_str(raw) {
        return Key::Uuid(u);
    }
    Key::from(raw)
}

fn show(value: &Value) -> String {
    match std::str::from_utf8(value) {
        Ok(s) => format!("\"{}\"", s),
        Err(_) => format!("<binary {} bytes>", value.len()),
    }
}

fn main() {
    env_logger::init();

    println!();
    println!("  ╔═══════════════════════════════════════════╗");
    println!("  ║          GRIDCORE Region Shell            ║");
    println!("  ║    Versioned Entries · LRU Overflow       ║");
    println!("  ╚═══════════════════════════════════════════╝");
    println!();
    println!("  Commands:");
    println!("    set <key> <value>                 - Write a value locally");
    println!("    get <key>                         - Read a value (faults in if evicted)");
    println!("    del <key>                         - Destroy a key (leaves a tombstone)");
    println!("    inv <key>                         - Invalidate a key");
    println!("    entry <key>                       - Show entry state and version");
    println!("    remote <key> <ver> <member> <val> - Apply a replicated update");
    println!("    evict                             - Run an eviction pass");
    println!("    info                              - Show region statistics");
    println!("    exit                              - Close the region");
    println!();

    let config = RegionConfig::new("shell", "./data")
        .with_statistics(true)
        .with_eviction(EvictionConfig::overflow_entries(SHELL_EVICTION_LIMIT));
    let region = match Region::open(config) {
        Ok(r) => r,
        Err(err) => {
            eprintln!("[ERROR] Failed to open region: {}", err);
            std::process::exit(1);
        }
    };
    println!("  Entry class: {}", region.factory().entry_class().name());
    println!();

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("gridcore> ");
        if stdout.flush().is_err() {
            break;
        }

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break, // EOF
            Ok(_) => {}
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() {
            continue;
        }

        match parts[0].to_lowercase().as_str() {
            "set" | "put" => {
                if parts.len() < 3 {
                    println!("  Usage: set <key> <value>");
                    continue;
                }
                let key = parse_key(parts[1]);
                let value = parts[2..].join(" ");
                match region.put(key, value) {
                    Ok(Some(stamp)) => println!("  OK ({})", stamp),
                    Ok(None) => println!("  OK"),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "get" => {
                if parts.len() < 2 {
                    println!("  Usage: get <key>");
                    continue;
                }
                match region.get(&parse_key(parts[1])) {
                    Ok(Some(value)) => println!("  {}", show(&value)),
                    Ok(None) => println!("  (nil)"),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "del" | "delete" | "destroy" => {
                if parts.len() < 2 {
                    println!("  Usage: del <key>");
                    continue;
                }
                match region.destroy(&parse_key(parts[1])) {
                    Ok(true) => println!("  OK (destroyed)"),
                    Ok(false) => println!("  (nil)"),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "inv" | "invalidate" => {
                if parts.len() < 2 {
                    println!("  Usage: inv <key>");
                    continue;
                }
                match region.invalidate(&parse_key(parts[1])) {
                    Ok(true) => println!("  OK (invalidated)"),
                    Ok(false) => println!("  (nil)"),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "entry" => {
                if parts.len() < 2 {
                    println!("  Usage: entry <key>");
                    continue;
                }
                match region.get_entry(&parse_key(parts[1])) {
                    Ok(Some(snap)) => {
                        println!("  key:       {}", snap.key);
                        println!("  state:     {}", snap.lifecycle);
                        println!("  resident:  {}", snap.resident);
                        match snap.stamp {
                            Some(stamp) => println!("  version:   {}", stamp),
                            None => println!("  version:   -"),
                        }
                        if let Some(value) = &snap.value {
                            println!("  value:     {}", show(value));
                        }
                        println!("  class:     {}", snap.variant);
                    }
                    Ok(None) => println!("  (nil)"),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "remote" => {
                if parts.len() < 5 {
                    println!("  Usage: remote <key> <version> <member> <value>");
                    continue;
                }
                let (Ok(version), Ok(member)) = (parts[2].parse::<u64>(), parts[3].parse::<u64>())
                else {
                    println!("  ERROR: version and member must be integers");
                    continue;
                };
                let stamp = VersionStamp::new(MemberId(member), version, now_ms());
                let update = RemoteUpdate::update(parse_key(parts[1]), parts[4..].join(" "), stamp);
                match region.apply_remote(update) {
                    Ok(outcome) => println!("  {:?}", outcome),
                    Err(e) => println!("  ERROR: {}", e),
                }
            }
            "evict" => match region.evict_now() {
                Ok(n) => println!("  OK ({} evicted)", n),
                Err(e) => println!("  ERROR: {}", e),
            },
            "info" | "stats" => {
                println!("  Live keys:     {}", region.len());
                println!("  Entries:       {}", region.entry_count());
                println!("  Resident:      {}", region.resident_count());
                if let Some(state) = region.eviction_state() {
                    println!("  Eviction:      {:?}", state);
                }
                println!("{}", region.stats().report());
            }
            "exit" | "quit" | "q" => {
                println!("  Shutting down GRIDCORE...");
                break;
            }
            _ => {
                println!("  Unknown command: '{}'. Type 'exit' to quit.", parts[0]);
            }
        }
    }

    if let Err(e) = region.close() {
        eprintln!("[ERROR] Failed to close region: {}", e);
    }
}
