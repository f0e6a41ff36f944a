//! # Opening Stock Seeder
//!
//! Populates a development database with opening stock.
//!
//! ## Usage
//! ```bash
//! # 200 variants across 3 locations (default)
//! cargo run -p tally-db --bin seed
//!
//! # Custom shape
//! cargo run -p tally-db --bin seed -- --variants 1000 --locations 5
//!
//! # Specify database path
//! cargo run -p tally-db --bin seed -- --db ./data/tally.db
//! ```
//!
//! ## Generated Data
//! - Variant ids: `{CATEGORY}-{INDEX:04}`
//! - Location ids: `LOC-{INDEX:02}`
//! - Opening quantity: 0 - 150, deterministic per (variant, location)
//!
//! Keys that already have ledger activity are skipped, so running the
//! seeder twice leaves the first run's balances untouched.

use std::env;
use tally_core::{CoreError, Quantity, StockKey};
use tally_db::{Database, DbConfig, LedgerError};

const CATEGORIES: &[&str] = &["BEV", "SNK", "DRY", "FRZ", "GRO", "HOM"];

const SEED_ACTOR: &str = "seed";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();

    let mut variants: usize = 200;
    let mut locations: usize = 3;
    let mut db_path = String::from("./tally_dev.db");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--variants" | "-v" => {
                if i + 1 < args.len() {
                    variants = args[i + 1].parse().unwrap_or(200);
                    i += 1;
                }
            }
            "--locations" | "-l" => {
                if i + 1 < args.len() {
                    locations = args[i + 1].parse().unwrap_or(3);
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Tally Opening Stock Seeder");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -v, --variants <N>   Number of product variants (default: 200)");
                println!("  -l, --locations <N>  Number of locations (default: 3)");
                println!("  -d, --db <PATH>      Database file path (default: ./tally_dev.db)");
                println!("  -h, --help           Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    println!("Tally Opening Stock Seeder");
    println!("==========================");
    println!("Database:  {}", db_path);
    println!("Variants:  {}", variants);
    println!("Locations: {}", locations);
    println!();

    let db = Database::new(DbConfig::new(&db_path)).await?;
    println!("✓ Connected to database");
    println!("✓ Migrations applied");
    println!();

    let opening = db.opening();
    let start = std::time::Instant::now();
    let mut seeded = 0usize;
    let mut skipped = 0usize;

    for v in 0..variants {
        let variant_id = variant_id(v);

        for l in 0..locations {
            let key = StockKey::new(variant_id.as_str(), location_id(l));
            let quantity = opening_quantity(v, l);

            match opening.set_opening_stock(&key, quantity, SEED_ACTOR).await {
                Ok(_) => seeded += 1,
                Err(LedgerError::Domain(CoreError::OpeningStockLocked { .. })) => skipped += 1,
                Err(e) => {
                    eprintln!("Failed to seed {}: {}", key, e);
                }
            }
        }

        if (v + 1) % 100 == 0 {
            println!("  Seeded {} variants...", v + 1);
        }
    }

    let elapsed = start.elapsed();
    println!();
    println!("✓ Seeded {} balances in {:?}", seeded, elapsed);
    if skipped > 0 {
        println!("  Skipped {} keys that already had activity", skipped);
    }

    println!();
    println!("Verifying ledger pairing...");
    let violations = db.ledger().verify_pairing().await?;
    if violations.is_empty() {
        println!("  ✓ Transaction log and history log agree");
    } else {
        println!("  ⚠ {} pairing violations", violations.len());
    }

    println!();
    println!("✓ Seed complete!");

    Ok(())
}

fn variant_id(index: usize) -> String {
    let category = CATEGORIES[index % CATEGORIES.len()];
    format!("{}-{:04}", category, index)
}

fn location_id(index: usize) -> String {
    format!("LOC-{:02}", index + 1)
}

/// Deterministic 0-150 spread so reruns on a fresh file match.
fn opening_quantity(variant: usize, location: usize) -> Quantity {
    Quantity::from(((variant * 37 + location * 11) % 151) as i64)
}
