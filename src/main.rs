use std::sync::Arc;

use dotenvy::dotenv;
use log::error;

use consent_core::bootstrap::BootstrapManager;
use consent_core::config::AppConfig;
use consent_core::health;
use consent_core::registry::BuiltinRegistry;
use consent_core::shared::utils::{create_conn, DbPool};

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .init();

    let code = match args.get(1).map(String::as_str) {
        Some("bootstrap") => run_bootstrap().await,
        Some("health-check") => {
            let fix = args.iter().any(|a| a == "--fix");
            run_health_check(fix).await
        }
        Some("--help") | Some("-h") | None => {
            print_usage();
            0
        }
        Some(other) => {
            eprintln!("Unknown command: {}", other);
            eprintln!("Run 'consent-core --help' for usage information");
            2
        }
    };

    std::process::exit(code);
}

fn print_usage() {
    println!("consent-core - consent versioning, audit and reconciliation engine");
    println!();
    println!("Usage:");
    println!("  consent-core bootstrap            Create schema, seed the initial version,");
    println!("                                    reconcile and verify. Idempotent.");
    println!("  consent-core health-check [--fix] Run invariant checks; with --fix, apply");
    println!("                                    offered remediations once and re-check.");
}

fn connect() -> Option<DbPool> {
    let config = AppConfig::from_env();
    match create_conn(&config.database_url()) {
        Ok(pool) => Some(pool),
        Err(e) => {
            error!("failed to set up database pool: {}", e);
            None
        }
    }
}

async fn run_bootstrap() -> i32 {
    let Some(pool) = connect() else {
        return 1;
    };

    let result = tokio::task::spawn_blocking(move || {
        let manager = BootstrapManager::new(pool, Arc::new(BuiltinRegistry));
        manager.run()
    })
    .await;

    match result {
        Ok(Ok(report)) => {
            println!("Bootstrap complete.");
            if let Some(label) = report.version_label {
                println!("  active version: {}", label);
            }
            if report.records_repaired > 0 {
                println!("  records repaired: {}", report.records_repaired);
            }
            0
        }
        Ok(Err(e)) => {
            error!("bootstrap failed: {}", e);
            1
        }
        Err(e) => {
            error!("bootstrap task panicked: {}", e);
            1
        }
    }
}

async fn run_health_check(fix: bool) -> i32 {
    let Some(pool) = connect() else {
        return 1;
    };

    let result = tokio::task::spawn_blocking(move || {
        health::run(&pool, &BuiltinRegistry, fix)
    })
    .await;

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            error!("health check task panicked: {}", e);
            return 1;
        }
    };

    for check in &report.checks {
        let status = if check.passed { "ok  " } else { "FAIL" };
        println!("[{}] {}: {}", status, check.name, check.message);
    }
    for name in &report.fixed {
        println!("fixed: {}", name);
    }

    if report.all_passed() {
        0
    } else {
        1
    }
}
