//! Trust store inspection.

use clipbridge_core::{Config, TrustScope, TrustStore};

pub fn list_trusted(config: &Config, scope: TrustScope) -> anyhow::Result<()> {
    let store = TrustStore::open_in(&config.data_dir, scope)?;
    let entries = store.list();

    if entries.is_empty() {
        println!("No trusted {}.", scope.as_str());
        return Ok(());
    }

    println!("\n\x1b[1mTrusted {}\x1b[0m", scope.as_str());
    println!("═══════════════════════════════════════");
    for (name, certificate) in entries.iter() {
        println!("\x1b[1m{}\x1b[0m", name);
        println!("  {}", certificate.fingerprint());
    }
    println!();
    Ok(())
}

pub fn remove_trusted(config: &Config, scope: TrustScope, name: &str) -> anyhow::Result<()> {
    let store = TrustStore::open_in(&config.data_dir, scope)?;
    if store.remove(name)? {
        println!("\x1b[1;32m✓\x1b[0m Removed {} from trusted {}", name, scope.as_str());
    } else {
        println!("{} is not a trusted {}", name, scope.as_str().trim_end_matches('s'));
    }
    Ok(())
}
