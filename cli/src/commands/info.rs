//! Info command implementation.

use clipbridge_core::prefs::{JsonPreferences, Preferences};
use clipbridge_core::{Config, DeviceIdentity};

/// Display device information.
pub fn show_info(config: Config) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.data_dir)?;
    let prefs = JsonPreferences::open(&config.data_dir)?;
    let identity = DeviceIdentity::load_or_generate(&prefs, &config.device_name)?;

    println!("\n\x1b[1mClipbridge Device Info\x1b[0m");
    println!("═══════════════════════════════════════");
    println!("\x1b[1mName:\x1b[0m        {}", identity.name);
    println!("\x1b[1mFingerprint:\x1b[0m {}", identity.fingerprint());
    println!("\x1b[1mPort:\x1b[0m        {}", config.port);
    println!("\x1b[1mData:\x1b[0m        {}", config.data_dir.display());
    if let Some(primary) = prefs.primary_server() {
        println!("\x1b[1mPrimary:\x1b[0m     {}", primary);
    }
    if let Some(device) = prefs.hub_device() {
        println!("\x1b[1mHub ID:\x1b[0m      {}", device.id());
    }

    println!("\n\x1b[1mLocal IPs:\x1b[0m");
    for ip in clipbridge_core::discovery::get_local_ips() {
        println!("  • {}", ip);
    }
    println!();
    Ok(())
}
