//! Banner and header printing.

/// Print the application banner.
pub fn print_banner() {
    println!("\n\x1b[1;36m╔══════════════════════════════════════╗\x1b[0m");
    println!("\x1b[1;36m║\x1b[0m         \x1b[1mClipbridge\x1b[0m                   \x1b[1;36m║\x1b[0m");
    println!("\x1b[1;36m║\x1b[0m   Clipboard sync between devices     \x1b[1;36m║\x1b[0m");
    println!("\x1b[1;36m╚══════════════════════════════════════╝\x1b[0m\n");
}

pub fn print_identity(name: &str, fingerprint: &str) {
    println!("\x1b[1mDevice:\x1b[0m {}", name);
    println!("\x1b[1mKey:\x1b[0m    {}\n", fingerprint);
}
