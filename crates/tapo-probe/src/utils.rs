use tapo_core::{
    DeviceInfo, EnergyUsage, Error,
    crypto::auth::{auth_hash, sha1},
};

/// Shows the first and last two characters of a password.
pub fn mask_password(password: &str) -> String {
    let chars: Vec<char> = password.chars().collect();
    if chars.len() <= 4 {
        return "****".to_string();
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{}****{}", head, tail)
}

/// The digests both protocols derive from the credentials.
pub fn hash_report(username: &str, password: &str) -> String {
    format!(
        "  Username SHA1: {}\n  Password SHA1: {}\n  Auth Hash: {}",
        hex::encode(sha1(username.as_bytes())),
        hex::encode(sha1(password.as_bytes())),
        hex::encode(auth_hash(username, password)),
    )
}

/// Whether `err` is the KLAP handshake rejecting the credentials.
pub fn is_hash_mismatch(err: &Error) -> bool {
    matches!(err, Error::Authentication(msg) if msg == "server hash verification failed")
}

pub fn print_debug_info(username: &str, password: &str) {
    println!("\nDebug information:");
    println!("  Username: {}", username);
    println!(
        "  Password: {} (length: {})",
        mask_password(password),
        password.chars().count()
    );
    println!("\nHash calculations:");
    println!("{}", hash_report(username, password));
    println!();
}

pub fn print_hash_hints() {
    println!("\nHash verification troubleshooting:");
    println!("1. Verify your TP-Link account credentials are correct");
    println!("2. Use the account email address rather than a display name");
    println!("3. Check that the device firmware speaks KLAP (1.1.0 or later)");
    println!("4. Ensure your account has access to this device");
    println!("5. Try -legacy if KLAP keeps failing");
}

pub fn print_device_info(info: &DeviceInfo) {
    println!("\nDevice info:");
    println!("  Device ID: {}", info.device_id);
    println!("  Model: {}", info.model);
    println!("  Firmware: {}", info.firmware_version);
    println!("  Device On: {}", info.is_on);
    println!("  RSSI: {}", info.rssi);
    if let Some(name) = info.display_name() {
        println!("  Name: {}", name);
    }
}

pub fn print_energy_usage(usage: &EnergyUsage) {
    println!("\nEnergy usage:");
    println!("  Current Power: {} mW", usage.current_power_milliwatts);
    println!("  Today Energy: {} Wh", usage.today_energy_wh);
    println!("  Month Energy: {} Wh", usage.month_energy_wh);
    println!("  Today Runtime: {} minutes", usage.today_runtime_minutes);
}
