use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;

/// Convert a unit string to bytes multiplier (binary prefixes only)
fn unit_to_bytes(unit: &str) -> Option<u128> {
    match unit {
        "B" | "bytes" => Some(1),
        "k" | "K" | "KiB" => Some(1024),
        "M" | "MiB" => Some(1024u128.pow(2)),
        "G" | "GiB" => Some(1024u128.pow(3)),
        "T" | "TiB" => Some(1024u128.pow(4)),
        _ => None,
    }
}

/// Parse a memory string (like "2G", "1024M", "512") to megabytes
///
/// This is the same grammar QEMU's `-m` accepts for the common cases, so a
/// string accepted here can be passed through to the hypervisor unchanged.
pub(crate) fn parse_memory_to_mb(memory_str: &str) -> Result<u32> {
    let memory_str = memory_str.trim();

    if memory_str.is_empty() {
        return Err(eyre!("Memory string cannot be empty"));
    }

    // Try to strip unit suffix, checking case-insensitively
    let (number_str, unit) = if let Some(num) = memory_str
        .strip_suffix('T')
        .or_else(|| memory_str.strip_suffix('t'))
    {
        (num, "TiB")
    } else if let Some(num) = memory_str
        .strip_suffix('G')
        .or_else(|| memory_str.strip_suffix('g'))
    {
        (num, "GiB")
    } else if let Some(num) = memory_str
        .strip_suffix('M')
        .or_else(|| memory_str.strip_suffix('m'))
    {
        (num, "MiB")
    } else if let Some(num) = memory_str
        .strip_suffix('K')
        .or_else(|| memory_str.strip_suffix('k'))
    {
        (num, "KiB")
    } else {
        // No suffix, assume megabytes
        (memory_str, "MiB")
    };

    let number: f64 = number_str
        .parse()
        .with_context(|| format!("Invalid number in memory specification '{memory_str}'"))?;
    if !number.is_finite() || number <= 0.0 {
        return Err(eyre!("Memory size must be positive: '{memory_str}'"));
    }

    let bytes_per_unit =
        unit_to_bytes(unit).ok_or_else(|| eyre!("Unknown unit: {}", unit))? as f64;

    let mib = 1024.0 * 1024.0;
    let total_mb = (number * bytes_per_unit) / mib;
    if total_mb < 1.0 {
        return Err(eyre!("Memory size '{memory_str}' is below 1 MiB"));
    }

    Ok(total_mb as u32)
}
