use std::net::IpAddr;

/// Parse memory size with optional unit suffix (kb, mb, gb, tb)
/// Examples: "20mb", "1GB", "512kb", "2097152"
pub fn parse_memory_size(s: &str) -> Result<u64, String> {
    let s = s.trim();

    let boundary = s.find(|c: char| c.is_ascii_alphabetic()).unwrap_or(s.len());
    let (num_str, unit_str) = s.split_at(boundary);

    let value: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number: '{}'", num_str))?;

    if value < 0.0 {
        return Err("Memory size cannot be negative".to_string());
    }

    let unit = unit_str.trim().to_lowercase();
    let multiplier: u64 = match unit.as_str() {
        "" | "b" => 1,
        "kb" | "k" | "kib" => 1024,
        "mb" | "m" | "mib" => 1024 * 1024,
        "gb" | "g" | "gib" => 1024 * 1024 * 1024,
        "tb" | "t" | "tib" => 1024 * 1024 * 1024 * 1024,
        _ => return Err(format!("Unknown unit: '{}'. Use kb, mb, gb, or tb", unit)),
    };

    let bytes = value * multiplier as f64;
    if bytes > u64::MAX as f64 {
        return Err(format!("Memory size {} bytes is too large", bytes));
    }
    Ok(bytes as u64)
}

/// Rank 0 of a two-node pair is whichever side has the smaller address; it
/// hosts the rendezvous store.
pub fn pair_master_ip(local: IpAddr, remote: IpAddr) -> IpAddr {
    local.min(remote)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_size_basic() {
        assert_eq!(parse_memory_size("1024").unwrap(), 1024);
        assert_eq!(parse_memory_size("20mb").unwrap(), 20 * 1024 * 1024);
        assert_eq!(parse_memory_size("1GiB").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(
            parse_memory_size("1.5gb").unwrap(),
            (1.5 * 1024.0 * 1024.0 * 1024.0) as u64
        );
    }

    #[test]
    fn test_parse_memory_size_invalid() {
        assert!(parse_memory_size("").is_err());
        assert!(parse_memory_size("abc").is_err());
        assert!(parse_memory_size("-10gb").is_err());
        assert!(parse_memory_size("10pb").is_err());
    }

    #[test]
    fn test_pair_master_ip() {
        let a: IpAddr = "10.0.0.2".parse().unwrap();
        let b: IpAddr = "10.0.0.10".parse().unwrap();
        assert_eq!(pair_master_ip(a, b), a);
        assert_eq!(pair_master_ip(b, a), a);
        assert_eq!(pair_master_ip(a, a), a);
    }
}
