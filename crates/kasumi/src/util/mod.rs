pub mod http;
pub mod ordered_stream;

/// Formats a byte count the way progress lines print it, e.g. `3.2MiB`.
pub fn format_size(size: u64) -> String {
    let mut num = size as f64;
    for unit in ["", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "Zi"] {
        if num.abs() < 1024.0 {
            return format!("{num:.1}{unit}B");
        }
        num /= 1024.0;
    }
    format!("{num:.1}YiB")
}
