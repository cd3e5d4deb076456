/// Parses a memory quantity reported by the API into gigabytes.
///
/// Accepts `"128.00G"`, `"30Gi"`, `"512M"`, `"1T"` and bare numbers, which are
/// taken as gigabytes. Returns `None` for anything else.
pub fn parse_memory_gb(value: &str) -> Option<f64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number.parse().ok()?;

    let factor = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "G" | "GI" | "GB" => 1.0,
        "M" | "MI" | "MB" => 1.0 / 1024.0,
        "T" | "TI" | "TB" => 1024.0,
        _ => return None,
    };
    Some(number * factor)
}
