use chrono::{DateTime, TimeZone, Utc};

const ZERO_DECIMAL: &[&str] = &[
    "bif", "clp", "djf", "gnf", "jpy", "kmf", "krw", "mga", "pyg", "rwf", "ugx", "vnd", "vuv",
    "xaf", "xof", "xpf",
];

const THREE_DECIMAL: &[&str] = &["bhd", "jod", "kwd", "omr", "tnd"];

pub fn currency_decimals(currency: &str) -> u32 {
    let currency = currency.trim().to_ascii_lowercase();
    if ZERO_DECIMAL.contains(&currency.as_str()) {
        0
    } else if THREE_DECIMAL.contains(&currency.as_str()) {
        3
    } else {
        2
    }
}

fn currency_symbol(currency: &str) -> Option<&'static str> {
    match currency.trim().to_ascii_lowercase().as_str() {
        "usd" => Some("$"),
        "eur" => Some("€"),
        "gbp" => Some("£"),
        "jpy" => Some("¥"),
        "inr" => Some("₹"),
        "krw" => Some("₩"),
        _ => None,
    }
}

/// Renders an amount in minor units (cents for USD) for display.
pub fn format_stripe_amount(amount: i64, currency: &str) -> String {
    let decimals = currency_decimals(currency);
    let sign = if amount < 0 { "-" } else { "" };
    let magnitude = amount.unsigned_abs();

    let number = if decimals == 0 {
        magnitude.to_string()
    } else {
        let divisor = 10u64.pow(decimals);
        format!(
            "{}.{:0width$}",
            magnitude / divisor,
            magnitude % divisor,
            width = decimals as usize
        )
    };

    match currency_symbol(currency) {
        Some(symbol) => format!("{}{}{}", sign, symbol, number),
        None => format!("{}{} {}", sign, number, currency.trim().to_ascii_uppercase()),
    }
}

pub fn from_unix(seconds: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0).single()
}
