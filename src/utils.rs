//! Wallet utility functions

use url::Url;

/// Normalize a mint URL to prevent duplicates like "mint.coinos.io" vs "mint.coinos.io/"
/// This should be called when storing or comparing mint URLs.
pub fn normalize_mint_url(url: &str) -> String {
    let mut normalized = url.trim().to_string();

    // Remove trailing slashes
    while normalized.ends_with('/') {
        normalized.pop();
    }

    // Ensure https:// prefix if no scheme
    if !normalized.starts_with("http://") && !normalized.starts_with("https://") {
        normalized = format!("https://{}", normalized);
    }

    // Lowercase the host portion for consistency
    if let Ok(parsed) = Url::parse(&normalized) {
        if let Some(host) = parsed.host_str() {
            let lowercase_host = host.to_lowercase();
            normalized = normalized.replacen(host, &lowercase_host, 1);
        }
    }

    normalized
}

/// Check if a mint URL matches a normalized mint URL
/// Used for filtering where stored URLs might not be normalized
#[inline]
pub fn mint_matches(stored_mint: &str, normalized_mint: &str) -> bool {
    normalize_mint_url(stored_mint) == normalized_mint
}

/// Get current timestamp in seconds
pub fn now_secs() -> u64 {
    chrono::Utc::now().timestamp() as u64
}

/// Split an amount into power-of-two denominations, largest first
pub fn split_amount(amount: u64) -> Vec<u64> {
    let mut parts = Vec::new();
    for bit in (0..64).rev() {
        let denom = 1u64 << bit;
        if amount & denom != 0 {
            parts.push(denom);
        }
    }
    parts
}
