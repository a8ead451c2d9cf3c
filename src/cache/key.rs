use sha2::{Digest, Sha256};

use crate::registry::Tier;
use crate::strategy::MarketContext;

/// Stable key over the context fields that feed a decision plus the tier.
///
/// Symbol and timeframe are case-normalized, features hash in name order and
/// numbers are fixed to eight decimals. The timestamp is not part of the key.
/// Every field is length-prefixed, so no choice of feature names can make two
/// contexts hash the same byte stream.
pub fn cache_key(context: &MarketContext, tier: Tier) -> String {
    let mut hasher = Sha256::new();
    write_field(&mut hasher, context.symbol.trim().to_uppercase().as_bytes());
    write_field(&mut hasher, context.timeframe.trim().to_lowercase().as_bytes());

    write_len(&mut hasher, context.features.len());
    for (name, value) in &context.features {
        write_field(&mut hasher, name.as_bytes());
        write_field(&mut hasher, normalize(*value).as_bytes());
    }

    write_len(&mut hasher, context.prices.len());
    for price in &context.prices {
        write_field(&mut hasher, normalize(*price).as_bytes());
    }

    write_field(&mut hasher, tier.as_str().as_bytes());
    format!("{:x}", hasher.finalize())
}

fn write_len(hasher: &mut Sha256, len: usize) {
    hasher.update((len as u64).to_le_bytes());
}

fn write_field(hasher: &mut Sha256, bytes: &[u8]) {
    write_len(hasher, bytes.len());
    hasher.update(bytes);
}

fn normalize(value: f64) -> String {
    // -0.0 + 0.0 == +0.0
    format!("{:.8}", value + 0.0)
}
