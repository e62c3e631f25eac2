//! Order-book normalization: parse raw wire levels into the sorted,
//! deduplicated, best-at-index-0 form every downstream component relies on.

use rust_decimal::Decimal;
use serde::Deserialize;

/// A single price level as it arrives on the wire — price and size are
/// strings at the boundary and are only ever parsed here, never downstream.
#[derive(Debug, Clone, Deserialize)]
pub struct RawLevel {
    pub price: String,
    pub size: String,
}

/// A parsed, validated price level. `size == 0` is never represented here —
/// zero-size deltas mean "delete" and are consumed before this type exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

/// Parse one raw level. Rejects non-numeric fields and non-positive sizes;
/// this is the only place §3's "size == 0 encodes deletion" and "prices in
/// (0,1)" get enforced for inbound book/snapshot data.
pub fn parse_level(raw: &RawLevel) -> Option<PriceLevel> {
    let price: Decimal = raw.price.parse().ok()?;
    let size: Decimal = raw.size.parse().ok()?;
    if size <= Decimal::ZERO || price <= Decimal::ZERO || price >= Decimal::ONE {
        return None;
    }
    Some(PriceLevel { price, size })
}

/// Normalize a raw (bids, asks) pair into the canonical sorted form:
/// bids descending by price, asks ascending by price, at most one level per
/// distinct price (last write for a given price wins), non-positive sizes
/// dropped, prices outside `(0,1)` dropped.
///
/// Idempotent: `normalize(normalize(b, a)) == normalize(b, a)`.
pub fn normalize(bids: &[RawLevel], asks: &[RawLevel]) -> (Vec<PriceLevel>, Vec<PriceLevel>) {
    (
        normalize_side(bids, Side::Bid),
        normalize_side(asks, Side::Ask),
    )
}

/// Normalize already-parsed levels (used by the push client, which keeps
/// its own price->size delta maps rather than re-parsing strings on every
/// update).
pub fn normalize_levels(levels: &[PriceLevel], side: Side) -> Vec<PriceLevel> {
    let mut by_price: Vec<PriceLevel> = Vec::with_capacity(levels.len());
    for lvl in levels {
        if lvl.size <= Decimal::ZERO || lvl.price <= Decimal::ZERO || lvl.price >= Decimal::ONE {
            continue;
        }
        if let Some(existing) = by_price.iter_mut().find(|l| l.price == lvl.price) {
            existing.size = lvl.size;
        } else {
            by_price.push(*lvl);
        }
    }
    sort_side(&mut by_price, side);
    by_price
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Bid,
    Ask,
}

fn normalize_side(raw: &[RawLevel], side: Side) -> Vec<PriceLevel> {
    let mut levels: Vec<PriceLevel> = Vec::with_capacity(raw.len());
    for r in raw {
        let Some(parsed) = parse_level(r) else { continue };
        if let Some(existing) = levels.iter_mut().find(|l| l.price == parsed.price) {
            existing.size = parsed.size;
        } else {
            levels.push(parsed);
        }
    }
    sort_side(&mut levels, side);
    levels
}

fn sort_side(levels: &mut [PriceLevel], side: Side) {
    match side {
        Side::Bid => levels.sort_by(|a, b| b.price.cmp(&a.price)),
        Side::Ask => levels.sort_by(|a, b| a.price.cmp(&b.price)),
    }
}

/// True iff both sides are non-empty and non-crossed: `bids[0] < asks[0]`.
pub fn is_valid_book(bids: &[PriceLevel], asks: &[PriceLevel]) -> bool {
    match (bids.first(), asks.first()) {
        (Some(b), Some(a)) => b.price < a.price,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn raw(price: &str, size: &str) -> RawLevel {
        RawLevel { price: price.to_string(), size: size.to_string() }
    }

    #[test]
    fn sorts_bids_desc_and_asks_asc() {
        let bids = vec![raw("0.48", "100"), raw("0.50", "50")];
        let asks = vec![raw("0.53", "200"), raw("0.52", "80")];
        let (b, a) = normalize(&bids, &asks);
        assert_eq!(b[0].price, dec!(0.50));
        assert_eq!(b[1].price, dec!(0.48));
        assert_eq!(a[0].price, dec!(0.52));
        assert_eq!(a[1].price, dec!(0.53));
    }

    #[test]
    fn drops_non_numeric_and_non_positive_levels() {
        let bids = vec![raw("not-a-number", "1"), raw("0.4", "0"), raw("0.4", "-1")];
        let (b, _) = normalize(&bids, &[]);
        assert!(b.is_empty());
    }

    #[test]
    fn dedups_to_one_level_per_price_last_wins() {
        let bids = vec![raw("0.40", "10"), raw("0.40", "25")];
        let (b, _) = normalize(&bids, &[]);
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].size, dec!(25));
    }

    #[test]
    fn normalize_is_idempotent() {
        let bids = vec![raw("0.48", "100"), raw("0.50", "50"), raw("0.50", "10")];
        let asks = vec![raw("0.53", "200"), raw("0.52", "80")];
        let (b1, a1) = normalize(&bids, &asks);
        let b1_raw: Vec<RawLevel> = b1.iter().map(|l| raw(&l.price.to_string(), &l.size.to_string())).collect();
        let a1_raw: Vec<RawLevel> = a1.iter().map(|l| raw(&l.price.to_string(), &l.size.to_string())).collect();
        let (b2, a2) = normalize(&b1_raw, &a1_raw);
        assert_eq!(b1, b2);
        assert_eq!(a1, a2);
    }

    #[test]
    fn best_of_normalized_equals_max_bid_min_ask() {
        let bids = vec![raw("0.48", "100"), raw("0.50", "50"), raw("0.10", "5")];
        let asks = vec![raw("0.90", "1"), raw("0.52", "80")];
        let (b, a) = normalize(&bids, &asks);
        assert_eq!(b[0].price, dec!(0.50));
        assert_eq!(a[0].price, dec!(0.52));
    }

    #[test]
    fn rejects_crossed_book() {
        let bids = vec![PriceLevel { price: dec!(0.60), size: dec!(1) }];
        let asks = vec![PriceLevel { price: dec!(0.50), size: dec!(1) }];
        assert!(!is_valid_book(&bids, &asks));
    }
}
