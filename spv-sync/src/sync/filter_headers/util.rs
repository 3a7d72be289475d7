use std::collections::BTreeMap;

use bitcoin::bip158::{FilterHash, FilterHeader};
use bitcoin::p2p::message_filter::CFHeaders;

use crate::types::PeerAddr;

/// Chain `filter_hashes` onto `prev`.
///
/// Each filter header is computed by chaining:
/// `header[i] = sha256d(filter_hash[i] || header[i-1])`
pub(super) fn compute_filter_headers(
    prev: &FilterHeader,
    filter_hashes: &[FilterHash],
) -> Vec<FilterHeader> {
    let mut prev_header = *prev;
    let mut computed_headers = Vec::with_capacity(filter_hashes.len());

    for filter_hash in filter_hashes {
        let header = filter_hash.filter_header(&prev_header);
        computed_headers.push(header);
        prev_header = header;
    }

    computed_headers
}

/// Whether `cfheaders` starts at `prev_checkpoint` and chains exactly to `next_checkpoint`.
pub(super) fn verify_checkpoint(
    prev_checkpoint: &FilterHeader,
    next_checkpoint: &FilterHeader,
    cfheaders: &CFHeaders,
) -> bool {
    if *prev_checkpoint != cfheaders.previous_filter_header {
        return false;
    }
    let last = compute_filter_headers(&cfheaders.previous_filter_header, &cfheaders.filter_hashes)
        .last()
        .copied()
        .unwrap_or(cfheaders.previous_filter_header);
    last == *next_checkpoint
}

/// Whether the responses disagree on the filter hash at position `idx`.
/// Responses too short to reach `idx` are not counted.
pub(super) fn check_for_cfheader_mismatch(
    headers: &BTreeMap<PeerAddr, CFHeaders>,
    idx: usize,
) -> bool {
    let mut seen: Option<&FilterHash> = None;
    for msg in headers.values() {
        let Some(hash) = msg.filter_hashes.get(idx) else {
            continue;
        };
        match seen {
            None => seen = Some(hash),
            Some(first) if first != hash => return true,
            Some(_) => {}
        }
    }
    false
}

/// Height of the last checkpoint in the shortest list, zero when there are none.
pub(super) fn min_checkpoint_height(
    checkpoints: &BTreeMap<PeerAddr, Vec<FilterHeader>>,
    interval: u32,
) -> u32 {
    checkpoints
        .values()
        .map(|cps| (cps.len() as u32).saturating_mul(interval))
        .min()
        .unwrap_or(0)
}

/// The checkpoints backed by at least two lists, or the sole list when only one
/// peer answered.
///
/// Callers have already checked that the lists agree wherever they overlap, so
/// the prefix is taken from the longest list.
pub(super) fn corroborated_prefix<T: Clone>(lists: &BTreeMap<PeerAddr, Vec<T>>) -> Vec<T> {
    let mut by_len: Vec<&Vec<T>> = lists.values().collect();
    by_len.sort_by_key(|list| std::cmp::Reverse(list.len()));
    match by_len.as_slice() {
        [] => Vec::new(),
        [only] => (*only).clone(),
        [longest, second, ..] => longest[..second.len()].to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::BlockHash;

    fn filter_hash(n: u8) -> FilterHash {
        FilterHash::from_byte_array([n; 32])
    }

    fn cfheaders(prev: FilterHeader, hashes: Vec<FilterHash>) -> CFHeaders {
        CFHeaders {
            filter_type: 0,
            stop_hash: BlockHash::all_zeros(),
            previous_filter_header: prev,
            filter_hashes: hashes,
        }
    }

    #[test]
    fn test_compute_filter_headers_chains() {
        let prev = FilterHeader::all_zeros();
        let headers = compute_filter_headers(&prev, &[filter_hash(1), filter_hash(2)]);

        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0], filter_hash(1).filter_header(&prev));
        assert_eq!(headers[1], filter_hash(2).filter_header(&headers[0]));
    }

    #[test]
    fn test_verify_checkpoint() {
        let prev = FilterHeader::from_byte_array([3u8; 32]);
        let hashes = vec![filter_hash(1), filter_hash(2), filter_hash(3)];
        let next = *compute_filter_headers(&prev, &hashes).last().unwrap();
        let msg = cfheaders(prev, hashes);

        assert!(verify_checkpoint(&prev, &next, &msg));
        assert!(!verify_checkpoint(&FilterHeader::all_zeros(), &next, &msg));
        assert!(!verify_checkpoint(&prev, &prev, &msg));
    }

    #[test]
    fn test_mismatch_ignores_short_responses() {
        let prev = FilterHeader::all_zeros();
        let mut headers = BTreeMap::new();
        headers.insert("a".to_string(), cfheaders(prev, vec![filter_hash(1), filter_hash(2)]));
        headers.insert("b".to_string(), cfheaders(prev, vec![filter_hash(1)]));
        headers.insert("c".to_string(), cfheaders(prev, vec![filter_hash(1), filter_hash(9)]));

        assert!(!check_for_cfheader_mismatch(&headers, 0));
        assert!(check_for_cfheader_mismatch(&headers, 1));
        assert!(!check_for_cfheader_mismatch(&headers, 2));
    }

    #[test]
    fn test_min_checkpoint_height() {
        let mut lists = BTreeMap::new();
        assert_eq!(min_checkpoint_height(&lists, 1000), 0);

        let cp = FilterHeader::all_zeros();
        lists.insert("b".to_string(), vec![cp, cp, cp]);
        lists.insert("a".to_string(), vec![cp, cp]);
        assert_eq!(min_checkpoint_height(&lists, 1000), 2000);
    }

    #[test]
    fn test_corroborated_prefix() {
        let mut lists: BTreeMap<PeerAddr, Vec<u32>> = BTreeMap::new();
        assert!(corroborated_prefix(&lists).is_empty());

        lists.insert("a".to_string(), vec![1, 2, 3, 4]);
        assert_eq!(corroborated_prefix(&lists), vec![1, 2, 3, 4]);

        // A lone peer claiming more checkpoints than anyone else is not trusted past
        // what a second peer confirms.
        lists.insert("b".to_string(), vec![1, 2]);
        assert_eq!(corroborated_prefix(&lists), vec![1, 2]);

        lists.insert("c".to_string(), vec![1, 2, 3]);
        assert_eq!(corroborated_prefix(&lists), vec![1, 2, 3]);

        lists.insert("d".to_string(), vec![1, 2, 3, 4]);
        assert_eq!(corroborated_prefix(&lists), vec![1, 2, 3, 4]);
    }
}
