//! Tests for pruning, rotation, and tokenized state synthesis.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::acquisition::{
    AcquisitionEntry, AcquisitionRecord, RecordMeta, RequestItem, TokenizedGroup,
    tokenized_is_empty,
};

use super::{
    AcquisitionSource, HmacKeyRing, ResourceTokenizer, TokenizerError, TokenizerOracle,
    token_payload,
};

async fn token_for(ring: &HmacKeyRing, key_id: &str, acquirer: &str, resource: &str) -> String {
    let mac = ring
        .sign(key_id, &token_payload(acquirer, resource))
        .await
        .expect("sign");
    hex::encode(mac)
}

fn persisted(acquirer: &str, tokenized: Vec<TokenizedGroup>, ttl: u64, expires: u64) -> AcquisitionRecord {
    AcquisitionRecord {
        acquirer_id: acquirer.into(),
        tokenized,
        ttl,
        expires,
        meta: Some(RecordMeta {
            created: 1,
            updated: 1,
        }),
    }
}

fn entry(count: u64, requested: u64) -> AcquisitionEntry {
    AcquisitionEntry { count, requested }
}

fn tracked(resources: &[&str]) -> BTreeSet<String> {
    resources.iter().map(|r| (*r).to_string()).collect()
}

#[tokio::test]
async fn tokens_differ_across_acquirer_resource_pairs() {
    let ring = HmacKeyRing::new();
    let key = ring.current();
    let mut tokens = BTreeSet::new();
    for (acquirer, resource) in [("a", "r"), ("a", "r2"), ("b", "r"), ("ar", ""), ("", "ar")] {
        assert!(tokens.insert(token_for(&ring, &key, acquirer, resource).await));
    }
    // Deterministic per key.
    assert_eq!(
        token_for(&ring, &key, "a", "r").await,
        token_for(&ring, &key, "a", "r").await
    );
}

#[tokio::test]
async fn keyring_rejects_unknown_keys_and_keeps_old_generations() {
    let ring = HmacKeyRing::new();
    let first = ring.current();
    let second = ring.rotate();
    assert_ne!(first, second);
    assert_eq!(ring.current(), second);
    // Old generation still signs.
    assert!(ring.sign(&first, b"payload").await.is_ok());
    assert!(matches!(
        ring.sign("no-such-key", b"payload").await,
        Err(TokenizerError::UnknownKey { .. })
    ));
}

#[tokio::test]
async fn methods_require_process_first() {
    let ring = Arc::new(HmacKeyRing::new());
    let request = vec![RequestItem::new("r", 1, 10)];
    let tokenizer = ResourceTokenizer::new("alice", &request, ring);
    assert!(matches!(
        tokenizer.untokenized_acquisition_map(),
        Err(TokenizerError::NotProcessed)
    ));
    assert!(matches!(
        tokenizer.apply_release(&request),
        Err(TokenizerError::NotProcessed)
    ));
}

#[tokio::test]
async fn process_prunes_expired_entries_and_resets_when_empty() {
    let ring = Arc::new(HmacKeyRing::new());
    let key = ring.current();
    let token = token_for(&ring, &key, "alice", "r").await;
    let mut group = TokenizedGroup::empty(&key);
    group
        .resources
        .insert(token.clone(), vec![entry(1, 100), entry(2, 500)]);
    // ttl 200: the entry at 100 is stale at now=400, the one at 500 survives.
    let record = persisted("alice", vec![group.clone()], 200, 700);
    let request = vec![RequestItem::new("r", 1, 400)];

    let mut tokenizer = ResourceTokenizer::new("alice", &request, ring.clone());
    tokenizer.process(&record, 400).await.expect("process");
    let map = tokenizer.untokenized_acquisition_map().expect("map");
    assert_eq!(map.get("r"), Some(&vec![entry(2, 500)]));
    assert_eq!(tokenizer.previous_ttl().expect("ttl"), 200);

    // All entries stale: record resets to one empty current-key group and a
    // zero carried-forward ttl.
    let mut tokenizer = ResourceTokenizer::new("alice", &request, ring.clone());
    tokenizer.process(&record, 10_000).await.expect("process");
    assert!(tokenizer.untokenized_acquisition_map().expect("map").is_empty());
    assert_eq!(tokenizer.previous_ttl().expect("ttl"), 0);
    let pruned = tokenizer.pruned_tokenized().expect("pruned");
    assert_eq!(pruned.len(), 1);
    assert_eq!(pruned[0].tokenizer_id, ring.current());
    assert!(tokenized_is_empty(pruned));
}

#[tokio::test]
async fn acquire_without_rotation_inserts_sorted_and_extends_ttl() {
    let ring = Arc::new(HmacKeyRing::new());
    let key = ring.current();
    let token = token_for(&ring, &key, "alice", "r").await;
    let mut group = TokenizedGroup::empty(&key);
    group.resources.insert(token.clone(), vec![entry(1, 300)]);
    let record = persisted("alice", vec![group], 1_000, 1_300);

    let request = vec![
        RequestItem::new("r", 2, 250),
        RequestItem::new("r", 3, 400),
    ];
    let mut tokenizer = ResourceTokenizer::new("alice", &request, ring.clone());
    tokenizer.process(&record, 500).await.expect("process");

    let update = tokenizer
        .apply_acquire(&request, &tracked(&["r"]), 2_000, 500)
        .expect("acquire");
    assert_eq!(update.ttl, 2_000);
    assert_eq!(update.new_tokenized.len(), 1);
    assert_eq!(update.new_tokenized[0].tokenizer_id, key);
    let list = &update.new_tokenized[0].resources[&token];
    let times: Vec<_> = list.iter().map(|e| e.requested).collect();
    assert_eq!(times, vec![250, 300, 400]);
    assert_eq!(update.expires, Some(400 + 2_000));
}

#[tokio::test]
async fn acquire_drops_stale_request_items_and_untracked_resources() {
    let ring = Arc::new(HmacKeyRing::new());
    let record = AcquisitionRecord::synthesized("alice", ring.current(), 1_000);
    let request = vec![
        // Stale under ttl 100 at now=1_000.
        RequestItem::new("r", 1, 500),
        RequestItem::new("r", 1, 990),
        RequestItem::new("untracked", 5, 995),
    ];
    let mut tokenizer = ResourceTokenizer::new("alice", &request, ring.clone());
    tokenizer.process(&record, 1_000).await.expect("process");

    let update = tokenizer
        .apply_acquire(&request, &tracked(&["r"]), 100, 1_000)
        .expect("acquire");
    let key = ring.current();
    let token = token_for(&ring, &key, "alice", "r").await;
    assert_eq!(update.new_tokenized.len(), 1);
    assert_eq!(update.new_tokenized[0].resources.len(), 1);
    assert_eq!(
        update.new_tokenized[0].resources[&token],
        vec![entry(1, 990)]
    );
    assert_eq!(update.expires, Some(990 + 100));
}

#[tokio::test]
async fn acquire_of_nothing_yields_undefined_expires() {
    let ring = Arc::new(HmacKeyRing::new());
    let record = AcquisitionRecord::synthesized("alice", ring.current(), 1_000);
    let request = vec![RequestItem::new("r", 1, 10)];
    let mut tokenizer = ResourceTokenizer::new("alice", &request, ring.clone());
    tokenizer.process(&record, 1_000).await.expect("process");

    // The only item is stale, so nothing is recorded anywhere.
    let update = tokenizer
        .apply_acquire(&request, &tracked(&["r"]), 100, 1_000)
        .expect("acquire");
    assert!(tokenized_is_empty(&update.new_tokenized));
    assert_eq!(update.expires, None);
}

#[tokio::test]
async fn rotation_translates_known_resources_to_the_current_key() {
    let ring = Arc::new(HmacKeyRing::new());
    let old_key = ring.current();
    let old_token = token_for(&ring, &old_key, "alice", "r").await;
    let mut group = TokenizedGroup::empty(&old_key);
    group.resources.insert(old_token, vec![entry(1, 300)]);
    let record = persisted("alice", vec![group], 1_000, 1_300);

    let new_key = ring.rotate();
    let request = vec![RequestItem::new("r", 1, 400)];
    let mut tokenizer = ResourceTokenizer::new("alice", &request, ring.clone());
    tokenizer.process(&record, 500).await.expect("process");

    // The stored entry is still visible untokenized while under the old key.
    let map = tokenizer.untokenized_acquisition_map().expect("map");
    assert_eq!(map.get("r"), Some(&vec![entry(1, 300)]));

    let update = tokenizer
        .apply_acquire(&request, &tracked(&["r"]), 1_000, 500)
        .expect("acquire");
    // Fully migrated: one group, new key, merged sorted list.
    assert_eq!(update.new_tokenized.len(), 1);
    assert_eq!(update.new_tokenized[0].tokenizer_id, new_key);
    let new_token = token_for(&ring, &new_key, "alice", "r").await;
    let times: Vec<_> = update.new_tokenized[0].resources[&new_token]
        .iter()
        .map(|e| e.requested)
        .collect();
    assert_eq!(times, vec![300, 400]);
}

#[tokio::test]
async fn rotation_retains_unresolvable_tokens_as_unconverted() {
    let ring = Arc::new(HmacKeyRing::new());
    let old_key = ring.current();
    let old_token = token_for(&ring, &old_key, "alice", "other").await;
    let mut group = TokenizedGroup::empty(&old_key);
    group.resources.insert(old_token.clone(), vec![entry(1, 300)]);
    let record = persisted("alice", vec![group], 1_000, 1_300);

    let new_key = ring.rotate();
    // The request names a different resource, so the stored token cannot be
    // reverse-mapped and stays under the old key.
    let request = vec![RequestItem::new("r", 1, 400)];
    let mut tokenizer = ResourceTokenizer::new("alice", &request, ring.clone());
    tokenizer.process(&record, 500).await.expect("process");

    let update = tokenizer
        .apply_acquire(&request, &tracked(&["r"]), 1_000, 500)
        .expect("acquire");
    assert_eq!(update.new_tokenized.len(), 2);
    assert_eq!(update.new_tokenized[0].tokenizer_id, old_key);
    assert_eq!(
        update.new_tokenized[0].resources[&old_token],
        vec![entry(1, 300)]
    );
    assert_eq!(update.new_tokenized[1].tokenizer_id, new_key);
    let new_token = token_for(&ring, &new_key, "alice", "r").await;
    assert_eq!(
        update.new_tokenized[1].resources[&new_token],
        vec![entry(1, 400)]
    );
    // Both generations count toward the record expiration.
    assert_eq!(update.expires, Some(400 + 1_000));
}

#[tokio::test]
async fn two_group_records_keep_converting_into_the_newest_group() {
    let ring = Arc::new(HmacKeyRing::new());
    let old_key = ring.current();
    let new_key = ring.rotate();
    let old_token = token_for(&ring, &old_key, "alice", "r").await;
    let new_token = token_for(&ring, &new_key, "alice", "r").await;

    let mut old_group = TokenizedGroup::empty(&old_key);
    old_group.resources.insert(old_token, vec![entry(1, 100)]);
    let mut new_group = TokenizedGroup::empty(&new_key);
    new_group.resources.insert(new_token.clone(), vec![entry(2, 200)]);
    let record = persisted("alice", vec![old_group, new_group], 1_000, 1_200);

    let request = vec![RequestItem::new("r", 3, 300)];
    let mut tokenizer = ResourceTokenizer::new("alice", &request, ring.clone());
    tokenizer.process(&record, 500).await.expect("process");

    // Merged view spans both generations, sorted ascending.
    let map = tokenizer.untokenized_acquisition_map().expect("map");
    assert_eq!(map.get("r"), Some(&vec![entry(1, 100), entry(2, 200)]));

    let update = tokenizer
        .apply_acquire(&request, &tracked(&["r"]), 1_000, 500)
        .expect("acquire");
    assert_eq!(update.new_tokenized.len(), 1);
    assert_eq!(update.new_tokenized[0].tokenizer_id, new_key);
    let times: Vec<_> = update.new_tokenized[0].resources[&new_token]
        .iter()
        .map(|e| e.requested)
        .collect();
    assert_eq!(times, vec![100, 200, 300]);
}

#[tokio::test]
async fn release_consumes_from_head_or_tail() {
    let ring = Arc::new(HmacKeyRing::new());
    let key = ring.current();
    let token = token_for(&ring, &key, "alice", "r").await;
    let mut group = TokenizedGroup::empty(&key);
    group.resources.insert(
        token.clone(),
        vec![entry(1, 100), entry(1, 200), entry(1, 300)],
    );
    let record = persisted("alice", vec![group], 1_000, 1_300);

    // Earliest first.
    let request = vec![RequestItem::release("r", 1)];
    let mut tokenizer = ResourceTokenizer::new("alice", &request, ring.clone());
    tokenizer.process(&record, 500).await.expect("process");
    let update = tokenizer.apply_release(&request).expect("release");
    assert!(update.excess_resources.is_empty());
    let times: Vec<_> = update.new_tokenized[0].resources[&token]
        .iter()
        .map(|e| e.requested)
        .collect();
    assert_eq!(times, vec![200, 300]);
    assert_eq!(update.expires, Some(300 + 1_000));

    // Latest first.
    let request = vec![RequestItem::release_latest("r", 1)];
    let mut tokenizer = ResourceTokenizer::new("alice", &request, ring.clone());
    tokenizer.process(&record, 500).await.expect("process");
    let update = tokenizer.apply_release(&request).expect("release");
    let times: Vec<_> = update.new_tokenized[0].resources[&token]
        .iter()
        .map(|e| e.requested)
        .collect();
    assert_eq!(times, vec![100, 200]);
    assert_eq!(update.expires, Some(200 + 1_000));
}

#[tokio::test]
async fn release_splits_entries_and_reports_excess() {
    let ring = Arc::new(HmacKeyRing::new());
    let key = ring.current();
    let token = token_for(&ring, &key, "alice", "r").await;
    let mut group = TokenizedGroup::empty(&key);
    group.resources.insert(token.clone(), vec![entry(5, 100)]);
    let record = persisted("alice", vec![group], 1_000, 1_100);

    // Partial consumption decrements the head entry in place.
    let request = vec![RequestItem::release("r", 2)];
    let mut tokenizer = ResourceTokenizer::new("alice", &request, ring.clone());
    tokenizer.process(&record, 500).await.expect("process");
    let update = tokenizer.apply_release(&request).expect("release");
    assert_eq!(update.new_tokenized[0].resources[&token], vec![entry(3, 100)]);
    assert!(update.excess_resources.is_empty());
    assert_eq!(update.ttl, 1_000);

    // Over-consumption drains the list, removes the token key, and reports
    // the shortfall.
    let request = vec![RequestItem::release("r", 6)];
    let mut tokenizer = ResourceTokenizer::new("alice", &request, ring.clone());
    tokenizer.process(&record, 500).await.expect("process");
    let update = tokenizer.apply_release(&request).expect("release");
    assert!(tokenized_is_empty(&update.new_tokenized));
    assert_eq!(update.excess_resources.get("r"), Some(&1));
    assert_eq!(update.expires, None);
}

#[tokio::test]
async fn release_of_unheld_resource_is_all_excess() {
    let ring = Arc::new(HmacKeyRing::new());
    let record = AcquisitionRecord::synthesized("alice", ring.current(), 1_000);
    let request = vec![RequestItem::release("r", 4)];
    let mut tokenizer = ResourceTokenizer::new("alice", &request, ring.clone());
    tokenizer.process(&record, 1_000).await.expect("process");
    let update = tokenizer.apply_release(&request).expect("release");
    assert_eq!(update.excess_resources.get("r"), Some(&4));
    assert!(tokenized_is_empty(&update.new_tokenized));
}

#[tokio::test]
async fn acquisition_source_resolves_resources_outside_the_request() {
    let ring = Arc::new(HmacKeyRing::new());
    let key = ring.current();
    let other_token = token_for(&ring, &key, "alice", "other").await;
    let mut group = TokenizedGroup::empty(&key);
    group.resources.insert(other_token, vec![entry(2, 100)]);
    let record = persisted("alice", vec![group], 1_000, 1_100);

    let request = vec![RequestItem::new("r", 1, 400)];
    let mut tokenizer = ResourceTokenizer::new("alice", &request, ring.clone());
    tokenizer.process(&record, 500).await.expect("process");

    // "other" is not in the request, so its token is computed on demand.
    let map = tokenizer
        .untokenized_map(&["other".to_string(), "missing".to_string()])
        .await
        .expect("map");
    assert_eq!(map.get("other"), Some(&vec![entry(2, 100)]));
    assert!(!map.contains_key("missing"));
}
