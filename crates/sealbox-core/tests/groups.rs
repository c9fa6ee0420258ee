//! Key-group recovery semantics, exercised end to end with age
//! custodians that work entirely offline.

use once_cell::sync::Lazy;
use tokio_util::sync::CancellationToken;

use sealbox_core::error::Error;
use sealbox_core::stores::{Store, YamlStore};
use sealbox_core::{
    decrypt_tree, encrypt_tree, AgeMasterKey, Cipher, KeyGroup, MasterKey, Metadata,
    SelectionPolicy, Tree, TreeItem, Value,
};

/// One identity for the whole test process, installed into the age key
/// environment variable exactly once; holds the matching recipient.
static RECIPIENT: Lazy<String> = Lazy::new(|| {
    let (identity, recipient) = AgeMasterKey::generate_identity();
    std::env::set_var("SEALBOX_AGE_KEY", &identity);
    recipient
});

fn openable_group() -> KeyGroup {
    KeyGroup(vec![MasterKey::Age(AgeMasterKey::new(&RECIPIENT).unwrap())])
}

/// A group whose identity is never installed, so its share cannot be
/// recovered.
fn unopenable_group() -> KeyGroup {
    let (_, recipient) = AgeMasterKey::generate_identity();
    KeyGroup(vec![MasterKey::Age(AgeMasterKey::new(&recipient).unwrap())])
}

#[tokio::test]
async fn single_group_wrap_and_recover() {
    let cancel = CancellationToken::new();
    let mut metadata = Metadata::new(vec![openable_group()], 0, SelectionPolicy::default());
    let data_key = metadata.generate_data_key(&cancel).await.unwrap();
    let recovered = metadata.data_key(&cancel).await.unwrap();
    assert_eq!(recovered.as_bytes(), data_key.as_bytes());
}

#[tokio::test]
async fn any_single_key_suffices_without_quorum() {
    let cancel = CancellationToken::new();
    // First group is unopenable; recovery falls through to the second.
    let mut metadata = Metadata::new(
        vec![unopenable_group(), openable_group()],
        0,
        SelectionPolicy::default(),
    );
    let data_key = metadata.generate_data_key(&cancel).await.unwrap();
    let recovered = metadata.data_key(&cancel).await.unwrap();
    assert_eq!(recovered.as_bytes(), data_key.as_bytes());
}

#[tokio::test]
async fn two_of_three_quorum_recovers_with_two_groups() {
    let cancel = CancellationToken::new();
    let mut metadata = Metadata::new(
        vec![openable_group(), unopenable_group(), openable_group()],
        2,
        SelectionPolicy::default(),
    );
    let data_key = metadata.generate_data_key(&cancel).await.unwrap();

    // Groups 1 and 3 contribute shares at x = 1 and x = 3.
    let recovered = metadata.data_key(&cancel).await.unwrap();
    assert_eq!(recovered.as_bytes(), data_key.as_bytes());
}

#[tokio::test]
async fn two_of_three_quorum_fails_with_one_group() {
    let cancel = CancellationToken::new();
    let mut metadata = Metadata::new(
        vec![openable_group(), unopenable_group(), unopenable_group()],
        2,
        SelectionPolicy::default(),
    );
    let _ = metadata.generate_data_key(&cancel).await.unwrap();

    match metadata.data_key(&cancel).await {
        Err(Error::InsufficientShares {
            needed,
            got,
            attempts,
        }) => {
            assert_eq!(needed, 2);
            assert_eq!(got, 1);
            assert_eq!(attempts.len(), 2);
        }
        other => panic!("expected InsufficientShares, got {other:?}"),
    }
}

#[tokio::test]
async fn threshold_above_group_count_is_rejected() {
    let cancel = CancellationToken::new();
    let mut metadata = Metadata::new(vec![openable_group()], 2, SelectionPolicy::default());
    assert!(matches!(
        metadata.generate_data_key(&cancel).await,
        Err(Error::MalformedMetadata(_))
    ));
}

#[tokio::test]
async fn grouped_document_round_trips_through_yaml() {
    let cancel = CancellationToken::new();
    let store = YamlStore::new();

    let mut metadata = Metadata::new(
        vec![openable_group(), openable_group(), openable_group()],
        2,
        SelectionPolicy::default(),
    );
    let data_key = metadata.generate_data_key(&cancel).await.unwrap();
    let mut tree = Tree {
        branches: vec![vec![TreeItem::Pair {
            key: "secret".into(),
            value: Value::String("swordfish".into()),
        }]],
        metadata,
    };
    encrypt_tree(&mut tree, &data_key, &mut Cipher::new()).unwrap();
    let emitted = store.emit_encrypted_file(&tree).unwrap();

    let text = String::from_utf8(emitted.clone()).unwrap();
    assert!(text.contains("key_groups"), "{text}");
    assert!(text.contains("shamir_threshold: 2"), "{text}");

    let mut reloaded = store.load_encrypted_file(&emitted).unwrap();
    assert_eq!(reloaded.metadata.key_groups.len(), 3);
    let recovered = reloaded.metadata.data_key(&cancel).await.unwrap();
    decrypt_tree(&mut reloaded, &recovered, &mut Cipher::new(), false).unwrap();
    assert_eq!(reloaded.branches, tree_plain());
}

fn tree_plain() -> Vec<Vec<TreeItem>> {
    vec![vec![TreeItem::Pair {
        key: "secret".into(),
        value: Value::String("swordfish".into()),
    }]]
}

#[tokio::test]
async fn single_group_document_uses_the_flat_form() {
    let cancel = CancellationToken::new();
    let store = YamlStore::new();

    let mut metadata = Metadata::new(vec![openable_group()], 0, SelectionPolicy::default());
    let data_key = metadata.generate_data_key(&cancel).await.unwrap();
    let mut tree = Tree {
        branches: tree_plain(),
        metadata,
    };
    encrypt_tree(&mut tree, &data_key, &mut Cipher::new()).unwrap();
    let emitted = store.emit_encrypted_file(&tree).unwrap();

    let text = String::from_utf8(emitted.clone()).unwrap();
    assert!(!text.contains("key_groups"), "{text}");
    assert!(text.contains("age:"), "{text}");

    // The flat legacy layout reads back as one group.
    let reloaded = store.load_encrypted_file(&emitted).unwrap();
    assert_eq!(reloaded.metadata.key_groups.len(), 1);
    assert_eq!(reloaded.metadata.shamir_threshold, 0);
}
