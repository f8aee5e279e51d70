//! Encryption and label policy between engines.

use std::time::Duration;

use shoal::{Error, Keyring, Membership, SecretKey};

use crate::fixtures::mesh::MeshNet;
use crate::fixtures::{fast_config, wait_until};

#[test]
fn mismatched_keys_fail_the_join_loudly() {
    let net = MeshNet::new();
    let mut a_config = fast_config("a");
    a_config.keyring = Some(Keyring::new(SecretKey::from_bytes([1; 32])));
    let mut b_config = fast_config("b");
    b_config.keyring = Some(Keyring::new(SecretKey::from_bytes([2; 32])));

    let a = Membership::start(a_config, net.endpoint(), None).expect("start a");
    let b = Membership::start(b_config, net.endpoint(), None).expect("start b");

    let err = b.join(&[a.local_addr()]).unwrap_err();
    assert!(matches!(err, Error::JoinFailed { .. }));
    assert!(
        err.to_string()
            .contains("no installed keys could decrypt the message"),
        "got: {err}"
    );

    a.shutdown();
    b.shutdown();
}

#[test]
fn shared_key_and_label_cluster_converges() {
    let net = MeshNet::new();
    let key = SecretKey::from_bytes([7; 32]);
    let mut a_config = fast_config("a");
    a_config.keyring = Some(Keyring::new(key.clone()));
    a_config.label = "blue".into();
    let mut b_config = fast_config("b");
    b_config.keyring = Some(Keyring::new(key));
    b_config.label = "blue".into();

    let a = Membership::start(a_config, net.endpoint(), None).expect("start a");
    let b = Membership::start(b_config, net.endpoint(), None).expect("start b");

    b.join(&[a.local_addr()]).expect("join");
    assert!(
        wait_until(Duration::from_secs(3), || {
            a.members().len() == 2 && b.members().len() == 2
        }),
        "encrypted, labelled cluster converges"
    );

    a.shutdown();
    b.shutdown();
}

#[test]
fn label_mismatch_keeps_tenants_apart() {
    let net = MeshNet::new();
    let mut a_config = fast_config("a");
    a_config.label = "blue".into();
    let mut b_config = fast_config("b");
    b_config.label = "green".into();

    let a = Membership::start(a_config, net.endpoint(), None).expect("start a");
    let b = Membership::start(b_config, net.endpoint(), None).expect("start b");

    let err = b.join(&[a.local_addr()]).unwrap_err();
    assert!(matches!(err, Error::JoinFailed { .. }));
    assert!(
        wait_until(Duration::from_millis(500), || {
            a.stats().label_mismatches > 0 || a.members().len() == 1
        }),
        "mislabelled traffic never becomes membership"
    );
    assert_eq!(a.members().len(), 1);
    assert_eq!(b.members().len(), 1);

    a.shutdown();
    b.shutdown();
}
