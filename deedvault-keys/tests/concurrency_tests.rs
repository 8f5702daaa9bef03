//! Parallel grants, reads and rotation against one service.

mod support;

use deedvault_keys::{DenyReason, GrantOptions, KeyError};
use deedvault_types::{DataClass, UserId};
use futures::future::join_all;
use pretty_assertions::assert_eq;
use support::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn grants_to_different_users_run_in_parallel() {
    let h = Harness::new();
    let owner = h.enrolled(OWNER_CREDENTIAL).await;
    let session = h.session(owner, OWNER_CREDENTIAL).await;
    let item = h
        .service
        .create_item(&session, DataClass::EntryNote, b"for everyone")
        .await
        .unwrap();

    let mut grantees = Vec::new();
    for i in 0..8 {
        let user = h.enrolled(&format!("grantee-{i}")).await;
        h.connect(owner, user).await;
        grantees.push(user);
    }

    let results = join_all(
        grantees
            .iter()
            .map(|g| h.service.grant(&session, item, *g, GrantOptions::read())),
    )
    .await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(h.service.holders(item).unwrap().len(), 9);
    assert_eq!(h.relations.grant_count().await, 8);

    let harness = &h;
    let sessions = join_all(grantees.iter().copied().enumerate().map(|(i, g)| async move {
        harness.session(g, &format!("grantee-{i}")).await
    }))
    .await;
    let reads = join_all(sessions.iter().map(|s| h.service.read_item(s, item))).await;
    for read in reads {
        assert_eq!(read.unwrap().as_slice(), b"for everyone");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_enrollment_of_one_user_succeeds_once() {
    let h = Harness::new();
    let user = UserId::new();
    h.users.register(user, 1).unwrap();

    let (a, b) = tokio::join!(h.service.enroll(user, "a"), h.service.enroll(user, "b"));
    let outcomes = [a, b];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .any(|r| matches!(r, Err(KeyError::AlreadyEnrolled(_)))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn items_created_during_rotation_stay_readable() {
    let h = Harness::new();
    let owner = h.enrolled(OWNER_CREDENTIAL).await;
    let session = h.session(owner, OWNER_CREDENTIAL).await;
    for i in 0..6 {
        h.service
            .create_item(&session, DataClass::EntryNote, format!("before {i}").as_bytes())
            .await
            .unwrap();
    }

    let creates = join_all((0..6).map(|i| {
        let service = h.service.clone();
        let session = &session;
        async move {
            service
                .create_item(session, DataClass::EntryNote, format!("during {i}").as_bytes())
                .await
        }
    }));
    let rotate = h
        .service
        .rotate_credential(owner, OWNER_CREDENTIAL, "rotated");
    let (created, rotated) = tokio::join!(creates, rotate);
    rotated.unwrap();

    let fresh = h.session(owner, "rotated").await;
    for outcome in created {
        match outcome {
            Ok(item) => {
                h.service.read_item(&fresh, item).await.unwrap();
            }
            Err(KeyError::SessionExpired) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repeated_grants_to_one_grantee_converge() {
    let h = Harness::new();
    let owner = h.enrolled(OWNER_CREDENTIAL).await;
    let friend = h.enrolled(FRIEND_CREDENTIAL).await;
    h.connect(owner, friend).await;
    let session = h.session(owner, OWNER_CREDENTIAL).await;
    let item = h
        .service
        .create_item(&session, DataClass::DeedItemName, b"same key every time")
        .await
        .unwrap();

    let results = join_all(
        (0..8).map(|_| h.service.grant(&session, item, friend, GrantOptions::read())),
    )
    .await;
    assert!(results.iter().all(Result::is_ok));

    // Last writer wins; every writer sealed the same DEK.
    let mut holders = h.service.holders(item).unwrap();
    holders.sort();
    let mut expected = vec![owner, friend];
    expected.sort();
    assert_eq!(holders, expected);
    assert_eq!(h.relations.grant_count().await, 1);

    let friend_session = h.session(friend, FRIEND_CREDENTIAL).await;
    assert_eq!(
        h.service.read_item(&friend_session, item).await.unwrap().as_slice(),
        b"same key every time"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn revoke_racing_reads_never_looks_like_tampering() {
    let h = Harness::new();
    let owner = h.enrolled(OWNER_CREDENTIAL).await;
    let friend = h.enrolled(FRIEND_CREDENTIAL).await;
    h.connect(owner, friend).await;
    let session = h.session(owner, OWNER_CREDENTIAL).await;
    let item = h
        .service
        .create_item(&session, DataClass::ReflectionMessage, b"read me while you can")
        .await
        .unwrap();
    h.service
        .grant(&session, item, friend, GrantOptions::read())
        .await
        .unwrap();
    let friend_session = h.session(friend, FRIEND_CREDENTIAL).await;

    let reads = join_all((0..16).map(|_| h.service.read_item(&friend_session, item)));
    let revoke = h.service.revoke(&session, item, friend);
    let (reads, revoked) = tokio::join!(reads, revoke);
    assert!(revoked.unwrap());

    for read in reads {
        match read {
            Ok(plaintext) => assert_eq!(plaintext.as_slice(), b"read me while you can"),
            Err(KeyError::PermissionDenied(DenyReason::NoGrant)) => {}
            Err(KeyError::KeyNotFound { item: i, user }) => {
                assert_eq!((i, user), (item, friend));
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    let records = h.service.audit_records_for_item(item).unwrap();
    assert!(with_outcome(&records, "authentication_failure").is_empty());
    assert!(with_outcome(&records, "invariant_violation").is_empty());
    assert!(matches!(
        h.service.read_item(&friend_session, item).await.unwrap_err(),
        KeyError::PermissionDenied(DenyReason::NoGrant)
    ));
}
