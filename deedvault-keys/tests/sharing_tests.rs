//! Grant and revoke workflows.

mod support;

use deedvault_keys::{DenyReason, GrantOptions, KeyError};
use deedvault_storage::{AuditAction, AuditOutcome, WrapScheme, WrappedKeyRepository};
use deedvault_types::{AccessAction, DataClass, RelationStatus};
use pretty_assertions::assert_eq;
use support::*;

#[tokio::test]
async fn grantee_reads_owner_plaintext() {
    let h = Harness::new();
    let owner = h.enrolled(OWNER_CREDENTIAL).await;
    let friend = h.enrolled(FRIEND_CREDENTIAL).await;
    h.connect(owner, friend).await;

    let owner_session = h.session(owner, OWNER_CREDENTIAL).await;
    let item = h
        .service
        .create_item(&owner_session, DataClass::ReflectionMessage, b"shared secret")
        .await
        .unwrap();
    h.service
        .grant(&owner_session, item, friend, GrantOptions::read())
        .await
        .unwrap();

    let friend_session = h.session(friend, FRIEND_CREDENTIAL).await;
    let as_friend = h.service.read_item(&friend_session, item).await.unwrap();
    let as_owner = h.service.read_item(&owner_session, item).await.unwrap();
    assert_eq!(as_friend.as_slice(), b"shared secret");
    assert_eq!(as_friend.as_slice(), as_owner.as_slice());

    let row = h.store.get_wrapped(item, friend).unwrap().unwrap();
    assert_eq!(row.dek.scheme(), WrapScheme::Sealed);
}

#[tokio::test]
async fn granting_twice_leaves_one_row_and_one_grant() {
    let h = Harness::new();
    let owner = h.enrolled(OWNER_CREDENTIAL).await;
    let friend = h.enrolled(FRIEND_CREDENTIAL).await;
    h.connect(owner, friend).await;
    let session = h.session(owner, OWNER_CREDENTIAL).await;
    let item = h
        .service
        .create_item(&session, DataClass::EntryNote, b"x")
        .await
        .unwrap();

    h.service
        .grant(&session, item, friend, GrantOptions::read())
        .await
        .unwrap();
    h.service
        .grant(&session, item, friend, GrantOptions::write())
        .await
        .unwrap();

    let mut holders = h.service.holders(item).unwrap();
    holders.sort();
    let mut expected = vec![owner, friend];
    expected.sort();
    assert_eq!(holders, expected);
    assert_eq!(h.relations.grant_count().await, 1);
    assert!(h.service.authorize(friend, item, AccessAction::Write).await.unwrap().is_allowed());
}

#[tokio::test]
async fn grant_requires_accepted_relation_with_grantee() {
    let h = Harness::new();
    let owner = h.enrolled(OWNER_CREDENTIAL).await;
    let pending = h.enrolled(FRIEND_CREDENTIAL).await;
    h.relations
        .connect(owner, pending, RelationStatus::Pending)
        .await;
    let session = h.session(owner, OWNER_CREDENTIAL).await;
    let item = h
        .service
        .create_item(&session, DataClass::EntryNote, b"x")
        .await
        .unwrap();

    let err = h
        .service
        .grant(&session, item, pending, GrantOptions::read())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        KeyError::PermissionDenied(DenyReason::GranteeNotConnected)
    ));
    assert!(h.store.get_wrapped(item, pending).unwrap().is_none());
    assert_eq!(h.relations.grant_count().await, 0);
}

#[tokio::test]
async fn grant_to_unenrolled_user_fails_without_side_effects() {
    let h = Harness::new();
    let owner = h.enrolled(OWNER_CREDENTIAL).await;
    let ghost = deedvault_types::UserId::new();
    h.connect(owner, ghost).await;
    let session = h.session(owner, OWNER_CREDENTIAL).await;
    let item = h
        .service
        .create_item(&session, DataClass::EntryNote, b"x")
        .await
        .unwrap();

    let err = h
        .service
        .grant(&session, item, ghost, GrantOptions::read())
        .await
        .unwrap_err();
    assert!(matches!(err, KeyError::NotEnrolled(u) if u == ghost));
    assert_eq!(h.relations.grant_count().await, 0);
}

#[tokio::test]
async fn failed_grant_creation_removes_new_row() {
    let h = Harness::new();
    let owner = h.enrolled(OWNER_CREDENTIAL).await;
    let friend = h.enrolled(FRIEND_CREDENTIAL).await;
    h.connect(owner, friend).await;
    let session = h.session(owner, OWNER_CREDENTIAL).await;
    let item = h
        .service
        .create_item(&session, DataClass::EntryNote, b"x")
        .await
        .unwrap();

    h.relations.fail_grant_creation(true);
    let err = h
        .service
        .grant(&session, item, friend, GrantOptions::read())
        .await
        .unwrap_err();

    assert!(matches!(err, KeyError::Directory(_)));
    assert!(h.store.get_wrapped(item, friend).unwrap().is_none());
    assert_eq!(h.store.wrapped_key_count().unwrap(), 1);
}

#[tokio::test]
async fn failed_regrant_restores_previous_row() {
    let h = Harness::new();
    let owner = h.enrolled(OWNER_CREDENTIAL).await;
    let friend = h.enrolled(FRIEND_CREDENTIAL).await;
    h.connect(owner, friend).await;
    let session = h.session(owner, OWNER_CREDENTIAL).await;
    let item = h
        .service
        .create_item(&session, DataClass::EntryNote, b"x")
        .await
        .unwrap();
    h.service
        .grant(&session, item, friend, GrantOptions::read())
        .await
        .unwrap();
    let before = h.store.get_wrapped(item, friend).unwrap().unwrap();

    h.relations.fail_grant_creation(true);
    h.service
        .grant(&session, item, friend, GrantOptions::write())
        .await
        .unwrap_err();

    let after = h.store.get_wrapped(item, friend).unwrap().unwrap();
    assert_eq!(after, before);

    let friend_session = h.session(friend, FRIEND_CREDENTIAL).await;
    assert_eq!(
        h.service.read_item(&friend_session, item).await.unwrap().as_slice(),
        b"x"
    );
}

#[tokio::test]
async fn grant_without_wrapped_key_is_an_audited_invariant_violation() {
    let h = Harness::new();
    let owner = h.enrolled(OWNER_CREDENTIAL).await;
    let friend = h.enrolled(FRIEND_CREDENTIAL).await;
    h.connect(owner, friend).await;
    let session = h.session(owner, OWNER_CREDENTIAL).await;
    let item = h
        .service
        .create_item(&session, DataClass::EntryNote, b"x")
        .await
        .unwrap();
    h.service
        .grant(&session, item, friend, GrantOptions::read())
        .await
        .unwrap();

    // Lose the key behind the service's back; the grant stays active.
    h.store.delete_wrapped(item, friend).unwrap();

    let friend_session = h.session(friend, FRIEND_CREDENTIAL).await;
    let err = h.service.read_item(&friend_session, item).await.unwrap_err();
    assert!(matches!(err, KeyError::InvariantViolation(_)));
    assert!(h.store.get_wrapped(item, friend).unwrap().is_none(), "never repaired");

    let records = h.service.audit_records_for_item(item).unwrap();
    let violations = with_outcome(&records, "invariant_violation");
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].entry.user_id, friend);
}

#[tokio::test]
async fn revoke_denies_and_removes_key() {
    let h = Harness::new();
    let owner = h.enrolled(OWNER_CREDENTIAL).await;
    let friend = h.enrolled(FRIEND_CREDENTIAL).await;
    h.connect(owner, friend).await;
    let session = h.session(owner, OWNER_CREDENTIAL).await;
    let item = h
        .service
        .create_item(&session, DataClass::EntryNote, b"x")
        .await
        .unwrap();
    h.service
        .grant(&session, item, friend, GrantOptions::read())
        .await
        .unwrap();

    assert!(h.service.revoke(&session, item, friend).await.unwrap());

    let friend_session = h.session(friend, FRIEND_CREDENTIAL).await;
    let err = h.service.read_item(&friend_session, item).await.unwrap_err();
    assert!(matches!(err, KeyError::PermissionDenied(DenyReason::NoGrant)));
    assert!(h.store.get_wrapped(item, friend).unwrap().is_none());
    assert_eq!(h.relations.grant_count().await, 0);

    // Second revoke finds nothing to remove.
    assert!(!h.service.revoke(&session, item, friend).await.unwrap());
}

#[tokio::test]
async fn revoke_leaves_other_grantees_untouched() {
    let h = Harness::new();
    let owner = h.enrolled(OWNER_CREDENTIAL).await;
    let a = h.enrolled(FRIEND_CREDENTIAL).await;
    let b = h.enrolled(STRANGER_CREDENTIAL).await;
    h.connect(owner, a).await;
    h.connect(owner, b).await;
    let session = h.session(owner, OWNER_CREDENTIAL).await;
    let item = h
        .service
        .create_item(&session, DataClass::EntryNote, b"both")
        .await
        .unwrap();
    for grantee in [a, b] {
        h.service
            .grant(&session, item, grantee, GrantOptions::read())
            .await
            .unwrap();
    }
    let b_row = h.store.get_wrapped(item, b).unwrap().unwrap();

    h.service.revoke(&session, item, a).await.unwrap();

    assert_eq!(h.store.get_wrapped(item, b).unwrap().unwrap(), b_row);
    let b_session = h.session(b, STRANGER_CREDENTIAL).await;
    assert_eq!(
        h.service.read_item(&b_session, item).await.unwrap().as_slice(),
        b"both"
    );
}

#[tokio::test]
async fn only_owner_revokes_and_never_their_own_key() {
    let h = Harness::new();
    let owner = h.enrolled(OWNER_CREDENTIAL).await;
    let friend = h.enrolled(FRIEND_CREDENTIAL).await;
    h.connect(owner, friend).await;
    let session = h.session(owner, OWNER_CREDENTIAL).await;
    let item = h
        .service
        .create_item(&session, DataClass::EntryNote, b"x")
        .await
        .unwrap();
    h.service
        .grant(&session, item, friend, GrantOptions::write())
        .await
        .unwrap();

    let friend_session = h.session(friend, FRIEND_CREDENTIAL).await;
    let err = h.service.revoke(&friend_session, item, friend).await.unwrap_err();
    assert!(matches!(err, KeyError::PermissionDenied(DenyReason::NotOwner)));

    let err = h.service.revoke(&session, item, owner).await.unwrap_err();
    assert!(matches!(err, KeyError::PermissionDenied(DenyReason::OwnerKey)));
    assert!(h.store.get_wrapped(item, owner).unwrap().is_some());

    let denied: Vec<_> = h
        .service
        .audit_records_for_item(item)
        .unwrap()
        .into_iter()
        .filter(|r| r.entry.action == AuditAction::Revoke && is_denied(&r.entry.outcome))
        .collect();
    assert_eq!(denied.len(), 2);
}

#[tokio::test]
async fn grant_and_revoke_success_is_audited() {
    let h = Harness::new();
    let owner = h.enrolled(OWNER_CREDENTIAL).await;
    let friend = h.enrolled(FRIEND_CREDENTIAL).await;
    h.connect(owner, friend).await;
    let session = h.session(owner, OWNER_CREDENTIAL).await;
    let item = h
        .service
        .create_item(&session, DataClass::EntryNote, b"x")
        .await
        .unwrap();
    h.service
        .grant(&session, item, friend, GrantOptions::read())
        .await
        .unwrap();
    h.service.revoke(&session, item, friend).await.unwrap();

    let succeeded: Vec<_> = h
        .service
        .audit_records_for_item(item)
        .unwrap()
        .into_iter()
        .filter(|r| r.entry.outcome == AuditOutcome::Succeeded)
        .map(|r| r.entry.action)
        .collect();
    assert_eq!(
        succeeded,
        vec![AuditAction::Write, AuditAction::Share, AuditAction::Revoke]
    );
}

#[tokio::test]
async fn reshare_passes_the_same_dek_along() {
    let mut config = test_config();
    config.allow_reshare = true;
    let h = Harness::with_config(config);

    let owner = h.enrolled(OWNER_CREDENTIAL).await;
    let friend = h.enrolled(FRIEND_CREDENTIAL).await;
    let third = h.enrolled(STRANGER_CREDENTIAL).await;
    h.connect(owner, friend).await;
    h.connect(owner, third).await;

    let owner_session = h.session(owner, OWNER_CREDENTIAL).await;
    let item = h
        .service
        .create_item(&owner_session, DataClass::EntryNote, b"passed on")
        .await
        .unwrap();
    h.service
        .grant(&owner_session, item, friend, GrantOptions::read().with_reshare())
        .await
        .unwrap();

    let friend_session = h.session(friend, FRIEND_CREDENTIAL).await;
    h.service
        .grant(&friend_session, item, third, GrantOptions::read())
        .await
        .unwrap();

    let third_session = h.session(third, STRANGER_CREDENTIAL).await;
    assert_eq!(
        h.service.read_item(&third_session, item).await.unwrap().as_slice(),
        b"passed on"
    );
    assert!(matches!(
        h.service.authorize(third, item, AccessAction::Read).await.unwrap(),
        deedvault_keys::Decision::Allow
    ));
}

#[tokio::test]
async fn deleting_an_item_withdraws_every_grant() {
    let h = Harness::new();
    let owner = h.enrolled(OWNER_CREDENTIAL).await;
    let friend = h.enrolled(FRIEND_CREDENTIAL).await;
    h.connect(owner, friend).await;
    let session = h.session(owner, OWNER_CREDENTIAL).await;
    let item = h
        .service
        .create_item(&session, DataClass::EntryNote, b"x")
        .await
        .unwrap();
    h.service
        .grant(&session, item, friend, GrantOptions::read())
        .await
        .unwrap();

    let friend_session = h.session(friend, FRIEND_CREDENTIAL).await;
    let err = h.service.delete_item(&friend_session, item).await.unwrap_err();
    assert!(matches!(err, KeyError::PermissionDenied(DenyReason::NotOwner)));

    h.service.delete_item(&session, item).await.unwrap();
    assert_eq!(h.store.wrapped_key_count().unwrap(), 0);
    assert_eq!(h.relations.grant_count().await, 0);
    assert!(matches!(
        h.service.read_item(&session, item).await.unwrap_err(),
        KeyError::ItemNotFound(_)
    ));
}
