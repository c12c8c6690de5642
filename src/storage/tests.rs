//! Backend conformance tests, run against the in-memory implementation.
//!
//! Every test takes the backend through the trait alone, so the same
//! assertions hold for any implementation that honors the contract.

use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

use crate::error::ReservationError;
use crate::models::{
    Allocation, AllocationId, Recurrence, RecurrenceId, Reservation, ReservationId,
    ReservationStatus, ReservationToken, ReservedSlot, TargetType,
};
use crate::storage::in_memory::InMemoryStorage;
use crate::storage::Storage;

fn hour(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, h, m, 0).unwrap()
}

fn master(resource: Uuid, start: DateTime<Utc>, end: DateTime<Utc>) -> Allocation {
    Allocation::new(resource, Uuid::new_v4(), start, end, 15).unwrap()
}

fn slot(
    resource: Uuid,
    start: DateTime<Utc>,
    allocation_id: AllocationId,
    token: ReservationToken,
) -> ReservedSlot {
    ReservedSlot {
        resource,
        start,
        end: start + Duration::minutes(15) - Duration::microseconds(1),
        allocation_id,
        reservation_token: token,
    }
}

fn reservation(resource: Uuid, target: Uuid, token: ReservationToken) -> Reservation {
    Reservation {
        id: ReservationId::new(),
        token,
        target,
        target_type: TargetType::Allocation,
        resource,
        start: Some(hour(8, 0)),
        end: Some(hour(9, 0) - Duration::microseconds(1)),
        status: ReservationStatus::Pending,
        data: None,
        email: "test@example.org".into(),
        quota: 1,
        rrule: None,
        created: Utc::now(),
        modified: None,
    }
}

#[tokio::test]
async fn duplicate_allocation_key_is_a_conflict() {
    let storage = InMemoryStorage::new();
    let resource = Uuid::new_v4();

    let first = master(resource, hour(8, 0), hour(9, 0));
    storage.insert_allocations(vec![first]).await.unwrap();

    // same (resource, start), fresh row id
    let second = master(resource, hour(8, 0), hour(10, 0));
    let result = storage.insert_allocations(vec![second]).await;
    assert!(matches!(result, Err(ReservationError::TryAgain)));

    // a conflict within the batch itself counts too
    let a = master(resource, hour(12, 0), hour(13, 0));
    let b = master(resource, hour(12, 0), hour(13, 0));
    let result = storage.insert_allocations(vec![a, b]).await;
    assert!(matches!(result, Err(ReservationError::TryAgain)));
}

#[tokio::test]
async fn range_scan_is_ordered_and_scoped() {
    let storage = InMemoryStorage::new();
    let resource = Uuid::new_v4();
    let other = Uuid::new_v4();

    let late = master(resource, hour(10, 0), hour(11, 0));
    let early = master(resource, hour(8, 0), hour(9, 0));
    let elsewhere = master(other, hour(8, 0), hour(9, 0));

    storage
        .insert_allocations(vec![late.clone(), early.clone(), elsewhere])
        .await
        .unwrap();

    let found = storage
        .allocations_in_range(resource, hour(7, 0), hour(12, 0), true)
        .await
        .unwrap();

    assert_eq!(found.len(), 2);
    assert_eq!(found[0].id, early.id);
    assert_eq!(found[1].id, late.id);

    // a range touching only one allocation returns just that one
    let found = storage
        .allocations_in_range(resource, hour(10, 30), hour(10, 45), true)
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, late.id);
}

#[tokio::test]
async fn masters_only_filters_out_mirrors() {
    let storage = InMemoryStorage::new();
    let resource = Uuid::new_v4();

    let master_row = master(resource, hour(8, 0), hour(9, 0));
    let mut mirror = master_row.clone();
    mirror.id = AllocationId::new();
    mirror.resource = crate::mirrors::mirror_key(resource, 1);

    storage
        .insert_allocations(vec![master_row.clone(), mirror.clone()])
        .await
        .unwrap();

    let masters = storage
        .allocations_in_range(resource, hour(8, 0), hour(9, 0), true)
        .await
        .unwrap();
    assert_eq!(masters.len(), 1);
    assert!(masters[0].is_master());

    let all = storage
        .allocations_in_range(resource, hour(8, 0), hour(9, 0), false)
        .await
        .unwrap();
    assert_eq!(all.len(), 2);

    let siblings = storage.siblings(resource, hour(8, 0)).await.unwrap();
    assert_eq!(siblings.len(), 2);
}

#[tokio::test]
async fn update_requires_an_existing_row() {
    let storage = InMemoryStorage::new();
    let resource = Uuid::new_v4();

    let mut allocation = master(resource, hour(8, 0), hour(9, 0));
    storage
        .insert_allocations(vec![allocation.clone()])
        .await
        .unwrap();

    allocation.quota = 5;
    storage
        .update_allocations(vec![allocation.clone()])
        .await
        .unwrap();

    let found = storage
        .allocation_by_id(resource, allocation.id)
        .await
        .unwrap();
    assert_eq!(found.quota, 5);

    let ghost = master(resource, hour(10, 0), hour(11, 0));
    let result = storage.update_allocations(vec![ghost]).await;
    assert!(matches!(result, Err(ReservationError::InvalidAllocation)));
}

#[tokio::test]
async fn allocation_lookup_is_scoped_to_the_resource() {
    let storage = InMemoryStorage::new();
    let resource = Uuid::new_v4();

    let allocation = master(resource, hour(8, 0), hour(9, 0));
    storage
        .insert_allocations(vec![allocation.clone()])
        .await
        .unwrap();

    let result = storage.allocation_by_id(Uuid::new_v4(), allocation.id).await;
    assert!(matches!(result, Err(ReservationError::InvalidAllocation)));
}

#[tokio::test]
async fn group_scans_and_counts() {
    let storage = InMemoryStorage::new();
    let resource = Uuid::new_v4();
    let group = Uuid::new_v4();

    let mut a = master(resource, hour(8, 0), hour(9, 0));
    a.group = group;
    let mut b = master(resource, hour(10, 0), hour(11, 0));
    b.group = group;
    let c = master(resource, hour(12, 0), hour(13, 0));

    storage
        .insert_allocations(vec![a, b, c.clone()])
        .await
        .unwrap();

    let members = storage
        .allocations_by_groups(resource, &[group], true)
        .await
        .unwrap();
    assert_eq!(members.len(), 2);

    assert_eq!(storage.group_member_count(resource, group).await.unwrap(), 2);
    assert_eq!(
        storage.group_member_count(resource, c.group).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn slot_keys_are_unique_per_resource_and_start() {
    let storage = InMemoryStorage::new();
    let resource = Uuid::new_v4();

    let allocation = master(resource, hour(8, 0), hour(9, 0));
    storage
        .insert_allocations(vec![allocation.clone()])
        .await
        .unwrap();

    let token = ReservationToken::new();
    storage
        .insert_slots(vec![slot(resource, hour(8, 0), allocation.id, token)])
        .await
        .unwrap();

    // another claim on the same key must fail, regardless of token
    let result = storage
        .insert_slots(vec![slot(
            resource,
            hour(8, 0),
            allocation.id,
            ReservationToken::new(),
        )])
        .await;
    assert!(matches!(result, Err(ReservationError::TryAgain)));

    // the same start on a different key is fine
    let mirror_key = crate::mirrors::mirror_key(resource, 1);
    storage
        .insert_slots(vec![slot(mirror_key, hour(8, 0), allocation.id, token)])
        .await
        .unwrap();
}

#[tokio::test]
async fn slots_are_found_and_deleted_by_token() {
    let storage = InMemoryStorage::new();
    let resource = Uuid::new_v4();

    let allocation = master(resource, hour(8, 0), hour(9, 0));
    storage
        .insert_allocations(vec![allocation.clone()])
        .await
        .unwrap();

    let token = ReservationToken::new();
    let other_token = ReservationToken::new();
    storage
        .insert_slots(vec![
            slot(resource, hour(8, 0), allocation.id, token),
            slot(resource, hour(8, 15), allocation.id, token),
            slot(resource, hour(8, 30), allocation.id, other_token),
        ])
        .await
        .unwrap();

    let found = storage.slots_by_token(resource, token).await.unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(found[0].start, hour(8, 0));

    let removed = storage.delete_slots_by_token(resource, token).await.unwrap();
    assert_eq!(removed, 2);

    let remaining = storage.slots_by_allocation(allocation.id).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].reservation_token, other_token);
}

#[tokio::test]
async fn relocate_moves_all_slots_of_an_allocation() {
    let storage = InMemoryStorage::new();
    let resource = Uuid::new_v4();
    let mirror_resource = crate::mirrors::mirror_key(resource, 1);

    let master_row = master(resource, hour(8, 0), hour(9, 0));
    let mut mirror = master_row.clone();
    mirror.id = AllocationId::new();
    mirror.resource = mirror_resource;

    storage
        .insert_allocations(vec![master_row.clone(), mirror.clone()])
        .await
        .unwrap();

    let token = ReservationToken::new();
    storage
        .insert_slots(vec![
            slot(mirror_resource, hour(8, 0), mirror.id, token),
            slot(mirror_resource, hour(8, 15), mirror.id, token),
        ])
        .await
        .unwrap();

    let moved = storage
        .relocate_slots(mirror.id, master_row.id, resource)
        .await
        .unwrap();
    assert_eq!(moved, 2);

    assert!(storage
        .slots_by_allocation(mirror.id)
        .await
        .unwrap()
        .is_empty());

    let relocated = storage.slots_by_allocation(master_row.id).await.unwrap();
    assert_eq!(relocated.len(), 2);
    assert!(relocated.iter().all(|s| s.resource == resource));
}

#[tokio::test]
async fn relocate_refuses_occupied_destination_keys() {
    let storage = InMemoryStorage::new();
    let resource = Uuid::new_v4();
    let mirror_resource = crate::mirrors::mirror_key(resource, 1);

    let master_row = master(resource, hour(8, 0), hour(9, 0));
    let mut mirror = master_row.clone();
    mirror.id = AllocationId::new();
    mirror.resource = mirror_resource;

    storage
        .insert_allocations(vec![master_row.clone(), mirror.clone()])
        .await
        .unwrap();

    storage
        .insert_slots(vec![
            slot(resource, hour(8, 0), master_row.id, ReservationToken::new()),
            slot(mirror_resource, hour(8, 0), mirror.id, ReservationToken::new()),
        ])
        .await
        .unwrap();

    let result = storage.relocate_slots(mirror.id, master_row.id, resource).await;
    assert!(matches!(result, Err(ReservationError::TryAgain)));
}

#[tokio::test]
async fn replacing_a_claim_is_all_or_nothing() {
    let storage = InMemoryStorage::new();
    let resource = Uuid::new_v4();

    let allocation = master(resource, hour(8, 0), hour(9, 0));
    storage
        .insert_allocations(vec![allocation.clone()])
        .await
        .unwrap();

    let token = ReservationToken::new();
    let rival = ReservationToken::new();
    storage
        .insert_slots(vec![
            slot(resource, hour(8, 0), allocation.id, token),
            slot(resource, hour(8, 30), allocation.id, rival),
        ])
        .await
        .unwrap();

    // the rival holds 8:30, so the swap fails and the old claim survives
    let result = storage
        .replace_slots(
            resource,
            token,
            vec![],
            vec![slot(resource, hour(8, 30), allocation.id, token)],
        )
        .await;
    assert!(matches!(result, Err(ReservationError::TryAgain)));

    let kept = storage.slots_by_token(resource, token).await.unwrap();
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].start, hour(8, 0));

    // reclaiming one's own key is fine, the removal happens first
    let removed = storage
        .replace_slots(
            resource,
            token,
            vec![],
            vec![
                slot(resource, hour(8, 0), allocation.id, token),
                slot(resource, hour(8, 15), allocation.id, token),
            ],
        )
        .await
        .unwrap();
    assert_eq!(removed, 1);

    let claimed = storage.slots_by_token(resource, token).await.unwrap();
    assert_eq!(claimed.len(), 2);
    assert_eq!(claimed[1].start, hour(8, 15));
}

#[tokio::test]
async fn reservations_round_trip_by_token_and_target() {
    let storage = InMemoryStorage::new();
    let resource = Uuid::new_v4();
    let target = Uuid::new_v4();
    let token = ReservationToken::new();

    let mut first = reservation(resource, target, token);
    first.created = hour(7, 0);
    let mut second = reservation(resource, target, token);
    second.created = hour(7, 30);

    storage
        .insert_reservations(vec![second.clone(), first.clone()])
        .await
        .unwrap();

    let by_token = storage.reservations_by_token(resource, token).await.unwrap();
    assert_eq!(by_token.len(), 2);
    assert_eq!(by_token[0].id, first.id);

    let pending = storage
        .reservations_by_target(resource, &[target], Some(ReservationStatus::Pending))
        .await
        .unwrap();
    assert_eq!(pending.len(), 2);

    first.status = ReservationStatus::Approved;
    storage
        .update_reservations(vec![first.clone()])
        .await
        .unwrap();

    let approved = storage
        .reservations_by_target(resource, &[target], Some(ReservationStatus::Approved))
        .await
        .unwrap();
    assert_eq!(approved.len(), 1);
    assert_eq!(approved[0].id, first.id);

    let removed = storage
        .delete_reservations(vec![first.id, second.id])
        .await
        .unwrap();
    assert_eq!(removed, 2);
}

#[tokio::test]
async fn orphaned_recurrences_are_swept() {
    let storage = InMemoryStorage::new();
    let resource = Uuid::new_v4();

    let kept = Recurrence::new(resource, None);
    let orphan = Recurrence::new(resource, Some("FREQ=DAILY".into()));

    storage.insert_recurrence(kept.clone()).await.unwrap();
    storage.insert_recurrence(orphan.clone()).await.unwrap();

    let mut allocation = master(resource, hour(8, 0), hour(9, 0));
    allocation.recurrence_id = Some(kept.id);
    storage.insert_allocations(vec![allocation]).await.unwrap();

    assert_eq!(storage.sweep_recurrences(resource).await.unwrap(), 1);
    // the kept one survives a second sweep
    assert_eq!(storage.sweep_recurrences(resource).await.unwrap(), 0);
}

#[tokio::test]
async fn extinguish_clears_every_table() {
    let storage = InMemoryStorage::new();
    let resource = Uuid::new_v4();
    let untouched = Uuid::new_v4();

    let doomed = master(resource, hour(8, 0), hour(9, 0));
    let survivor = master(untouched, hour(8, 0), hour(9, 0));
    storage
        .insert_allocations(vec![doomed.clone(), survivor.clone()])
        .await
        .unwrap();

    let token = ReservationToken::new();
    storage
        .insert_slots(vec![slot(resource, hour(8, 0), doomed.id, token)])
        .await
        .unwrap();
    storage
        .insert_reservations(vec![reservation(resource, doomed.group, token)])
        .await
        .unwrap();
    storage
        .insert_recurrence(Recurrence::new(resource, None))
        .await
        .unwrap();

    storage.extinguish(resource).await.unwrap();

    assert!(storage
        .allocations_in_range(resource, hour(0, 0), hour(23, 0), false)
        .await
        .unwrap()
        .is_empty());
    assert!(storage.slots_by_token(resource, token).await.unwrap().is_empty());
    assert!(storage
        .reservations_by_token(resource, token)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(storage.sweep_recurrences(resource).await.unwrap(), 0);

    // the other resource is untouched
    let kept = storage
        .allocation_by_id(untouched, survivor.id)
        .await
        .unwrap();
    assert_eq!(kept.id, survivor.id);
}
