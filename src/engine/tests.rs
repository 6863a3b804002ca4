use super::*;
use crate::clock::ManualClock;
use crate::directory::OpenDirectory;
use chrono::Weekday;

const H: Ms = HOUR_MS;
const M: Ms = MINUTE_MS;
/// 2026-01-05T00:00:00Z, a Monday.
const MONDAY: Ms = 1_767_571_200_000;

const WEEK: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("berth_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn settings() -> EngineSettings {
    EngineSettings {
        lock_timeout: Duration::from_secs(2),
        arbitration_retries: 3,
        outbox_max_attempts: 3,
        outbox_lease_ms: 10_000,
        initial_backoff_ms: 1_000,
        max_backoff_ms: 60_000,
    }
}

fn engine_at(path: &PathBuf, now: Ms) -> (Engine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(now));
    let engine = Engine::new(path.clone(), settings(), clock.clone()).unwrap();
    (engine, clock)
}

fn policy() -> BookingPolicy {
    BookingPolicy {
        min_duration: 30 * M,
        max_duration: Some(4 * H),
        buffer: 0,
        granularity: 30 * M,
        advance_horizon: None,
        cancellation_cutoff: None,
        utc_offset_minutes: 0,
    }
}

/// Facility open 08:00-20:00 every day.
async fn open_facility(engine: &Engine, policy: BookingPolicy) -> Ulid {
    let id = Ulid::new();
    engine
        .create_facility(id, Some("Court 1".into()), policy)
        .await
        .unwrap();
    for weekday in WEEK {
        engine
            .add_window(
                id,
                AvailabilityWindow {
                    id: Ulid::new(),
                    weekday,
                    start_minute: 8 * 60,
                    end_minute: 20 * 60,
                    effective_from: None,
                    effective_until: None,
                },
            )
            .await
            .unwrap();
    }
    id
}

async fn program(engine: &Engine, capacity: u32) -> (Ulid, Ulid) {
    let pid = Ulid::new();
    let occ = Ulid::new();
    engine
        .create_program(pid, Some("Spin class".into()), capacity)
        .await
        .unwrap();
    engine
        .add_occurrence(occ, pid, Some(MONDAY + 18 * H), None)
        .await
        .unwrap();
    (pid, occ)
}

fn monday(start_h: Ms, end_h: Ms) -> Span {
    Span::new(MONDAY + start_h * H, MONDAY + end_h * H)
}

// ── Facility arbitration ─────────────────────────────────

#[tokio::test]
async fn facility_booking_confirmed() {
    let path = test_wal_path("facility_confirmed.wal");
    let (engine, _) = engine_at(&path, MONDAY);
    let fid = open_facility(&engine, policy()).await;

    let outcome = engine
        .create_reservation(ReservationRequest::booking(fid, monday(10, 11), "ana"))
        .await
        .unwrap();
    assert_eq!(outcome.status, Status::Confirmed);
    assert_eq!(outcome.position, None);
    assert!(!outcome.replayed);

    let (r, _) = engine.get_reservation(outcome.reservation_id).await.unwrap();
    assert_eq!(r.participant, "ana");
    assert_eq!(r.span, Some(monday(10, 11)));
}

#[tokio::test]
async fn overlapping_booking_conflicts() {
    let path = test_wal_path("facility_conflict.wal");
    let (engine, _) = engine_at(&path, MONDAY);
    let fid = open_facility(&engine, policy()).await;

    let first = engine
        .create_reservation(ReservationRequest::booking(fid, monday(10, 11), "ana"))
        .await
        .unwrap();
    let second = engine
        .create_reservation(ReservationRequest::booking(
            fid,
            Span::new(MONDAY + 10 * H + 30 * M, MONDAY + 11 * H + 30 * M),
            "ben",
        ))
        .await;
    assert!(matches!(second, Err(EngineError::Conflict(id)) if id == first.reservation_id));

    // back-to-back is fine with no buffer
    engine
        .create_reservation(ReservationRequest::booking(fid, monday(11, 12), "ben"))
        .await
        .unwrap();
}

#[tokio::test]
async fn buffer_separates_bookings() {
    let path = test_wal_path("facility_buffer.wal");
    let (engine, _) = engine_at(&path, MONDAY);
    let fid = open_facility(
        &engine,
        BookingPolicy {
            buffer: 15 * M,
            ..policy()
        },
    )
    .await;

    engine
        .create_reservation(ReservationRequest::booking(fid, monday(10, 11), "ana"))
        .await
        .unwrap();
    let too_close = engine
        .create_reservation(ReservationRequest::booking(
            fid,
            Span::new(MONDAY + 11 * H + 10 * M, MONDAY + 12 * H),
            "ben",
        ))
        .await;
    assert!(matches!(too_close, Err(EngineError::Conflict(_))));

    engine
        .create_reservation(ReservationRequest::booking(
            fid,
            Span::new(MONDAY + 11 * H + 15 * M, MONDAY + 12 * H),
            "ben",
        ))
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_same_slot_exactly_one_wins() {
    let path = test_wal_path("facility_race.wal");
    let (engine, _) = engine_at(&path, MONDAY);
    let fid = open_facility(&engine, policy()).await;
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .create_reservation(ReservationRequest::booking(fid, monday(14, 15), format!("user-{i}")))
                .await
        }));
    }
    let mut wins = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(o) => {
                assert_eq!(o.status, Status::Confirmed);
                wins += 1;
            }
            Err(e) => assert!(matches!(e, EngineError::Conflict(_)), "unexpected {e}"),
        }
    }
    assert_eq!(wins, 1);
    let reservations = engine.list_reservations(fid, None).await.unwrap();
    assert_eq!(reservations.len(), 1);
}

#[tokio::test]
async fn availability_reasons() {
    let path = test_wal_path("availability_reasons.wal");
    let (engine, _) = engine_at(&path, MONDAY + 9 * H);
    let fid = open_facility(
        &engine,
        BookingPolicy {
            advance_horizon: Some(7 * DAY_MS),
            ..policy()
        },
    )
    .await;

    assert!(engine.check_availability(fid, monday(10, 11)).await.is_ok());
    assert!(matches!(
        engine.check_availability(fid, monday(21, 22)).await,
        Err(EngineError::OutOfWindow { .. })
    ));
    assert!(matches!(
        engine.check_availability(fid, monday(19, 21)).await,
        Err(EngineError::PartiallyOutOfWindow { .. })
    ));
    assert!(matches!(
        engine.check_availability(fid, monday(8, 9)).await,
        Err(EngineError::InThePast)
    ));
    assert!(matches!(
        engine
            .check_availability(fid, Span::new(MONDAY + 10 * H, MONDAY + 10 * H + 10 * M))
            .await,
        Err(EngineError::DurationOutOfBounds { .. })
    ));
    let far = Span::new(MONDAY + 14 * DAY_MS + 10 * H, MONDAY + 14 * DAY_MS + 11 * H);
    assert!(matches!(
        engine.check_availability(fid, far).await,
        Err(EngineError::TooFarInAdvance { .. })
    ));

    let closure = Ulid::new();
    engine
        .add_closure(fid, closure, monday(12, 13), Some("maintenance".into()))
        .await
        .unwrap();
    assert!(matches!(
        engine.check_availability(fid, monday(12, 14)).await,
        Err(EngineError::DuringClosure { id, .. }) if id == closure
    ));
    engine.remove_closure(closure).await.unwrap();
    assert!(engine.check_availability(fid, monday(12, 14)).await.is_ok());

    engine.deactivate_resource(fid).await.unwrap();
    assert!(matches!(
        engine.check_availability(fid, monday(10, 11)).await,
        Err(EngineError::ResourceInactive(_))
    ));
    assert!(matches!(
        engine
            .create_reservation(ReservationRequest::booking(fid, monday(10, 11), "ana"))
            .await,
        Err(EngineError::ResourceInactive(_))
    ));
}

#[tokio::test]
async fn removed_window_closes_day() {
    let path = test_wal_path("remove_window.wal");
    let (engine, _) = engine_at(&path, MONDAY);
    let (window_id, fid) = facility_with_single_window(&engine).await;
    assert!(engine.check_availability(fid, monday(10, 11)).await.is_ok());
    assert_eq!(engine.remove_window(window_id).await.unwrap(), fid);
    assert!(matches!(
        engine.check_availability(fid, monday(10, 11)).await,
        Err(EngineError::OutOfWindow { .. })
    ));
    assert!(matches!(
        engine.remove_window(window_id).await,
        Err(EngineError::NotFound(_))
    ));
}

/// Returns (window id, facility id).
async fn facility_with_single_window(engine: &Engine) -> (Ulid, Ulid) {
    let fid = Ulid::new();
    let wid = Ulid::new();
    engine.create_facility(fid, None, policy()).await.unwrap();
    engine
        .add_window(
            fid,
            AvailabilityWindow {
                id: wid,
                weekday: Weekday::Mon,
                start_minute: 9 * 60,
                end_minute: 17 * 60,
                effective_from: None,
                effective_until: None,
            },
        )
        .await
        .unwrap();
    (wid, fid)
}

#[tokio::test]
async fn slots_exclude_bookings() {
    let path = test_wal_path("slots.wal");
    let (engine, _) = engine_at(&path, MONDAY);
    let fid = open_facility(&engine, policy()).await;
    engine
        .create_reservation(ReservationRequest::booking(fid, monday(9, 19), "ana"))
        .await
        .unwrap_err();
    engine
        .create_reservation(ReservationRequest::booking(fid, monday(9, 12), "ana"))
        .await
        .unwrap();

    let slots = engine
        .list_available_slots(fid, monday(0, 13), H)
        .await
        .unwrap();
    assert_eq!(
        slots,
        vec![monday(8, 9), monday(12, 13)],
    );

    assert!(matches!(
        engine.list_available_slots(fid, monday(0, 13), 5 * H).await,
        Err(EngineError::DurationOutOfBounds { .. })
    ));
    assert!(matches!(
        engine
            .list_available_slots(fid, Span::new(MONDAY, MONDAY + 200 * DAY_MS), H)
            .await,
        Err(EngineError::LimitExceeded(_))
    ));
}

#[tokio::test]
async fn lock_timeout_reports_busy() {
    let path = test_wal_path("busy.wal");
    let clock = Arc::new(ManualClock::new(MONDAY));
    let engine = Engine::new(
        path,
        EngineSettings {
            lock_timeout: Duration::from_millis(30),
            arbitration_retries: 1,
            ..settings()
        },
        clock,
    )
    .unwrap();
    let fid = open_facility(&engine, policy()).await;

    let rs = engine.get_resource(&fid).unwrap();
    let held = rs.write().await;
    let result = engine
        .create_reservation(ReservationRequest::booking(fid, monday(10, 11), "ana"))
        .await;
    assert!(matches!(result, Err(EngineError::Busy)));
    drop(held);

    engine
        .create_reservation(ReservationRequest::booking(fid, monday(10, 11), "ana"))
        .await
        .unwrap();
}

// ── Identity and idempotency ─────────────────────────────

#[tokio::test]
async fn idempotency_key_replays_outcome() {
    let path = test_wal_path("idempotency.wal");
    let (engine, _) = engine_at(&path, MONDAY);
    let fid = open_facility(&engine, policy()).await;

    let req = ReservationRequest::booking(fid, monday(10, 11), "ana").with_idempotency_key("req-1");
    let first = engine.create_reservation(req.clone()).await.unwrap();
    // retried with a fresh request id, same key
    let retry = ReservationRequest {
        id: Ulid::new(),
        ..req
    };
    let second = engine.create_reservation(retry).await.unwrap();
    assert_eq!(second.reservation_id, first.reservation_id);
    assert_eq!(second.status, Status::Confirmed);
    assert!(second.replayed);
    assert_eq!(engine.list_reservations(fid, None).await.unwrap().len(), 1);
    assert_eq!(engine.pending_outbox().await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_idempotent_requests_decide_once() {
    let path = test_wal_path("idempotency_race.wal");
    let (engine, _) = engine_at(&path, MONDAY);
    let (pid, occ) = program(&engine, 5).await;
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .create_reservation(ReservationRequest::seat(pid, Some(occ), "ana").with_idempotency_key("dup"))
                .await
                .unwrap()
        }));
    }
    let mut ids = Vec::new();
    for h in handles {
        ids.push(h.await.unwrap().reservation_id);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(engine.list_reservations(pid, Some(occ)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn same_participant_gets_existing_seat() {
    let path = test_wal_path("same_participant.wal");
    let (engine, _) = engine_at(&path, MONDAY);
    let (pid, occ) = program(&engine, 2).await;

    let first = engine
        .create_reservation(ReservationRequest::seat(pid, Some(occ), "ana"))
        .await
        .unwrap();
    let again = engine
        .create_reservation(ReservationRequest::seat(pid, Some(occ), "ana"))
        .await
        .unwrap();
    assert_eq!(again.reservation_id, first.reservation_id);
    assert!(again.replayed);
    assert_eq!(engine.list_reservations(pid, Some(occ)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn participant_must_be_self_by_default() {
    let path = test_wal_path("directory.wal");
    let (engine, _) = engine_at(&path, MONDAY);
    let (pid, occ) = program(&engine, 2).await;

    let result = engine
        .create_reservation(ReservationRequest::seat(pid, Some(occ), "ana").with_participant("ben"))
        .await;
    assert!(matches!(result, Err(EngineError::NotOwner { .. })));
    assert!(matches!(
        engine
            .create_reservation(ReservationRequest::seat(pid, Some(occ), ""))
            .await,
        Err(EngineError::InvalidParticipant(_))
    ));
}

#[tokio::test]
async fn open_directory_allows_booking_for_others() {
    let path = test_wal_path("open_directory.wal");
    let clock = Arc::new(ManualClock::new(MONDAY));
    let engine = Engine::new(path, settings(), clock)
        .unwrap()
        .with_directory(Arc::new(OpenDirectory));
    let (pid, occ) = program(&engine, 2).await;

    let outcome = engine
        .create_reservation(ReservationRequest::seat(pid, Some(occ), "desk").with_participant("ben"))
        .await
        .unwrap();
    let (r, _) = engine.get_reservation(outcome.reservation_id).await.unwrap();
    assert_eq!(r.requester, "desk");
    assert_eq!(r.participant, "ben");
    // the participant may cancel what the desk booked
    engine
        .cancel_reservation(outcome.reservation_id, "ben")
        .await
        .unwrap();
}

// ── Capacity and waitlist ────────────────────────────────

#[tokio::test]
async fn capacity_then_waitlist() {
    let path = test_wal_path("capacity.wal");
    let (engine, _) = engine_at(&path, MONDAY);
    let (pid, occ) = program(&engine, 2).await;

    let mut outcomes = Vec::new();
    for who in ["a", "b", "c", "d"] {
        outcomes.push(
            engine
                .create_reservation(ReservationRequest::seat(pid, Some(occ), who))
                .await
                .unwrap(),
        );
    }
    let statuses: Vec<_> = outcomes.iter().map(|o| (o.status, o.position)).collect();
    assert_eq!(
        statuses,
        vec![
            (Status::Confirmed, None),
            (Status::Confirmed, None),
            (Status::Waitlisted, Some(1)),
            (Status::Waitlisted, Some(2)),
        ]
    );

    let outbox = engine.pending_outbox().await;
    let count = |kind: NotificationKind| outbox.iter().filter(|e| e.kind == kind).count();
    assert_eq!(count(NotificationKind::Confirmation), 2);
    assert_eq!(count(NotificationKind::Waitlisted), 2);
    let waitlisted = outbox
        .iter()
        .find(|e| e.payload.reservation_id == outcomes[3].reservation_id)
        .unwrap();
    assert_eq!(waitlisted.payload.position, Some(2));
    assert_eq!(waitlisted.payload.starts_at, Some(MONDAY + 18 * H));
}

#[tokio::test]
async fn occurrence_capacity_override() {
    let path = test_wal_path("capacity_override.wal");
    let (engine, _) = engine_at(&path, MONDAY);
    let (pid, _) = program(&engine, 10).await;
    let small = Ulid::new();
    engine.add_occurrence(small, pid, None, Some(1)).await.unwrap();

    engine
        .create_reservation(ReservationRequest::seat(pid, Some(small), "a"))
        .await
        .unwrap();
    let second = engine
        .create_reservation(ReservationRequest::seat(pid, Some(small), "b"))
        .await
        .unwrap();
    assert_eq!(second.status, Status::Waitlisted);

    assert!(matches!(
        engine
            .create_reservation(ReservationRequest::seat(pid, Some(Ulid::new()), "c"))
            .await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_seats_respect_capacity() {
    let path = test_wal_path("capacity_race.wal");
    let (engine, _) = engine_at(&path, MONDAY);
    let (pid, occ) = program(&engine, 3).await;
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for i in 0..10 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .create_reservation(ReservationRequest::seat(pid, Some(occ), format!("user-{i}")))
                .await
                .unwrap()
        }));
    }
    let mut confirmed = 0;
    let mut positions = Vec::new();
    for h in handles {
        let o = h.await.unwrap();
        match o.status {
            Status::Confirmed => confirmed += 1,
            Status::Waitlisted => positions.push(o.position.unwrap()),
            Status::Cancelled => unreachable!(),
        }
    }
    positions.sort_unstable();
    assert_eq!(confirmed, 3);
    assert_eq!(positions, (1..=7).collect::<Vec<u32>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_sharing_an_id_decide_once() {
    let path = test_wal_path("shared_id_race.wal");
    let (engine, _) = engine_at(&path, MONDAY);
    let (pid, occ) = program(&engine, 5).await;
    let engine = Arc::new(engine);

    let id = Ulid::new();
    let mut handles = Vec::new();
    for i in 0..4 {
        let engine = engine.clone();
        let mut request = ReservationRequest::seat(pid, Some(occ), format!("user-{i}"));
        request.id = id;
        handles.push(tokio::spawn(async move { engine.create_reservation(request).await }));
    }
    let mut decided = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(o) => {
                assert_eq!(o.reservation_id, id);
                decided += 1;
            }
            Err(e) => assert!(matches!(e, EngineError::AlreadyExists(x) if x == id), "{e}"),
        }
    }
    assert_eq!(decided, 1);
    assert_eq!(engine.list_reservations(pid, Some(occ)).await.unwrap().len(), 1);
    assert_eq!(engine.pending_outbox().await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reused_booking_id_leaves_no_stray_booking() {
    let path = test_wal_path("shared_id_facility.wal");
    let (engine, _) = engine_at(&path, MONDAY);
    let fid = open_facility(&engine, policy()).await;
    let engine = Arc::new(engine);

    let id = Ulid::new();
    let mut handles = Vec::new();
    for (i, hour) in [9, 11, 13].into_iter().enumerate() {
        let engine = engine.clone();
        let mut request = ReservationRequest::booking(fid, monday(hour, hour + 1), format!("user-{i}"));
        request.id = id;
        handles.push(tokio::spawn(async move { engine.create_reservation(request).await }));
    }
    let mut winner = None;
    for h in handles {
        if h.await.unwrap().is_ok() {
            assert!(winner.is_none(), "two bookings decided with one id");
            winner = Some(());
        }
    }
    assert!(winner.is_some());
    {
        let rs = engine.get_resource(&fid).unwrap();
        let guard = rs.read().await;
        assert_eq!(guard.as_facility().unwrap().bookings.len(), 1);
    }

    let (booked, _) = engine.get_reservation(id).await.unwrap();
    engine.cancel_reservation(id, &booked.requester).await.unwrap();
    let span = booked.span.unwrap();
    engine
        .create_reservation(ReservationRequest::booking(fid, span, "ana"))
        .await
        .unwrap();
}

#[tokio::test]
async fn cancel_confirmed_promotes_head() {
    let path = test_wal_path("promotion.wal");
    let (engine, _) = engine_at(&path, MONDAY);
    let (pid, occ) = program(&engine, 1).await;

    let a = engine
        .create_reservation(ReservationRequest::seat(pid, Some(occ), "a"))
        .await
        .unwrap();
    let b = engine
        .create_reservation(ReservationRequest::seat(pid, Some(occ), "b"))
        .await
        .unwrap();
    let c = engine
        .create_reservation(ReservationRequest::seat(pid, Some(occ), "c"))
        .await
        .unwrap();
    assert_eq!((b.position, c.position), (Some(1), Some(2)));

    let cancelled = engine.cancel_reservation(a.reservation_id, "a").await.unwrap();
    assert_eq!(cancelled.promoted, Some(b.reservation_id));

    let (rb, pos) = engine.get_reservation(b.reservation_id).await.unwrap();
    assert_eq!(rb.status, Status::Confirmed);
    assert_eq!(pos, None);
    let waitlist = engine.list_waitlist(pid, Some(occ)).await.unwrap();
    assert_eq!(waitlist.len(), 1);
    assert_eq!(waitlist[0].position, 2);

    let promoted: Vec<_> = engine
        .pending_outbox()
        .await
        .into_iter()
        .filter(|e| e.kind == NotificationKind::Promoted)
        .collect();
    assert_eq!(promoted.len(), 1);
    assert_eq!(promoted[0].payload.reservation_id, b.reservation_id);
    assert_eq!(promoted[0].payload.starts_at, Some(MONDAY + 18 * H));

    // a newcomer joins behind the existing waitlist, never reusing a position
    let d = engine
        .create_reservation(ReservationRequest::seat(pid, Some(occ), "d"))
        .await
        .unwrap();
    assert_eq!(d.position, Some(3));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cancellations_promote_distinct_heads() {
    let path = test_wal_path("cancel_race.wal");
    let (engine, _) = engine_at(&path, MONDAY);
    let (pid, occ) = program(&engine, 2).await;

    let mut decided = Vec::new();
    for who in ["a", "b", "c", "d", "e"] {
        let o = engine
            .create_reservation(ReservationRequest::seat(pid, Some(occ), who))
            .await
            .unwrap();
        decided.push(o);
    }
    assert_eq!(
        decided.iter().map(|o| o.position).collect::<Vec<_>>(),
        vec![None, None, Some(1), Some(2), Some(3)]
    );

    let engine = Arc::new(engine);
    let cancels: Vec<_> = [("a", decided[0].reservation_id), ("b", decided[1].reservation_id)]
        .into_iter()
        .map(|(who, id)| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.cancel_reservation(id, who).await.unwrap() })
        })
        .collect();
    let mut promoted = Vec::new();
    for h in cancels {
        promoted.push(h.await.unwrap().promoted.expect("each cancellation promotes"));
    }
    promoted.sort();
    let mut expected = vec![decided[2].reservation_id, decided[3].reservation_id];
    expected.sort();
    assert_eq!(promoted, expected);

    for id in expected {
        let (r, pos) = engine.get_reservation(id).await.unwrap();
        assert_eq!(r.status, Status::Confirmed);
        assert_eq!(pos, None);
    }
    let waitlist = engine.list_waitlist(pid, Some(occ)).await.unwrap();
    assert_eq!(waitlist.len(), 1);
    assert_eq!((waitlist[0].participant.as_str(), waitlist[0].position), ("e", 3));
    let promotions = engine
        .pending_outbox()
        .await
        .into_iter()
        .filter(|e| e.kind == NotificationKind::Promoted)
        .count();
    assert_eq!(promotions, 2);
}

#[tokio::test]
async fn cancel_waitlisted_does_not_promote() {
    let path = test_wal_path("cancel_waitlisted.wal");
    let (engine, _) = engine_at(&path, MONDAY);
    let (pid, occ) = program(&engine, 1).await;

    engine
        .create_reservation(ReservationRequest::seat(pid, Some(occ), "a"))
        .await
        .unwrap();
    let b = engine
        .create_reservation(ReservationRequest::seat(pid, Some(occ), "b"))
        .await
        .unwrap();
    let c = engine
        .create_reservation(ReservationRequest::seat(pid, Some(occ), "c"))
        .await
        .unwrap();
    let before = engine.pending_outbox().await.len();

    let out = engine.cancel_reservation(b.reservation_id, "b").await.unwrap();
    assert_eq!(out.promoted, None);
    assert_eq!(engine.pending_outbox().await.len(), before);

    let waitlist = engine.list_waitlist(pid, Some(occ)).await.unwrap();
    assert_eq!(waitlist.len(), 1);
    assert_eq!(waitlist[0].reservation_id, c.reservation_id);
    assert_eq!(waitlist[0].position, 2);
}

#[tokio::test]
async fn opted_out_promotion_is_silent() {
    let path = test_wal_path("silent_promotion.wal");
    let (engine, _) = engine_at(&path, MONDAY);
    let (pid, occ) = program(&engine, 1).await;

    let a = engine
        .create_reservation(ReservationRequest::seat(pid, Some(occ), "a"))
        .await
        .unwrap();
    let mut quiet = ReservationRequest::seat(pid, Some(occ), "b");
    quiet.notify = false;
    engine.create_reservation(quiet).await.unwrap();

    engine.cancel_reservation(a.reservation_id, "a").await.unwrap();
    let promoted = engine
        .pending_outbox()
        .await
        .into_iter()
        .find(|e| e.kind == NotificationKind::Promoted)
        .unwrap();
    assert!(promoted.payload.silent);
}

#[tokio::test]
async fn cancel_rules() {
    let path = test_wal_path("cancel_rules.wal");
    let (engine, clock) = engine_at(&path, MONDAY);
    let fid = open_facility(
        &engine,
        BookingPolicy {
            cancellation_cutoff: Some(2 * H),
            ..policy()
        },
    )
    .await;

    let early = engine
        .create_reservation(ReservationRequest::booking(fid, monday(10, 11), "ana"))
        .await
        .unwrap();
    let late = engine
        .create_reservation(ReservationRequest::booking(fid, monday(15, 16), "ana"))
        .await
        .unwrap();

    assert!(matches!(
        engine.cancel_reservation(early.reservation_id, "ben").await,
        Err(EngineError::NotOwner { .. })
    ));
    assert!(matches!(
        engine.cancel_reservation(Ulid::new(), "ana").await,
        Err(EngineError::NotFound(_))
    ));

    clock.set(MONDAY + 9 * H);
    assert!(matches!(
        engine.cancel_reservation(early.reservation_id, "ana").await,
        Err(EngineError::CancellationCutoff { .. })
    ));

    engine.cancel_reservation(late.reservation_id, "ana").await.unwrap();
    assert!(matches!(
        engine.cancel_reservation(late.reservation_id, "ana").await,
        Err(EngineError::AlreadyCancelled(_))
    ));

    // the freed slot is bookable again
    engine
        .create_reservation(ReservationRequest::booking(fid, monday(15, 16), "ben"))
        .await
        .unwrap();
}

// ── Outbox ───────────────────────────────────────────────

#[tokio::test]
async fn outbox_lease_retry_and_abandon() {
    let path = test_wal_path("outbox.wal");
    let (engine, clock) = engine_at(&path, MONDAY);
    let (pid, occ) = program(&engine, 1).await;
    engine
        .create_reservation(ReservationRequest::seat(pid, Some(occ), "a"))
        .await
        .unwrap();

    let batch = engine.outbox_next_batch(10);
    assert_eq!(batch.len(), 1);
    let id = batch[0].id;
    // leased
    assert!(engine.outbox_next_batch(10).is_empty());

    engine.outbox_mark_failed(id, "smtp timeout").await.unwrap();
    assert!(engine.outbox_next_batch(10).is_empty());
    clock.advance(1_000);
    let retry = engine.outbox_next_batch(10);
    assert_eq!(retry.len(), 1);
    assert_eq!(retry[0].attempts, 1);
    assert_eq!(retry[0].last_error.as_deref(), Some("smtp timeout"));

    engine.outbox_mark_failed(id, "again").await.unwrap();
    clock.advance(2_000);
    assert_eq!(engine.outbox_next_batch(10).len(), 1);
    engine.outbox_mark_failed(id, "gave up").await.unwrap();

    clock.advance(60_000);
    assert!(engine.outbox_next_batch(10).is_empty());
    let abandoned = engine.abandoned_outbox().await;
    assert_eq!(abandoned.len(), 1);
    assert_eq!(abandoned[0].attempts, 3);

    // a late report from a worker that still held the entry
    engine.outbox_mark_failed(id, "late").await.unwrap();
    let abandoned = engine.abandoned_outbox().await;
    assert_eq!(abandoned[0].attempts, 3);
    assert_eq!(abandoned[0].last_error.as_deref(), Some("gave up"));
    let appended = engine.wal_appends_since_compact().await;
    engine.outbox_mark_failed(id, "later").await.unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, appended);
}

#[tokio::test]
async fn outbox_delivered_is_removed() {
    let path = test_wal_path("outbox_delivered.wal");
    let (engine, _) = engine_at(&path, MONDAY);
    let (pid, occ) = program(&engine, 1).await;
    engine
        .create_reservation(ReservationRequest::seat(pid, Some(occ), "a"))
        .await
        .unwrap();

    let batch = engine.outbox_next_batch(10);
    engine.outbox_mark_delivered(batch[0].id).await.unwrap();
    assert!(engine.pending_outbox().await.is_empty());
    assert!(matches!(
        engine.outbox_mark_delivered(batch[0].id).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn outbox_batch_oldest_first_and_limited() {
    let path = test_wal_path("outbox_order.wal");
    let (engine, _) = engine_at(&path, MONDAY);
    let (pid, occ) = program(&engine, 10).await;
    let mut reservations = Vec::new();
    for who in ["a", "b", "c"] {
        reservations.push(
            engine
                .create_reservation(ReservationRequest::seat(pid, Some(occ), who))
                .await
                .unwrap()
                .reservation_id,
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let first = engine.outbox_next_batch(2);
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].payload.reservation_id, reservations[0]);
    assert_eq!(first[1].payload.reservation_id, reservations[1]);
    let rest = engine.outbox_next_batch(2);
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].payload.reservation_id, reservations[2]);
}

// ── Reminders ────────────────────────────────────────────

#[tokio::test]
async fn reminders_enqueued_once() {
    let path = test_wal_path("reminders.wal");
    let (engine, clock) = engine_at(&path, MONDAY);
    let fid = open_facility(&engine, policy()).await;
    let (pid, occ) = program(&engine, 5).await; // occurrence at 18:00

    let booking = engine
        .create_reservation(ReservationRequest::booking(fid, monday(10, 11), "ana"))
        .await
        .unwrap();
    let seat = engine
        .create_reservation(ReservationRequest::seat(pid, Some(occ), "ben"))
        .await
        .unwrap();

    let leads = [H, DAY_MS];
    let tolerance = 10 * M;

    // 09:00: the 10:00 booking is one hour out
    clock.set(MONDAY + 9 * H);
    assert_eq!(engine.sweep_reminders(&leads, tolerance).await.unwrap(), 1);
    assert_eq!(engine.sweep_reminders(&leads, tolerance).await.unwrap(), 0);
    clock.advance(5 * M);
    assert_eq!(engine.sweep_reminders(&leads, tolerance).await.unwrap(), 0);

    // 17:00: the 18:00 class is one hour out
    clock.set(MONDAY + 17 * H);
    assert_eq!(engine.sweep_reminders(&leads, tolerance).await.unwrap(), 1);

    let reminders: Vec<_> = engine
        .pending_outbox()
        .await
        .into_iter()
        .filter(|e| matches!(e.kind, NotificationKind::Reminder { .. }))
        .collect();
    assert_eq!(reminders.len(), 2);
    let for_booking = reminders
        .iter()
        .find(|e| e.payload.reservation_id == booking.reservation_id)
        .unwrap();
    assert_eq!(for_booking.not_before, Some(MONDAY + 9 * H));
    assert_eq!(for_booking.kind, NotificationKind::Reminder { lead: H });
    assert!(reminders.iter().any(|e| e.payload.reservation_id == seat.reservation_id));
}

#[tokio::test]
async fn reminders_skip_cancelled() {
    let path = test_wal_path("reminders_cancelled.wal");
    let (engine, clock) = engine_at(&path, MONDAY);
    let fid = open_facility(&engine, policy()).await;
    let booking = engine
        .create_reservation(ReservationRequest::booking(fid, monday(10, 11), "ana"))
        .await
        .unwrap();
    engine.cancel_reservation(booking.reservation_id, "ana").await.unwrap();

    clock.set(MONDAY + 9 * H);
    assert_eq!(engine.sweep_reminders(&[H], 10 * M).await.unwrap(), 0);
}

#[tokio::test]
async fn compaction_forgets_spent_reminder_keys() {
    let path = test_wal_path("reminders_compacted.wal");
    let (engine, clock) = engine_at(&path, MONDAY);
    let fid = open_facility(&engine, policy()).await;
    let (pid, occ) = program(&engine, 5).await; // occurrence at 18:00
    let early = engine
        .create_reservation(ReservationRequest::booking(fid, monday(10, 11), "ana"))
        .await
        .unwrap();
    let later = engine
        .create_reservation(ReservationRequest::booking(fid, monday(14, 15), "ben"))
        .await
        .unwrap();
    let seat = engine
        .create_reservation(ReservationRequest::seat(pid, Some(occ), "cy"))
        .await
        .unwrap();

    clock.set(MONDAY + 9 * H);
    assert_eq!(engine.sweep_reminders(&[H, 5 * H, 9 * H], 10 * M).await.unwrap(), 3);
    engine.cancel_reservation(later.reservation_id, "ben").await.unwrap();

    // 11:00: ana's booking has started, ben's is cancelled
    clock.set(MONDAY + 11 * H);
    engine.compact_wal().await.unwrap();
    let kept: Vec<_> = engine.index.reminder_keys.iter().map(|k| k.reservation_id).collect();
    assert_eq!(kept, vec![seat.reservation_id]);
    assert!(!kept.contains(&early.reservation_id));
    drop(engine);

    let (engine, _) = engine_at(&path, MONDAY + 11 * H);
    assert_eq!(engine.index.reminder_keys.len(), 1);
    // the class reminder is still deduplicated after restart
    assert_eq!(engine.sweep_reminders(&[9 * H], 2 * H + 10 * M).await.unwrap(), 0);
}

// ── Durability ───────────────────────────────────────────

struct Observed {
    reservations: Vec<Reservation>,
    waitlist: Vec<WaitlistEntry>,
    outbox: Vec<OutboxEntry>,
    bookings: Vec<Reservation>,
}

async fn observe(engine: &Engine, fid: Ulid, pid: Ulid, occ: Ulid) -> Observed {
    Observed {
        reservations: engine.list_reservations(pid, Some(occ)).await.unwrap(),
        waitlist: engine.list_waitlist(pid, Some(occ)).await.unwrap(),
        outbox: engine.pending_outbox().await,
        bookings: engine.list_reservations(fid, None).await.unwrap(),
    }
}

async fn busy_history(engine: &Engine, clock: &ManualClock) -> (Ulid, Ulid, Ulid) {
    let fid = open_facility(engine, policy()).await;
    let (pid, occ) = program(engine, 1).await;
    let a = engine
        .create_reservation(ReservationRequest::seat(pid, Some(occ), "a"))
        .await
        .unwrap();
    for who in ["b", "c", "d"] {
        engine
            .create_reservation(ReservationRequest::seat(pid, Some(occ), who))
            .await
            .unwrap();
    }
    engine.cancel_reservation(a.reservation_id, "a").await.unwrap();
    let booked = engine
        .create_reservation(ReservationRequest::booking(fid, monday(10, 11), "ana").with_idempotency_key("k1"))
        .await
        .unwrap();
    engine
        .create_reservation(ReservationRequest::booking(fid, monday(12, 13), "ana"))
        .await
        .unwrap();
    engine.cancel_reservation(booked.reservation_id, "ana").await.unwrap();

    let batch = engine.outbox_next_batch(2);
    engine.outbox_mark_delivered(batch[0].id).await.unwrap();
    engine.outbox_mark_failed(batch[1].id, "bounced").await.unwrap();

    clock.set(MONDAY + 11 * H);
    engine.sweep_reminders(&[H], 10 * M).await.unwrap();
    (fid, pid, occ)
}

fn assert_same(a: &Observed, b: &Observed) {
    assert_eq!(a.reservations, b.reservations);
    assert_eq!(a.waitlist, b.waitlist);
    assert_eq!(a.outbox, b.outbox);
    assert_eq!(a.bookings, b.bookings);
}

#[tokio::test]
async fn replay_restores_state() {
    let path = test_wal_path("replay.wal");
    let (before, fid, pid, occ) = {
        let (engine, clock) = engine_at(&path, MONDAY);
        let (fid, pid, occ) = busy_history(&engine, &clock).await;
        (observe(&engine, fid, pid, occ).await, fid, pid, occ)
    };

    let (engine, _) = engine_at(&path, MONDAY + 11 * H);
    let after = observe(&engine, fid, pid, occ).await;
    assert_same(&before, &after);

    // high-water mark survives: next waitlister gets position 4
    let next = engine
        .create_reservation(ReservationRequest::seat(pid, Some(occ), "e"))
        .await
        .unwrap();
    assert_eq!(next.position, Some(4));
    // idempotency survives
    let again = engine
        .create_reservation(ReservationRequest::booking(fid, monday(10, 11), "ana").with_idempotency_key("k1"))
        .await
        .unwrap();
    assert!(again.replayed);
    assert_eq!(again.status, Status::Cancelled);
    // reminder dedup survives
    assert_eq!(engine.sweep_reminders(&[H], 10 * M).await.unwrap(), 0);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let (engine, clock) = engine_at(&path, MONDAY);
    let (fid, pid, occ) = busy_history(&engine, &clock).await;
    let before = observe(&engine, fid, pid, occ).await;

    let appended = engine.wal_appends_since_compact().await;
    assert!(appended > 0);
    engine.compact_wal().await.unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, 0);
    assert_same(&before, &observe(&engine, fid, pid, occ).await);
    drop(engine);

    let (engine, _) = engine_at(&path, MONDAY + 11 * H);
    assert_same(&before, &observe(&engine, fid, pid, occ).await);
    let next = engine
        .create_reservation(ReservationRequest::seat(pid, Some(occ), "e"))
        .await
        .unwrap();
    assert_eq!(next.position, Some(4));
    assert_eq!(engine.sweep_reminders(&[H], 10 * M).await.unwrap(), 0);
}

// ── Admin ────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_ids_rejected() {
    let path = test_wal_path("duplicates.wal");
    let (engine, _) = engine_at(&path, MONDAY);
    let fid = open_facility(&engine, policy()).await;
    assert!(matches!(
        engine.create_program(fid, None, 3).await,
        Err(EngineError::AlreadyExists(_))
    ));
    let (pid, occ) = program(&engine, 3).await;
    assert!(matches!(
        engine.add_occurrence(occ, pid, None, None).await,
        Err(EngineError::AlreadyExists(_))
    ));
    assert!(matches!(
        engine.add_occurrence(Ulid::new(), fid, None, None).await,
        Err(EngineError::InvalidRequest(_))
    ));

    let listed = engine.list_resources().await;
    assert_eq!(listed.len(), 2);
    let prog = listed.iter().find(|r| r.id == pid).unwrap();
    assert_eq!(prog.capacity, Some(3));
    assert!(!prog.is_facility);
}

// ── Worked scenarios ─────────────────────────────────────

#[tokio::test]
async fn monday_window_touching_boundary() {
    let path = test_wal_path("scenario_monday.wal");
    let (engine, _) = engine_at(&path, MONDAY);
    let (_, fid) = facility_with_single_window(&engine).await;

    engine
        .create_reservation(ReservationRequest::booking(fid, monday(9, 10), "ana"))
        .await
        .unwrap();
    let overlap = engine
        .create_reservation(ReservationRequest::booking(
            fid,
            Span::new(MONDAY + 9 * H + 30 * M, MONDAY + 10 * H + 30 * M),
            "ben",
        ))
        .await;
    assert!(matches!(overlap, Err(EngineError::Conflict(_))));
    let touching = engine
        .create_reservation(ReservationRequest::booking(fid, monday(10, 11), "ben"))
        .await
        .unwrap();
    assert_eq!(touching.status, Status::Confirmed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_racers_two_seats() {
    let path = test_wal_path("scenario_two_seats.wal");
    let (engine, _) = engine_at(&path, MONDAY);
    let (pid, occ) = program(&engine, 2).await;
    let engine = Arc::new(engine);

    let racers: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|who| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .create_reservation(ReservationRequest::seat(pid, Some(occ), who))
                    .await
                    .unwrap()
            })
        })
        .collect();
    let mut outcomes = Vec::new();
    for r in racers {
        outcomes.push(r.await.unwrap());
    }
    let confirmed: Vec<_> = outcomes.iter().filter(|o| o.status == Status::Confirmed).collect();
    let waitlisted: Vec<_> = outcomes.iter().filter(|o| o.status == Status::Waitlisted).collect();
    assert_eq!(confirmed.len(), 2);
    assert_eq!(waitlisted.len(), 1);
    assert_eq!(waitlisted[0].position, Some(1));

    let (holder, _) = engine.get_reservation(confirmed[0].reservation_id).await.unwrap();
    let out = engine
        .cancel_reservation(holder.id, &holder.requester)
        .await
        .unwrap();
    assert_eq!(out.promoted, Some(waitlisted[0].reservation_id));
    let (promoted, _) = engine.get_reservation(waitlisted[0].reservation_id).await.unwrap();
    assert_eq!(promoted.status, Status::Confirmed);
    assert!(engine.list_waitlist(pid, Some(occ)).await.unwrap().is_empty());
}
