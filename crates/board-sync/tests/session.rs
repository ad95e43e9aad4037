//! Session-level tests driving a full `SyncSession` with a manual clock.

use std::sync::Arc;

use board_sync::{
    file_link, resolve_link, BoardMessage, BoardSnapshot, CanvasDocument, CanvasElement,
    DisconnectReason, Element, InMemoryCanvas, ManualClock, MemoryTransport, SessionConfig,
    SessionState, Structure, SyncIndicator, SyncSession, SyncStatus,
};

struct Harness {
    clock: Arc<ManualClock>,
    transport: Arc<MemoryTransport>,
    canvas: Arc<InMemoryCanvas>,
    session: Arc<SyncSession>,
}

fn harness_with(elements: Vec<CanvasElement>) -> Harness {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let transport = Arc::new(MemoryTransport::new());
    let session = SyncSession::new(SessionConfig::new("demo"), transport.clone(), clock.clone());
    session.initialize();

    let canvas = Arc::new(InMemoryCanvas::with_elements(elements));
    session.set_document_instance(canvas.clone());
    transport.take_sent();

    Harness {
        clock,
        transport,
        canvas,
        session,
    }
}

fn harness() -> Harness {
    harness_with(Vec::new())
}

impl Harness {
    fn advance(&self, ms: u64) {
        self.clock.advance(ms);
        self.session.tick();
    }

    fn update_state_ids(&self) -> Vec<String> {
        self.transport
            .sent()
            .into_iter()
            .filter_map(|message| match message {
                BoardMessage::UpdateState { request_id, .. } => Some(request_id),
                _ => None,
            })
            .collect()
    }

    /// Acknowledge every state write sent so far and clear the log.
    fn acknowledge_all(&self) {
        for request_id in self.update_state_ids() {
            self.transport.deliver(BoardMessage::StateSaved {
                board_name: "demo".into(),
                request_id,
            });
        }
        self.transport.take_sent();
    }

    fn fail_three_syncs(&self) {
        self.transport.set_fail_sends(true);
        for _ in 0..3 {
            self.session.force_sync();
        }
    }

    fn is_active(&self) -> bool {
        self.session.manager().is_active()
    }
}

#[test]
fn test_local_edit_reaches_hub_after_debounce() {
    let h = harness();

    h.canvas.edit(|elements| {
        elements.push(Element::embeddable("e1", "/files/demo/notes.md").to_canvas());
        elements.push(Element::frame("f1", Some("Research")).to_canvas());
    });
    h.advance(299);
    assert!(h.transport.sent().is_empty());

    h.advance(1);
    let sent = h.transport.sent();
    assert!(sent.contains(&BoardMessage::CreateFile {
        path: "demo/notes.md".into()
    }));
    assert!(sent.contains(&BoardMessage::CreateDirectory {
        element_id: "f1".into(),
        name: "Research".into()
    }));

    let structure = h.session.document().current_structure();
    assert_eq!(structure.len(), 2);
    assert_eq!(structure, h.session.document().current_structure());
}

#[test]
fn test_board_state_follows_structure_change() {
    let h = harness();
    h.advance(1_000);
    h.acknowledge_all();

    h.canvas
        .edit(|elements| elements.push(CanvasElement::new("r1", "rectangle")));
    h.advance(300);
    assert!(h.update_state_ids().is_empty());

    h.advance(500);
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        BoardMessage::UpdateState {
            board_name, board, ..
        } => {
            assert_eq!(board_name, "demo");
            assert_eq!(board.elements.len(), 1);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_link_round_trip() {
    let h = harness();
    let path = "demo/Reading notes.md";

    h.canvas.edit(|elements| {
        elements.push(Element::embeddable("e1", file_link(path, "/files/")).to_canvas())
    });
    h.advance(300);
    assert!(h.transport.sent().contains(&BoardMessage::CreateFile {
        path: path.to_string()
    }));

    // A second client builds the same viewer from the path alone.
    let second = harness();
    let structure: Structure = [Element::embeddable("e9", file_link(path, "/files/"))]
        .into_iter()
        .collect();
    second.session.document().initialize(&structure).unwrap();

    let restored = second.session.document().current_structure();
    let element = restored.get("e9").unwrap();
    match &element.kind {
        board_sync::ElementKind::Embeddable { link } => {
            assert_eq!(resolve_link(link, "/files/"), Some(path.to_string()))
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_keystrokes_coalesce_into_one_rename() {
    let h = harness_with(vec![Element::frame("f1", Some("D")).to_canvas()]);

    for name in ["Dr", "Dra", "Draf", "Draft"] {
        h.canvas
            .edit(|elements| elements[0].name = Some(name.to_string()));
        h.advance(100);
    }
    h.advance(300);

    let renames: Vec<_> = h
        .transport
        .sent()
        .into_iter()
        .filter(|m| matches!(m, BoardMessage::FolderRenamed { .. }))
        .collect();
    assert_eq!(
        renames,
        vec![BoardMessage::FolderRenamed {
            element_id: "f1".into(),
            old_name: "D".into(),
            new_name: "Draft".into()
        }]
    );
}

#[test]
fn test_own_echo_is_suppressed_until_acknowledged() {
    let h = harness();
    h.advance(1_000);
    h.acknowledge_all();

    h.canvas
        .edit(|elements| elements.push(Element::frame("f1", Some("Local")).to_canvas()));
    h.advance(300);
    h.advance(500);
    let request_ids = h.update_state_ids();
    assert_eq!(request_ids.len(), 1);

    // Anything the hub broadcasts before acknowledging is not applied.
    h.transport.deliver(BoardMessage::BoardUpdate {
        board_name: "demo".into(),
        board: BoardSnapshot::default(),
    });
    assert!(h.canvas.find("f1").is_some());

    h.transport.deliver(BoardMessage::StateSaved {
        board_name: "demo".into(),
        request_id: request_ids[0].clone(),
    });
    h.transport.deliver(BoardMessage::BoardUpdate {
        board_name: "demo".into(),
        board: BoardSnapshot::new(vec![
            Element::frame("f1", Some("Local")).to_canvas(),
            Element::frame("f2", Some("Remote")).to_canvas(),
        ]),
    });
    assert!(h.canvas.find("f2").is_some());
}

#[test]
fn test_breaker_backoff_timings() {
    let h = harness();
    h.fail_three_syncs();

    assert_eq!(h.session.consecutive_failures(), 3);
    assert!(!h.is_active());
    assert_eq!(h.session.indicator(), SyncIndicator::Error);

    // Syncs are skipped while the breaker is open.
    h.session.force_sync();
    assert_eq!(h.session.consecutive_failures(), 3);

    h.advance(1_999);
    assert!(!h.is_active());
    assert_eq!(h.session.consecutive_failures(), 3);

    // The trial sync at 2000ms fails and doubles the pause.
    h.advance(1);
    assert_eq!(h.session.consecutive_failures(), 4);
    assert!(!h.is_active());

    h.advance(3_999);
    assert_eq!(h.session.consecutive_failures(), 4);
    h.advance(1);
    assert_eq!(h.session.consecutive_failures(), 5);

    h.advance(8_000);
    assert_eq!(h.session.consecutive_failures(), 6);
    h.advance(16_000);
    assert_eq!(h.session.consecutive_failures(), 7);

    // 2000 * 2^4 = 32000 is capped at 30000.
    h.advance(29_999);
    assert_eq!(h.session.consecutive_failures(), 7);
    h.transport.set_fail_sends(false);
    h.advance(1);

    assert_eq!(h.session.consecutive_failures(), 0);
    assert!(h.is_active());
    assert_eq!(h.session.sync_error(), None);
    assert_eq!(h.session.indicator(), SyncIndicator::Active);
}

#[test]
fn test_reset_sync_runs_exactly_one_forced_sync() {
    let h = harness();
    h.fail_three_syncs();
    h.transport.set_fail_sends(false);

    h.session.reset_sync();

    assert_eq!(h.session.sync_status(), SyncStatus::fresh());
    assert_eq!(h.session.consecutive_failures(), 0);
    assert_eq!(h.session.sync_error(), None);
    assert_eq!(h.session.indicator(), SyncIndicator::Active);

    h.advance(499);
    assert!(h.update_state_ids().is_empty());
    h.advance(1);
    assert_eq!(h.update_state_ids().len(), 1);

    h.advance(10_000);
    assert_eq!(h.update_state_ids().len(), 1);
    assert!(h.session.sync_status().last_sync_time.is_some());
}

#[test]
fn test_first_attach_schedules_initial_sync() {
    let h = harness();

    h.advance(999);
    assert!(h.update_state_ids().is_empty());
    h.advance(1);
    assert_eq!(h.update_state_ids().len(), 1);

    // Re-attaching does not schedule another one.
    h.session.set_document_instance(h.canvas.clone());
    h.advance(5_000);
    assert_eq!(h.update_state_ids().len(), 1);
}

#[test]
fn test_unauthorized_disconnect_is_not_an_error() {
    let h = harness();

    h.transport.disconnect(DisconnectReason::Unauthorized);

    assert_eq!(h.session.indicator(), SyncIndicator::Inactive);
    assert_eq!(h.session.sync_error(), None);
    assert_eq!(h.session.consecutive_failures(), 0);
}

#[test]
fn test_reconnect_rejoins_and_syncs() {
    let h = harness();
    h.fail_three_syncs();
    h.transport.set_fail_sends(false);
    h.transport.disconnect(DisconnectReason::Closed);
    h.transport.take_sent();

    h.transport.connect();

    let sent = h.transport.sent();
    assert_eq!(
        sent[0],
        BoardMessage::JoinBoard {
            board_name: "demo".into()
        }
    );
    assert!(matches!(sent[1], BoardMessage::UpdateState { .. }));
    assert_eq!(h.session.consecutive_failures(), 0);
    assert_eq!(h.session.indicator(), SyncIndicator::Active);
}

#[test]
fn test_initialization_failure_is_recorded() {
    let clock = Arc::new(ManualClock::new(0));
    let transport = Arc::new(MemoryTransport::new());
    transport.set_fail_sends(true);
    let session = SyncSession::new(SessionConfig::new("demo"), transport.clone(), clock);

    session.initialize();

    assert_eq!(session.indicator(), SyncIndicator::Error);
    assert_eq!(session.consecutive_failures(), 1);
    assert!(session.sync_error().is_some());
}

#[test]
fn test_reset_sync_recovers_from_failed_initialization() {
    let clock = Arc::new(ManualClock::new(0));
    let transport = Arc::new(MemoryTransport::new());
    transport.set_fail_sends(true);
    let session = SyncSession::new(SessionConfig::new("demo"), transport.clone(), clock.clone());
    session.initialize();
    let canvas = Arc::new(InMemoryCanvas::new());
    session.set_document_instance(canvas.clone());
    assert_eq!(session.indicator(), SyncIndicator::Error);

    transport.set_fail_sends(false);
    session.reset_sync();

    assert_eq!(session.indicator(), SyncIndicator::Active);
    assert_eq!(session.sync_error(), None);
    assert_eq!(session.manager().state(), SessionState::Idle { active: true });
    assert_eq!(
        transport.take_sent(),
        vec![BoardMessage::JoinBoard {
            board_name: "demo".into()
        }]
    );

    clock.advance(2_000);
    session.tick();
    assert!(matches!(
        transport.take_sent().as_slice(),
        [BoardMessage::UpdateState { .. }]
    ));
    assert!(session.sync_status().last_sync_time.is_some());

    canvas.edit(|elements| elements.push(Element::frame("f1", Some("Research")).to_canvas()));
    clock.advance(300);
    session.tick();
    assert!(transport.sent().contains(&BoardMessage::CreateDirectory {
        element_id: "f1".into(),
        name: "Research".into()
    }));
}

#[test]
fn test_reconnect_retries_failed_initialization() {
    let clock = Arc::new(ManualClock::new(0));
    let transport = Arc::new(MemoryTransport::new());
    transport.set_fail_sends(true);
    let session = SyncSession::new(SessionConfig::new("demo"), transport.clone(), clock);
    session.initialize();
    assert_eq!(session.manager().state(), SessionState::Uninitialized);

    transport.disconnect(DisconnectReason::Closed);
    assert_eq!(session.indicator(), SyncIndicator::Error);
    transport.set_fail_sends(false);
    transport.connect();

    assert_eq!(session.manager().state(), SessionState::Idle { active: true });
    assert_eq!(session.indicator(), SyncIndicator::Active);
    assert_eq!(session.consecutive_failures(), 0);
}

#[test]
fn test_reset_sync_that_fails_again_stays_retryable() {
    let clock = Arc::new(ManualClock::new(0));
    let transport = Arc::new(MemoryTransport::new());
    transport.set_fail_sends(true);
    let session = SyncSession::new(SessionConfig::new("demo"), transport.clone(), clock);
    session.initialize();

    session.reset_sync();

    assert_eq!(session.indicator(), SyncIndicator::Error);
    assert_eq!(session.consecutive_failures(), 1);
    assert!(!session.sync_status().is_active);

    transport.set_fail_sends(false);
    session.reset_sync();
    assert_eq!(session.indicator(), SyncIndicator::Active);
}

#[test]
fn test_frame_added_offline_is_created_after_reconnect() {
    let h = harness();
    h.advance(1_000);
    h.acknowledge_all();

    h.transport.disconnect(DisconnectReason::Closed);
    h.canvas
        .edit(|elements| elements.push(Element::frame("f1", Some("Research")).to_canvas()));
    h.advance(300);
    h.advance(500);
    assert!(h.transport.sent().is_empty());
    assert_eq!(h.session.filesystem().queued_requests(), 1);

    h.transport.connect();
    h.advance(5_000);

    let sent = h.transport.sent();
    assert_eq!(
        sent[..2],
        [
            BoardMessage::JoinBoard {
                board_name: "demo".into()
            },
            BoardMessage::CreateDirectory {
                element_id: "f1".into(),
                name: "Research".into()
            },
        ]
    );
    assert!(matches!(&sent[2], BoardMessage::UpdateState { board, .. } if board.elements.len() == 1));
}

#[test]
fn test_stopping_sync_keeps_failure_count() {
    let h = harness();
    h.transport.set_fail_sends(true);
    h.session.force_sync();
    assert_eq!(h.session.consecutive_failures(), 1);

    h.session.manager().stop_sync();

    assert_eq!(h.session.consecutive_failures(), 1);
    assert!(h.session.sync_error().is_some());
    assert_eq!(h.session.indicator(), SyncIndicator::Error);
}

#[test]
fn test_shutdown_clears_timers() {
    let h = harness();
    h.session.shutdown();

    h.canvas
        .edit(|elements| elements.push(Element::frame("f1", None).to_canvas()));
    h.advance(5_000);

    assert!(h.transport.sent().is_empty());
    assert_eq!(h.canvas.elements().len(), 1);
}
