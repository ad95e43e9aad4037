//! Document adapter: bridges the canvas host and the neutral board model.
//!
//! Canvas changes are buffered for a short window, then diffed against the last
//! captured snapshot. Writes made by the adapter itself run under an
//! `AckGuard` so the change notifications they cause are not reported back as
//! local edits.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error, info, warn};

use crate::canvas::{CanvasDocument, ChangeHook};
use crate::clock::SharedClock;
use crate::debounce::Debouncer;
use crate::error::{AdapterError, Result};
use crate::events::{Emitter, Subscription};
use crate::guard::{AckGuard, GuardToken};
use crate::model::{BoardSnapshot, CanvasElement, Element, Structure};

/// Changes detected in the canvas.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentEvent {
    ElementAdded(Element),
    ElementUpdated { previous: Element, current: Element },
    ElementDeleted(Element),
    /// Summary published after every detected change batch.
    StructureChanged {
        added: usize,
        updated: usize,
        deleted: usize,
    },
}

#[derive(Debug)]
enum PendingEdit {
    Add(Element),
    Update(Element),
    Remove(String),
}

struct DocState {
    canvas: Option<Arc<dyn CanvasDocument>>,
    /// Supported, non-deleted records by id as of the last detection pass.
    snapshot: BTreeMap<String, CanvasElement>,
    /// Full element list as of the last detection pass.
    baseline: Vec<CanvasElement>,
    changes: Debouncer<Vec<CanvasElement>>,
    guard: AckGuard,
    queued: Vec<PendingEdit>,
}

impl DocState {
    fn capture(&mut self, elements: Vec<CanvasElement>) {
        self.snapshot = supported_records(&elements);
        self.baseline = elements;
    }
}

/// Adapter over one canvas document.
///
/// Construct with `DocumentAdapter::new`, which returns an `Arc` so the change
/// hook installed on the canvas can reach back without keeping it alive.
pub struct DocumentAdapter {
    clock: SharedClock,
    state: Mutex<DocState>,
    events: Arc<Emitter<DocumentEvent>>,
    self_ref: Weak<DocumentAdapter>,
}

impl DocumentAdapter {
    pub fn new(clock: SharedClock, change_debounce_ms: u64, ack_timeout_ms: u64) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            clock,
            state: Mutex::new(DocState {
                canvas: None,
                snapshot: BTreeMap::new(),
                baseline: Vec::new(),
                changes: Debouncer::new(change_debounce_ms),
                guard: AckGuard::new(ack_timeout_ms),
                queued: Vec::new(),
            }),
            events: Arc::new(Emitter::new()),
            self_ref: self_ref.clone(),
        })
    }

    /// Bind a canvas, install the change hook and capture the baseline.
    pub fn attach(&self, canvas: Arc<dyn CanvasDocument>) {
        let elements = canvas.elements();
        let previous = {
            let mut state = self.lock();
            state.changes.clear();
            state.capture(elements);
            state.canvas.replace(Arc::clone(&canvas))
        };
        if let Some(previous) = previous {
            previous.set_change_hook(None);
        }

        let adapter = self.self_ref.clone();
        let hook: ChangeHook = Arc::new(move |elements, _app_state| {
            if let Some(adapter) = adapter.upgrade() {
                adapter.on_canvas_change(elements);
            }
        });
        canvas.set_change_hook(Some(hook));
        info!("Document attached");
    }

    /// Unbind the canvas. Pending changes are discarded.
    pub fn detach(&self) {
        let canvas = {
            let mut state = self.lock();
            state.changes.clear();
            state.guard.release();
            state.queued.clear();
            state.snapshot.clear();
            state.baseline.clear();
            state.canvas.take()
        };
        if let Some(canvas) = canvas {
            canvas.set_change_hook(None);
            info!("Document detached");
        }
    }

    pub fn is_attached(&self) -> bool {
        self.lock().canvas.is_some()
    }

    pub fn subscribe(&self, callback: impl Fn(&DocumentEvent) + Send + Sync + 'static) -> Subscription {
        self.events.subscribe(callback)
    }

    /// Push `structure` into the canvas, replacing its embeddables and frames.
    /// Elements of other types are kept.
    pub fn initialize(&self, structure: &Structure) -> Result<()> {
        let canvas = self.canvas().ok_or(AdapterError::NotAttached)?;
        let current = canvas.elements();

        let mut existing: BTreeMap<String, CanvasElement> = BTreeMap::new();
        let mut records = Vec::with_capacity(current.len() + structure.len());
        for record in current {
            if record.is_supported() {
                existing.insert(record.id.clone(), record);
            } else {
                records.push(record);
            }
        }
        for element in structure.iter() {
            let record = match existing.remove(&element.id) {
                Some(mut record) => {
                    element.apply_to(&mut record);
                    record
                }
                None => element.to_canvas(),
            };
            records.push(record);
        }

        debug!("Initializing canvas with {} elements", structure.len());
        self.write(canvas, records)
    }

    /// Replace the whole element list with `elements`.
    pub fn apply_snapshot(&self, elements: Vec<CanvasElement>) -> Result<()> {
        let canvas = self.canvas().ok_or(AdapterError::NotAttached)?;
        debug!("Applying snapshot with {} elements", elements.len());
        self.write(canvas, elements)
    }

    /// Add one element. Replaces a record with the same id.
    pub fn add_element(&self, element: Element) -> Result<()> {
        self.edit(PendingEdit::Add(element))
    }

    /// Update an existing element, keeping its canvas-only properties.
    pub fn update_element(&self, element: Element) -> Result<()> {
        self.edit(PendingEdit::Update(element))
    }

    /// Mark an element deleted.
    pub fn remove_element(&self, id: &str) -> Result<()> {
        self.edit(PendingEdit::Remove(id.to_string()))
    }

    /// Non-deleted embeddables and frames currently in the canvas.
    pub fn current_structure(&self) -> Structure {
        match self.canvas() {
            Some(canvas) => Structure::from_canvas(&canvas.elements()),
            None => Structure::new(),
        }
    }

    pub fn snapshot(&self) -> Result<BoardSnapshot> {
        let canvas = self.canvas().ok_or(AdapterError::NotAttached)?;
        Ok(canvas.snapshot())
    }

    /// Run change detection if the debounce window has passed.
    pub fn tick(&self, now: u64) {
        let (due, queued) = {
            let mut state = self.lock();
            let due = state.changes.take_due(now);
            // Expiry of an unacknowledged write frees queued edits too.
            let queued = if state.guard.is_held(now) {
                Vec::new()
            } else {
                std::mem::take(&mut state.queued)
            };
            (due, queued)
        };
        if let Some(elements) = due {
            self.detect(elements);
        }
        self.replay(queued);
    }

    /// Run change detection now for any buffered change.
    pub fn flush(&self) {
        let due = self.lock().changes.flush();
        if let Some(elements) = due {
            self.detect(elements);
        }
    }

    /// Whether a change is waiting for its debounce window.
    pub fn has_pending_changes(&self) -> bool {
        self.lock().changes.is_pending()
    }

    pub fn shutdown(&self) {
        self.detach();
    }

    fn on_canvas_change(&self, elements: &[CanvasElement]) {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        if state.guard.is_held(now) {
            debug!("Ignoring canvas change caused by our own write");
            return;
        }
        state.changes.push(elements.to_vec(), now);
    }

    fn detect(&self, elements: Vec<CanvasElement>) {
        let events = {
            let mut state = self.lock();
            if state.canvas.is_none() {
                return;
            }
            let current = supported_records(&elements);
            let events = diff(&state.snapshot, &current);
            let unsupported_changed = events.is_empty() && state.baseline != elements;
            state.snapshot = current;
            state.baseline = elements;

            if events.is_empty() && !unsupported_changed {
                return;
            }
            events
        };

        let mut added = 0;
        let mut updated = 0;
        let mut deleted = 0;
        for event in &events {
            match event {
                DocumentEvent::ElementAdded(_) => added += 1,
                DocumentEvent::ElementUpdated { .. } => updated += 1,
                DocumentEvent::ElementDeleted(_) => deleted += 1,
                DocumentEvent::StructureChanged { .. } => {}
            }
            self.events.emit(event);
        }
        debug!(
            "Structure changed: {} added, {} updated, {} deleted",
            added, updated, deleted
        );
        self.events.emit(&DocumentEvent::StructureChanged {
            added,
            updated,
            deleted,
        });
    }

    fn edit(&self, edit: PendingEdit) -> Result<()> {
        let now = self.clock.now_ms();
        let canvas = {
            let mut state = self.lock();
            let Some(canvas) = state.canvas.clone() else {
                warn!("No document attached, dropping {:?}", edit);
                return Ok(());
            };
            if state.guard.is_held(now) {
                debug!("Write in flight, queueing {:?}", edit);
                state.queued.push(edit);
                return Ok(());
            }
            canvas
        };

        let mut elements = canvas.elements();
        match edit {
            PendingEdit::Add(element) => {
                match elements.iter_mut().find(|r| r.id == element.id) {
                    Some(record) => element.apply_to(record),
                    None => elements.push(element.to_canvas()),
                }
            }
            PendingEdit::Update(element) => {
                let Some(record) = elements.iter_mut().find(|r| r.id == element.id) else {
                    warn!("Cannot update unknown element {}", element.id);
                    return Ok(());
                };
                element.apply_to(record);
            }
            PendingEdit::Remove(id) => {
                let Some(record) = elements.iter_mut().find(|r| r.id == id) else {
                    warn!("Cannot remove unknown element {}", id);
                    return Ok(());
                };
                record.is_deleted = true;
            }
        }

        canvas.replace_elements(elements).map_err(|e| {
            error!("Canvas write failed: {}", e);
            AdapterError::from(e)
        })
    }

    /// Replace the element list under the guard, then recapture the snapshot.
    fn write(&self, canvas: Arc<dyn CanvasDocument>, elements: Vec<CanvasElement>) -> Result<()> {
        let token: GuardToken = self.lock().guard.begin(self.clock.now_ms());

        let result = canvas.replace_elements(elements);
        let written = result.as_ref().ok().map(|_| canvas.elements());

        let queued = {
            let mut state = self.lock();
            if !state.guard.acknowledge(token.as_str()) {
                debug!("Write {} finished after its guard expired", token);
            }
            if let Some(elements) = written {
                state.capture(elements);
                state.changes.clear();
            }
            std::mem::take(&mut state.queued)
        };

        if let Err(e) = &result {
            error!("Canvas write failed: {}", e);
        }
        self.replay(queued);
        result.map_err(AdapterError::from)
    }

    fn replay(&self, queued: Vec<PendingEdit>) {
        for edit in queued {
            if let Err(e) = self.edit(edit) {
                warn!("Replaying queued edit failed: {}", e);
            }
        }
    }

    fn canvas(&self) -> Option<Arc<dyn CanvasDocument>> {
        self.lock().canvas.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DocState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn supported_records(elements: &[CanvasElement]) -> BTreeMap<String, CanvasElement> {
    elements
        .iter()
        .filter(|r| r.is_supported() && !r.is_deleted)
        .map(|r| (r.id.clone(), r.clone()))
        .collect()
}

fn diff(
    before: &BTreeMap<String, CanvasElement>,
    current: &BTreeMap<String, CanvasElement>,
) -> Vec<DocumentEvent> {
    let mut events = Vec::new();
    for (id, record) in current {
        let Some(element) = Element::from_canvas(record) else {
            continue;
        };
        match before.get(id) {
            None => events.push(DocumentEvent::ElementAdded(element)),
            Some(old) if old != record => {
                if let Some(previous) = Element::from_canvas(old) {
                    events.push(DocumentEvent::ElementUpdated {
                        previous,
                        current: element,
                    });
                }
            }
            Some(_) => {}
        }
    }
    for (id, record) in before {
        if !current.contains_key(id) {
            if let Some(element) = Element::from_canvas(record) {
                events.push(DocumentEvent::ElementDeleted(element));
            }
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::{CanvasError, InMemoryCanvas};
    use crate::clock::{Clock, ManualClock};
    use serde_json::Value;

    struct Fixture {
        clock: Arc<ManualClock>,
        canvas: Arc<InMemoryCanvas>,
        adapter: Arc<DocumentAdapter>,
        events: Arc<Mutex<Vec<DocumentEvent>>>,
        _sub: Subscription,
    }

    fn fixture(elements: Vec<CanvasElement>) -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000));
        let canvas = Arc::new(InMemoryCanvas::with_elements(elements));
        let adapter = DocumentAdapter::new(clock.clone(), 300, 5_000);
        adapter.attach(canvas.clone());

        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);
        let sub = adapter.subscribe(move |event| {
            events_clone.lock().unwrap().push(event.clone());
        });

        Fixture {
            clock,
            canvas,
            adapter,
            events,
            _sub: sub,
        }
    }

    impl Fixture {
        fn advance(&self, ms: u64) {
            self.clock.advance(ms);
            self.adapter.tick(self.clock.now_ms());
        }

        fn take_events(&self) -> Vec<DocumentEvent> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    #[test]
    fn test_structure_reflects_edit_after_debounce() {
        let f = fixture(Vec::new());

        f.canvas.edit(|elements| {
            elements.push(Element::embeddable("e1", "/files/demo/a.md").to_canvas());
            elements.push(CanvasElement::new("r1", "rectangle"));
        });
        f.advance(299);
        assert!(f.take_events().is_empty());

        f.advance(1);
        let events = f.take_events();
        assert_eq!(
            events,
            vec![
                DocumentEvent::ElementAdded(Element::embeddable("e1", "/files/demo/a.md")),
                DocumentEvent::StructureChanged {
                    added: 1,
                    updated: 0,
                    deleted: 0
                },
            ]
        );

        let structure = f.adapter.current_structure();
        assert_eq!(structure.len(), 1);
        assert_eq!(structure, f.adapter.current_structure());
    }

    #[test]
    fn test_keystrokes_coalesce_into_one_update() {
        let f = fixture(vec![Element::frame("f1", Some("D")).to_canvas()]);

        for name in ["Dr", "Dra", "Draf", "Draft"] {
            f.canvas.edit(|elements| elements[0].name = Some(name.to_string()));
            f.advance(100);
        }
        f.advance(300);

        let events = f.take_events();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            DocumentEvent::ElementUpdated {
                previous: Element::frame("f1", Some("D")),
                current: Element::frame("f1", Some("Draft")),
            }
        );
    }

    #[test]
    fn test_unsupported_change_still_reports_structure_changed() {
        let f = fixture(vec![CanvasElement::new("r1", "rectangle")]);

        f.canvas.edit(|elements| {
            elements[0].extra.insert("x".into(), Value::from(50));
        });
        f.adapter.flush();

        assert_eq!(
            f.take_events(),
            vec![DocumentEvent::StructureChanged {
                added: 0,
                updated: 0,
                deleted: 0
            }]
        );
    }

    #[test]
    fn test_remove_element_reports_deletion() {
        let f = fixture(vec![Element::frame("f1", Some("Draft")).to_canvas()]);

        f.adapter.remove_element("f1").unwrap();
        f.adapter.flush();

        assert!(f.canvas.find("f1").unwrap().is_deleted);
        assert_eq!(
            f.take_events()[0],
            DocumentEvent::ElementDeleted(Element::frame("f1", Some("Draft")))
        );
        assert!(f.adapter.current_structure().is_empty());
    }

    #[test]
    fn test_initialize_keeps_other_types_and_emits_nothing() {
        let f = fixture(vec![
            CanvasElement::new("r1", "rectangle"),
            Element::embeddable("old", "/files/demo/old.md").to_canvas(),
        ]);

        let structure: Structure = [
            Element::embeddable("e1", "/files/demo/a.md"),
            Element::frame("f1", Some("Research")),
        ]
        .into_iter()
        .collect();
        f.adapter.initialize(&structure).unwrap();
        f.advance(1_000);

        assert!(f.take_events().is_empty());
        assert!(f.canvas.find("r1").is_some());
        assert!(f.canvas.find("old").is_none());
        assert_eq!(f.adapter.current_structure(), structure);
    }

    #[test]
    fn test_failed_write_releases_guard() {
        let f = fixture(Vec::new());
        f.canvas.set_fail_writes(true);

        let result = f.adapter.apply_snapshot(vec![CanvasElement::new("r1", "rectangle")]);
        assert!(matches!(
            result,
            Err(AdapterError::Canvas(CanvasError::Rejected(_)))
        ));

        f.canvas.set_fail_writes(false);
        f.canvas.edit(|elements| {
            elements.push(Element::frame("f1", Some("Draft")).to_canvas())
        });
        f.adapter.flush();
        assert_eq!(f.take_events().len(), 2);
    }

    #[test]
    fn test_edits_without_document_are_noops() {
        let clock = Arc::new(ManualClock::new(0));
        let adapter = DocumentAdapter::new(clock, 300, 5_000);

        assert!(adapter.add_element(Element::frame("f1", None)).is_ok());
        assert!(adapter.current_structure().is_empty());
        assert!(matches!(adapter.snapshot(), Err(AdapterError::NotAttached)));
        assert!(matches!(
            adapter.initialize(&Structure::new()),
            Err(AdapterError::NotAttached)
        ));
    }

    /// Canvas that performs a local edit from inside its first write, the way
    /// a host reacting to scene updates can.
    struct ReentrantCanvas {
        inner: InMemoryCanvas,
        adapter: Mutex<Weak<DocumentAdapter>>,
        fired: std::sync::atomic::AtomicBool,
    }

    impl CanvasDocument for ReentrantCanvas {
        fn elements(&self) -> Vec<CanvasElement> {
            self.inner.elements()
        }

        fn app_state(&self) -> Value {
            self.inner.app_state()
        }

        fn files(&self) -> Value {
            self.inner.files()
        }

        fn replace_elements(&self, elements: Vec<CanvasElement>) -> crate::canvas::Result<()> {
            self.inner.replace_elements(elements)?;
            if !self.fired.swap(true, std::sync::atomic::Ordering::SeqCst) {
                let adapter = self.adapter.lock().unwrap().upgrade();
                if let Some(adapter) = adapter {
                    adapter
                        .add_element(Element::frame("late", Some("Late")))
                        .unwrap();
                }
            }
            Ok(())
        }

        fn set_change_hook(&self, hook: Option<ChangeHook>) {
            self.inner.set_change_hook(hook);
        }
    }

    #[test]
    fn test_edit_during_write_is_queued_and_replayed() {
        let clock = Arc::new(ManualClock::new(0));
        let adapter = DocumentAdapter::new(clock, 300, 5_000);
        let canvas = Arc::new(ReentrantCanvas {
            inner: InMemoryCanvas::new(),
            adapter: Mutex::new(Arc::downgrade(&adapter)),
            fired: std::sync::atomic::AtomicBool::new(false),
        });
        adapter.attach(canvas.clone());

        adapter
            .apply_snapshot(vec![Element::frame("f1", Some("A")).to_canvas()])
            .unwrap();

        let structure = adapter.current_structure();
        assert!(structure.contains("f1"));
        assert!(structure.contains("late"));
        // The replayed edit is a local change and goes through detection.
        assert!(adapter.has_pending_changes());
    }
}
