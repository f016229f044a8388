//! External collaborator interfaces (spec §6): the component registry and
//! the error parser. The core is only a *consumer* of these — it neither
//! mutates the registry nor assumes ordering across `watch` events — and
//! the reference implementations here exist solely to exercise the
//! pipeline in tests and in `templar-pipeline-cli`. They are not the
//! subject of this crate's invariants.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::types::{ComponentDescriptor, ParsedError};

/// The kind of change a `RegistryEvent` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryChangeKind {
    Added,
    Modified,
    Removed,
}

/// One change notification from [`ComponentRegistry::watch`].
#[derive(Debug, Clone)]
pub struct RegistryEvent {
    pub kind: RegistryChangeKind,
    pub descriptor: Arc<ComponentDescriptor>,
}

/// A change-notifying keyed store of component descriptors. Out of scope
/// for this crate's own implementation (spec §1) — the core depends only
/// on this trait.
pub trait ComponentRegistry: Send + Sync {
    fn get(&self, name: &str) -> Option<Arc<ComponentDescriptor>>;
    fn get_all(&self) -> Vec<Arc<ComponentDescriptor>>;
    fn watch(&self) -> Receiver<RegistryEvent>;
    fn count(&self) -> usize;
}

/// A pure function from a failed build's combined stderr+stdout to a list
/// of structured diagnostics. Out of scope for this crate's own
/// implementation (spec §1) — the core invokes it once per failing build
/// and attaches the result to the `BuildResult`.
pub trait ErrorParser: Send + Sync {
    fn parse(&self, component: &str, combined_output: &[u8]) -> Vec<ParsedError>;
}

/// In-memory reference [`ComponentRegistry`]: a mutexed map plus a
/// broadcast of [`RegistryEvent`] to every live watcher.
#[derive(Default)]
pub struct InMemoryRegistry {
    inner: Mutex<InMemoryRegistryInner>,
}

#[derive(Default)]
struct InMemoryRegistryInner {
    components: HashMap<String, Arc<ComponentDescriptor>>,
    watchers: Vec<Sender<RegistryEvent>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a descriptor, notifying watchers with `Added`
    /// (new name) or `Modified` (existing name).
    pub fn upsert(&self, descriptor: ComponentDescriptor) {
        let descriptor = Arc::new(descriptor);
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let kind = if inner.components.contains_key(&descriptor.name) {
            RegistryChangeKind::Modified
        } else {
            RegistryChangeKind::Added
        };
        inner.components.insert(descriptor.name.clone(), Arc::clone(&descriptor));
        Self::notify(&mut inner, kind, descriptor);
    }

    /// Removes a descriptor by name, notifying watchers with `Removed`.
    /// A no-op (no notification) if the name was not present.
    pub fn remove(&self, name: &str) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        if let Some(descriptor) = inner.components.remove(name) {
            Self::notify(&mut inner, RegistryChangeKind::Removed, descriptor);
        }
    }

    fn notify(inner: &mut InMemoryRegistryInner, kind: RegistryChangeKind, descriptor: Arc<ComponentDescriptor>) {
        inner.watchers.retain(|tx| {
            tx.send(RegistryEvent { kind, descriptor: Arc::clone(&descriptor) }).is_ok()
        });
    }
}

impl ComponentRegistry for InMemoryRegistry {
    fn get(&self, name: &str) -> Option<Arc<ComponentDescriptor>> {
        self.inner.lock().expect("registry lock poisoned").components.get(name).cloned()
    }

    fn get_all(&self) -> Vec<Arc<ComponentDescriptor>> {
        self.inner.lock().expect("registry lock poisoned").components.values().cloned().collect()
    }

    fn watch(&self) -> Receiver<RegistryEvent> {
        let (tx, rx) = unbounded();
        self.inner.lock().expect("registry lock poisoned").watchers.push(tx);
        rx
    }

    fn count(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").components.len()
    }
}

/// Reference [`ErrorParser`]: splits the combined output on lines matching
/// `file:line:col: message` and falls back to one [`ParsedError`] wrapping
/// the entire raw output when no line matches. This is adequate for tests
/// and the demo CLI; it is explicitly not a generator-specific grammar.
pub struct HeuristicErrorParser;

impl ErrorParser for HeuristicErrorParser {
    fn parse(&self, component: &str, combined_output: &[u8]) -> Vec<ParsedError> {
        let text = String::from_utf8_lossy(combined_output);
        let mut parsed: Vec<ParsedError> = text
            .lines()
            .filter_map(|line| parse_diagnostic_line(component, line))
            .collect();

        if parsed.is_empty() && !text.trim().is_empty() {
            parsed.push(ParsedError {
                kind: "unknown".to_string(),
                severity: "error".to_string(),
                component: component.to_string(),
                file: None,
                line: None,
                column: None,
                message: text.trim().to_string(),
                raw: text.into_owned(),
            });
        }
        parsed
    }
}

/// Parses a single `path:line:col: message` line. Returns `None` if the
/// line does not match that shape.
fn parse_diagnostic_line(component: &str, line: &str) -> Option<ParsedError> {
    let mut parts = line.splitn(4, ':');
    let file = parts.next()?;
    let line_no: u32 = parts.next()?.trim().parse().ok()?;
    let col: u32 = parts.next()?.trim().parse().ok()?;
    let message = parts.next()?.trim();
    if file.is_empty() || message.is_empty() {
        return None;
    }
    let severity = if message.to_ascii_lowercase().starts_with("warning") {
        "warning"
    } else {
        "error"
    };
    Some(ParsedError {
        kind: "syntax".to_string(),
        severity: severity.to_string(),
        component: component.to_string(),
        file: Some(file.to_string()),
        line: Some(line_no),
        column: Some(col),
        message: message.to_string(),
        raw: line.to_string(),
    })
}
