use std::fmt;

use rustc_hash::FxHashMap;

use crate::error::{Fault, HouseError};
use crate::interp::{Interp, PayloadKind, PendingOutput, TickStatus, HEAP_CELLS};
use crate::manifest::Manifest;
use crate::printer::print_value;
use crate::sandbox::Sandbox;

pub const DAEMON_NAME_LEN: usize = 64;
pub const INTERFACE_NAME_LEN: usize = 16;
pub const LANG_LEN: usize = 16;
pub const TYPE_LEN: usize = 16;
pub const FORMAT_LEN: usize = 16;

//===----------------------------------------------------------------------===//
// Daemons, interfaces, interlinks
//===----------------------------------------------------------------------===//

/// Non-zero daemon identifier, derived from the registry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DaemonId(u32);

impl DaemonId {
    fn from_slot(slot: usize) -> Self {
        DaemonId(slot as u32 + 1)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    fn slot(self) -> usize {
        (self.0 - 1) as usize
    }
}

impl fmt::Display for DaemonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

impl Direction {
    /// Manifest and `register-interface` encode direction as 0 (out) / 1 (in).
    pub fn from_flag(flag: u8) -> Direction {
        if flag == 0 {
            Direction::Out
        } else {
            Direction::In
        }
    }
}

/// A named, typed, directional hook declared by a daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub kind: String,
    pub format: String,
    pub direction: Direction,
    pub triggering: bool,
}

/// A router-managed pairing of an OUT port and an IN port with identical
/// name, type and format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interlink {
    pub name: String,
    pub kind: String,
    pub format: String,
    pub producer: DaemonId,
    pub consumer: DaemonId,
}

/// Manifest-derived metadata, the only form of a daemon known before it runs.
#[derive(Debug, Clone)]
pub struct DaemonInfo {
    pub language: String,
    pub name: String,
    pub script: String,
    pub interfaces: Vec<Interface>,
}

pub struct Daemon {
    pub id: DaemonId,
    pub name: String,
    pub language: String,
    pub interp: Interp,
    pub finished: bool,
}

//===----------------------------------------------------------------------===//
// Slot pool
//===----------------------------------------------------------------------===//

enum Slot<T> {
    Vacant,
    /// Taken out for its scheduling turn; not allocatable until put back.
    Reserved,
    Full(T),
}

/// A growable pool of occupancy-tracked slots: first-fit allocation with
/// amortised geometric growth. Backs the daemon and daemon-info registries.
pub struct Pool<T> {
    slots: Vec<Slot<T>>,
}

impl<T> Pool<T> {
    pub fn new() -> Self {
        Pool { slots: Vec::new() }
    }

    /// First-fit insert; the slot index is handed to the constructor so
    /// entries can embed their own identifier.
    pub fn insert(&mut self, make: impl FnOnce(usize) -> T) -> usize {
        let found = (0..self.slots.len()).find(|&i| matches!(self.slots[i], Slot::Vacant));
        let i = match found {
            Some(i) => i,
            None => {
                let old = self.slots.len();
                let grown = (old * 2).max(4);
                self.slots.resize_with(grown, || Slot::Vacant);
                old
            }
        };
        self.slots[i] = Slot::Full(make(i));
        i
    }

    pub fn get(&self, i: usize) -> Option<&T> {
        match self.slots.get(i) {
            Some(Slot::Full(t)) => Some(t),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, i: usize) -> Option<&mut T> {
        match self.slots.get_mut(i) {
            Some(Slot::Full(t)) => Some(t),
            _ => None,
        }
    }

    /// Take an entry out for its turn, leaving the slot reserved.
    pub fn take(&mut self, i: usize) -> Option<T> {
        let slot = self.slots.get_mut(i)?;
        if !matches!(slot, Slot::Full(_)) {
            return None;
        }
        match std::mem::replace(slot, Slot::Reserved) {
            Slot::Full(t) => Some(t),
            _ => None,
        }
    }

    pub fn put(&mut self, i: usize, t: T) {
        self.slots[i] = Slot::Full(t);
    }

    pub fn remove(&mut self, i: usize) -> Option<T> {
        let slot = self.slots.get_mut(i)?;
        if !matches!(slot, Slot::Full(_)) {
            return None;
        }
        match std::mem::replace(slot, Slot::Vacant) {
            Slot::Full(t) => Some(t),
            _ => None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn count(&self) -> usize {
        self.slots.iter().filter(|s| matches!(s, Slot::Full(_))).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| match s {
            Slot::Full(t) => Some((i, t)),
            _ => None,
        })
    }
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Pool::new()
    }
}

//===----------------------------------------------------------------------===//
// House: registry, router, scheduler
//===----------------------------------------------------------------------===//

/// The host process: the daemon registry, the manifest-info registry, the
/// interlink table and the sandbox every daemon shares.
pub struct House {
    daemons: Pool<Daemon>,
    infos: Pool<DaemonInfo>,
    interlinks: Vec<Interlink>,
    sandbox: Sandbox,
    names: FxHashMap<String, DaemonId>,
    heap_cells: usize,
}

impl House {
    pub fn new(sandbox: Sandbox) -> Self {
        Self::with_heap(sandbox, HEAP_CELLS)
    }

    pub fn with_heap(sandbox: Sandbox, heap_cells: usize) -> Self {
        House {
            daemons: Pool::new(),
            infos: Pool::new(),
            interlinks: Vec::new(),
            sandbox,
            names: FxHashMap::default(),
            heap_cells,
        }
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn daemon(&self, id: DaemonId) -> Option<&Daemon> {
        self.daemons.get(id.slot())
    }

    pub fn daemon_mut(&mut self, id: DaemonId) -> Option<&mut Daemon> {
        self.daemons.get_mut(id.slot())
    }

    pub fn daemon_by_name(&self, name: &str) -> Option<DaemonId> {
        self.names.get(name).copied()
    }

    pub fn daemon_count(&self) -> usize {
        self.daemons.count()
    }

    pub fn interlinks(&self) -> &[Interlink] {
        &self.interlinks
    }

    pub fn infos(&self) -> impl Iterator<Item = &DaemonInfo> {
        self.infos.iter().map(|(_, info)| info)
    }

    /// Instantiate a daemon from a script in the sandbox. Only the embedded
    /// Lisp is instantiable; any other language tag fails.
    pub fn start_daemon(
        &mut self,
        script: &str,
        language: &str,
    ) -> Result<DaemonId, HouseError> {
        if language != "lisp" {
            return Err(HouseError::UnknownLanguage(language.to_string()));
        }
        let program = self.sandbox.read_all(script)?;
        let mut interp = Interp::new(self.heap_cells).map_err(HouseError::Boot)?;
        interp.sources.set_main(String::from_utf8_lossy(&program).into_owned());
        let slot = self.daemons.insert(|i| Daemon {
            id: DaemonId::from_slot(i),
            name: script.to_string(),
            language: language.to_string(),
            interp,
            finished: false,
        });
        let id = DaemonId::from_slot(slot);
        self.names.insert(script.to_string(), id);
        tracing::info!(daemon = id.get(), script, "daemon started");
        Ok(id)
    }

    /// Parse a `.proc` manifest, register its info, and start the daemon it
    /// names.
    pub fn boot_manifest(&mut self, path: &str) -> Result<DaemonId, HouseError> {
        let data = self.sandbox.read_all(path)?;
        let manifest = Manifest::parse(&data)?;
        let id = self.start_daemon(&manifest.filename, "lisp")?;
        if let Some(daemon) = self.daemon_mut(id) {
            daemon.name = manifest.name.clone();
        }
        self.names.insert(manifest.name.clone(), id);
        self.infos.insert(|_| DaemonInfo {
            language: "lisp".to_string(),
            name: manifest.name,
            script: manifest.filename,
            interfaces: manifest.interfaces,
        });
        Ok(id)
    }

    /// Explicit kill: frees the slot and tears down every interlink touching
    /// the daemon.
    pub fn kill(&mut self, id: DaemonId) -> bool {
        if self.daemons.remove(id.slot()).is_none() {
            return false;
        }
        self.interlinks.retain(|l| l.producer != id && l.consumer != id);
        self.names.retain(|_, v| *v != id);
        tracing::info!(daemon = id.get(), "daemon killed");
        true
    }

    /// True when every live daemon has exhausted its program and has no
    /// queued synthetic source.
    pub fn all_finished(&self) -> bool {
        self.daemons
            .iter()
            .all(|(_, d)| d.finished && d.interp.sources.depth() <= 1)
    }

    /// One scheduler pass over all occupied slots in registry order: evaluate
    /// one top-level form per daemon, adopt freshly declared interfaces into
    /// interlinks, then deliver pending output unless the daemon yielded.
    pub fn cycle(&mut self) {
        let upper = self.daemons.capacity();
        for slot in 0..upper {
            let Some(mut daemon) = self.daemons.take(slot) else {
                continue;
            };
            let id = daemon.id;
            let runnable = !daemon.finished || daemon.interp.sources.depth() > 1;
            if runnable {
                match daemon.interp.tick(self) {
                    Ok(TickStatus::Ran) => {}
                    Ok(TickStatus::Finished) => {
                        if !daemon.finished {
                            tracing::debug!(daemon = id.get(), "program exhausted");
                        }
                        daemon.finished = true;
                    }
                    Err(fault) => {
                        tracing::warn!(
                            daemon = id.get(),
                            code = fault.code(),
                            %fault,
                            "daemon fault; recovering"
                        );
                        daemon.interp.recover();
                    }
                }
            }
            let fresh = daemon.interp.take_fresh();
            let yielded = daemon.interp.yielded;
            daemon.interp.yielded = false;
            self.daemons.put(slot, daemon);
            self.pair_fresh(id, fresh);
            if !yielded {
                self.route_outputs(id);
            }
        }
    }

    /// Drive cycles until every daemon is done or the budget runs out.
    pub fn run(&mut self, max_cycles: Option<u64>) -> u64 {
        let mut n = 0u64;
        while self.daemon_count() > 0 && !self.all_finished() {
            if let Some(max) = max_cycles {
                if n >= max {
                    break;
                }
            }
            self.cycle();
            n += 1;
        }
        n
    }

    /// Match newly declared interfaces against the other daemons' ports:
    /// opposite direction, identical name/type/format. Several candidates
    /// tie-break to the lowest daemon id; duplicate pairings are skipped.
    fn pair_fresh(&mut self, owner: DaemonId, fresh: Vec<Interface>) {
        for iface in fresh {
            let mut best: Option<DaemonId> = None;
            for (_, other) in self.daemons.iter() {
                if other.id == owner {
                    continue;
                }
                let matched = other.interp.interfaces().iter().any(|o| {
                    o.direction != iface.direction
                        && o.name == iface.name
                        && o.kind == iface.kind
                        && o.format == iface.format
                });
                if matched && best.map_or(true, |b| other.id.get() < b.get()) {
                    best = Some(other.id);
                }
            }
            let Some(other) = best else { continue };
            let (producer, consumer) = match iface.direction {
                Direction::Out => (owner, other),
                Direction::In => (other, owner),
            };
            let link = Interlink {
                name: iface.name.clone(),
                kind: iface.kind.clone(),
                format: iface.format.clone(),
                producer,
                consumer,
            };
            if self.interlinks.contains(&link) {
                continue;
            }
            tracing::debug!(
                name = %link.name,
                producer = producer.get(),
                consumer = consumer.get(),
                "interlink created"
            );
            self.interlinks.push(link);
        }
    }

    /// Deliver the producer's pending output across every interlink whose
    /// port name matches, then clear the slot. Without a matching interlink
    /// the slot is left for a later cycle (or a later overwrite).
    fn route_outputs(&mut self, src: DaemonId) {
        let pending = match self.daemons.get_mut(src.slot()) {
            Some(d) => d.interp.pending.take(),
            None => return,
        };
        let Some(pending) = pending else { return };
        let links: Vec<Interlink> = self
            .interlinks
            .iter()
            .filter(|l| l.producer == src && l.name == pending.port)
            .cloned()
            .collect();
        if links.is_empty() {
            if let Some(d) = self.daemons.get_mut(src.slot()) {
                d.interp.pending = Some(pending);
            }
            return;
        }
        for link in links {
            let text = wire_text(&link.name, &pending);
            let Some(mut consumer) = self.daemons.take(link.consumer.slot()) else {
                continue;
            };
            let triggering = consumer.interp.interfaces().iter().any(|i| {
                i.direction == Direction::In && i.name == link.name && i.triggering
            });
            if !consumer.interp.sources.push(text) {
                tracing::warn!(
                    consumer = link.consumer.get(),
                    port = %link.name,
                    "cursor stack full; delivery dropped"
                );
                self.daemons.put(link.consumer.slot(), consumer);
                continue;
            }
            if triggering {
                // A triggering IN port evaluates the invocation within the
                // same tick; a non-triggering one is read at the start of the
                // consumer's next turn.
                if let Err(fault) = consumer.interp.tick(self) {
                    tracing::warn!(
                        consumer = link.consumer.get(),
                        code = fault.code(),
                        %fault,
                        "handler fault; recovering"
                    );
                    consumer.interp.recover();
                }
            }
            let fresh = consumer.interp.take_fresh();
            let cid = consumer.id;
            self.daemons.put(link.consumer.slot(), consumer);
            self.pair_fresh(cid, fresh);
        }
    }

    /// Evaluate a snippet inside a daemon's interpreter and return the
    /// printed result. Inspection hook for tests and debugging; the daemon's
    /// own program cursor is left untouched.
    pub fn eval_in(&mut self, id: DaemonId, src: &str) -> Result<String, Fault> {
        let Some(mut daemon) = self.daemons.take(id.slot()) else {
            return Err(Fault::Arguments(format!("no daemon {}", id)));
        };
        let result = daemon
            .interp
            .eval_snippet(self, src)
            .map(|v| print_value(&daemon.interp.heap, v));
        self.daemons.put(id.slot(), daemon);
        result
    }
}

/// Source text for a synthetic invocation: `(<port> "<payload>")` for string
/// payloads (quotes and backslashes escaped), `(<port> (list b ...))` for
/// byte lists, and bare literal text for stringified scalars.
fn wire_text(port: &str, pending: &PendingOutput) -> String {
    match pending.kind {
        PayloadKind::Text => {
            let mut payload = String::new();
            for &b in &pending.data {
                match b {
                    b'"' => payload.push_str("\\\""),
                    b'\\' => payload.push_str("\\\\"),
                    _ => payload.push(b as char),
                }
            }
            format!("({} \"{}\")", port, payload)
        }
        PayloadKind::Bytes => {
            let nums: Vec<String> = pending.data.iter().map(|b| b.to_string()).collect();
            format!("({} (list {}))", port, nums.join(" "))
        }
        PayloadKind::Literal => {
            format!("({} {})", port, String::from_utf8_lossy(&pending.data))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_is_first_fit_and_reuses_slots() {
        let mut pool: Pool<u32> = Pool::new();
        let a = pool.insert(|_| 10);
        let b = pool.insert(|_| 20);
        assert_eq!((a, b), (0, 1));
        pool.remove(a);
        let c = pool.insert(|_| 30);
        assert_eq!(c, 0);
        assert_eq!(pool.get(c), Some(&30));
        assert_eq!(pool.count(), 2);
    }

    #[test]
    fn pool_reserved_slots_are_not_reallocated() {
        let mut pool: Pool<u32> = Pool::new();
        let a = pool.insert(|_| 1);
        let taken = pool.take(a).unwrap();
        // While slot `a` is reserved, a new insert must not land on it.
        let b = pool.insert(|_| 2);
        assert_ne!(a, b);
        pool.put(a, taken);
        assert_eq!(pool.get(a), Some(&1));
    }

    #[test]
    fn pool_constructor_sees_the_slot_index() {
        let mut pool: Pool<usize> = Pool::new();
        for expect in 0..6 {
            let slot = pool.insert(|i| i);
            assert_eq!(slot, expect);
            assert_eq!(pool.get(slot), Some(&expect));
        }
    }

    #[test]
    fn daemon_ids_are_non_zero_and_slot_stable() {
        let id = DaemonId::from_slot(0);
        assert_eq!(id.get(), 1);
        assert_eq!(id.slot(), 0);
    }

    #[test]
    fn wire_text_escapes_string_payloads() {
        let pending = PendingOutput {
            port: "log".to_string(),
            kind: PayloadKind::Text,
            data: b"say \"hi\" \\ there".to_vec(),
        };
        assert_eq!(
            wire_text("log", &pending),
            "(log \"say \\\"hi\\\" \\\\ there\")"
        );
    }

    #[test]
    fn wire_text_renders_byte_lists_and_literals() {
        let bytes = PendingOutput {
            port: "raw".to_string(),
            kind: PayloadKind::Bytes,
            data: vec![98, 99],
        };
        assert_eq!(wire_text("raw", &bytes), "(raw (list 98 99))");
        let lit = PendingOutput {
            port: "tick".to_string(),
            kind: PayloadKind::Literal,
            data: b"42".to_vec(),
        };
        assert_eq!(wire_text("tick", &lit), "(tick 42)");
    }
}
