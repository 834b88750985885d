//! Device-node backend for unix hosts
//!
//! The AJA driver exposes each board as a character device named after its
//! class followed by a board index (`/dev/ajantv20`, `/dev/ajantv21`, ...).
//! Registers are 32-bit little-endian words read at byte offset
//! `4 * register`. Hot-plug is detected by rescanning the device directory,
//! either on a background poll thread or on demand with
//! [`DevfsBackend::rescan`].

use aja_pnp_core::{
    ArrivalCallback, ClassWatch, DriverConnection, HotplugBackend, RemovalCallback, UnitHandle,
    WatchError, WatchToken,
};
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::config::DevfsConfig;

#[derive(Default)]
struct DevfsState {
    class_watchers: HashMap<u64, (String, ArrivalCallback)>,
    removal_watchers: HashMap<u64, (PathBuf, RemovalCallback)>,
    /// Nodes already reported, with their class
    known: HashMap<PathBuf, String>,
    next_watch: u64,
}

struct Poller {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

struct DevfsInner {
    root: PathBuf,
    poll_interval: Option<Duration>,
    state: Mutex<DevfsState>,
    poller: Mutex<Option<Poller>>,
}

/// Hot-plug backend over a directory of driver device nodes
pub struct DevfsBackend {
    inner: Arc<DevfsInner>,
}

impl DevfsBackend {
    /// `poll_interval` of `None` disables the background thread; call
    /// [`rescan`](Self::rescan) to pick up changes.
    pub fn new(root: impl Into<PathBuf>, poll_interval: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(DevfsInner {
                root: root.into(),
                poll_interval,
                state: Mutex::new(DevfsState::default()),
                poller: Mutex::new(None),
            }),
        }
    }

    pub fn from_config(config: &DevfsConfig) -> Self {
        Self::new(config.root.clone(), config.poll_interval())
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Compare the directory against what was last reported and fire
    /// arrival and removal callbacks for the difference.
    pub fn rescan(&self) {
        self.inner.rescan();
    }
}

impl DevfsInner {
    fn lock(&self) -> MutexGuard<'_, DevfsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn rescan(&self) {
        let mut arrivals: Vec<(ArrivalCallback, Vec<UnitHandle>)> = Vec::new();
        let mut removals: Vec<RemovalCallback> = Vec::new();
        {
            let mut state = self.lock();
            let classes: BTreeSet<String> =
                state.class_watchers.values().map(|(c, _)| c.clone()).collect();
            if classes.is_empty() {
                return;
            }
            let current = match scan_nodes(&self.root, classes.iter().map(String::as_str)) {
                Ok(current) => current,
                Err(e) => {
                    debug!(root = %self.root.display(), error = %e, "Device directory unreadable");
                    return;
                }
            };

            let gone: Vec<PathBuf> = state
                .known
                .keys()
                .filter(|path| !current.contains_key(*path))
                .cloned()
                .collect();
            for path in gone {
                state.known.remove(&path);
                let ids: Vec<u64> = state
                    .removal_watchers
                    .iter()
                    .filter(|(_, (watched, _))| *watched == path)
                    .map(|(id, _)| *id)
                    .collect();
                for id in ids {
                    if let Some((_, cb)) = state.removal_watchers.remove(&id) {
                        removals.push(cb);
                    }
                }
                debug!(node = %path.display(), "Device node removed");
            }

            let mut new_by_class: HashMap<String, Vec<UnitHandle>> = HashMap::new();
            for (path, class) in current {
                if state.known.contains_key(&path) {
                    continue;
                }
                debug!(node = %path.display(), class = %class, "Device node appeared");
                new_by_class
                    .entry(class.clone())
                    .or_default()
                    .push(unit_for(&class, &path));
                state.known.insert(path, class);
            }
            for (class, units) in new_by_class {
                for (watched, cb) in state.class_watchers.values() {
                    if *watched == class {
                        arrivals.push((cb.clone(), units.clone()));
                    }
                }
            }
        }

        for cb in removals {
            cb();
        }
        for (cb, units) in arrivals {
            cb(units);
        }
    }

    fn ensure_poller(self: &Arc<Self>) {
        let Some(interval) = self.poll_interval else {
            return;
        };
        let mut poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
        if poller.is_some() {
            return;
        }
        let stop = Arc::new(AtomicBool::new(false));
        let weak: Weak<Self> = Arc::downgrade(self);
        let thread_stop = stop.clone();
        let spawned = thread::Builder::new()
            .name("aja-pnp-devfs".into())
            .spawn(move || poll_loop(weak, interval, thread_stop));
        match spawned {
            Ok(thread) => {
                info!(root = %self.root.display(), interval_ms = interval.as_millis() as u64, "Device node polling started");
                *poller = Some(Poller { stop, thread });
            }
            Err(e) => warn!(error = %e, "Failed to start device node poller"),
        }
    }
}

impl Drop for DevfsInner {
    fn drop(&mut self) {
        let poller = self
            .poller
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(poller) = poller {
            poller.stop.store(true, Ordering::SeqCst);
            poller.thread.thread().unpark();
            // The poll thread may hold the last reference itself
            if poller.thread.thread().id() != thread::current().id() {
                let _ = poller.thread.join();
            }
            debug!("Device node polling stopped");
        }
    }
}

fn poll_loop(inner: Weak<DevfsInner>, interval: Duration, stop: Arc<AtomicBool>) {
    loop {
        thread::park_timeout(interval);
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match inner.upgrade() {
            Some(inner) => inner.rescan(),
            None => break,
        }
    }
}

impl HotplugBackend for DevfsBackend {
    fn name(&self) -> &str {
        "devfs"
    }

    fn watch_class(
        &self,
        class_name: &str,
        on_arrival: ArrivalCallback,
    ) -> Result<ClassWatch, WatchError> {
        let mut classes: BTreeSet<String> = self
            .inner
            .lock()
            .class_watchers
            .values()
            .map(|(c, _)| c.clone())
            .collect();
        classes.insert(class_name.to_string());
        let mut nodes = scan_nodes(&self.inner.root, classes.iter().map(String::as_str))
            .map_err(|e| WatchError::Arm {
                class: class_name.to_string(),
                reason: format!("{}: {e}", self.inner.root.display()),
            })?;
        nodes.retain(|_, class| *class == class_name);

        let id = {
            let mut state = self.inner.lock();
            let id = state.next_watch;
            state.next_watch += 1;
            state
                .class_watchers
                .insert(id, (class_name.to_string(), on_arrival));
            for path in nodes.keys() {
                state.known.insert(path.clone(), class_name.to_string());
            }
            id
        };
        self.inner.ensure_poller();

        let present = nodes
            .keys()
            .map(|path| unit_for(class_name, path))
            .collect::<Vec<_>>();
        debug!(class = class_name, present = present.len(), "Watching device nodes");

        let weak = Arc::downgrade(&self.inner);
        Ok(ClassWatch {
            token: WatchToken::new(move || {
                if let Some(inner) = weak.upgrade() {
                    let mut state = inner.lock();
                    if let Some((class, _)) = state.class_watchers.remove(&id) {
                        if !state.class_watchers.values().any(|(c, _)| *c == class) {
                            state.known.retain(|_, c| *c != class);
                        }
                    }
                }
            }),
            present,
        })
    }

    fn watch_removal(
        &self,
        unit: &UnitHandle,
        on_removal: RemovalCallback,
    ) -> Result<WatchToken, WatchError> {
        let path = PathBuf::from(unit.location());
        let mut state = self.inner.lock();
        if !path.exists() {
            state.known.remove(&path);
            drop(state);
            trace!(unit = %unit, "Device node already gone");
            on_removal();
            return Ok(WatchToken::inert());
        }
        state
            .known
            .entry(path.clone())
            .or_insert_with(|| unit.class_name().to_string());
        let id = state.next_watch;
        state.next_watch += 1;
        state.removal_watchers.insert(id, (path, on_removal));

        let weak = Arc::downgrade(&self.inner);
        Ok(WatchToken::new(move || {
            if let Some(inner) = weak.upgrade() {
                let removed = inner.lock().removal_watchers.remove(&id);
                drop(removed);
            }
        }))
    }

    fn open(&self, unit: &UnitHandle) -> Result<Box<dyn DriverConnection>, WatchError> {
        let file = File::open(unit.location()).map_err(|e| WatchError::Open {
            unit: unit.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Box::new(DevfsConnection { file }))
    }
}

struct DevfsConnection {
    file: File,
}

impl DriverConnection for DevfsConnection {
    fn read_register(&self, register: u32) -> Result<u32, WatchError> {
        let mut word = [0u8; 4];
        self.file
            .read_exact_at(&mut word, u64::from(register) * 4)
            .map_err(|e| {
                trace!(register, error = %e, "Register read failed");
                WatchError::RegisterRead { register }
            })?;
        Ok(u32::from_le_bytes(word))
    }
}

fn unit_for(class_name: &str, path: &Path) -> UnitHandle {
    UnitHandle::new(class_name, path.to_string_lossy())
}

/// `<class><digits>`, e.g. `ajantv20`
fn node_matches(file_name: &str, class_name: &str) -> bool {
    match file_name.strip_prefix(class_name) {
        Some(index) => !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

/// Device nodes under `root` belonging to any of `classes`
fn scan_nodes<'a>(
    root: &Path,
    classes: impl IntoIterator<Item = &'a str>,
) -> std::io::Result<HashMap<PathBuf, String>> {
    let classes: Vec<&str> = classes.into_iter().collect();
    let mut nodes = HashMap::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        // `ajantv20` belongs to `ajantv2`, not `ajantv`
        let owner = classes
            .iter()
            .filter(|c| node_matches(name, c))
            .max_by_key(|c| c.len());
        if let Some(class) = owner {
            nodes.insert(entry.path(), class.to_string());
        }
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aja_pnp_core::device::{REG_BOARD_ID, REG_SERIAL_HI, REG_SERIAL_LO};
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn write_node(dir: &Path, name: &str, board_id: u32, serial: u64) -> PathBuf {
        let mut image = vec![0u8; 4 * 64];
        let mut put = |reg: u32, value: u32| {
            let at = reg as usize * 4;
            image[at..at + 4].copy_from_slice(&value.to_le_bytes());
        };
        put(REG_BOARD_ID, board_id);
        put(REG_SERIAL_LO, serial as u32);
        put(REG_SERIAL_HI, (serial >> 32) as u32);
        let path = dir.join(name);
        std::fs::write(&path, image).unwrap();
        path
    }

    #[test]
    fn test_node_matches() {
        assert!(node_matches("ajantv20", "ajantv2"));
        assert!(node_matches("ajantv212", "ajantv2"));
        assert!(!node_matches("ajantv2", "ajantv2"));
        assert!(!node_matches("ajantv2x", "ajantv2"));
        assert!(!node_matches("tty0", "ajantv2"));
    }

    #[test]
    fn test_node_goes_to_longest_matching_class() {
        let dir = TempDir::new().unwrap();
        write_node(dir.path(), "ajantv20", 1, 1);
        write_node(dir.path(), "ajantv7", 2, 2);

        let nodes = scan_nodes(dir.path(), ["ajantv", "ajantv2"]).unwrap();
        assert_eq!(nodes[&dir.path().join("ajantv20")], "ajantv2");
        assert_eq!(nodes[&dir.path().join("ajantv7")], "ajantv");

        let backend = DevfsBackend::new(dir.path(), None);
        let specific = backend
            .watch_class("ajantv2", Arc::new(|_: Vec<UnitHandle>| {}))
            .unwrap();
        let general = backend
            .watch_class("ajantv", Arc::new(|_: Vec<UnitHandle>| {}))
            .unwrap();
        assert_eq!(specific.present.len(), 1);
        assert_eq!(general.present.len(), 1);
        assert_eq!(
            general.present[0].location(),
            dir.path().join("ajantv7").to_str().unwrap()
        );
    }

    #[test]
    fn test_watch_reports_present_nodes() {
        let dir = TempDir::new().unwrap();
        write_node(dir.path(), "ajantv20", 1, 1);
        write_node(dir.path(), "ajantv21", 2, 2);
        std::fs::write(dir.path().join("null"), b"").unwrap();

        let backend = DevfsBackend::new(dir.path(), None);
        let watch = backend
            .watch_class("ajantv2", Arc::new(|_: Vec<UnitHandle>| {}))
            .unwrap();
        assert_eq!(watch.present.len(), 2);
    }

    #[test]
    fn test_missing_root_fails_to_arm() {
        let dir = TempDir::new().unwrap();
        let backend = DevfsBackend::new(dir.path().join("missing"), None);
        assert!(matches!(
            backend.watch_class("ajantv2", Arc::new(|_: Vec<UnitHandle>| {})),
            Err(WatchError::Arm { .. })
        ));
    }

    #[test]
    fn test_registers_read_little_endian() {
        let dir = TempDir::new().unwrap();
        let path = write_node(dir.path(), "ajantv20", 0x10538200, 0x0000_0001_00a1_b2c3);
        let backend = DevfsBackend::new(dir.path(), None);
        let conn = backend
            .open(&UnitHandle::new("ajantv2", path.to_string_lossy()))
            .unwrap();
        assert_eq!(conn.read_register(REG_BOARD_ID).unwrap(), 0x10538200);
        assert_eq!(conn.read_register(REG_SERIAL_LO).unwrap(), 0x00a1b2c3);
        assert_eq!(conn.read_register(REG_SERIAL_HI).unwrap(), 1);
        assert!(matches!(
            conn.read_register(1000),
            Err(WatchError::RegisterRead { register: 1000 })
        ));
    }

    #[test]
    fn test_rescan_reports_arrival_and_removal() {
        let dir = TempDir::new().unwrap();
        let backend = DevfsBackend::new(dir.path(), None);

        let arrived = Arc::new(Mutex::new(Vec::new()));
        let a = arrived.clone();
        let _watch = backend
            .watch_class(
                "ajantv2",
                Arc::new(move |units: Vec<UnitHandle>| a.lock().unwrap().extend(units)),
            )
            .unwrap();

        let path = write_node(dir.path(), "ajantv20", 1, 1);
        backend.rescan();
        backend.rescan();
        let units = arrived.lock().unwrap().clone();
        assert_eq!(units.len(), 1);

        let removed = Arc::new(AtomicUsize::new(0));
        let r = removed.clone();
        let _token = backend
            .watch_removal(
                &units[0],
                Box::new(move || {
                    r.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        std::fs::remove_file(&path).unwrap();
        backend.rescan();
        backend.rescan();
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_watch_removal_of_missing_node_fires_immediately() {
        let dir = TempDir::new().unwrap();
        let backend = DevfsBackend::new(dir.path(), None);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let unit = UnitHandle::new("ajantv2", dir.path().join("ajantv27").to_string_lossy());
        let _token = backend
            .watch_removal(
                &unit,
                Box::new(move || {
                    f.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_background_poller_picks_up_nodes() {
        let dir = TempDir::new().unwrap();
        let backend = DevfsBackend::new(dir.path(), Some(Duration::from_millis(10)));
        let arrived = Arc::new(AtomicUsize::new(0));
        let a = arrived.clone();
        let _watch = backend
            .watch_class(
                "ajantv2",
                Arc::new(move |units: Vec<UnitHandle>| {
                    a.fetch_add(units.len(), Ordering::SeqCst);
                }),
            )
            .unwrap();

        write_node(dir.path(), "ajantv20", 1, 1);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while arrived.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(arrived.load(Ordering::SeqCst), 1);
    }
}
