//! The cross-process control flag that turns instrumentation on and off.
//!
//! One 32-bit word in a file-backed shared mapping. The instrumented process
//! creates and zeroes it at startup; an operator (or `leakpatrol-start`)
//! writes `1` into it once the application has warmed up. The hot path reads
//! the word with a relaxed atomic load and nothing else.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};

use memmap2::MmapMut;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum WatchState {
    NotWatching = 0,
    Watching = 1,
}

#[derive(thiserror::Error, Debug)]
pub enum SwitchError {
    #[error("could not open watch-switch file {path:?}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not map watch-switch file {path:?}: {source}")]
    Map {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// A handle on the shared watch word.
pub struct WatchSwitch {
    word: *mut i32,
    // Keeps the mapping alive for as long as `word` may be dereferenced.
    // `None` for detached switches, whose word is leaked instead.
    _map: Option<MmapMut>,
}

// SAFETY: the word is only ever accessed through `AtomicI32`, and the
// mapping it points into lives as long as the switch.
unsafe impl Send for WatchSwitch {}
unsafe impl Sync for WatchSwitch {}

impl WatchSwitch {
    /// Creates (or truncates to a fresh `NotWatching` word) the shared file.
    /// This is what the instrumented process calls at startup.
    pub fn open_or_create(path: &Path) -> Result<Self, SwitchError> {
        let switch = Self::open(path, true)?;
        switch.set(WatchState::NotWatching);
        Ok(switch)
    }

    /// Attaches to a switch some instrumented process already created.
    /// The current state is left alone.
    pub fn open_existing(path: &Path) -> Result<Self, SwitchError> {
        Self::open(path, false)
    }

    fn open(path: &Path, create: bool) -> Result<Self, SwitchError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(path)
            .map_err(|source| SwitchError::Open {
                path: path.to_owned(),
                source,
            })?;
        file.set_len(4).map_err(|source| SwitchError::Open {
            path: path.to_owned(),
            source,
        })?;

        let mut map = unsafe { memmap2::MmapOptions::new().len(4).map_mut(&file) }.map_err(
            |source| SwitchError::Map {
                path: path.to_owned(),
                source,
            },
        )?;

        let word = map.as_mut_ptr() as *mut i32;
        Ok(Self {
            word,
            _map: Some(map),
        })
    }

    /// A process-private switch. Used by tests and by tools that only need
    /// the engine, not cross-process control.
    pub fn detached() -> Self {
        let word: &'static mut i32 = Box::leak(Box::new(WatchState::NotWatching as i32));
        Self {
            word,
            _map: None,
        }
    }

    #[inline]
    fn atom(&self) -> &AtomicI32 {
        // SAFETY: `word` points at 4 aligned bytes that outlive `self`
        // (page-aligned mapping start, or a leaked box).
        unsafe { AtomicI32::from_ptr(self.word) }
    }

    /// The hot-path read: one relaxed load, no synchronization beyond the
    /// natural atomicity of an aligned word.
    #[inline]
    pub fn state(&self) -> WatchState {
        if self.atom().load(Ordering::Relaxed) == WatchState::Watching as i32 {
            WatchState::Watching
        } else {
            WatchState::NotWatching
        }
    }

    pub fn set(&self, state: WatchState) {
        self.atom().store(state as i32, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_switch_starts_not_watching() {
        let switch = WatchSwitch::detached();
        assert_eq!(switch.state(), WatchState::NotWatching);
        switch.set(WatchState::Watching);
        assert_eq!(switch.state(), WatchState::Watching);
    }

    #[test]
    fn file_backed_switch_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alloc-comm");

        let switch = WatchSwitch::open_or_create(&path).unwrap();
        assert_eq!(switch.state(), WatchState::NotWatching);
        switch.set(WatchState::Watching);
        assert_eq!(switch.state(), WatchState::Watching);
    }

    #[test]
    fn two_handles_observe_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alloc-comm");

        let process_side = WatchSwitch::open_or_create(&path).unwrap();
        let operator_side = WatchSwitch::open_existing(&path).unwrap();
        assert_eq!(operator_side.state(), WatchState::NotWatching);

        operator_side.set(WatchState::Watching);
        assert_eq!(process_side.state(), WatchState::Watching);
    }

    #[test]
    fn open_existing_requires_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never-created");
        assert!(matches!(
            WatchSwitch::open_existing(&path),
            Err(SwitchError::Open { .. })
        ));
    }

    #[test]
    fn reopening_resets_to_not_watching() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alloc-comm");

        let first = WatchSwitch::open_or_create(&path).unwrap();
        first.set(WatchState::Watching);

        // A freshly instrumented process must never start half-enabled by a
        // stale file.
        let second = WatchSwitch::open_or_create(&path).unwrap();
        assert_eq!(second.state(), WatchState::NotWatching);
    }
}
