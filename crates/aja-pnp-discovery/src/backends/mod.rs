//! Hot-plug backends

#[cfg(unix)]
pub mod devfs;
pub mod simulated;

#[cfg(unix)]
pub use devfs::DevfsBackend;
pub use simulated::SimulatedBus;
