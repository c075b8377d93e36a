#[cfg(not(target_pointer_width = "64"))]
compile_error!("zonepool supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod zone;

// core types
pub use zone::chunk::ElementRef;
pub use zone::zone::{
    AllocError, AllocFlags, EntropySource, PressureRelief, Zone, ZoneConfig, ZoneFlags,
    ZoneSnapshot, ZoneTuning,
};

// registry / introspection
pub use zone::registry::{ZoneHandle, ZoneRegistry};

// collaborator interfaces
pub use zone::bitmap::{BitmapAllocator, BitmapPool, BitmapRef};
pub use zone::provider::{PageProvider, PlatformProvider, ZoneError};
