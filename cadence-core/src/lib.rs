//! # Cadence Core
//!
//! Media playback synchronization engine: serial-stamped queues,
//! drift-corrected clocks, and the render/refresh drivers that present
//! independently decoded audio and video at the right wall-clock moment.

// ============================================================================
// Timing
// ============================================================================
pub mod clock;

// ============================================================================
// Queues
// ============================================================================
pub mod frame;
pub mod packet;

// ============================================================================
// Drivers
// ============================================================================
pub mod audio;
pub mod decoder;
pub mod reader;
pub mod video;

// ============================================================================
// Session
// ============================================================================
pub mod session;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
