//! Translation of a guest GPU's 3D engine register state into host
//! graphics API state.
//!
//! One [`state::StateUpdater`] exists per GPU channel. The command
//! processor writes the register bank ([`regs::ThreedRegisters`]) and marks
//! the written words dirty; the draw dispatcher runs
//! [`state::StateUpdater::update_state`] at the top of every draw, which
//! flushes exactly the state that changed to the host through the
//! [`host`] collaborator traits.

#![deny(unused_crate_dependencies)]

pub mod dirty;
pub mod host;
pub mod pipeline;
pub mod regs;
pub mod shader;
pub mod state;

pub use state::{DrawParams, GroupId, StateUpdater, ALL_GROUPS};

/// Capabilities and policies of the host API family the channel renders
/// through. Mirrors what the device layer reports at startup.
#[derive(Copy, Clone, Debug)]
pub struct HostFeatures {
    /// The host honors per-viewport swizzles. Without it a negative-Y
    /// swizzle has to be folded into the viewport transform.
    pub supports_viewport_swizzle: bool,
    /// Primitive restart may stay enabled during non-indexed draws. Hosts
    /// without this need the restart enable recomputed whenever a draw
    /// switches between indexed and non-indexed.
    pub supports_non_indexed_primitive_restart: bool,
}

impl Default for HostFeatures {
    fn default() -> Self {
        Self {
            supports_viewport_swizzle: true,
            supports_non_indexed_primitive_restart: true,
        }
    }
}
