//! `netstate_shared`
//!
//! Libraries used by both client and server.
//!
//! Design goals:
//! - Deterministic simulation so both peers reproduce the same state from the
//!   same commands.
//! - The prediction and authority machinery only knows the
//!   [`system::NetworkedStateSystem`] trait; concrete state lives behind it.
//! - Network receive never touches simulation state directly (see [`inbox`]).
//! - No `unsafe`.

pub mod config;
pub mod event;
pub mod history;
pub mod inbox;
pub mod input;
pub mod math;
pub mod move_state;
pub mod movement;
pub mod net;
pub mod physics;
pub mod state;
pub mod system;
pub mod wire;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::event::*;
    pub use crate::history::*;
    pub use crate::inbox::*;
    pub use crate::input::*;
    pub use crate::math::*;
    pub use crate::move_state::*;
    pub use crate::movement::*;
    pub use crate::net::*;
    pub use crate::physics::*;
    pub use crate::state::*;
    pub use crate::system::*;
    pub use crate::wire::*;
}
