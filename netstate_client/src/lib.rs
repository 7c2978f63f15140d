//! `netstate_client`
//!
//! Client-side systems:
//! - Connection management (reliable + unreliable channels)
//! - Input sampling and command generation
//! - Prediction and reconciliation of the owned entity
//! - Interpolation of observed entities

pub mod client;
pub mod input;
pub mod interp;
pub mod predict;

pub use client::GameClient;
pub use interp::Interpolator;
pub use predict::{PredictionController, Reconciliation};
