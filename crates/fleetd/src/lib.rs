//! fleetd internals: control-plane assembly and the in-process simulated
//! collaborators it runs against.

pub mod control_plane;
pub mod sim;

pub use control_plane::ControlPlane;
