//! Worker hierarchy: the static role catalog and the identity codec that
//! encodes a worker's tree position into its folder name.

pub mod catalog;
pub mod identity;

pub use identity::{AgentIdentity, MAX_FAN_OUT, MAX_UID, NAME_PREFIX};
pub use identity::{ceo_in_path, deepest_in_path, scan_path};
