pub mod backup;
pub mod common;
pub mod config_map;
pub mod pdb;
pub mod secret;
pub mod service;
pub mod statefulset;

pub use common::{FIELD_MANAGER, owner_reference, standard_labels};
