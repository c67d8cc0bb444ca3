//! API handlers module

pub mod bundles;
pub mod health;
pub mod sessions;
pub mod upload;
