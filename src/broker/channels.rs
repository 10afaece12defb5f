//! The closed channel set from §4.1. Kept as named constants rather than
//! free-form strings so a typo fails to compile instead of silently
//! opening a new, unlisted channel.

pub const RADAR: &str = "traffic:radar";
pub const CAMERA: &str = "traffic:camera";
pub const CONSOLIDATED: &str = "traffic:consolidated";
pub const PERSISTED: &str = "traffic:persisted";
pub const ALERT: &str = "traffic:alert";

pub const ALL: &[&str] = &[RADAR, CAMERA, CONSOLIDATED, PERSISTED, ALERT];
