//! Transition labels bound into challenges
//!
//! Each label names exactly one protocol transition, so a challenge computed
//! for one operation can never authorize another.

/// Session challenge answered at the end of the handshake
pub const HANDSHAKE: &str = "S1.13";

pub const LOGIN: &str = "S21.7";
pub const CREATION: &str = "S22.7";
pub const DELETION: &str = "S23.7";
pub const CONFIGURATION: &str = "S24.7";
pub const EXPORTATION: &str = "S25.7";
pub const SEARCHDATA: &str = "S26.7";
pub const ADDDATA: &str = "S27.7";
pub const UPDATEDATA: &str = "S28.7";
pub const DELETEDATA: &str = "S29.7";
