//! Brute-force shield boundary
//!
//! The server records a strike against a peer for identity mismatches and for
//! attempts to guess which accounts exist during LOGIN/CREATION. What a strike
//! leads to is up to the implementation (`sibd` bans after a threshold).

use std::net::IpAddr;

pub trait Shield: Send + Sync {
    fn add_suspect_ip(&self, ip: IpAddr);
    fn is_banned(&self, ip: IpAddr) -> bool;
}

/// Shield that never bans anybody.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoShield;

impl Shield for NoShield {
    fn add_suspect_ip(&self, _ip: IpAddr) {}

    fn is_banned(&self, _ip: IpAddr) -> bool {
        false
    }
}
