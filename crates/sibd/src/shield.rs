//! Brute-force shield: strikes per peer address, timed bans
//!
//! Strikes are forgotten once a peer stays quiet for the ban duration; every
//! call prunes such peers so the table only holds recent offenders.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use sib_core::config::ShieldConfig;
use sib_protocol::Shield;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug)]
struct Suspect {
    strikes: u32,
    last_strike: Instant,
    banned_until: Option<Instant>,
}

impl Suspect {
    fn is_stale(&self, now: Instant, window: Duration) -> bool {
        let banned = self.banned_until.is_some_and(|until| now < until);
        !banned && now.duration_since(self.last_strike) >= window
    }
}

#[derive(Debug)]
pub struct SuspectTracker {
    enabled: bool,
    max_suspicion: u32,
    ban: Duration,
    peers: Mutex<HashMap<IpAddr, Suspect>>,
}

impl SuspectTracker {
    pub fn new(config: &ShieldConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_suspicion: config.max_suspicion.max(1),
            ban: Duration::from_secs(config.ban_secs),
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// The peer table with stale entries removed.
    fn peers(&self, now: Instant) -> MutexGuard<'_, HashMap<IpAddr, Suspect>> {
        // A panic mid-update leaves at worst a stale strike count
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        let before = peers.len();
        peers.retain(|_, suspect| !suspect.is_stale(now, self.ban));
        if peers.len() < before {
            debug!(pruned = before - peers.len(), "forgot quiet peers");
        }
        peers
    }
}

impl Shield for SuspectTracker {
    fn add_suspect_ip(&self, ip: IpAddr) {
        if !self.enabled {
            return;
        }
        let now = Instant::now();
        let mut peers = self.peers(now);
        let suspect = peers.entry(ip).or_insert(Suspect {
            strikes: 0,
            last_strike: now,
            banned_until: None,
        });
        suspect.strikes += 1;
        suspect.last_strike = now;
        if suspect.strikes >= self.max_suspicion {
            suspect.strikes = 0;
            suspect.banned_until = Some(now + self.ban);
            warn!(peer = %ip, ban_secs = self.ban.as_secs(), "peer banned");
        }
    }

    fn is_banned(&self, ip: IpAddr) -> bool {
        if !self.enabled {
            return false;
        }
        let now = Instant::now();
        self.peers(now)
            .get(&ip)
            .and_then(|s| s.banned_until)
            .is_some_and(|until| now < until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 7));

    fn tracker(enabled: bool, max_suspicion: u32, ban_secs: u64) -> SuspectTracker {
        SuspectTracker::new(&ShieldConfig {
            enabled,
            max_suspicion,
            ban_secs,
        })
    }

    #[test]
    fn test_ban_after_threshold() {
        let shield = tracker(true, 3, 600);
        shield.add_suspect_ip(PEER);
        shield.add_suspect_ip(PEER);
        assert!(!shield.is_banned(PEER));
        shield.add_suspect_ip(PEER);
        assert!(shield.is_banned(PEER));
        assert!(!shield.is_banned(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)));
    }

    #[test]
    fn test_ban_expires() {
        let shield = tracker(true, 1, 0);
        shield.add_suspect_ip(PEER);
        assert!(!shield.is_banned(PEER));
        assert!(shield.peers(Instant::now()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_peers_are_forgotten() {
        let shield = tracker(true, 3, 60);
        shield.add_suspect_ip(PEER);
        assert_eq!(shield.peers(Instant::now()).len(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!shield.is_banned(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)));
        assert!(shield.peers.lock().unwrap().is_empty());

        // the old strike no longer counts towards a ban
        shield.add_suspect_ip(PEER);
        shield.add_suspect_ip(PEER);
        assert!(!shield.is_banned(PEER));
    }

    #[tokio::test(start_paused = true)]
    async fn test_banned_peer_kept_until_ban_ends() {
        let shield = tracker(true, 1, 60);
        shield.add_suspect_ip(PEER);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(shield.is_banned(PEER));
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!shield.is_banned(PEER));
        assert!(shield.peers.lock().unwrap().is_empty());
    }

    #[test]
    fn test_disabled_never_bans() {
        let shield = tracker(false, 1, 600);
        shield.add_suspect_ip(PEER);
        assert!(!shield.is_banned(PEER));
    }
}
