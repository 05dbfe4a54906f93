//! Rotating topic derivation. All peers sharing the room secret agree
//! on the gossip topic for any instant inside a window; the swarm loop
//! re-checks once a second and re-subscribes on a boundary.
//!
//! Rotating the channel *identifier* rather than just the key bounds
//! the exposure of any single leaked window.

use edgevpn_crypto::{md5_hex, otp};

/// Derives the private and public topic names for the room secret.
#[derive(Debug, Clone)]
pub struct TopicSchedule {
    room: String,
    key_length: usize,
    interval: u64,
}

impl TopicSchedule {
    pub fn new(room: impl Into<String>, key_length: usize, interval: u64) -> TopicSchedule {
        TopicSchedule {
            room: room.into(),
            key_length,
            interval,
        }
    }

    /// Private (sealed) channel topic at an explicit unix time.
    pub fn private_topic_at(&self, unix_time: u64) -> String {
        md5_hex(&self.totp_at(unix_time))
    }

    /// Public (cleartext) channel topic at an explicit unix time.
    pub fn public_topic_at(&self, unix_time: u64) -> String {
        md5_hex(&format!("{}public", self.totp_at(unix_time)))
    }

    /// Private topic for the current window.
    pub fn private_topic(&self) -> String {
        md5_hex(&otp::totp_now(&self.room, self.key_length, self.interval))
    }

    /// Public topic for the current window.
    pub fn public_topic(&self) -> String {
        md5_hex(&format!(
            "{}public",
            otp::totp_now(&self.room, self.key_length, self.interval)
        ))
    }

    fn totp_at(&self, unix_time: u64) -> String {
        otp::totp(&self.room, self.key_length, self.interval, unix_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peers_sharing_the_secret_agree() {
        let a = TopicSchedule::new("room-secret", 43, 9000);
        let b = TopicSchedule::new("room-secret", 43, 9000);
        let t = 1_700_000_123;
        assert_eq!(a.private_topic_at(t), b.private_topic_at(t));
        assert_eq!(a.public_topic_at(t), b.public_topic_at(t));
    }

    #[test]
    fn topics_change_exactly_on_the_window_boundary() {
        let s = TopicSchedule::new("room-secret", 43, 9000);
        let window_start = 1_700_000_000 - 1_700_000_000 % 9000;
        assert_eq!(
            s.private_topic_at(window_start),
            s.private_topic_at(window_start + 8999)
        );
        assert_ne!(
            s.private_topic_at(window_start),
            s.private_topic_at(window_start + 9000)
        );
    }

    #[test]
    fn public_and_private_topics_differ() {
        let s = TopicSchedule::new("room-secret", 43, 9000);
        assert_ne!(s.private_topic_at(0), s.public_topic_at(0));
    }

    #[test]
    fn different_rooms_never_collide() {
        let a = TopicSchedule::new("room-a", 43, 9000);
        let b = TopicSchedule::new("room-b", 43, 9000);
        assert_ne!(a.private_topic_at(0), b.private_topic_at(0));
    }

    #[test]
    fn topic_is_a_hex_md5() {
        let s = TopicSchedule::new("room", 43, 9000);
        let topic = s.private_topic_at(1);
        assert_eq!(topic.len(), 32);
        assert!(topic.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
