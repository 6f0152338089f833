use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::Sha512;

type HmacSha512 = Hmac<Sha512>;

/// Core event trait
#[async_trait]
pub trait Event: Send + Sync + Sized + Serialize + DeserializeOwned {
    /// Get the event topic/category (e.g., "task_started", "task_completed")
    fn topic(&self) -> &str;

    /// Convert event to a generic event
    fn to_generic_event(&self) -> GenericEvent {
        GenericEvent {
            topic: self.topic().to_string(),
            payload: serde_json::to_value(self).unwrap_or_default(),
        }
    }

    /// Create an event from a generic event
    fn from_generic_event(e: &GenericEvent) -> Result<Self, anyhow::Error> {
        let payload: Self = serde_json::from_value(e.payload.clone())?;
        Ok(payload)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenericEvent {
    pub topic: String,
    pub payload: serde_json::Value,
}

impl Event for GenericEvent {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn from_generic_event(e: &GenericEvent) -> Result<Self, anyhow::Error> {
        Ok(e.clone())
    }
}

/// Derive the unguessable per-submission topic name.
///
/// `sub_<16-hex HMAC-SHA512 prefix><8-hex id>`: the HMAC prefix keeps
/// subscribers from enumerating other users' submissions by incrementing an
/// id, while the trailing id keeps the topic name a function of the
/// submission rather than requiring a side lookup table.
pub fn submission_topic(event_secret: &[u8], submission_id: i64) -> String {
    let mut mac =
        HmacSha512::new_from_slice(event_secret).expect("HMAC accepts a key of any length");
    mac.update(&submission_id.to_be_bytes());
    let digest = mac.finalize().into_bytes();
    let prefix = hex::encode(&digest[..8]);
    format!("sub_{prefix}{:08x}", submission_id as u32)
}

/// The per-contest topic name.
pub fn contest_topic(contest_id: i64) -> String {
    format!("contest_{contest_id}")
}

/// The coarse, global topic that receives every submission's terminal state
/// change.
pub const GLOBAL_SUBMISSIONS_TOPIC: &str = "submissions";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_is_deterministic_and_unguessable_without_secret() {
        let a = submission_topic(b"secret-one", 42);
        let b = submission_topic(b"secret-one", 42);
        assert_eq!(a, b);
        assert!(a.starts_with("sub_"));
        assert!(a.ends_with("0000002a"));

        let c = submission_topic(b"secret-two", 42);
        assert_ne!(a, c, "different secrets must yield different topics");
    }
}
