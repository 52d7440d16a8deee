pub mod shutdown;

use std::{
    hash::{Hash, Hasher},
    time::Duration,
};

use k8s_openapi::jiff::Timestamp;
use kube::api::ObjectMeta;

/// Whether a kube API error is an HTTP 404.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

/// Whether a kube API error is an HTTP 409 caused by a stale resource
/// version or a name collision.
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 409)
}

/// Hashes any hashable value into the fingerprint used by watch triggers
/// to suppress events that carry no relevant change.
pub fn fingerprint<H: Hash>(value: &H) -> u64 {
    let mut hasher = std::hash::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Age of an object, measured from its creation timestamp.
///
/// Objects without a creation timestamp (not yet persisted) and clock skew
/// into the future both report a zero age.
pub fn object_age(metadata: &ObjectMeta) -> Duration {
    metadata
        .creation_timestamp
        .as_ref()
        .map(|created| Timestamp::now().duration_since(created.0))
        .and_then(|age| Duration::try_from(age).ok())
        .unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use super::*;

    #[test]
    fn fingerprint_is_stable() {
        assert_eq!(fingerprint(&(1, "a")), fingerprint(&(1, "a")));
        assert_ne!(fingerprint(&(1, "a")), fingerprint(&(2, "a")));
    }

    #[test]
    fn age_of_unpersisted_object_is_zero() {
        assert_eq!(object_age(&ObjectMeta::default()), Duration::ZERO);
    }

    #[test]
    fn age_of_old_object_is_positive() {
        let metadata = ObjectMeta {
            creation_timestamp: Some(Time(Timestamp::UNIX_EPOCH)),
            ..ObjectMeta::default()
        };

        assert!(object_age(&metadata) > Duration::from_secs(60));
    }

    #[test]
    fn future_creation_timestamp_reports_zero_age() {
        let future = Timestamp::now()
            .checked_add(k8s_openapi::jiff::SignedDuration::from_secs(3600))
            .expect("timestamp arithmetic");
        let metadata = ObjectMeta {
            creation_timestamp: Some(Time(future)),
            ..ObjectMeta::default()
        };

        assert_eq!(object_age(&metadata), Duration::ZERO);
    }
}
