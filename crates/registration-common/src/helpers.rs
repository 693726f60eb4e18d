//! Small shared helpers: URL validation, label diffing, lease freshness

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::coordination::v1::Lease;
use url::Url;

use crate::LEASE_GRACE_MULTIPLIER;

/// Whether a client-config URL is a parseable https:// URL with a host
pub fn is_valid_https_url(raw: &str) -> bool {
    match Url::parse(raw) {
        Ok(url) => url.scheme() == "https" && url.has_host(),
        Err(_) => false,
    }
}

/// Diff two label maps, returning (deleted, added).
///
/// A value change counts as delete-then-add, matching how label permission
/// checks treat the old and new bindings as separate grants.
pub fn diff_labels(
    old: &BTreeMap<String, String>,
    new: &BTreeMap<String, String>,
) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let mut deleted = BTreeMap::new();
    for (k, v) in old {
        if new.get(k) != Some(v) {
            deleted.insert(k.clone(), v.clone());
        }
    }
    let mut added = BTreeMap::new();
    for (k, v) in new {
        if old.get(k) != Some(v) {
            added.insert(k.clone(), v.clone());
        }
    }
    (deleted, added)
}

/// Whether a lease is still fresh at `now`.
///
/// A lease is fresh while `now < renewTime + grace` where
/// `grace = 5 × lease_duration_seconds`. A lease without a renew time is
/// treated as stale. Clock skew between writer and evaluator is absorbed by
/// the 5× grace.
pub fn is_lease_fresh(lease: &Lease, lease_duration_seconds: i32, now: DateTime<Utc>) -> bool {
    let renew_time = match lease.spec.as_ref().and_then(|s| s.renew_time.as_ref()) {
        Some(t) => t.0,
        None => return false,
    };
    let grace = Duration::seconds((LEASE_GRACE_MULTIPLIER * lease_duration_seconds).into());
    now < renew_time + grace
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::coordination::v1::LeaseSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;

    fn lease_renewed_at(renew: DateTime<Utc>) -> Lease {
        Lease {
            spec: Some(LeaseSpec {
                renew_time: Some(MicroTime(renew)),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn https_urls() {
        assert!(is_valid_https_url("https://detached:6443"));
        assert!(is_valid_https_url("https://api.cluster.example.com:6443/path"));
        assert!(!is_valid_https_url("http://insecure:6443"));
        assert!(!is_valid_https_url("detached:6443"));
        assert!(!is_valid_https_url("https://"));
        assert!(!is_valid_https_url(""));
    }

    #[test]
    fn lease_fresh_within_grace() {
        let now = Utc::now();
        let lease = lease_renewed_at(now - Duration::seconds(299));
        assert!(is_lease_fresh(&lease, 60, now));
    }

    #[test]
    fn lease_stale_at_grace_boundary() {
        let now = Utc::now();
        // grace is 5 × 60 s; a renewal exactly 300 s ago is expired
        let lease = lease_renewed_at(now - Duration::seconds(300));
        assert!(!is_lease_fresh(&lease, 60, now));
    }

    #[test]
    fn lease_without_renew_time_is_stale() {
        let lease = Lease::default();
        assert!(!is_lease_fresh(&lease, 60, Utc::now()));
    }

    #[test]
    fn lease_grace_scales_with_duration() {
        let now = Utc::now();
        let lease = lease_renewed_at(now - Duration::seconds(400));
        assert!(!is_lease_fresh(&lease, 60, now));
        assert!(is_lease_fresh(&lease, 120, now));
    }

    #[test]
    fn label_diff_classifies_changes() {
        let mut old = BTreeMap::new();
        old.insert("keep".to_string(), "same".to_string());
        old.insert("drop".to_string(), "gone".to_string());
        old.insert("flip".to_string(), "v1".to_string());

        let mut new = BTreeMap::new();
        new.insert("keep".to_string(), "same".to_string());
        new.insert("flip".to_string(), "v2".to_string());
        new.insert("add".to_string(), "fresh".to_string());

        let (deleted, added) = diff_labels(&old, &new);
        assert_eq!(deleted.get("drop").map(String::as_str), Some("gone"));
        assert_eq!(deleted.get("flip").map(String::as_str), Some("v1"));
        assert!(!deleted.contains_key("keep"));
        assert_eq!(added.get("add").map(String::as_str), Some("fresh"));
        assert_eq!(added.get("flip").map(String::as_str), Some("v2"));
        assert!(!added.contains_key("keep"));
    }

    #[test]
    fn label_diff_with_empty_sides() {
        let labels: BTreeMap<String, String> =
            [("a".to_string(), "1".to_string())].into_iter().collect();
        let (deleted, added) = diff_labels(&BTreeMap::new(), &labels);
        assert!(deleted.is_empty());
        assert_eq!(added.len(), 1);

        let (deleted, added) = diff_labels(&labels, &BTreeMap::new());
        assert_eq!(deleted.len(), 1);
        assert!(added.is_empty());
    }
}
