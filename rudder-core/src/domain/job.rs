//! Job domain types
//!
//! A job is one ephemeral Pod run. Every resource belonging to a run is
//! correlated through its [`JobId`].

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Characters a job id is drawn from
pub const JOB_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Length of every job id
pub const JOB_ID_LEN: usize = 8;

/// Label key carried by every Pod of a job run
pub const LABEL_JOB_ID: &str = "job-id";

/// Longest Kubernetes object name that is also a DNS-1123 label
pub const DNS_LABEL_MAX_LEN: usize = 63;

/// Longest job name whose `{name}-{id}` Pod name is still a DNS-1123 label
pub const MAX_JOB_NAME_LEN: usize = DNS_LABEL_MAX_LEN - 1 - JOB_ID_LEN;

/// Short identifier correlating all resources of one job run
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(String);

impl JobId {
    /// Wraps an existing id, checking length and alphabet
    pub fn parse(value: &str) -> Option<Self> {
        let valid = value.len() == JOB_ID_LEN && value.bytes().all(|b| JOB_ID_ALPHABET.contains(&b));
        valid.then(|| Self(value.to_string()))
    }

    /// Encodes the low bits of `value` as a fixed-width base-36 id
    fn from_bits(mut value: u64) -> Self {
        let base = JOB_ID_ALPHABET.len() as u64;
        let mut buf = [0u8; JOB_ID_LEN];
        for slot in buf.iter_mut().rev() {
            *slot = JOB_ID_ALPHABET[(value % base) as usize];
            value /= base;
        }
        Self(buf.iter().map(|&b| b as char).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `job-id=<id>` selector matching every Pod of this run
    pub fn label_selector(&self) -> String {
        format!("{}={}", LABEL_JOB_ID, self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source of fresh job ids
pub trait JobIdSource: Send + Sync {
    fn next_id(&self) -> JobId;
}

/// Entropy-seeded generator mixed with a process-wide counter
///
/// The generator is seeded once; the counter guarantees two ids drawn in the
/// same process never repeat within the 36^8 id space.
pub struct RandomJobIds {
    rng: Mutex<StdRng>,
    counter: AtomicU64,
    offset: u64,
}

impl RandomJobIds {
    pub fn new() -> Self {
        let mut rng = StdRng::from_entropy();
        let offset = rng.r#gen::<u64>();
        Self {
            rng: Mutex::new(rng),
            counter: AtomicU64::new(0),
            offset,
        }
    }
}

impl Default for RandomJobIds {
    fn default() -> Self {
        Self::new()
    }
}

impl JobIdSource for RandomJobIds {
    fn next_id(&self) -> JobId {
        const SPACE: u64 = 36u64.pow(JOB_ID_LEN as u32);
        // Odd multiplier coprime with 36^8 keeps the counter walk a permutation.
        const STRIDE: u64 = 1_911_007_081;

        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let jitter = match self.rng.lock() {
            Ok(mut rng) => rng.gen_range(0..36u64),
            Err(poisoned) => poisoned.into_inner().gen_range(0..36u64),
        };
        let modulus = u128::from(SPACE / 36);
        let walk = (u128::from(self.offset) % modulus + u128::from(n) * u128::from(STRIDE))
            % modulus;
        JobId::from_bits(walk as u64 * 36 + jitter)
    }
}

/// Deterministic ids for tests and dry runs: `job00000`, `job00001`, ...
pub struct SequenceJobIds {
    prefix: String,
    counter: AtomicU64,
}

impl SequenceJobIds {
    pub fn new(prefix: &str) -> Self {
        debug_assert!(
            prefix.len() < JOB_ID_LEN,
            "prefix '{}' leaves no room for the sequence number",
            prefix
        );
        debug_assert!(
            prefix.bytes().all(|b| JOB_ID_ALPHABET.contains(&b)),
            "prefix '{}' has characters outside the job id alphabet",
            prefix
        );
        Self {
            prefix: prefix.to_string(),
            counter: AtomicU64::new(0),
        }
    }
}

impl JobIdSource for SequenceJobIds {
    fn next_id(&self) -> JobId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let width = JOB_ID_LEN.saturating_sub(self.prefix.len());
        let id = format!("{}{:0width$}", self.prefix, n, width = width);
        JobId(id.chars().take(JOB_ID_LEN).collect())
    }
}

/// Object-store key of a job's artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactKey {
    pub job_name: String,
    pub job_id: String,
}

impl ArtifactKey {
    pub fn new(job_name: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            job_id: job_id.into(),
        }
    }

    /// `{name}-{id}.tar`, written by the sidecar after a successful build
    pub fn archive(&self) -> String {
        format!("{}-{}.tar", self.job_name, self.job_id)
    }

    /// `{name}-{id}`, the bare key read by `download-artifacts`
    pub fn bare(&self) -> String {
        format!("{}-{}", self.job_name, self.job_id)
    }
}

/// Name of a job Pod: `{name}-{id}`
pub fn pod_name(job_name: &str, job_id: &JobId) -> String {
    format!("{}-{}", job_name, job_id)
}

/// Whether `value` is a DNS-1123 label: lowercase alphanumerics and `-`,
/// starting and ending with an alphanumeric, at most 63 characters
pub fn is_dns_label(value: &str) -> bool {
    let bytes = value.as_bytes();
    let edge = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    !bytes.is_empty()
        && bytes.len() <= DNS_LABEL_MAX_LEN
        && bytes.first().is_some_and(edge)
        && bytes.last().is_some_and(edge)
        && bytes.iter().all(|b| edge(b) || *b == b'-')
}

/// Lowercases `value` and replaces every other character outside `[a-z0-9-]` with `-`
pub fn dns_label(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '-',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn is_valid(id: &JobId) -> bool {
        id.as_str().len() == JOB_ID_LEN
            && id
                .as_str()
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
    }

    #[test]
    fn test_random_ids_are_well_formed() {
        let ids = RandomJobIds::new();
        for _ in 0..2_000 {
            let id = ids.next_id();
            assert!(is_valid(&id), "bad id {}", id);
        }
    }

    #[test]
    fn test_random_ids_do_not_repeat() {
        let ids = RandomJobIds::new();
        let seen: HashSet<_> = (0..5_000).map(|_| ids.next_id()).collect();
        assert_eq!(seen.len(), 5_000);
    }

    #[test]
    fn test_sequence_ids() {
        let ids = SequenceJobIds::new("job");
        assert_eq!(ids.next_id().as_str(), "job00000");
        assert_eq!(ids.next_id().as_str(), "job00001");
        assert!(is_valid(&ids.next_id()));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "outside the job id alphabet")]
    fn test_sequence_prefix_must_use_id_alphabet() {
        SequenceJobIds::new("Job_");
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "no room")]
    fn test_sequence_prefix_must_leave_room() {
        SequenceJobIds::new("jobjobjob");
    }

    #[test]
    fn test_dns_labels() {
        assert!(is_dns_label("svc-abcd1234"));
        assert!(is_dns_label("a"));
        assert!(!is_dns_label("My_Service-abcd1234"));
        assert!(!is_dns_label("svc.api-abcd1234"));
        assert!(!is_dns_label("-svc"));
        assert!(!is_dns_label("svc-"));
        assert!(!is_dns_label(""));
        assert!(!is_dns_label(&"a".repeat(64)));

        assert_eq!(dns_label("Octo"), "octo");
        assert_eq!(dns_label("dns.zones_v2"), "dns-zones-v2");
    }

    #[test]
    fn test_longest_job_name_fits_a_pod_name() {
        let id = JobId::parse("abcd1234").unwrap();
        let name = "a".repeat(MAX_JOB_NAME_LEN);
        assert!(is_dns_label(&pod_name(&name, &id)));
        assert!(!is_dns_label(&pod_name(&format!("{}a", name), &id)));
    }

    #[test]
    fn test_parse() {
        assert!(JobId::parse("abc12345").is_some());
        assert!(JobId::parse("ABC12345").is_none());
        assert!(JobId::parse("abc1234").is_none());
        assert!(JobId::parse("abc-2345").is_none());
    }

    #[test]
    fn test_artifact_keys() {
        let key = ArtifactKey::new("svc", "abcd1234");
        assert_eq!(key.archive(), "svc-abcd1234.tar");
        assert_eq!(key.bare(), "svc-abcd1234");
    }

    #[test]
    fn test_label_selector_and_pod_name() {
        let id = JobId::parse("abcd1234").unwrap();
        assert_eq!(id.label_selector(), "job-id=abcd1234");
        assert_eq!(pod_name("svc", &id), "svc-abcd1234");
    }
}
