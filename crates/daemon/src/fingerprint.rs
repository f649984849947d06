//! Content fingerprinting for (source, template) pairs.
//!
//! A fingerprint is the SHA-256 of a length-prefixed encoding of every input
//! that affects the produced artifact. It is the only cache key and the only
//! mutual-exclusion token, so two different input sets must never encode to
//! the same byte stream.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Bumped whenever the encoding below changes.
const FINGERPRINT_DOMAIN: &[u8] = b"md2pdf/fingerprint/v1";

const TAG_NO_TEMPLATE: u8 = 0;
const TAG_TEMPLATE: u8 = 1;

/// Deterministic identity of one conversion input set, rendered as `sha256:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint of a source document, the active template
    /// (`None` when converting without one) and any extra output-affecting inputs.
    pub fn compute(source: &[u8], template: Option<&[u8]>, extra: &[&str]) -> Self {
        let mut h = Sha256::new();
        h.update(FINGERPRINT_DOMAIN);

        h.update((source.len() as u64).to_le_bytes());
        h.update(source);

        match template {
            Some(bytes) => {
                h.update([TAG_TEMPLATE]);
                h.update((bytes.len() as u64).to_le_bytes());
                h.update(bytes);
            }
            None => h.update([TAG_NO_TEMPLATE]),
        }

        h.update((extra.len() as u64).to_le_bytes());
        for input in extra {
            h.update((input.len() as u64).to_le_bytes());
            h.update(input.as_bytes());
        }

        Fingerprint(format!("sha256:{:x}", h.finalize()))
    }

    /// Parse a `sha256:<64 hex>` string, e.g. a cache file stem.
    pub fn parse(s: &str) -> Option<Self> {
        let hex = s.strip_prefix("sha256:")?;
        if hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            Some(Fingerprint(s.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hex digest without the algorithm prefix.
    pub fn hex(&self) -> &str {
        self.0.strip_prefix("sha256:").unwrap_or(&self.0)
    }

    /// First 12 hex digits, used in artifact and log file names.
    pub fn short(&self) -> &str {
        let hex = self.hex();
        &hex[..hex.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// SHA-256 of raw bytes in the same `sha256:<hex>` form, used for template
/// identity and artifact content ids.
pub fn sha256_tagged(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    format!("sha256:{:x}", h.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_fingerprint_is_deterministic(
            source in proptest::collection::vec(any::<u8>(), 0..512),
            template in proptest::option::of(proptest::collection::vec(any::<u8>(), 0..512)),
        ) {
            let a = Fingerprint::compute(&source, template.as_deref(), &["xelatex"]);
            let b = Fingerprint::compute(&source, template.as_deref(), &["xelatex"]);
            prop_assert_eq!(a, b);
        }

        #[test]
        fn prop_single_byte_change_in_source_changes_fingerprint(
            source in proptest::collection::vec(any::<u8>(), 1..512),
            template in proptest::collection::vec(any::<u8>(), 0..256),
            idx in any::<prop::sample::Index>(),
            delta in 1u8..=255,
        ) {
            let mut changed = source.clone();
            let i = idx.index(changed.len());
            changed[i] = changed[i].wrapping_add(delta);

            let a = Fingerprint::compute(&source, Some(&template), &[]);
            let b = Fingerprint::compute(&changed, Some(&template), &[]);
            prop_assert_ne!(a, b);
        }

        #[test]
        fn prop_single_byte_change_in_template_changes_fingerprint(
            source in proptest::collection::vec(any::<u8>(), 0..256),
            template in proptest::collection::vec(any::<u8>(), 1..512),
            idx in any::<prop::sample::Index>(),
            delta in 1u8..=255,
        ) {
            let mut changed = template.clone();
            let i = idx.index(changed.len());
            changed[i] = changed[i].wrapping_add(delta);

            let a = Fingerprint::compute(&source, Some(&template), &[]);
            let b = Fingerprint::compute(&source, Some(&changed), &[]);
            prop_assert_ne!(a, b);
        }

        #[test]
        fn prop_fingerprint_round_trips_through_parse(
            source in proptest::collection::vec(any::<u8>(), 0..128),
        ) {
            let fp = Fingerprint::compute(&source, None, &[]);
            prop_assert_eq!(Fingerprint::parse(fp.as_str()), Some(fp.clone()));
        }
    }

    #[test]
    fn test_absent_template_differs_from_empty_template() {
        let src = b"# Resume\n";
        let without = Fingerprint::compute(src, None, &[]);
        let empty = Fingerprint::compute(src, Some(b""), &[]);
        assert_ne!(without, empty);
    }

    #[test]
    fn test_boundary_between_source_and_template_is_unambiguous() {
        let a = Fingerprint::compute(b"ab", Some(b"c"), &[]);
        let b = Fingerprint::compute(b"a", Some(b"bc"), &[]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_extra_inputs_affect_fingerprint() {
        let a = Fingerprint::compute(b"doc", None, &["xelatex", "pdflatex"]);
        let b = Fingerprint::compute(b"doc", None, &["pdflatex", "xelatex"]);
        let c = Fingerprint::compute(b"doc", None, &["xelatexpdflatex"]);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_format_and_short_form() {
        let fp = Fingerprint::compute(b"doc", None, &[]);
        assert!(fp.as_str().starts_with("sha256:"));
        assert_eq!(fp.hex().len(), 64);
        assert_eq!(fp.short().len(), 12);
        assert!(fp.hex().starts_with(fp.short()));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Fingerprint::parse("md5:abcd").is_none());
        assert!(Fingerprint::parse("sha256:xyz").is_none());
        assert!(Fingerprint::parse(&format!("sha256:{}", "A".repeat(64))).is_none());
    }

    #[test]
    fn test_sha256_tagged_known_vector() {
        assert_eq!(
            sha256_tagged(b"abc"),
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
