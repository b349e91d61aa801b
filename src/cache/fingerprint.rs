//! Stable request fingerprints
//!
//! A fingerprint is the BLAKE3 digest of a canonical JSON document over the
//! fields that affect decoding determinism. Keys are emitted in sorted order
//! (serde_json object maps are ordered), so two requests that agree on these
//! fields always produce the same digest regardless of field order at the
//! call site. Fields outside this set never influence the fingerprint.

use serde_json::json;

/// The determinism-relevant subset of a generation request
#[derive(Debug, Clone, PartialEq)]
pub struct FingerprintInputs<'a> {
    pub prompt: &'a str,
    pub model_id: &'a str,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
}

/// Compute the hex fingerprint for a request
pub fn fingerprint(inputs: &FingerprintInputs<'_>) -> String {
    let canonical = json!({
        "max_tokens": inputs.max_tokens,
        "model_id": inputs.model_id,
        "prompt": inputs.prompt,
        "temperature": inputs.temperature,
        "top_k": inputs.top_k,
        "top_p": inputs.top_p,
    });
    // Object keys serialize sorted, so this string form is canonical.
    let encoded = canonical.to_string();
    blake3::hash(encoded.as_bytes()).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base<'a>() -> FingerprintInputs<'a> {
        FingerprintInputs {
            prompt: "Summarize.",
            model_id: "mA",
            max_tokens: 64,
            temperature: 0.0,
            top_p: 1.0,
            top_k: 0,
        }
    }

    #[test]
    fn test_identical_inputs_identical_fingerprints() {
        assert_eq!(fingerprint(&base()), fingerprint(&base()));
    }

    #[test]
    fn test_each_field_changes_fingerprint() {
        let reference = fingerprint(&base());

        let mut changed = base();
        changed.prompt = "Summarize!";
        assert_ne!(fingerprint(&changed), reference);

        let mut changed = base();
        changed.model_id = "mB";
        assert_ne!(fingerprint(&changed), reference);

        let mut changed = base();
        changed.max_tokens = 65;
        assert_ne!(fingerprint(&changed), reference);

        let mut changed = base();
        changed.temperature = 0.5;
        assert_ne!(fingerprint(&changed), reference);

        let mut changed = base();
        changed.top_p = 0.9;
        assert_ne!(fingerprint(&changed), reference);

        let mut changed = base();
        changed.top_k = 40;
        assert_ne!(fingerprint(&changed), reference);
    }

    #[test]
    fn test_digest_is_256_bit_hex() {
        assert_eq!(fingerprint(&base()).len(), 64);
    }
}
