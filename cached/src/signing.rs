//! Idempotent narinfo signing.
//!
//! Re-signing a narinfo we've already signed must not accumulate
//! duplicate signatures under our own key name: `sign` always removes any
//! existing entry carrying our key name before appending the fresh one,
//! so repeated calls (e.g. after a compression-normalization pass) leave
//! exactly one signature of ours in the list.

use common::signing::NixKeypair;

/// Appends our signature over `fingerprint` to `signatures`, removing any
/// prior signature under our own key name first.
pub fn sign(signatures: &mut Vec<String>, fingerprint: &[u8], keypair: &NixKeypair) {
    let our_name = keypair.name();
    signatures.retain(|sig| key_name(sig) != Some(our_name));
    signatures.push(keypair.sign(fingerprint));
}

fn key_name(signature: &str) -> Option<&str> {
    signature.split_once(':').map(|(name, _)| name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::signing::NixKeypair;

    #[test]
    fn test_sign_is_idempotent() {
        let keypair = NixKeypair::generate("test-1").unwrap();
        let mut signatures = vec!["other-1:deadbeef==".to_string()];

        sign(&mut signatures, b"fingerprint", &keypair);
        assert_eq!(signatures.len(), 2);

        let first_ours = signatures[1].clone();
        sign(&mut signatures, b"fingerprint", &keypair);

        assert_eq!(signatures.len(), 2, "re-signing must not duplicate our entry");
        assert_eq!(signatures[1], first_ours);
        assert_eq!(signatures[0], "other-1:deadbeef==");
    }
}
