use super::*;

use crate::error::AtticError;

const BLOB: &[u8] = b"the quick brown fox jumps over the lazy dog";

#[test]
fn test_basic() {
    let hash = Hash::sha256_from_bytes(BLOB);

    let expected_base16 = "sha256:05c6e08f1d9fdafa03147fcb8f82f124c76d2f70e3d989dc8aadb5e7d7450bec";
    assert_eq!(expected_base16, hash.to_typed_base16());

    let expected_base32 = "sha256:1v0b8pbygdddibf8kng3f0pnvir4y618zjvz2h1zmnlz3n7y1ih5";
    assert_eq!(expected_base32, hash.to_typed_base32());
}

#[test]
fn test_from_typed() {
    let base16 = "sha256:baeabdb75c223d171800c17b05c5e7e8e9980723a90eb6ffcc632a305afc5a42";
    let base32 = "sha256:0hjszid30ak3rkzvc3m94c3risg8wz2hayy100c1fg92bjvvvsms";

    assert_eq!(
        Hash::from_typed(base16).unwrap(),
        Hash::from_typed(base32).unwrap()
    );

    assert!(matches!(
        Hash::from_typed("sha256"),
        Err(AtticError::HashError(Error::NoColonSeparator))
    ));

    assert!(matches!(
        Hash::from_typed("sha256:"),
        Err(AtticError::HashError(Error::InvalidHashStringLength { .. }))
    ));

    assert!(matches!(
        Hash::from_typed("sha256:eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee"),
        Err(AtticError::HashError(Error::InvalidBase32Hash))
    ));

    assert!(matches!(
        Hash::from_typed("sha256:gggggggggggggggggggggggggggggggggggggggggggggggggggggggggggggggg"),
        Err(AtticError::HashError(Error::InvalidBase16Hash(_)))
    ));

    assert!(matches!(
        Hash::from_typed("md5:invalid"),
        Err(AtticError::HashError(Error::UnsupportedHashAlgorithm(alg))) if alg == "md5"
    ));
}
