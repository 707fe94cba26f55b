use std::sync::LazyLock;

use aho_corasick::AhoCorasick;

use crate::error::{Error, Result};

pub struct Signature {
    pub name: &'static str,
    pub pattern: &'static [u8],
}

pub const SIGNATURES: &[Signature] = &[Signature {
    name: "EICAR-Test-File",
    pattern: b"X5O!P%@AP[4\\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*",
}];

static MATCHER: LazyLock<Option<AhoCorasick>> = LazyLock::new(|| {
    AhoCorasick::new(SIGNATURES.iter().map(|signature| signature.pattern)).ok()
});

/// Reject content containing any known malicious signature.
pub fn scan(content: &[u8]) -> Result<()> {
    let Some(matcher) = MATCHER.as_ref() else {
        return Err(Error::unknown("content scan", "signature matcher failed to build"));
    };
    match matcher.find(content) {
        Some(found) => Err(Error::SecurityThreat(
            SIGNATURES[found.pattern().as_usize()].name.to_string(),
        )),
        None => Ok(()),
    }
}
