//! Text decoding with a configurable encoding label.

use encoding_rs::{Encoding, UTF_8};

/// Decoded text plus any warning raised while decoding.
#[derive(Debug)]
pub struct Decoded {
    pub text: String,
    pub warning: Option<String>,
}

/// Decode `bytes` using the WHATWG encoding `label`.
///
/// A byte-order mark overrides the label. Unknown labels fall back to
/// UTF-8 with a warning; malformed sequences are replaced with U+FFFD.
/// `truncated` suppresses the malformed-input warning, since a prefix
/// cut can split a multi-byte character.
pub fn decode(bytes: &[u8], label: &str, truncated: bool) -> Decoded {
    let (encoding, mut warning) = match Encoding::for_label(label.trim().as_bytes()) {
        Some(encoding) => (encoding, None),
        None => (
            UTF_8,
            Some(format!("Unknown encoding '{label}', decoded as UTF-8")),
        ),
    };

    let (text, used, had_errors) = encoding.decode(bytes);
    if had_errors && !truncated && warning.is_none() {
        warning = Some(format!(
            "File contains bytes that are not valid {}; they were replaced",
            used.name()
        ));
    }

    Decoded {
        text: text.into_owned(),
        warning,
    }
}
