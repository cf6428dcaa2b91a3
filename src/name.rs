// SPDX-License-Identifier: MIT
//
// POSIX-safe forms of caller-supplied global object names.
//
// Callers' names are passed through otherwise unmodified; the only
// transformations are the leading '/' that shm_open requires and, where
// the platform enforces a short name limit, hash-based shortening.

/// FNV-1a 64-bit hash, used to shorten over-long names deterministically.
pub(crate) fn fnv1a(data: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in data {
        h ^= b as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

/// macOS caps POSIX shm names at `PSHMNAMLEN` (31 bytes including the
/// leading '/'). Other Unixes allow at least NAME_MAX; no shortening there.
#[cfg(target_os = "macos")]
const NAME_MAX: usize = 31;

#[cfg(not(target_os = "macos"))]
const NAME_MAX: usize = 0; // 0 = unlimited

/// Produce the shm-namespace form of `name`: a leading '/', and on
/// platforms with a short name limit, `/<prefix>_<16-hex-hash>` where the
/// prefix keeps the head of the original name for debuggability.
pub(crate) fn shm_form(name: &str) -> String {
    let full = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };

    if NAME_MAX == 0 || full.len() <= NAME_MAX {
        return full;
    }

    const SUFFIX: usize = 1 + 16; // '_' + 16 hex digits
    let keep = NAME_MAX.saturating_sub(SUFFIX + 1); // -1 for the leading '/'
    let body = &full[1..];

    let mut short = String::with_capacity(NAME_MAX);
    short.push('/');
    short.push_str(&body[..keep.min(body.len())]);
    short.push('_');
    short.push_str(&format!("{:016x}", fnv1a(full.as_bytes())));
    short
}
