//! Wire-level tracing, gated on the `IPMI_DEBUG` environment variable.

use std::fmt::Write as _;

pub(crate) fn enabled() -> bool {
    std::env::var_os("IPMI_DEBUG").is_some_and(|v| !v.is_empty())
}

/// Hex-dump one datagram. `label` names the transport and direction
/// ("lan send", "lanplus recv", ...).
pub(crate) fn dump_hex(label: &str, bytes: &[u8]) {
    if !enabled() {
        return;
    }

    let mut out = format!("{label} [{} bytes]", bytes.len());
    for chunk in bytes.chunks(16) {
        out.push_str("\n   ");
        for b in chunk {
            let _ = write!(out, " {b:02x}");
        }
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("{out}");

    #[cfg(not(feature = "tracing"))]
    eprintln!("{out}");
}
