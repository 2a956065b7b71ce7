//! Protocol version negotiation.
//!
//! The controller proposes the highest version it speaks; the test host answers
//! with the version both sides will use for the rest of the connection.

use crate::codec::CodecError;

/// Highest protocol version this implementation speaks.
pub const HIGHEST_SUPPORTED_VERSION: u32 = 5;

/// First version whose peers understand `AttachDebugger`.
pub const ATTACH_DEBUGGER_MIN_VERSION: u32 = 5;

/// Setting this to `1` or `true` keeps a negotiated version 3 instead of
/// remapping it to 2.
pub const DISABLE_DOWNGRADE_ENV: &str = "TESTPLANE_DISABLE_PROTOCOL_3_VERSION_DOWNGRADE";

/// Version 3 payload serialization is markedly slower than version 2 on the
/// peer side, so a negotiated 3 is served as 2 unless explicitly disabled.
const SLOW_VERSION: u32 = 3;
const SLOW_VERSION_REPLACEMENT: u32 = 2;

/// Compute the version to use for a connection.
pub fn negotiate_version(
    proposed: u32,
    highest_supported: u32,
    downgrade_disabled: bool,
) -> Result<u32, CodecError> {
    if proposed == 0 {
        return Err(CodecError::InvalidVersion(proposed));
    }

    let version = proposed.min(highest_supported);
    if version == SLOW_VERSION && !downgrade_disabled {
        return Ok(SLOW_VERSION_REPLACEMENT);
    }
    Ok(version)
}

/// Read the downgrade override from the process environment.
pub fn downgrade_disabled_from_env() -> bool {
    std::env::var(DISABLE_DOWNGRADE_ENV)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highest_matches_highest() {
        assert_eq!(negotiate_version(5, 5, false).unwrap(), 5);
    }

    #[test]
    fn newer_peer_is_capped() {
        assert_eq!(negotiate_version(9, 5, false).unwrap(), 5);
    }

    #[test]
    fn version_three_is_downgraded_by_default() {
        assert_eq!(negotiate_version(3, 5, false).unwrap(), 2);
    }

    #[test]
    fn version_three_kept_when_override_set() {
        assert_eq!(negotiate_version(3, 5, true).unwrap(), 3);
    }

    #[test]
    fn older_versions_pass_through() {
        assert_eq!(negotiate_version(1, 5, false).unwrap(), 1);
        assert_eq!(negotiate_version(2, 5, false).unwrap(), 2);
        assert_eq!(negotiate_version(4, 5, false).unwrap(), 4);
    }

    #[test]
    fn responder_capped_at_three_still_downgrades() {
        assert_eq!(negotiate_version(5, 3, false).unwrap(), 2);
    }

    #[test]
    fn zero_is_rejected() {
        assert!(matches!(
            negotiate_version(0, 5, false),
            Err(CodecError::InvalidVersion(0))
        ));
    }
}
