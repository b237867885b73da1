//! Quota and cellular admission rules. Pure functions; the coordinator
//! turns a non-allowed answer into a decision request.

use crate::network::NetworkStatus;

/// Result of comparing a transfer against the storage quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaCheck {
    Allowed,
    /// Usage is already at or over the quota.
    QuotaExceeded,
    /// This file would push usage over the quota.
    WouldExceed,
}

/// A quota of 0 means unlimited.
pub fn check_quota(used_bytes: u64, file_size: u64, quota_bytes: u64) -> QuotaCheck {
    if quota_bytes == 0 {
        return QuotaCheck::Allowed;
    }
    if used_bytes >= quota_bytes {
        return QuotaCheck::QuotaExceeded;
    }
    if used_bytes.saturating_add(file_size) > quota_bytes {
        return QuotaCheck::WouldExceed;
    }
    QuotaCheck::Allowed
}

/// Whether a transfer of `file_size` bytes needs the user's go-ahead before
/// using a metered connection.
pub fn should_prompt_cellular(
    file_size: u64,
    threshold_bytes: u64,
    network: NetworkStatus,
    skip_warnings: bool,
) -> bool {
    network.is_connected && !network.is_wifi && !skip_warnings && file_size > threshold_bytes
}
