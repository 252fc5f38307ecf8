use serde::{Deserialize, Serialize};

/// Which registered variables a flush re-encodes.
///
/// The byte comparison made during flush is the only dirty signal that counts;
/// this only decides how many entries are compared at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushPolicy {
    /// Re-encode every registered variable.
    #[default]
    CompareAll,
    /// Skip variables whose proxies saw no write and never fell back to
    /// unintercepted access.
    TouchedOnly,
}

impl FlushPolicy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CompareAll => "compare_all",
            Self::TouchedOnly => "touched_only",
        }
    }
}
