//! Network status: the lifecycle state of one observed query's fetch activity

use serde::{Deserialize, Serialize};

/// Enumerated lifecycle state of one observed query's current fetch
/// activity. The numeric discriminants are part of the reported surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NetworkStatus {
    /// First fetch for this query is in flight
    Loading = 1,
    /// Variables changed; the previous result stays visible until the new
    /// one arrives
    SetVariables = 2,
    /// A pagination fetch is in flight alongside the current result
    FetchMore = 3,
    /// An explicit refetch is in flight
    Refetch = 4,
    /// A scheduled poll fetch is in flight
    Poll = 6,
    /// The last fetch settled successfully
    Ready = 7,
    /// The last fetch failed; a later successful fetch clears this
    Error = 8,
}

impl NetworkStatus {
    /// Whether this status counts as "loading" for subscribers
    pub fn is_loading(self) -> bool {
        matches!(
            self,
            NetworkStatus::Loading
                | NetworkStatus::SetVariables
                | NetworkStatus::FetchMore
                | NetworkStatus::Refetch
                | NetworkStatus::Poll
        )
    }

    /// The numeric code reported to subscribers
    pub fn code(self) -> u8 {
        self as u8
    }
}
