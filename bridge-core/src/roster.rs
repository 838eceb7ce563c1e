//! Device roster planning.
//!
//! Given the persisted device records and the set of relay sessions that
//! are currently open, decide which sessions to open, which to keep and
//! which to close.

use std::collections::HashSet;

use signbridge_types::{DeviceRecord, ResyncLevel, SessionId};

/// Result of comparing persisted devices with live sessions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RosterPlan {
    /// Enabled devices with no live session.
    pub open: Vec<DeviceRecord>,
    /// Enabled devices whose session stays; records carry fresh state.
    pub keep: Vec<DeviceRecord>,
    /// Live sessions whose device is gone or disabled.
    pub close: Vec<SessionId>,
    /// Whether any device, enabled or not, is at alert level.
    pub alert: bool,
}

/// Compute the roster plan.
pub fn plan<'a, I>(devices: I, live: &HashSet<SessionId>) -> RosterPlan
where
    I: IntoIterator<Item = &'a DeviceRecord>,
{
    let mut out = RosterPlan::default();
    let mut wanted = HashSet::new();

    for device in devices {
        if device.resync == ResyncLevel::Alert {
            out.alert = true;
        }
        if !device.enabled {
            continue;
        }
        wanted.insert(device.session_id.clone());
        if live.contains(&device.session_id) {
            out.keep.push(device.clone());
        } else {
            out.open.push(device.clone());
        }
    }

    let mut close: Vec<SessionId> = live.difference(&wanted).cloned().collect();
    close.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    out.close = close;
    out
}
