//! System-event handler (spec.md §4.7): the `iotready` subscription
//! prefix is never surfaced to the user event bus as a plain `publish`;
//! instead it is interpreted as device control.

use crate::events::{ClientEvent, EventBus};
use crate::registry::OwnerList;

/// A follow-up the session loop must perform after a system event, since
/// publishing back to the cloud needs the multiplexer/transport this
/// module doesn't own.
#[derive(Debug, Clone, PartialEq)]
pub enum SystemAction {
    None,
    RepublishUpdatesForced(bool),
    PublishUpdatesPendingAck,
}

/// Returns `true` if `event_name` falls under the `iotready` system
/// prefix and was consumed here (the caller must not also deliver it to
/// user subscriptions).
pub fn handle_system_event(
    event_name: &str,
    payload: &[u8],
    updates_forced: &mut bool,
    updates_pending: &mut bool,
    owners: &mut OwnerList,
    events: &EventBus,
) -> Option<SystemAction> {
    if !event_name.starts_with("iotready") {
        return None;
    }

    let action = match event_name {
        "iotready/device/reset" => {
            match std::str::from_utf8(payload).unwrap_or("") {
                "dfu" => events.emit(ClientEvent::Dfu),
                "safe mode" => events.emit(ClientEvent::Safemode),
                "reboot" => events.emit(ClientEvent::Reboot),
                _ => {}
            }
            SystemAction::None
        }
        "iotready/device/updates/forced" => {
            let forced = payload.first().copied().unwrap_or(0) != 0;
            if forced != *updates_forced {
                *updates_forced = forced;
                events.emit(ClientEvent::FirmwareUpdateForced(forced));
                SystemAction::RepublishUpdatesForced(forced)
            } else {
                SystemAction::None
            }
        }
        "iotready/device/updates/pending" => {
            let pending = payload.first().copied().unwrap_or(0) != 0;
            if pending && !*updates_pending {
                *updates_pending = true;
                events.emit(ClientEvent::FirmwareUpdatePending(true));
                SystemAction::PublishUpdatesPendingAck
            } else {
                SystemAction::None
            }
        }
        "iotready/device/owners" => {
            let text = String::from_utf8_lossy(payload);
            let parsed: Vec<String> = text
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            owners.replace(parsed);
            SystemAction::None
        }
        _ => SystemAction::None,
    };

    Some(action)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_dfu_emits_dfu_signal() {
        let (bus, mut rx) = EventBus::new();
        let mut forced = false;
        let mut pending = false;
        let mut owners = OwnerList::default();
        let consumed = handle_system_event(
            "iotready/device/reset",
            b"dfu",
            &mut forced,
            &mut pending,
            &mut owners,
            &bus,
        );
        assert!(consumed.is_some());
        assert!(matches!(rx.try_recv(), Ok(ClientEvent::Dfu)));
    }

    #[test]
    fn updates_forced_flag_change_triggers_republish() {
        let (bus, _rx) = EventBus::new();
        let mut forced = false;
        let mut pending = false;
        let mut owners = OwnerList::default();
        let action = handle_system_event(
            "iotready/device/updates/forced",
            &[1],
            &mut forced,
            &mut pending,
            &mut owners,
            &bus,
        )
        .unwrap();
        assert_eq!(action, SystemAction::RepublishUpdatesForced(true));
        assert!(forced);

        let action = handle_system_event(
            "iotready/device/updates/forced",
            &[1],
            &mut forced,
            &mut pending,
            &mut owners,
            &bus,
        )
        .unwrap();
        assert_eq!(action, SystemAction::None);
    }

    #[test]
    fn owners_event_replaces_owner_list() {
        let (bus, _rx) = EventBus::new();
        let mut forced = false;
        let mut pending = false;
        let mut owners = OwnerList::default();
        handle_system_event(
            "iotready/device/owners",
            b"alice, bob",
            &mut forced,
            &mut pending,
            &mut owners,
            &bus,
        );
        assert!(owners.contains("alice"));
        assert!(owners.contains("bob"));
    }

    #[test]
    fn non_system_event_is_ignored() {
        let (bus, _rx) = EventBus::new();
        let mut forced = false;
        let mut pending = false;
        let mut owners = OwnerList::default();
        assert!(handle_system_event(
            "application/custom",
            b"",
            &mut forced,
            &mut pending,
            &mut owners,
            &bus,
        )
        .is_none());
    }
}
