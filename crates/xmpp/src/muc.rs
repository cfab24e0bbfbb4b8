use std::collections::{BTreeMap, HashMap};

use perch_core::event::{MucAffiliation, MucOccupant, MucRole, PresenceShow};

use crate::element::Element;
use crate::error::RemoteError;
use crate::extensions::{MucItem, MucUser};
use crate::jid::Jid;
use crate::ns;
use crate::stanza::{Presence, PresenceType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    pub jid: Jid,
    pub nick: String,
    pub subject: Option<String>,
    pub joined: bool,
    pub occupants: BTreeMap<String, MucOccupant>,
    /// Accept the default configuration if the server reports a new room.
    instant: bool,
}

/// A state change produced by a room presence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomUpdate {
    Joined { room: Jid, nick: String },
    Left { room: Jid },
    OccupantChanged { room: Jid, occupant: MucOccupant },
    /// The room was created by our join and must be unlocked.
    NeedsInstantConfig { room: Jid },
    JoinFailed { room: Jid, reason: String },
}

/// Rooms this session has joined or is joining, keyed by bare room JID.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<String, Room>,
}

impl RoomRegistry {
    pub fn begin_join(&mut self, room: &Jid, nick: &str, instant: bool) {
        self.rooms.insert(
            room.bare_string(),
            Room {
                jid: room.to_bare(),
                nick: nick.to_string(),
                subject: None,
                joined: false,
                occupants: BTreeMap::new(),
                instant,
            },
        );
    }

    pub fn get(&self, room: &Jid) -> Option<&Room> {
        self.rooms.get(&room.bare_string())
    }

    pub fn contains(&self, room: &Jid) -> bool {
        self.rooms.contains_key(&room.bare_string())
    }

    pub fn remove(&mut self, room: &Jid) -> Option<Room> {
        self.rooms.remove(&room.bare_string())
    }

    pub fn rooms(&self) -> Vec<Room> {
        self.rooms.values().cloned().collect()
    }

    /// Record a subject change; `false` if the room is unknown.
    pub fn set_subject(&mut self, room: &Jid, subject: &str) -> bool {
        match self.rooms.get_mut(&room.bare_string()) {
            Some(state) => {
                state.subject = Some(subject.to_string());
                true
            }
            None => false,
        }
    }

    /// Apply a presence from `room/nick`. Returns `None` when the sender is
    /// not a room we know about, so the caller can treat it as buddy presence.
    pub fn handle_presence(&mut self, presence: &Presence) -> Option<Vec<RoomUpdate>> {
        let from = presence.from.as_ref()?;
        let key = from.bare_string();
        let room = self.rooms.get_mut(&key)?;
        let room_jid = room.jid.clone();

        if presence.kind == PresenceType::Error {
            if room.joined {
                return Some(Vec::new());
            }
            let reason = presence
                .payloads
                .iter()
                .find(|p| p.is("error", ns::CLIENT))
                .map(|error| RemoteError::from_error_element(error).to_string())
                .unwrap_or_else(|| "join refused".to_string());
            self.rooms.remove(&key);
            return Some(vec![RoomUpdate::JoinFailed {
                room: room_jid,
                reason,
            }]);
        }

        let nick = from.resource()?.to_string();
        let muc_user = presence.extensions().find_map(|ext| match ext {
            crate::extensions::Extension::MucUser(user) => Some(user),
            _ => None,
        });
        let muc_user = muc_user.unwrap_or_default();
        let is_self = muc_user.has_status(MucUser::STATUS_SELF) || nick == room.nick;
        let mut updates = Vec::new();

        if presence.kind == PresenceType::Unavailable {
            room.occupants.remove(&nick);
            if is_self {
                self.rooms.remove(&key);
                updates.push(RoomUpdate::Left { room: room_jid });
                return Some(updates);
            }
            updates.push(RoomUpdate::OccupantChanged {
                room: room_jid,
                occupant: MucOccupant {
                    nick,
                    jid: None,
                    affiliation: MucAffiliation::None,
                    role: MucRole::None,
                    show: PresenceShow::Unavailable,
                },
            });
            return Some(updates);
        }

        let item = muc_user.items.first().cloned().unwrap_or(MucItem {
            affiliation: MucAffiliation::None,
            role: MucRole::Participant,
            jid: None,
            nick: None,
        });
        let occupant = MucOccupant {
            nick: nick.clone(),
            jid: item.jid,
            affiliation: item.affiliation,
            role: item.role,
            show: presence.availability(),
        };
        room.occupants.insert(nick.clone(), occupant.clone());

        if is_self && !room.joined {
            room.joined = true;
            room.nick = nick.clone();
            updates.push(RoomUpdate::Joined {
                room: room_jid.clone(),
                nick,
            });
            if muc_user.has_status(MucUser::STATUS_CREATED) && room.instant {
                updates.push(RoomUpdate::NeedsInstantConfig {
                    room: room_jid.clone(),
                });
            }
        }
        updates.push(RoomUpdate::OccupantChanged {
            room: room_jid,
            occupant,
        });
        Some(updates)
    }
}

/// The `<x/>` payload of a join presence.
pub fn join_payload(password: Option<&str>) -> Element {
    let mut x = Element::builder("x", ns::MUC);
    if let Some(password) = password {
        x = x.append(Element::builder("password", ns::MUC).append(password).build());
    }
    x.build()
}

/// Owner query accepting the default room configuration.
pub fn instant_room_config() -> Element {
    Element::builder("query", ns::MUC_OWNER)
        .append(
            Element::builder("x", ns::DATA_FORMS)
                .attr("type", "submit")
                .build(),
        )
        .build()
}
