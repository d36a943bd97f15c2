//! Presence rewriting.
//!
//! Takes one read chunk from the client, finds the top-level `<presence>`
//! stanzas in it and rewrites them so the remote service sees the visibility
//! the user picked instead of the real one. Everything that is not a presence
//! stanza is re-serialized untouched, in its original position.

use std::fmt;
use std::str::FromStr;

use super::stanza::{parse_fragment, serialize_fragment, Element, Node, StanzaError};

/// Primary game presence block and the fields inside it that we touch.
const PRIMARY_GAME: &str = "league_of_legends";
const GAME_STATUS: &str = "st";
const CURRENT_GAME: &str = "p";
const CURRENT_MAP: &str = "m";

/// Companion application presence blocks. Always stripped since there is no
/// believable value to spoof them with.
const COMPANION_GAMES: [&str; 2] = ["bacon", "valorant"];

/// Game status value that an Online rewrite leaves alone.
const DO_NOT_DISTURB: &str = "dnd";

/// Visibility the user wants to present to the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    Online,
    #[default]
    Offline,
    Mobile,
}

impl Visibility {
    /// Wire token written into `<show>` and the game status field.
    pub fn token(self) -> &'static str {
        match self {
            Visibility::Online => "chat",
            Visibility::Offline => "offline",
            Visibility::Mobile => "mobile",
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Visibility::Online => 0,
            Visibility::Offline => 1,
            Visibility::Mobile => 2,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Visibility::Online,
            2 => Visibility::Mobile,
            _ => Visibility::Offline,
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chat" | "online" => Ok(Visibility::Online),
            "offline" => Ok(Visibility::Offline),
            "mobile" => Ok(Visibility::Mobile),
            other => Err(format!("unknown visibility '{}'", other)),
        }
    }
}

/// Rewrite every top-level presence stanza in `chunk`.
///
/// Directed presences (those with a `to` attribute) are lobby broadcasts:
/// they are dropped when `lobby_chat` is off and forwarded as-is otherwise.
pub fn rewrite_presence(
    chunk: &str,
    target: Visibility,
    lobby_chat: bool,
) -> Result<String, StanzaError> {
    let mut nodes = parse_fragment(chunk)?;

    nodes.retain(|node| match node {
        Node::Element(e) if e.name == "presence" && e.attribute("to").is_some() => lobby_chat,
        _ => true,
    });

    for node in nodes.iter_mut() {
        let Some(presence) = node.as_element_mut() else {
            continue;
        };
        if presence.name != "presence" || presence.attribute("to").is_some() {
            continue;
        }
        rewrite_one(presence, target);
    }

    Ok(serialize_fragment(&nodes))
}

fn rewrite_one(presence: &mut Element, target: Visibility) {
    let game_status = presence
        .descendant(&["games", PRIMARY_GAME, GAME_STATUS])
        .map(Element::text);

    if target != Visibility::Online || game_status.as_deref() != Some(DO_NOT_DISTURB) {
        if let Some(show) = presence.child_mut("show") {
            show.set_text(target.token());
        }
        if let Some(st) = presence.descendant_mut(&["games", PRIMARY_GAME, GAME_STATUS]) {
            st.set_text(target.token());
        }
    }

    if target != Visibility::Online {
        presence.remove_child("status");
        if let Some(games) = presence.child_mut("games") {
            match target {
                Visibility::Mobile => {
                    if let Some(primary) = games.child_mut(PRIMARY_GAME) {
                        primary.remove_child(CURRENT_GAME);
                        primary.remove_child(CURRENT_MAP);
                    }
                }
                _ => {
                    games.remove_child(PRIMARY_GAME);
                }
            }
        }
    }

    if let Some(games) = presence.child_mut("games") {
        for companion in COMPANION_GAMES {
            games.remove_child(companion);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SELF_PRESENCE: &str = "<presence id='p1'><show>chat</show><status>In lobby</status>\
        <games><league_of_legends><st>chat</st><s.p>league_of_legends</s.p><p>{&quot;pty&quot;:true}</p>\
        <m>map11</m></league_of_legends><bacon><st>chat</st></bacon><valorant><st>chat</st></valorant>\
        </games></presence>";

    fn first_presence(out: &str) -> Element {
        parse_fragment(out)
            .unwrap()
            .into_iter()
            .find_map(|n| match n {
                Node::Element(e) if e.name == "presence" => Some(e),
                _ => None,
            })
            .expect("presence in output")
    }

    // --- Visibility tests ---

    #[test]
    fn test_visibility_tokens_roundtrip() {
        for v in [Visibility::Online, Visibility::Offline, Visibility::Mobile] {
            assert_eq!(v.token().parse::<Visibility>().unwrap(), v);
            assert_eq!(Visibility::from_u8(v.as_u8()), v);
        }
        assert_eq!("Online".parse::<Visibility>().unwrap(), Visibility::Online);
        assert!("away".parse::<Visibility>().is_err());
    }

    // --- rewrite tests ---

    #[test]
    fn test_offline_removes_primary_game_and_status() {
        let out = rewrite_presence(SELF_PRESENCE, Visibility::Offline, true).unwrap();
        let presence = first_presence(&out);
        assert_eq!(presence.child("show").unwrap().text(), "offline");
        assert!(presence.child("status").is_none());
        let games = presence.child("games").unwrap();
        assert!(games.child("league_of_legends").is_none());
        assert!(games.child("bacon").is_none());
        assert!(games.child("valorant").is_none());
    }

    #[test]
    fn test_mobile_keeps_reduced_game_status() {
        let out = rewrite_presence(SELF_PRESENCE, Visibility::Mobile, true).unwrap();
        let presence = first_presence(&out);
        assert_eq!(presence.child("show").unwrap().text(), "mobile");
        assert!(presence.child("status").is_none());
        let primary = presence.descendant(&["games", "league_of_legends"]).unwrap();
        assert_eq!(primary.child("st").unwrap().text(), "mobile");
        assert!(primary.child("p").is_none());
        assert!(primary.child("m").is_none());
        assert_eq!(primary.child("s.p").unwrap().text(), "league_of_legends");
    }

    #[test]
    fn test_spec_example_input_offline_and_mobile() {
        let input = "<presence><show>chat</show><games><league_of_legends><st>chat</st></league_of_legends></games></presence>";

        let offline = rewrite_presence(input, Visibility::Offline, true).unwrap();
        assert_eq!(offline, "<presence><show>offline</show><games/></presence>");

        let mobile = rewrite_presence(input, Visibility::Mobile, true).unwrap();
        assert_eq!(
            mobile,
            "<presence><show>mobile</show><games><league_of_legends><st>mobile</st></league_of_legends></games></presence>"
        );
    }

    #[test]
    fn test_online_keeps_status_text_and_game() {
        let out = rewrite_presence(SELF_PRESENCE, Visibility::Online, true).unwrap();
        let presence = first_presence(&out);
        assert_eq!(presence.child("show").unwrap().text(), "chat");
        assert_eq!(presence.child("status").unwrap().text(), "In lobby");
        let games = presence.child("games").unwrap();
        assert!(games.descendant(&["league_of_legends", "p"]).is_some());
        // Companion blocks are stripped in every mode
        assert!(games.child("bacon").is_none());
        assert!(games.child("valorant").is_none());
    }

    #[test]
    fn test_online_preserves_do_not_disturb() {
        let input = "<presence><show>dnd</show><games><league_of_legends><st>dnd</st></league_of_legends></games></presence>";
        let out = rewrite_presence(input, Visibility::Online, true).unwrap();
        let presence = first_presence(&out);
        assert_eq!(presence.child("show").unwrap().text(), "dnd");
        assert_eq!(
            presence.descendant(&["games", "league_of_legends", "st"]).unwrap().text(),
            "dnd"
        );
    }

    #[test]
    fn test_offline_overrides_do_not_disturb() {
        let input = "<presence><show>dnd</show><games><league_of_legends><st>dnd</st></league_of_legends></games></presence>";
        let out = rewrite_presence(input, Visibility::Offline, true).unwrap();
        assert_eq!(first_presence(&out).child("show").unwrap().text(), "offline");
    }

    #[test]
    fn test_directed_presence_dropped_without_lobby_chat() {
        let input = "<presence to='lobby@champ-select.pvp.net/me'><show>chat</show></presence><presence><show>chat</show></presence>";
        let out = rewrite_presence(input, Visibility::Offline, false).unwrap();
        assert!(!out.contains("lobby@champ-select"));
        assert_eq!(out, "<presence><show>offline</show></presence>");
    }

    #[test]
    fn test_directed_presence_forwarded_untouched_with_lobby_chat() {
        let input = "<presence to=\"lobby@champ-select.pvp.net/me\"><show>chat</show><status>hi</status></presence>";
        let out = rewrite_presence(input, Visibility::Offline, true).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn test_non_presence_siblings_pass_through() {
        let input = "<iq type=\"get\" id=\"1\"><query xmlns=\"jabber:iq:roster\"/></iq><presence><show>chat</show></presence>";
        let out = rewrite_presence(input, Visibility::Mobile, true).unwrap();
        assert!(out.starts_with("<iq type=\"get\" id=\"1\"><query xmlns=\"jabber:iq:roster\"/></iq>"));
        assert!(out.ends_with("<presence><show>mobile</show></presence>"));
    }

    #[test]
    fn test_malformed_chunk_is_an_error() {
        assert!(rewrite_presence("<presence><show>chat", Visibility::Offline, true).is_err());
    }

    #[test]
    fn test_status_never_survives_non_online_modes() {
        for mode in [Visibility::Offline, Visibility::Mobile] {
            for lobby in [true, false] {
                let out = rewrite_presence(SELF_PRESENCE, mode, lobby).unwrap();
                assert!(!out.contains("<status"), "{mode} lobby={lobby}: {out}");
            }
        }
    }
}
