//! Presence rewriting.
//!
//! The single pure transform at the heart of the relay: given the raw bytes
//! of one inbound read and the target status, produce the bytes to send to
//! the real chat server. Only `<presence>` elements are touched; every
//! other top-level element, and the bytes between elements, are copied
//! verbatim. A scan or parse failure is reported to the caller, which
//! forwards the original bytes unmodified.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::constants::{KNOWN_PRODUCTS, PRIMARY_PRODUCT, SECONDARY_PRODUCTS, VERSIONED_PRODUCT};
use crate::policy::StatusMode;
use crate::xml::{self, Element, XmlError};

/// Result of rewriting one fragment.
#[derive(Debug)]
pub struct RewriteOutcome {
    /// The bytes to forward in place of the original fragment.
    pub payload: String,
    /// Product client version extracted from a rich-presence payload, if
    /// one was seen in this fragment.
    pub discovered_version: Option<String>,
}

enum Disposition {
    /// Targeted at a lobby/room and pass-through is disabled: remove it.
    Drop,
    /// Targeted at a lobby/room and pass-through is enabled: forward the
    /// original bytes untouched.
    Forward,
    /// Broadcast presence: forward the mutated tree.
    Rewritten,
}

/// Rewrites every `<presence>` element in the fragment for the target
/// status.
pub fn rewrite_presences(
    input: &str,
    status: StatusMode,
    connect_lobby_chat: bool,
) -> Result<RewriteOutcome, XmlError> {
    let tops = xml::scan_fragment(input)?;

    let mut payload = String::with_capacity(input.len());
    let mut discovered_version = None;
    let mut cursor = 0;

    for top in tops {
        payload.push_str(&input[cursor..top.start]);
        cursor = top.end;
        let span = &input[top.start..top.end];

        if top.name != "presence" {
            payload.push_str(span);
            continue;
        }

        let mut element = xml::parse_element(span)?;
        match rewrite_one(
            &mut element,
            status,
            connect_lobby_chat,
            &mut discovered_version,
        ) {
            Disposition::Drop => {}
            Disposition::Forward => payload.push_str(span),
            Disposition::Rewritten => payload.push_str(&element.to_xml()),
        }
    }
    payload.push_str(&input[cursor..]);

    Ok(RewriteOutcome {
        payload,
        discovered_version,
    })
}

fn rewrite_one(
    element: &mut Element,
    status: StatusMode,
    connect_lobby_chat: bool,
    discovered_version: &mut Option<String>,
) -> Disposition {
    // A presence with a "to" address targets a specific peer or room
    // rather than being a broadcast.
    if element.attribute("to").is_some() {
        return if connect_lobby_chat {
            Disposition::Forward
        } else {
            Disposition::Drop
        };
    }

    // The client marks an in-game player as "do not disturb" in the
    // primary product's sub-status; with masking effectively off that
    // state must survive.
    let primary_sub_status = element
        .child("games")
        .and_then(|games| games.child(PRIMARY_PRODUCT))
        .and_then(|block| block.child("st"))
        .and_then(|st| st.text());
    let keep_dnd = status == StatusMode::Chat && primary_sub_status.as_deref() == Some("dnd");

    if !keep_dnd {
        if let Some(show) = element.child_mut("show") {
            show.set_text(status.token());
        }
        if let Some(games) = element.child_mut("games") {
            for product in KNOWN_PRODUCTS {
                if let Some(st) = games.child_mut(product).and_then(|block| block.child_mut("st"))
                {
                    st.set_text(status.token());
                }
            }
        }
    }

    if status == StatusMode::Chat {
        return Disposition::Rewritten;
    }

    // Masked: drop the free-text rich presence message.
    element.remove_child("status");

    if let Some(games) = element.child_mut("games") {
        if status == StatusMode::Mobile {
            // Mobile keeps a minimal primary block so the client still
            // renders the mobile marker, without the rich fields.
            if let Some(primary) = games.child_mut(PRIMARY_PRODUCT) {
                primary.remove_child("p");
                primary.remove_child("m");
            }
        } else {
            games.remove_child(PRIMARY_PRODUCT);
        }

        if discovered_version.is_none() {
            if let Some(encoded) = games
                .child(VERSIONED_PRODUCT)
                .and_then(|block| block.child("p"))
                .and_then(|p| p.text())
            {
                *discovered_version = extract_party_client_version(&encoded);
            }
        }

        for product in SECONDARY_PRODUCTS {
            games.remove_child(product);
        }
    }

    Disposition::Rewritten
}

/// Pulls the client version out of a base64-encoded rich-presence payload.
/// Absent or malformed payloads are ignored.
fn extract_party_client_version(encoded: &str) -> Option<String> {
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let value: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    value
        .get("partyClientVersion")
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const FULL_PRESENCE: &str = "<presence><show>chat</show><games><league_of_legends><st>chat</st></league_of_legends></games></presence>";

    #[test]
    fn offline_strips_primary_block_and_status() {
        let outcome =
            rewrite_presences(FULL_PRESENCE, StatusMode::Offline, true).unwrap();
        assert!(outcome.payload.contains("<show>offline</show>"));
        assert!(!outcome.payload.contains("league_of_legends"));
        assert!(!outcome.payload.contains("<status>"));
    }

    #[test]
    fn offline_removes_rich_presence_message() {
        let input = "<presence><show>chat</show><status>playing ranked</status></presence>";
        let outcome = rewrite_presences(input, StatusMode::Offline, true).unwrap();
        assert_eq!(outcome.payload, "<presence><show>offline</show></presence>");
    }

    #[test]
    fn mobile_keeps_minimal_primary_block() {
        let input = "<presence><show>chat</show><games><league_of_legends><st>chat</st><p>cmljaA==</p><m>extra</m></league_of_legends></games></presence>";
        let outcome = rewrite_presences(input, StatusMode::Mobile, true).unwrap();
        assert!(outcome.payload.contains("<league_of_legends>"));
        assert!(outcome.payload.contains("<st>mobile</st>"));
        assert!(!outcome.payload.contains("<p>"));
        assert!(!outcome.payload.contains("<m>"));
        assert!(outcome.payload.contains("<show>mobile</show>"));
    }

    #[test]
    fn secondary_products_are_always_stripped_when_masked() {
        let input = "<presence><show>chat</show><games><league_of_legends><st>chat</st></league_of_legends><valorant><st>chat</st></valorant><bacon><st>chat</st></bacon></games></presence>";
        let outcome = rewrite_presences(input, StatusMode::Offline, true).unwrap();
        assert!(!outcome.payload.contains("valorant"));
        assert!(!outcome.payload.contains("bacon"));
    }

    #[rstest]
    #[case(false, false)]
    #[case(true, true)]
    fn targeted_presence_follows_lobby_chat_policy(
        #[case] connect_lobby_chat: bool,
        #[case] expect_forwarded: bool,
    ) {
        let input = "<presence to='room@conference.example'><show>chat</show></presence>";
        let outcome = rewrite_presences(input, StatusMode::Offline, connect_lobby_chat).unwrap();
        if expect_forwarded {
            // Forwarded byte-for-byte, not rewritten.
            assert_eq!(outcome.payload, input);
        } else {
            assert_eq!(outcome.payload, "");
        }
    }

    #[test]
    fn targeted_presence_dropped_among_siblings() {
        let input = "<presence to='room@conference.example'/><presence><show>chat</show></presence>";
        let outcome = rewrite_presences(input, StatusMode::Offline, false).unwrap();
        assert_eq!(outcome.payload, "<presence><show>offline</show></presence>");
    }

    #[test]
    fn rewrite_is_idempotent() {
        let first = rewrite_presences(FULL_PRESENCE, StatusMode::Offline, true).unwrap();
        let second = rewrite_presences(&first.payload, StatusMode::Offline, true).unwrap();
        assert_eq!(second.payload, first.payload);

        let first = rewrite_presences(FULL_PRESENCE, StatusMode::Mobile, true).unwrap();
        let second = rewrite_presences(&first.payload, StatusMode::Mobile, true).unwrap();
        assert_eq!(second.payload, first.payload);
    }

    #[test]
    fn dnd_survives_when_not_masking() {
        let input = "<presence><show>dnd</show><games><league_of_legends><st>dnd</st></league_of_legends></games></presence>";
        let outcome = rewrite_presences(input, StatusMode::Chat, true).unwrap();
        assert!(outcome.payload.contains("<show>dnd</show>"));
        assert!(outcome.payload.contains("<st>dnd</st>"));
    }

    #[test]
    fn dnd_does_not_survive_when_masking() {
        let input = "<presence><show>dnd</show><games><league_of_legends><st>dnd</st></league_of_legends></games></presence>";
        let outcome = rewrite_presences(input, StatusMode::Offline, true).unwrap();
        assert!(outcome.payload.contains("<show>offline</show>"));
        assert!(!outcome.payload.contains("league_of_legends"));
    }

    #[test]
    fn version_extracted_from_rich_presence_payload() {
        let payload = STANDARD.encode(r#"{"isValid":true,"partyClientVersion":"release-08.07"}"#);
        let input = format!(
            "<presence><show>chat</show><games><valorant><st>chat</st><p>{payload}</p></valorant></games></presence>"
        );
        let outcome = rewrite_presences(&input, StatusMode::Offline, true).unwrap();
        assert_eq!(outcome.discovered_version.as_deref(), Some("release-08.07"));
        assert!(!outcome.payload.contains("valorant"));
    }

    #[test]
    fn malformed_version_payload_is_ignored() {
        let input = "<presence><show>chat</show><games><valorant><p>not-base64!</p></valorant></games></presence>";
        let outcome = rewrite_presences(input, StatusMode::Offline, true).unwrap();
        assert!(outcome.discovered_version.is_none());
    }

    #[test]
    fn non_presence_siblings_are_untouched() {
        let input = "<presence><show>chat</show></presence><message to='a@b'><body>hi &amp; bye</body></message>";
        let outcome = rewrite_presences(input, StatusMode::Offline, true).unwrap();
        assert!(outcome
            .payload
            .ends_with("<message to='a@b'><body>hi &amp; bye</body></message>"));
        assert!(outcome.payload.starts_with("<presence><show>offline</show>"));
    }

    #[test]
    fn incomplete_fragment_is_an_error() {
        assert!(rewrite_presences("<presence><show>chat", StatusMode::Offline, true).is_err());
    }
}
