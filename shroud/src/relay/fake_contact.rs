//! Stanza builders for the synthetic roster contact.
//!
//! The contact lives entirely inside the relay: its roster entry is spliced
//! into the server's first roster response, its presence and messages are
//! written straight to the client-facing stream, and anything the client
//! sends to it is suppressed before reaching the real server.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use uuid::Uuid;

use crate::constants::{FAKE_CONTACT_JID, FAKE_CONTACT_NAME, FAKE_CONTACT_RESOURCE};
use crate::xml::escape_text;

/// Roster `<item>` spliced into the first roster-query response. The
/// `&#9;` (tab) name prefix sorts the contact above real friends.
pub(crate) fn roster_item() -> String {
    let puuid = FAKE_CONTACT_JID.split('@').next().unwrap_or(FAKE_CONTACT_JID);
    format!(
        "<item jid='{jid}' name='&#9;{name}' subscription='both' puuid='{puuid}'>\
         <group priority='9999'>Shroud</group>\
         <state>online</state>\
         <id name='{name}' tagline='...'/>\
         <lol name='&#9;{name}'/>\
         <platforms><riot name='{name}' tagline='...'/></platforms>\
         </item>",
        jid = FAKE_CONTACT_JID,
        name = FAKE_CONTACT_NAME,
        puuid = puuid,
    )
}

/// Presence broadcast for the contact, advertising every product as
/// available. Embedding the learned client version keeps the client from
/// flagging the contact with a version-mismatch warning.
pub(crate) fn presence_stanza(product_version: Option<&str>) -> String {
    let now = Utc::now().timestamp_millis();
    let rich_payload = STANDARD.encode(format!(
        r#"{{"isValid":true,"partyId":"00000000-0000-0000-0000-000000000000","partyClientVersion":"{}","accountLevel":1000}}"#,
        product_version.unwrap_or("unknown")
    ));

    format!(
        "<presence from='{jid}/{resource}' id='b-{id}'>\
         <games>\
         <keystone><st>chat</st><s.t>{now}</s.t><s.p>keystone</s.p></keystone>\
         <league_of_legends><st>chat</st><s.t>{now}</s.t><s.p>league_of_legends</s.p><p>{{&quot;pty&quot;:true}}</p></league_of_legends>\
         <valorant><st>chat</st><s.t>{now}</s.t><s.p>valorant</s.p><p>{payload}</p></valorant>\
         <bacon><st>chat</st><s.t>{now}</s.t><s.l>bacon_availability_online</s.l><s.p>bacon</s.p></bacon>\
         </games>\
         <show>chat</show>\
         <platform>riot</platform>\
         </presence>",
        jid = FAKE_CONTACT_JID,
        resource = FAKE_CONTACT_RESOURCE,
        id = Uuid::new_v4(),
        now = now,
        payload = rich_payload,
    )
}

/// Chat message from the contact to the player. The stamp is set slightly
/// in the future so the client renders it at the bottom of the history.
pub(crate) fn message_stanza(body: &str) -> String {
    let stamp = (Utc::now() + chrono::Duration::seconds(1)).format("%Y-%m-%d %H:%M:%S%.3f");
    format!(
        "<message from='{jid}/{resource}' stamp='{stamp}' id='fake-{stamp}' type='chat'>\
         <body>{body}</body>\
         </message>",
        jid = FAKE_CONTACT_JID,
        resource = FAKE_CONTACT_RESOURCE,
        stamp = stamp,
        body = escape_text(body),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roster_item_carries_the_reserved_jid() {
        let item = roster_item();
        assert!(item.contains(FAKE_CONTACT_JID));
        assert!(item.contains("subscription='both'"));
        assert!(item.contains("&#9;"));
    }

    #[test]
    fn presence_embeds_the_learned_version() {
        let stanza = presence_stanza(Some("release-08.07"));
        let encoded = stanza
            .split("<valorant>")
            .nth(1)
            .and_then(|rest| rest.split("<p>").nth(1))
            .and_then(|rest| rest.split("</p>").next())
            .unwrap();
        let decoded = STANDARD.decode(encoded).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(value["partyClientVersion"], "release-08.07");
    }

    #[test]
    fn presence_defaults_to_unknown_version() {
        let stanza = presence_stanza(None);
        assert!(stanza.contains("<show>chat</show>"));
        assert!(stanza.starts_with("<presence from="));
    }

    #[test]
    fn message_body_is_escaped() {
        let stanza = message_stanza("a < b & c");
        assert!(stanza.contains("<body>a &lt; b &amp; c</body>"));
        assert!(stanza.contains("type='chat'"));
    }
}
