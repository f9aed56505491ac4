//! Protocol constants shared across the relay.

use std::time::Duration;

/// Read buffer size for both forwarding loops.
pub const READ_BUFFER_SIZE: usize = 8192;

/// Reserved address of the synthetic roster contact. The inbound loop
/// recognizes this value to keep client traffic about the contact away from
/// the real chat servers.
pub const FAKE_CONTACT_JID: &str = "41c322a1-b328-495b-a004-5ccd3e45eae8@eu1.pvp.net";

/// Resource the synthetic contact presents itself from.
pub const FAKE_CONTACT_RESOURCE: &str = "RC-Shroud";

/// Display name of the synthetic contact.
pub const FAKE_CONTACT_NAME: &str = "Masking Active";

/// Opening tag of the roster query result the server sends once per
/// session. The synthetic contact is spliced in right after it.
pub const ROSTER_QUERY_MARKER: &str = "<query xmlns='jabber:iq:riotgames:roster'>";

/// Product block whose status token is the one the client actually
/// renders for this launcher.
pub const PRIMARY_PRODUCT: &str = "league_of_legends";

/// Product blocks that are stripped entirely whenever the status is masked.
pub const SECONDARY_PRODUCTS: &[&str] = &["valorant", "bacon"];

/// Every product block a presence stanza may carry.
pub const KNOWN_PRODUCTS: &[&str] = &["keystone", "league_of_legends", "valorant", "bacon"];

/// Product block carrying the base64 rich-presence payload the version is
/// learned from.
pub const VERSIONED_PRODUCT: &str = "valorant";

/// Loopback address substituted for every chat host the launcher could use.
pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// Delay before the synthetic contact introduces itself after it first
/// appears in the roster.
pub const INTRO_MESSAGE_DELAY: Duration = Duration::from_secs(5);
