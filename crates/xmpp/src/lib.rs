pub mod buddy;
pub mod caps;
pub mod carbons;
pub mod chat;
pub mod client;
pub mod disco;
pub mod error;
pub mod message;
pub mod muc;
pub mod outbound;
pub mod pep;
pub mod presence;
pub mod sasl;
pub mod session;
pub mod stanza;
pub mod stream;

pub use buddy::{Buddy, BuddyTable, Resource, Subscription};
pub use caps::{CapsCache, CapsClientInfo, CapsLookup, CapsRequester, CapsTuple};
pub use carbons::{CarbonDirection, CarbonsManager, CarbonsState};
pub use chat::{Chat, ChatRegistry, JoinRequest};
pub use error::{CapsError, XmppError};
pub use outbound::OutgoingMessage;
pub use presence::{Presence, PresenceType};
pub use session::{JabberSession, PROTOCOL_ID, SessionState, XmppPlugin};
pub use stream::{Frame, StreamNegotiator, StreamPhase};
