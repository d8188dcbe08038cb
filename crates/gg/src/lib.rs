pub mod avatar;
pub mod chat;
pub mod client;
pub mod error;
pub mod oauth;
pub mod packet;
pub mod session;

pub use avatar::{AvatarApi, AvatarQueue, AvatarUpdate, Liveness};
pub use chat::{Conference, ConferenceRegistry};
pub use client::GgHttp;
pub use error::{GgError, LoginFailure};
pub use oauth::{OAuthEndpoints, Token};
pub use packet::{ClientPacket, ServerEvent};
pub use session::{Completion, GgPlugin, GgSession, PROTOCOL_ID, Task};
