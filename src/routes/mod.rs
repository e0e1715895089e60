// Route module decomposition — each surface area in its own file.
// Shared request guards live here; route functions in submodules.

mod admin;
mod query;
mod send;
mod system;
mod webhook_routes;

// --- Re-exports (all route functions used by lib.rs mount) ---

pub use admin::{
    add_friend, add_group_member, block_user, create_group, get_group, list_friendships,
    list_group_members, mute_group_member, remove_group_member, unblock_user, user_token,
};
pub use query::{
    get_message, history, list_conversations, list_failed_messages, list_group_messages,
    list_user_messages, search_messages, update_conversation_settings, user_stats,
};
pub use send::{batch_send, forward_message, mark_read, recall_message, retry_message, send_message};
pub use system::{health, not_found, system_stats, unprocessable};
pub use webhook_routes::broker_webhook;

// --- Shared request guards ---

use rocket::request::{FromRequest, Outcome, Request};

/// The broker's HMAC signature header, when present.
pub struct SignatureHeader(pub Option<String>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for SignatureHeader {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let value = req
            .headers()
            .get_one(crate::webhook::SIGNATURE_HEADER)
            .map(String::from);
        Outcome::Success(SignatureHeader(value))
    }
}
