// ── Ports ────────────────────────────────────────────────────────────────────
pub mod traits;

// ── Infrastructure ───────────────────────────────────────────────────────────
pub mod sse;
pub mod timeout;

// ── Adapters and decorators ─────────────────────────────────────────────────
pub mod compatible;
pub mod factory;
pub mod reliable;

pub use compatible::OpenAiCompatibleChat;
pub use factory::{ChatBackendFactory, HttpChatFactory};
pub use reliable::ReliableChat;
pub use timeout::with_timeout;
pub use traits::{BoxFuture, ChatBackend, ChatStream};
