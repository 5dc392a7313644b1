/// Conversion of Telegram updates into core inbound events
pub mod inbound;
/// `ChatPlatform` implementation on top of `teloxide::Bot`
pub mod platform;
/// Resilient messaging with automatic retry for Telegram API operations
pub mod resilient;

pub use platform::TelegramPlatform;
