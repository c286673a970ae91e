//! # Courier Core
//!
//! Shared building blocks for the Courier bot framework.
//!
//! - [`update`]: the inbound [`Update`] model and its payloads.
//! - [`source`]: the [`UpdateSource`] contract, the in-process
//!   [`update_queue`] and the [`RetryingSource`] wrapper.
//! - [`error`]: [`TransportError`], shared by every source implementation.
//!
//! Handler routing, conversations and persistence live in
//! `courier-framework`; the dispatch loop lives in `courier-runtime`.

pub mod error;
pub mod source;
pub mod update;

pub use error::{TransportError, TransportResult};
pub use source::{
    QueueSource, RetryConfig, RetryingSource, UpdateBatch, UpdateQueue, UpdateSource,
    update_queue,
};
pub use update::{
    CallbackQuery, Chat, ChatJoinRequest, ChatMemberUpdated, ChatType, ChosenInlineResult,
    InlineQuery, Message, MessageEntity, PaymentQuery, Poll, PollAnswer, Update, UpdateKind,
    UpdateTag, User,
};

/// Commonly used items.
pub mod prelude {
    pub use crate::error::{TransportError, TransportResult};
    pub use crate::source::{UpdateBatch, UpdateSource, update_queue};
    pub use crate::update::{Chat, ChatType, Message, Update, UpdateKind, UpdateTag, User};
}
