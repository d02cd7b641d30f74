//! Rallytime timing: turning keystrokes into tags and tags into finishes.
//!
//! ```text
//! reader keystrokes ──▶ TagDecoder ──▶ DecodedTag ──┐
//!                                                   ▼
//! gate passes ─────────────────────────────▶ FinishQueue ──▶ TaggedFinish
//! ```
//!
//! An RFID reader in keyboard mode types each tag as a fast burst of
//! characters ending in Enter or Tab. [`TagDecoder`] separates those bursts
//! from stray or human keystrokes; [`FinishQueue`] attaches each decoded tag
//! to the oldest untagged gate pass.

pub mod association;
pub mod decoder;
pub mod error;
pub mod session;

pub use association::{Association, Finish, FinishQueue, TaggedFinish};
pub use decoder::{DecodedTag, DecoderConfig, DecoderState, Key, KeyEvent, TagDecoder};
pub use error::{Result, TimingError};
pub use session::DecoderSession;
