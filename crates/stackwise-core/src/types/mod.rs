//! # Types
//!
//! Plain data shared by every stage of the pipeline.
//!
//! - [`Address`]: runtime address newtype
//! - [`ThreadContext`] / [`StackBounds`]: where a walk starts and what it may read
//! - [`StackTraceFrame`]: one enriched frame, plus its stage and outcome
//! - [`Architecture`] and [`SymbolLanguage`]: small classification enums

pub mod address;
pub mod arch;
pub mod context;
pub mod frame;
pub mod symbols;

pub use address::Address;
pub use arch::Architecture;
pub use context::{StackBounds, ThreadContext};
pub use frame::{ResolutionOutcome, ResolutionStage, StackTraceFrame};
pub use symbols::SymbolLanguage;
