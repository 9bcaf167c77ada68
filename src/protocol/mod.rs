//! Protocol module for parsing and constructing vendor messages.
//!
//! This module contains the implementations for:
//! - SOH frame encoding and parsing
//! - Envelope wrapping and multi-block fragmentation
//! - Inbound notification accumulation
//! - Command/response correlation
//! - CRC calculation

pub mod accumulator;
pub mod crc;
pub mod fragment;
pub mod router;
pub mod soh;

pub use accumulator::{NotifyAccumulator, NotifyRate};
pub use crc::{crc16, CRC_INIT_MD8000, CRC_INIT_TR4X};
pub use fragment::BlockAssembler;
pub use router::CommandRouter;
pub use soh::SohFrame;
