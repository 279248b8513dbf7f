#![allow(clippy::needless_range_loop, clippy::manual_range_contains)]

pub mod serial;
pub mod bufpool;
pub mod bytequeue;
pub mod huffman;
pub mod zlib;
pub mod packet_io;
pub mod packet;
pub mod sendqueue;
pub mod version;
pub mod diagnostics;
