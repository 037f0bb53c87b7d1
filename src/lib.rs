//! Bao is a general purpose tree hash built on BLAKE3, for verified
//! streaming and verified slicing. The `hash` module computes root hashes,
//! the `encode` module produces combined and outboard encodings, and the
//! `decode` module streams content back out of an encoding -- or out of an
//! extracted slice of one -- verifying every byte against the root hash.

#[macro_use]
extern crate arrayref;
extern crate arrayvec;
extern crate byteorder;
extern crate ring;

#[cfg(test)]
extern crate hex;

pub mod decode;
pub mod encode;
pub mod hash;
