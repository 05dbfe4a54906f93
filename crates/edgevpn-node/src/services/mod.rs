//! Ledger-backed side services. Only the alive service lives here;
//! DNS, TCP publishing, file transfer and egress are external
//! consumers of the same primitives.

pub mod alive;
