//! Architecture-specific code
//!
//! Only the ARMv6 core of the Raspberry Pi 1 is supported.

pub mod arm;
