//! [`Platform`](crate::Platform) implementations.
//!
//! `x86_64` drives the real CPU and is compiled whenever the target is x86_64, so
//! host builds type-check it too. `software` simulates a CPU and its physical
//! memory for tests.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(any(test, feature = "software-emulation"))]
pub mod software;
