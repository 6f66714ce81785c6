//! # Kernel Layout Information
//!
//! Compile-time constants describing the virtual address space that the
//! physical map manages: the user/kernel split, the recursive page-table
//! window and the shared kernel slot. All values are `const` and checked by
//! compile-time assertions in [`memory`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod memory;
