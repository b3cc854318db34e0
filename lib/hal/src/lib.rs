//! A tiny slice of the platform's hardware-abstraction layer: just the address type the unwinder
//! and exception core need to talk about image bases, register contents and stack addresses.
//! The rest of a real HAL (page tables, frame allocators, boot info) belongs to the physical and
//! virtual memory managers, which are an external collaborator of this crate, not part of it.

#![no_std]

mod virtual_address;

pub use virtual_address::VAddr;
