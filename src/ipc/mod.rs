// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Primary/secondary IPC control plane (§4.6): bootstrap address parsing,
// the wire message set, and the two roles that negotiate and drive a
// shared-memory control session.

pub mod addr;
pub mod primary;
pub mod secondary;
pub mod wire;

pub use addr::BootstrapAddr;
pub use primary::IpcPrimary;
pub use secondary::IpcSecondary;
pub use wire::{ChannelHandle, IpcMsg};
