// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Broker transports.
//!
//! A transport owns one logical broker connection. It reconnects on its own
//! and reports what happened as a stream of [`BrokerEvent`]s; subscription
//! bookkeeping lives one level up in the subscriber.

pub mod mock;
pub mod mqtt;

mod traits;

pub use mock::{MockBroker, MockBrokerHandle};
pub use mqtt::MqttTransport;
pub use traits::*;
