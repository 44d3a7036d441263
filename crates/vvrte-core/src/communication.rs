// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Payload delivery between real vehicles.

use async_trait::async_trait;

use crate::entities::RealVehicle;
use crate::error::Result;

/// Connector receiving migration archives.
pub const MIGRATION_CONNECTOR: &str = "migration";

/// Connector receiving migration chunk acknowledgements.
pub const MIGRATION_ACK_CONNECTOR: &str = "migration-ack";

/// Outcome reported by the remote connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Ok,
    Failed,
}

/// Reply of a connector call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommunicationResponse {
    pub status: ResponseStatus,
    /// Response body, usually an error text when the status is [`ResponseStatus::Failed`].
    pub content: Vec<u8>,
}

impl CommunicationResponse {
    /// A successful empty reply.
    pub fn ok() -> Self {
        Self {
            status: ResponseStatus::Ok,
            content: Vec::new(),
        }
    }

    /// A failed reply carrying `message`.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Failed,
            content: message.into().into_bytes(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    /// The content as lossy UTF-8.
    pub fn content_text(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }
}

/// Delivers payloads to a named connector of another real vehicle.
///
/// `Err` means the payload could not be handed over at all. A remote that
/// received it but refused it answers with [`ResponseStatus::Failed`].
#[async_trait]
pub trait CommunicationService: Send + Sync {
    async fn transfer(
        &self,
        destination: &RealVehicle,
        connector: &str,
        payload: &[u8],
    ) -> Result<CommunicationResponse>;
}
