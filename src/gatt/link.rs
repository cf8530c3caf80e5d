//! Radio requests used by the central role.

use async_trait::async_trait;
use std::time::Duration;

use crate::ble::address::{AddressType, BdAddress};
use crate::error::Result;

/// Request interface of a central-role radio stack.
///
/// Every method only submits a request and returns once it is accepted.
/// Completion is reported later as a [`CentralEvent`](crate::gatt::CentralEvent)
/// on the channel the link was created with, so a slow radio never blocks the
/// task that owns the state machine.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CentralLink: Send + Sync {
    /// Connect to a peripheral. Reports `Connected`, or `Disconnected` with
    /// the invalid connection handle on failure.
    async fn connect(
        &self,
        addr_type: AddressType,
        address: BdAddress,
        timeout: Duration,
    ) -> Result<()>;

    /// Discover primary services. Reports one `ServiceResult` per service.
    async fn discover_services(&self, conn_handle: u16) -> Result<()>;

    /// Discover characteristics in a handle range. Reports one
    /// `CharacteristicResult` per characteristic.
    async fn discover_characteristics(
        &self,
        conn_handle: u16,
        start_handle: u16,
        end_handle: u16,
    ) -> Result<()>;

    /// Write a characteristic value with response. Reports `WriteStatus`.
    async fn write(&self, conn_handle: u16, value_handle: u16, data: &[u8]) -> Result<()>;

    /// Read a characteristic value. Reports `ReadResult`.
    async fn read(&self, conn_handle: u16, value_handle: u16) -> Result<()>;

    /// Terminate a connection. Reports `Disconnected`.
    async fn disconnect(&self, conn_handle: u16) -> Result<()>;
}
