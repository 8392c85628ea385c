//! Device identity: immutable once the client is initialized.

use crate::error::{ConfigurationError, Result};

/// 12-byte device id, product id, firmware version, and platform id.
///
/// Immutable after `Client::begin`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    id: [u8; 12],
    product_id: u16,
    firmware_version: u16,
    platform_id: u16,
}

impl DeviceIdentity {
    /// Parse a 24-character hex device id plus the product/firmware/platform
    /// triple. Rejects the empty string and any length other than 24.
    pub fn from_hex(
        id_hex: &str,
        product_id: u16,
        firmware_version: u16,
        platform_id: u16,
    ) -> Result<Self> {
        if id_hex.len() != 24 {
            return Err(ConfigurationError::InvalidDeviceIdLength { len: id_hex.len() }.into());
        }
        let bytes = hex::decode(id_hex)
            .map_err(|e| ConfigurationError::InvalidDeviceIdHex(e.to_string()))?;
        let id: [u8; 12] = bytes
            .try_into()
            .map_err(|_| ConfigurationError::InvalidDeviceIdLength { len: id_hex.len() })?;
        Ok(Self {
            id,
            product_id,
            firmware_version,
            platform_id,
        })
    }

    pub fn id_bytes(&self) -> &[u8; 12] {
        &self.id
    }

    pub fn id_hex(&self) -> String {
        hex::encode(self.id)
    }

    pub fn product_id(&self) -> u16 {
        self.product_id
    }

    pub fn firmware_version(&self) -> u16 {
        self.firmware_version
    }

    pub fn platform_id(&self) -> u16 {
        self.platform_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_hex_id() {
        let id = DeviceIdentity::from_hex("000102030405060708090a0b", 6, 10, 6).unwrap();
        assert_eq!(
            id.id_bytes(),
            &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 0x0a, 0x0b]
        );
        assert_eq!(id.id_hex(), "000102030405060708090a0b");
    }

    #[test]
    fn rejects_wrong_length() {
        let err = DeviceIdentity::from_hex("0001", 6, 10, 6).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Configuration(ConfigurationError::InvalidDeviceIdLength {
                len: 4
            })
        ));
    }

    #[test]
    fn rejects_empty() {
        let err = DeviceIdentity::from_hex("", 6, 10, 6).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Configuration(ConfigurationError::InvalidDeviceIdLength {
                len: 0
            })
        ));
    }

    #[test]
    fn rejects_non_hex() {
        let err =
            DeviceIdentity::from_hex("zzzzzzzzzzzzzzzzzzzzzzzz", 6, 10, 6).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Configuration(ConfigurationError::InvalidDeviceIdHex(_))
        ));
    }
}
