use serde::{Deserialize, Serialize};

use crate::error::DriverError;

pub fn cbor_encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, DriverError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| DriverError::CborEncode(e.to_string()))?;
    Ok(buf)
}

pub fn cbor_decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, DriverError> {
    ciborium::from_reader(data).map_err(|e| DriverError::CborDecode(e.to_string()))
}
