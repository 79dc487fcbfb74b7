//! Binary frame codec for the sensor bus.
//!
//! Requests are `[addr][func][data..][crc_lo][crc_hi]`. Replies come in three
//! shapes, selected by function code:
//!
//! ```text
//! read (0x03)        [addr][0x03][byte_count][payload..][crc]
//! write echo (0x06)  [addr][0x06][payload..][crc]
//! error (> 0x80)     [addr][func|0x80][payload..][crc]
//! ```

use thiserror::Error;

use sensorlink_common::{ERROR_REPLY_FLAG, MeasureItem};

/// Read holding registers.
pub const FUNC_READ: u8 = 0x03;

/// Write single register; the reply echoes register and data.
pub const FUNC_WRITE: u8 = 0x06;

/// Length of the trailing checksum.
pub const CRC_LEN: usize = 2;

/// Length of a config frame (header, register, data, crc).
pub const CONFIG_FRAME_LEN: usize = 8;

/// Errors raised while building or splitting frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    FrameIntegrity { expected: u16, actual: u16 },

    #[error("Frame too short: {0} bytes")]
    FrameTooShort(usize),

    #[error("Unsupported function code {0:#04x}")]
    UnsupportedFunctionCode(u8),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Item count mismatch: payload has {values} values, {names} names given")]
    ItemCountMismatch { values: usize, names: usize },
}

/// Header fields of a validated reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMeta {
    pub addr: u8,
    pub func_code: u8,
}

impl FrameMeta {
    /// Whether the device answered with an exception.
    pub fn is_error_reply(&self) -> bool {
        self.func_code > ERROR_REPLY_FLAG
    }
}

/// Parts of a validated config frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigFrame<'a> {
    /// Device address and function code.
    pub header: &'a [u8],
    pub register: &'a [u8],
    pub data: &'a [u8],
}

/// Modbus CRC-16 (poly 0xA001 reflected, init 0xFFFF).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Checksum bytes in wire order (low byte first).
pub fn crc_bytes(data: &[u8]) -> [u8; 2] {
    crc16(data).to_le_bytes()
}

/// Check `crc` against the checksum of `body`.
pub fn validate_crc(body: &[u8], crc: &[u8]) -> Result<(), CodecError> {
    let expected = crc16(body);
    let actual = match crc {
        [lo, hi] => u16::from_le_bytes([*lo, *hi]),
        _ => return Err(CodecError::FrameTooShort(body.len() + crc.len())),
    };
    if expected == actual {
        Ok(())
    } else {
        Err(CodecError::FrameIntegrity { expected, actual })
    }
}

/// Build a request frame: header, data, then the CRC of everything before it.
pub fn compose_request(addr: u8, func_code: u8, data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(2 + data.len() + CRC_LEN);
    frame.push(addr);
    frame.push(func_code);
    frame.extend_from_slice(data);
    let crc = crc_bytes(&frame);
    frame.extend_from_slice(&crc);
    frame
}

/// Build a read request. `block` is the register address and count, 4 bytes.
pub fn read_request(addr: u8, block: &[u8]) -> Vec<u8> {
    compose_request(addr, FUNC_READ, block)
}

/// Build a single-register write request.
pub fn write_request(addr: u8, register: u16, value: u16) -> Vec<u8> {
    let mut data = [0u8; 4];
    data[..2].copy_from_slice(&register.to_be_bytes());
    data[2..].copy_from_slice(&value.to_be_bytes());
    compose_request(addr, FUNC_WRITE, &data)
}

/// Validate a reply frame and split it into header and payload.
pub fn split_and_validate(src: &[u8]) -> Result<(FrameMeta, &[u8]), CodecError> {
    if src.len() < 2 + CRC_LEN {
        return Err(CodecError::FrameTooShort(src.len()));
    }

    let base = src.len() - CRC_LEN;
    validate_crc(&src[..base], &src[base..])?;

    let meta = FrameMeta {
        addr: src[0],
        func_code: src[1],
    };

    let payload = match meta.func_code {
        fc if fc > ERROR_REPLY_FLAG => &src[2..base],
        FUNC_READ => {
            if base < 3 {
                return Err(CodecError::FrameTooShort(src.len()));
            }
            &src[3..base]
        }
        FUNC_WRITE => &src[2..base],
        fc => return Err(CodecError::UnsupportedFunctionCode(fc)),
    };

    Ok((meta, payload))
}

/// Split a fixed 8-byte config frame.
pub fn split_config(src: &[u8]) -> Result<ConfigFrame<'_>, CodecError> {
    if src.len() != CONFIG_FRAME_LEN {
        return Err(CodecError::MalformedPayload(format!(
            "config frame must be {} bytes, got {}",
            CONFIG_FRAME_LEN,
            src.len()
        )));
    }
    validate_crc(&src[..6], &src[6..])?;
    Ok(ConfigFrame {
        header: &src[..2],
        register: &src[2..4],
        data: &src[4..6],
    })
}

/// Round to two decimal places, half away from zero.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Decode scaled-float groups: `[m_hi, m_lo, e_hi, e_lo]` -> `m * 10^-e`.
pub fn decode_scaled_floats(payload: &[u8]) -> Result<Vec<f64>, CodecError> {
    if payload.is_empty() || payload.len() % 4 != 0 {
        return Err(CodecError::MalformedPayload(format!(
            "scaled-float payload length {} is not a positive multiple of 4",
            payload.len()
        )));
    }

    Ok(payload
        .chunks_exact(4)
        .map(|group| {
            let magnitude = u16::from_be_bytes([group[0], group[1]]) as f64;
            let exponent = u16::from_be_bytes([group[2], group[3]]) as i32;
            round2(magnitude * 10f64.powi(-exponent))
        })
        .collect())
}

/// Decode scaled floats and pair them with `names`, in order.
pub fn decode_items(payload: &[u8], names: &[String]) -> Result<Vec<MeasureItem>, CodecError> {
    let values = decode_scaled_floats(payload)?;
    if values.len() != names.len() {
        return Err(CodecError::ItemCountMismatch {
            values: values.len(),
            names: names.len(),
        });
    }
    Ok(names
        .iter()
        .zip(values)
        .map(|(name, value)| MeasureItem::new(name.clone(), value))
        .collect())
}

/// Decode a 2-byte slope/offset value (`u16 / 1000`).
pub fn decode_slope(payload: &[u8]) -> Result<f64, CodecError> {
    match payload {
        [hi, lo] => Ok(u16::from_be_bytes([*hi, *lo]) as f64 / 1000.0),
        _ => Err(CodecError::MalformedPayload(format!(
            "slope payload must be 2 bytes, got {}",
            payload.len()
        ))),
    }
}

/// Decode a slope payload into a named item.
pub fn decode_slope_item(payload: &[u8], name: &str) -> Result<MeasureItem, CodecError> {
    decode_slope(payload).map(|value| MeasureItem::new(name, value))
}

/// Split a write echo payload into `(register, data)`.
pub fn split_write_echo(payload: &[u8]) -> Result<(&[u8], &[u8]), CodecError> {
    if payload.len() < 2 {
        return Err(CodecError::MalformedPayload(format!(
            "write echo payload too short: {} bytes",
            payload.len()
        )));
    }
    Ok(payload.split_at(2))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_crc(body: &[u8]) -> Vec<u8> {
        let mut frame = body.to_vec();
        frame.extend_from_slice(&crc_bytes(body));
        frame
    }

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(crc16(b"123456789"), 0x4B37);
    }

    #[test]
    fn test_compose_read_request() {
        let frame = read_request(0x01, &[0x00, 0x00, 0x00, 0x0A]);
        assert_eq!(frame, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD]);
    }

    #[test]
    fn test_write_request_layout() {
        let frame = write_request(0x02, 0x2002, 0x0001);
        assert_eq!(&frame[..6], &[0x02, 0x06, 0x20, 0x02, 0x00, 0x01]);
        assert!(validate_crc(&frame[..6], &frame[6..]).is_ok());
    }

    #[test]
    fn test_crc_detects_single_bit_flips() {
        let samples: [&[u8]; 3] = [b"", &[0x01, 0x03, 0x04], &[0xFF; 17]];
        for body in samples {
            let frame = with_crc(body);
            let base = frame.len() - CRC_LEN;
            assert!(validate_crc(&frame[..base], &frame[base..]).is_ok());

            for bit in 0..frame.len() * 8 {
                let mut corrupted = frame.clone();
                corrupted[bit / 8] ^= 1 << (bit % 8);
                assert!(
                    validate_crc(&corrupted[..base], &corrupted[base..]).is_err(),
                    "flip of bit {} went unnoticed",
                    bit
                );
            }
        }
    }

    #[test]
    fn test_split_read_reply() {
        let frame = with_crc(&[0x01, 0x03, 0x04, 0x00, 0x0A, 0x00, 0x01]);
        let (meta, payload) = split_and_validate(&frame).unwrap();

        assert_eq!(meta, FrameMeta { addr: 0x01, func_code: 0x03 });
        assert_eq!(payload, &[0x00, 0x0A, 0x00, 0x01]);
    }

    #[test]
    fn test_split_rejects_bad_crc() {
        let mut frame = with_crc(&[0x01, 0x03, 0x04, 0x00, 0x0A, 0x00, 0x01]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;

        assert!(matches!(
            split_and_validate(&frame),
            Err(CodecError::FrameIntegrity { .. })
        ));
    }

    #[test]
    fn test_split_write_echo_and_error_reply() {
        let echo = with_crc(&[0x02, 0x06, 0x20, 0x02, 0x00, 0x01]);
        let (meta, payload) = split_and_validate(&echo).unwrap();
        assert_eq!(meta.func_code, FUNC_WRITE);
        let (register, data) = split_write_echo(payload).unwrap();
        assert_eq!(register, &[0x20, 0x02]);
        assert_eq!(data, &[0x00, 0x01]);

        let error = with_crc(&[0x02, 0x83, 0x02]);
        let (meta, payload) = split_and_validate(&error).unwrap();
        assert!(meta.is_error_reply());
        assert_eq!(payload, &[0x02]);
    }

    #[test]
    fn test_split_unsupported_function_code() {
        let frame = with_crc(&[0x01, 0x10, 0x00]);
        assert_eq!(
            split_and_validate(&frame),
            Err(CodecError::UnsupportedFunctionCode(0x10))
        );
    }

    #[test]
    fn test_split_short_frame() {
        assert_eq!(
            split_and_validate(&[0x01, 0x03]),
            Err(CodecError::FrameTooShort(2))
        );
    }

    #[test]
    fn test_split_config() {
        let frame = with_crc(&[0x01, 0x06, 0x20, 0x02, 0x00, 0x05]);
        let config = split_config(&frame).unwrap();
        assert_eq!(config.header, &[0x01, 0x06]);
        assert_eq!(config.register, &[0x20, 0x02]);
        assert_eq!(config.data, &[0x00, 0x05]);

        let mut bad = frame.clone();
        bad[4] = 0xFF;
        assert!(matches!(
            split_config(&bad),
            Err(CodecError::FrameIntegrity { .. })
        ));
        assert!(split_config(&frame[..7]).is_err());
    }

    #[test]
    fn test_decode_scaled_floats() {
        assert_eq!(
            decode_scaled_floats(&[0x00, 0x0A, 0x00, 0x01]).unwrap(),
            vec![1.0]
        );
        // 825 * 10^-2, 213 * 10^-1
        assert_eq!(
            decode_scaled_floats(&[0x03, 0x39, 0x00, 0x02, 0x00, 0xD5, 0x00, 0x01]).unwrap(),
            vec![8.25, 21.3]
        );
        // 1234 * 10^-3 rounds to two places
        assert_eq!(
            decode_scaled_floats(&[0x04, 0xD2, 0x00, 0x03]).unwrap(),
            vec![1.23]
        );
    }

    #[test]
    fn test_decode_scaled_floats_malformed() {
        assert!(matches!(
            decode_scaled_floats(&[0x00, 0x0A, 0x00]),
            Err(CodecError::MalformedPayload(_))
        ));
        assert!(matches!(
            decode_scaled_floats(&[]),
            Err(CodecError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_decode_items_count_mismatch() {
        let names = vec!["Oxygen".to_string(), "Temp".to_string()];
        let err = decode_items(&[0x00, 0x0A, 0x00, 0x01], &names).unwrap_err();
        assert_eq!(err, CodecError::ItemCountMismatch { values: 1, names: 2 });

        let items = decode_items(&[0x00, 0x0A, 0x00, 0x01, 0x00, 0x14, 0x00, 0x00], &names).unwrap();
        assert_eq!(items[0], MeasureItem::new("Oxygen", 1.0));
        assert_eq!(items[1], MeasureItem::new("Temp", 20.0));
    }

    #[test]
    fn test_decode_slope() {
        assert_eq!(decode_slope(&[0x03, 0xE8]).unwrap(), 1.0);
        assert!(decode_slope(&[0x03, 0xE8, 0x00]).is_err());
        assert!(decode_slope(&[]).is_err());

        let item = decode_slope_item(&[0x01, 0xF4], "Slope").unwrap();
        assert_eq!(item, MeasureItem::new("Slope", 0.5));
    }
}
