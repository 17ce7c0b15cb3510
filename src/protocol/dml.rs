//! DML records
//!
//! Data frame payloads are flat records of typed fields laid out back to back
//! with no padding. A record type is described by a static list of
//! `(name, type)` pairs; decoding walks the list, encoding writes the values
//! back in the same order. Bytes past the last known field are preserved so a
//! rewrite never drops data the layout does not describe.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::common::{ProxyError, Result};

/// Wire type of a DML field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmlType {
    /// i8
    Byt,
    /// u8
    UByt,
    /// u16
    UShrt,
    /// i32
    Int,
    /// u32
    UInt,
    /// u16 length + bytes
    Str,
    /// u16 length in code units + UTF-16LE
    WStr,
    /// f32
    Flt,
    /// f64
    Dbl,
    /// u64 global id
    Gid,
}

/// A decoded DML value
#[derive(Debug, Clone, PartialEq)]
pub enum DmlValue {
    Byt(i8),
    UByt(u8),
    UShrt(u16),
    Int(i32),
    UInt(u32),
    Str(Bytes),
    WStr(String),
    Flt(f32),
    Dbl(f64),
    Gid(u64),
}

impl DmlValue {
    /// Wire type of the value
    pub fn dml_type(&self) -> DmlType {
        match self {
            DmlValue::Byt(_) => DmlType::Byt,
            DmlValue::UByt(_) => DmlType::UByt,
            DmlValue::UShrt(_) => DmlType::UShrt,
            DmlValue::Int(_) => DmlType::Int,
            DmlValue::UInt(_) => DmlType::UInt,
            DmlValue::Str(_) => DmlType::Str,
            DmlValue::WStr(_) => DmlType::WStr,
            DmlValue::Flt(_) => DmlType::Flt,
            DmlValue::Dbl(_) => DmlType::Dbl,
            DmlValue::Gid(_) => DmlType::Gid,
        }
    }

    /// Build a STR value from text
    pub fn str(text: &str) -> Self {
        DmlValue::Str(Bytes::copy_from_slice(text.as_bytes()))
    }

    fn read(ty: DmlType, buf: &mut &[u8]) -> Result<Self> {
        let value = match ty {
            DmlType::Byt => {
                need(buf, 1)?;
                DmlValue::Byt(buf.get_i8())
            }
            DmlType::UByt => {
                need(buf, 1)?;
                DmlValue::UByt(buf.get_u8())
            }
            DmlType::UShrt => {
                need(buf, 2)?;
                DmlValue::UShrt(buf.get_u16_le())
            }
            DmlType::Int => {
                need(buf, 4)?;
                DmlValue::Int(buf.get_i32_le())
            }
            DmlType::UInt => {
                need(buf, 4)?;
                DmlValue::UInt(buf.get_u32_le())
            }
            DmlType::Str => {
                need(buf, 2)?;
                let len = buf.get_u16_le() as usize;
                need(buf, len)?;
                let value = Bytes::copy_from_slice(&buf[..len]);
                buf.advance(len);
                DmlValue::Str(value)
            }
            DmlType::WStr => {
                need(buf, 2)?;
                let units = buf.get_u16_le() as usize;
                need(buf, units * 2)?;
                let wide: Vec<u16> = (0..units).map(|_| buf.get_u16_le()).collect();
                let text = String::from_utf16(&wide)
                    .map_err(|e| ProxyError::Dml(format!("invalid WSTR: {}", e)))?;
                DmlValue::WStr(text)
            }
            DmlType::Flt => {
                need(buf, 4)?;
                DmlValue::Flt(buf.get_f32_le())
            }
            DmlType::Dbl => {
                need(buf, 8)?;
                DmlValue::Dbl(buf.get_f64_le())
            }
            DmlType::Gid => {
                need(buf, 8)?;
                DmlValue::Gid(buf.get_u64_le())
            }
        };
        Ok(value)
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            DmlValue::Byt(v) => buf.put_i8(*v),
            DmlValue::UByt(v) => buf.put_u8(*v),
            DmlValue::UShrt(v) => buf.put_u16_le(*v),
            DmlValue::Int(v) => buf.put_i32_le(*v),
            DmlValue::UInt(v) => buf.put_u32_le(*v),
            DmlValue::Str(v) => {
                let len = u16::try_from(v.len())
                    .map_err(|_| ProxyError::Dml(format!("STR of {} bytes is too long", v.len())))?;
                buf.put_u16_le(len);
                buf.put_slice(v);
            }
            DmlValue::WStr(v) => {
                let wide: Vec<u16> = v.encode_utf16().collect();
                let len = u16::try_from(wide.len())
                    .map_err(|_| ProxyError::Dml("WSTR is too long".to_string()))?;
                buf.put_u16_le(len);
                for unit in wide {
                    buf.put_u16_le(unit);
                }
            }
            DmlValue::Flt(v) => buf.put_f32_le(*v),
            DmlValue::Dbl(v) => buf.put_f64_le(*v),
            DmlValue::Gid(v) => buf.put_u64_le(*v),
        }
        Ok(())
    }
}

/// Field list of a record type
pub type DmlLayout = &'static [(&'static str, DmlType)];

/// A decoded record
#[derive(Debug, Clone, PartialEq)]
pub struct DmlRecord {
    fields: Vec<(&'static str, DmlValue)>,
    trailer: Bytes,
}

impl DmlRecord {
    /// Decode a payload against a layout
    pub fn decode(layout: DmlLayout, payload: &[u8]) -> Result<Self> {
        let mut buf = payload;
        let mut fields = Vec::with_capacity(layout.len());

        for (name, ty) in layout {
            let value = DmlValue::read(*ty, &mut buf)
                .map_err(|e| ProxyError::Dml(format!("field {}: {}", name, e)))?;
            fields.push((*name, value));
        }

        Ok(Self { fields, trailer: Bytes::copy_from_slice(buf) })
    }

    /// Encode the record, including any trailing bytes seen on decode
    pub fn encode(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::with_capacity(64 + self.trailer.len());
        for (_, value) in &self.fields {
            value.write(&mut buf)?;
        }
        buf.put_slice(&self.trailer);
        Ok(buf)
    }

    /// Value of a field
    pub fn get(&self, name: &str) -> Option<&DmlValue> {
        self.fields.iter().find(|(field, _)| *field == name).map(|(_, value)| value)
    }

    /// Replace a field value; the type must match the layout
    pub fn set(&mut self, name: &str, value: DmlValue) -> Result<()> {
        let slot = self
            .fields
            .iter_mut()
            .find(|(field, _)| *field == name)
            .ok_or_else(|| ProxyError::Dml(format!("no field named {}", name)))?;

        if slot.1.dml_type() != value.dml_type() {
            return Err(ProxyError::Dml(format!(
                "field {} is {:?}, not {:?}",
                name,
                slot.1.dml_type(),
                value.dml_type()
            )));
        }

        slot.1 = value;
        Ok(())
    }

    /// STR field as UTF-8 text
    pub fn get_str(&self, name: &str) -> Result<String> {
        match self.get(name) {
            Some(DmlValue::Str(bytes)) => std::str::from_utf8(bytes)
                .map(str::to_string)
                .map_err(|e| ProxyError::Dml(format!("field {} is not UTF-8: {}", name, e))),
            Some(other) => Err(ProxyError::Dml(format!("field {} is {:?}, not Str", name, other.dml_type()))),
            None => Err(ProxyError::Dml(format!("no field named {}", name))),
        }
    }

    /// INT field
    pub fn get_int(&self, name: &str) -> Result<i32> {
        match self.get(name) {
            Some(DmlValue::Int(v)) => Ok(*v),
            Some(other) => Err(ProxyError::Dml(format!("field {} is {:?}, not Int", name, other.dml_type()))),
            None => Err(ProxyError::Dml(format!("no field named {}", name))),
        }
    }
}

fn need(buf: &[u8], len: usize) -> Result<()> {
    if buf.len() < len {
        return Err(ProxyError::Dml(format!("need {} bytes, have {}", len, buf.len())));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUT: DmlLayout = &[
        ("Name", DmlType::Str),
        ("Port", DmlType::Int),
        ("Id", DmlType::Gid),
        ("Title", DmlType::WStr),
        ("Scale", DmlType::Flt),
    ];

    fn sample() -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u16_le(4);
        buf.put_slice(b"host");
        buf.put_i32_le(12000);
        buf.put_u64_le(0xDEAD_BEEF);
        buf.put_u16_le(2);
        buf.put_u16_le('h' as u16);
        buf.put_u16_le('i' as u16);
        buf.put_f32_le(1.5);
        buf
    }

    #[test]
    fn test_decode_fields() {
        let record = DmlRecord::decode(LAYOUT, &sample()).unwrap();

        assert_eq!(record.get_str("Name").unwrap(), "host");
        assert_eq!(record.get_int("Port").unwrap(), 12000);
        assert_eq!(record.get("Id"), Some(&DmlValue::Gid(0xDEAD_BEEF)));
        assert_eq!(record.get("Title"), Some(&DmlValue::WStr("hi".to_string())));
        assert_eq!(record.get("Scale"), Some(&DmlValue::Flt(1.5)));
    }

    #[test]
    fn test_set_changes_lengths_and_keeps_trailer() {
        let mut payload = sample();
        payload.put_slice(&[0xAA, 0xBB]);

        let mut record = DmlRecord::decode(LAYOUT, &payload).unwrap();
        record.set("Name", DmlValue::str("127.0.0.1")).unwrap();
        record.set("Port", DmlValue::Int(40000)).unwrap();

        let encoded = record.encode().unwrap();
        assert_eq!(&encoded[..2], &9u16.to_le_bytes());
        assert_eq!(&encoded[encoded.len() - 2..], &[0xAA, 0xBB]);

        let reparsed = DmlRecord::decode(LAYOUT, &encoded).unwrap();
        assert_eq!(reparsed.get_str("Name").unwrap(), "127.0.0.1");
        assert_eq!(reparsed.get_int("Port").unwrap(), 40000);
    }

    #[test]
    fn test_type_mismatch_and_truncation() {
        let mut record = DmlRecord::decode(LAYOUT, &sample()).unwrap();
        assert!(record.set("Port", DmlValue::str("x")).is_err());
        assert!(record.set("Missing", DmlValue::Int(1)).is_err());
        assert!(record.get_int("Name").is_err());

        let short = sample();
        assert!(DmlRecord::decode(LAYOUT, &short[..7]).is_err());
    }
}
