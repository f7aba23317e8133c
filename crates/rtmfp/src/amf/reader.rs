// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! AMF0 reader (with the AVM+ escape into AMF3).

use crate::error::{Error, Result};
use crate::packet::PacketReader;

use super::{
    AmfObject, AmfValue, AMF3_DOUBLE, AMF3_INTEGER, AMF3_NULL, AMF3_STRING, AMF_AVMPLUS_OBJECT,
    AMF_BEGIN_OBJECT, AMF_BOOLEAN, AMF_END_OBJECT, AMF_LONG_STRING, AMF_NULL, AMF_NUMBER,
    AMF_STRING, AMF_UNDEFINED,
};

/// AMF0 decoder over a [`PacketReader`].
///
/// Typed accessors (`read_string`, `read_number`, ...) fail on a marker
/// mismatch; [`AmfReader::read_value`] decodes whatever comes next.
pub struct AmfReader<'a, 'b> {
    reader: &'b mut PacketReader<'a>,
}

impl<'a, 'b> AmfReader<'a, 'b> {
    /// Wrap a packet reader positioned on an AMF value.
    pub fn new(reader: &'b mut PacketReader<'a>) -> Self {
        Self { reader }
    }

    /// Bytes left in the underlying reader.
    #[must_use]
    pub fn available(&self) -> usize {
        self.reader.available()
    }

    /// Borrow the underlying packet reader.
    pub fn inner(&mut self) -> &mut PacketReader<'a> {
        self.reader
    }

    /// Read a string value. Undefined decodes as the empty string.
    pub fn read_string(&mut self) -> Result<String> {
        match self.reader.read8()? {
            AMF_STRING => Ok(self.reader.read_string16()?),
            AMF_UNDEFINED => Ok(String::new()),
            marker => Err(bad_marker("string", marker)),
        }
    }

    /// Read a number value.
    pub fn read_number(&mut self) -> Result<f64> {
        match self.reader.read8()? {
            AMF_NUMBER => Ok(self.reader.read_number()?),
            marker => Err(bad_marker("number", marker)),
        }
    }

    /// Read a boolean value.
    pub fn read_bool(&mut self) -> Result<bool> {
        match self.reader.read8()? {
            AMF_BOOLEAN => Ok(self.reader.read8()? != 0),
            marker => Err(bad_marker("boolean", marker)),
        }
    }

    /// Skip one null (or undefined) value.
    pub fn skip_null(&mut self) -> Result<()> {
        match self.reader.read8()? {
            AMF_NULL | AMF_UNDEFINED => Ok(()),
            marker => Err(bad_marker("null", marker)),
        }
    }

    /// Read an object value.
    pub fn read_object(&mut self) -> Result<AmfObject> {
        match self.reader.read8()? {
            AMF_BEGIN_OBJECT => self.read_object_properties(),
            marker => Err(bad_marker("object", marker)),
        }
    }

    /// Decode the next value, whatever its type.
    pub fn read_value(&mut self) -> Result<AmfValue> {
        let marker = self.reader.read8()?;
        self.read_value_of(marker)
    }

    fn read_value_of(&mut self, marker: u8) -> Result<AmfValue> {
        match marker {
            AMF_NUMBER => Ok(AmfValue::Number(self.reader.read_number()?)),
            AMF_BOOLEAN => Ok(AmfValue::Boolean(self.reader.read8()? != 0)),
            AMF_STRING => Ok(AmfValue::String(self.reader.read_string16()?)),
            AMF_LONG_STRING => {
                let len = self.reader.read32()? as usize;
                let raw = self.reader.read_raw_vec(len)?;
                Ok(AmfValue::String(String::from_utf8_lossy(&raw).into_owned()))
            }
            AMF_NULL => Ok(AmfValue::Null),
            AMF_UNDEFINED => Ok(AmfValue::Undefined),
            AMF_AVMPLUS_OBJECT => self.read_amf3_value(),
            marker => Err(bad_marker("value", marker)),
        }
    }

    fn read_object_properties(&mut self) -> Result<AmfObject> {
        let mut object = AmfObject::new();
        loop {
            let name = self.reader.read_string16()?;
            if name.is_empty() {
                match self.reader.read8()? {
                    AMF_END_OBJECT => return Ok(object),
                    marker => return Err(bad_marker("end of object", marker)),
                }
            }
            let marker = self.reader.read8()?;
            // Nested objects are flattened away by clients we care about,
            // but tolerate them instead of failing the whole message.
            let value = if marker == AMF_BEGIN_OBJECT {
                self.read_object_properties()?;
                AmfValue::Undefined
            } else {
                self.read_value_of(marker)?
            };
            object.insert(name, value);
        }
    }

    /// One AMF3 value, entered through the AVM+ switch.
    fn read_amf3_value(&mut self) -> Result<AmfValue> {
        match self.reader.read8()? {
            AMF3_NULL => Ok(AmfValue::Null),
            AMF3_INTEGER => {
                let raw = self.reader.read7_bit_value()?;
                Ok(AmfValue::Number(f64::from(raw)))
            }
            AMF3_DOUBLE => Ok(AmfValue::Number(self.reader.read_number()?)),
            AMF3_STRING => {
                let header = self.reader.read7_bit_value()?;
                let len = (header >> 1) as usize;
                let raw = self.reader.read_raw_vec(len)?;
                Ok(AmfValue::String(String::from_utf8_lossy(&raw).into_owned()))
            }
            AMF_LONG_STRING => {
                // AMF3 bytearray: 7-bit length with the by-value bit.
                let header = self.reader.read7_bit_value()?;
                let len = (header >> 1) as usize;
                Ok(AmfValue::ByteArray(self.reader.read_raw_vec(len)?))
            }
            marker => Err(bad_marker("AMF3 value", marker)),
        }
    }
}

fn bad_marker(expected: &str, marker: u8) -> Error {
    Error::Protocol(format!(
        "AMF marker '{:02x}' where {} was expected",
        marker, expected
    ))
}
