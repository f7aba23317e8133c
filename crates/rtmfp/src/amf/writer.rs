// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! AMF0 writer (byte arrays escape into AMF3 behind the AVM+ switch).

use crate::packet::{BinaryWriter, BufferError};

use super::{
    AmfObject, AmfValue, AMF_AVMPLUS_OBJECT, AMF_BEGIN_OBJECT, AMF_BOOLEAN, AMF_END_OBJECT,
    AMF_LONG_STRING, AMF_NULL, AMF_NUMBER, AMF_STRING, AMF_UNDEFINED,
};

/// The AMF invoke message tag (what `Flow::unpack` classifies on).
const AMF_INVOKE_TAG: u8 = 0x14;

/// AMF0 encoder over any [`BinaryWriter`] sink.
pub struct AmfWriter<'a, W: BinaryWriter> {
    out: &'a mut W,
}

impl<'a, W: BinaryWriter> AmfWriter<'a, W> {
    /// Wrap a sink.
    pub fn new(out: &'a mut W) -> Self {
        Self { out }
    }

    /// Emit a response header: invoke tag, four zero bytes, the response
    /// key (`_result`, `onStatus`, `_error`), the callback handle, null.
    pub fn write_response_header(
        &mut self,
        key: &str,
        callback_handle: f64,
    ) -> Result<(), BufferError> {
        self.out.write8(AMF_INVOKE_TAG)?;
        self.out.write32(0)?;
        self.write(key)?;
        self.write_number(callback_handle)?;
        self.write_null()
    }

    /// Write a boolean value.
    pub fn write_bool(&mut self, value: bool) -> Result<(), BufferError> {
        self.out.write8(AMF_BOOLEAN)?;
        self.out.write8(u8::from(value))
    }

    /// Write a number value.
    pub fn write_number(&mut self, value: f64) -> Result<(), BufferError> {
        self.out.write8(AMF_NUMBER)?;
        self.out.write_number(value)
    }

    /// Write a string value; the empty string encodes as undefined.
    pub fn write(&mut self, value: &str) -> Result<(), BufferError> {
        if value.is_empty() {
            return self.out.write8(AMF_UNDEFINED);
        }
        self.out.write8(AMF_STRING)?;
        self.out.write_string16(value)
    }

    /// Write a null value.
    pub fn write_null(&mut self) -> Result<(), BufferError> {
        self.out.write8(AMF_NULL)
    }

    /// Write a whole object.
    pub fn write_object(&mut self, object: &AmfObject) -> Result<(), BufferError> {
        let mut writer = self.begin_object()?;
        for (name, value) in object.iter() {
            writer.write(name, value)?;
        }
        writer.end()
    }

    /// Write one named property (key + value, no markers around the key).
    pub fn write_object_property(
        &mut self,
        name: &str,
        value: &AmfValue,
    ) -> Result<(), BufferError> {
        self.out.write_string16(name)?;
        self.write_value(value)
    }

    /// Write a byte array: AVM+ switch, then the AMF3 bytearray encoding.
    /// An empty array encodes as undefined.
    pub fn write_byte_array(&mut self, data: &[u8]) -> Result<(), BufferError> {
        if data.is_empty() {
            return self.out.write8(AMF_UNDEFINED);
        }
        self.out.write8(AMF_AVMPLUS_OBJECT)?;
        self.out.write8(AMF_LONG_STRING)?;
        self.out.write7_bit_value(((data.len() as u32) << 1) | 1)?;
        self.out.write_raw(data)
    }

    /// Start an object; finish it with [`AmfObjectWriter::end`].
    pub fn begin_object(&mut self) -> Result<AmfObjectWriter<'_, 'a, W>, BufferError> {
        self.out.write8(AMF_BEGIN_OBJECT)?;
        Ok(AmfObjectWriter {
            amf: self,
            ended: false,
        })
    }

    fn write_value(&mut self, value: &AmfValue) -> Result<(), BufferError> {
        match value {
            AmfValue::Number(n) => self.write_number(*n),
            AmfValue::Boolean(b) => self.write_bool(*b),
            AmfValue::String(s) => self.write(s),
            AmfValue::ByteArray(data) => self.write_byte_array(data),
            AmfValue::Null => self.write_null(),
            AmfValue::Undefined => self.out.write8(AMF_UNDEFINED),
        }
    }

    fn end_object(&mut self) -> Result<(), BufferError> {
        self.out.write16(0)?;
        self.out.write8(AMF_END_OBJECT)
    }
}

/// Scoped writer for one object's properties.
///
/// Emits the object terminator exactly once: on [`end`](Self::end), or
/// best-effort on drop if the caller forgot.
pub struct AmfObjectWriter<'w, 'a, W: BinaryWriter> {
    amf: &'w mut AmfWriter<'a, W>,
    ended: bool,
}

impl<W: BinaryWriter> AmfObjectWriter<'_, '_, W> {
    /// Write one property.
    pub fn write(&mut self, name: &str, value: &AmfValue) -> Result<(), BufferError> {
        self.amf.write_object_property(name, value)
    }

    /// String property shorthand.
    pub fn write_string(&mut self, name: &str, value: &str) -> Result<(), BufferError> {
        self.write(name, &AmfValue::String(value.to_owned()))
    }

    /// Number property shorthand.
    pub fn write_number(&mut self, name: &str, value: f64) -> Result<(), BufferError> {
        self.write(name, &AmfValue::Number(value))
    }

    /// Terminate the object.
    pub fn end(mut self) -> Result<(), BufferError> {
        self.ended = true;
        self.amf.end_object()
    }
}

impl<W: BinaryWriter> Drop for AmfObjectWriter<'_, '_, W> {
    fn drop(&mut self) {
        if !self.ended {
            let _ = self.amf.end_object();
        }
    }
}
