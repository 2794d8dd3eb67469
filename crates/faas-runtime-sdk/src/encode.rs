//! Strict JSON encoding
//!
//! `serde_json` writes NaN and infinities as `null`, so a handler output or
//! environment entry holding one would be stored in altered form. Values are
//! first walked with a serializer that only inspects floats, then encoded.

use std::fmt;

use serde::ser::{self, Serialize};
use serde_json::Value;

/// A value that has no faithful JSON encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeError(String);

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for EncodeError {}

impl ser::Error for EncodeError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        EncodeError(msg.to_string())
    }
}

/// Encode `value` as JSON, rejecting non-finite floats and non-string map keys
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value, EncodeError> {
    value.serialize(FiniteCheck)?;
    serde_json::to_value(value).map_err(|e| EncodeError(e.to_string()))
}

fn check_float(v: f64) -> Result<(), EncodeError> {
    if v.is_finite() {
        Ok(())
    } else {
        Err(EncodeError(format!("{} cannot be represented in JSON", v)))
    }
}

#[derive(Clone, Copy)]
struct FiniteCheck;

impl ser::Serializer for FiniteCheck {
    type Ok = ();
    type Error = EncodeError;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    fn serialize_bool(self, _: bool) -> Result<(), EncodeError> {
        Ok(())
    }
    fn serialize_i8(self, _: i8) -> Result<(), EncodeError> {
        Ok(())
    }
    fn serialize_i16(self, _: i16) -> Result<(), EncodeError> {
        Ok(())
    }
    fn serialize_i32(self, _: i32) -> Result<(), EncodeError> {
        Ok(())
    }
    fn serialize_i64(self, _: i64) -> Result<(), EncodeError> {
        Ok(())
    }
    fn serialize_i128(self, _: i128) -> Result<(), EncodeError> {
        Ok(())
    }
    fn serialize_u8(self, _: u8) -> Result<(), EncodeError> {
        Ok(())
    }
    fn serialize_u16(self, _: u16) -> Result<(), EncodeError> {
        Ok(())
    }
    fn serialize_u32(self, _: u32) -> Result<(), EncodeError> {
        Ok(())
    }
    fn serialize_u64(self, _: u64) -> Result<(), EncodeError> {
        Ok(())
    }
    fn serialize_u128(self, _: u128) -> Result<(), EncodeError> {
        Ok(())
    }
    fn serialize_f32(self, v: f32) -> Result<(), EncodeError> {
        check_float(f64::from(v))
    }
    fn serialize_f64(self, v: f64) -> Result<(), EncodeError> {
        check_float(v)
    }
    fn serialize_char(self, _: char) -> Result<(), EncodeError> {
        Ok(())
    }
    fn serialize_str(self, _: &str) -> Result<(), EncodeError> {
        Ok(())
    }
    fn serialize_bytes(self, _: &[u8]) -> Result<(), EncodeError> {
        Ok(())
    }
    fn serialize_none(self) -> Result<(), EncodeError> {
        Ok(())
    }
    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<(), EncodeError> {
        value.serialize(self)
    }
    fn serialize_unit(self) -> Result<(), EncodeError> {
        Ok(())
    }
    fn serialize_unit_struct(self, _: &'static str) -> Result<(), EncodeError> {
        Ok(())
    }
    fn serialize_unit_variant(self, _: &'static str, _: u32, _: &'static str) -> Result<(), EncodeError> {
        Ok(())
    }
    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _: &'static str,
        value: &T,
    ) -> Result<(), EncodeError> {
        value.serialize(self)
    }
    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        value: &T,
    ) -> Result<(), EncodeError> {
        value.serialize(self)
    }
    fn serialize_seq(self, _: Option<usize>) -> Result<Self, EncodeError> {
        Ok(self)
    }
    fn serialize_tuple(self, _: usize) -> Result<Self, EncodeError> {
        Ok(self)
    }
    fn serialize_tuple_struct(self, _: &'static str, _: usize) -> Result<Self, EncodeError> {
        Ok(self)
    }
    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self, EncodeError> {
        Ok(self)
    }
    fn serialize_map(self, _: Option<usize>) -> Result<Self, EncodeError> {
        Ok(self)
    }
    fn serialize_struct(self, _: &'static str, _: usize) -> Result<Self, EncodeError> {
        Ok(self)
    }
    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self, EncodeError> {
        Ok(self)
    }
}

impl ser::SerializeSeq for FiniteCheck {
    type Ok = ();
    type Error = EncodeError;
    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), EncodeError> {
        value.serialize(*self)
    }
    fn end(self) -> Result<(), EncodeError> {
        Ok(())
    }
}

impl ser::SerializeTuple for FiniteCheck {
    type Ok = ();
    type Error = EncodeError;
    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), EncodeError> {
        value.serialize(*self)
    }
    fn end(self) -> Result<(), EncodeError> {
        Ok(())
    }
}

impl ser::SerializeTupleStruct for FiniteCheck {
    type Ok = ();
    type Error = EncodeError;
    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), EncodeError> {
        value.serialize(*self)
    }
    fn end(self) -> Result<(), EncodeError> {
        Ok(())
    }
}

impl ser::SerializeTupleVariant for FiniteCheck {
    type Ok = ();
    type Error = EncodeError;
    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), EncodeError> {
        value.serialize(*self)
    }
    fn end(self) -> Result<(), EncodeError> {
        Ok(())
    }
}

impl ser::SerializeMap for FiniteCheck {
    type Ok = ();
    type Error = EncodeError;
    // Key validity is left to serde_json
    fn serialize_key<T: Serialize + ?Sized>(&mut self, _: &T) -> Result<(), EncodeError> {
        Ok(())
    }
    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), EncodeError> {
        value.serialize(*self)
    }
    fn end(self) -> Result<(), EncodeError> {
        Ok(())
    }
}

impl ser::SerializeStruct for FiniteCheck {
    type Ok = ();
    type Error = EncodeError;
    fn serialize_field<T: Serialize + ?Sized>(&mut self, _: &'static str, value: &T) -> Result<(), EncodeError> {
        value.serialize(*self)
    }
    fn end(self) -> Result<(), EncodeError> {
        Ok(())
    }
}

impl ser::SerializeStructVariant for FiniteCheck {
    type Ok = ();
    type Error = EncodeError;
    fn serialize_field<T: Serialize + ?Sized>(&mut self, _: &'static str, value: &T) -> Result<(), EncodeError> {
        value.serialize(*self)
    }
    fn end(self) -> Result<(), EncodeError> {
        Ok(())
    }
}
