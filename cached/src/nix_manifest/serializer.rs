//! The serializer.
//!
//! This maps the serde data model back into the flat, colon-delimited
//! manifest format. Mirrors the restrictions enforced by the
//! deserializer: exactly one level of struct/map, no sequences besides
//! the space-delimited list newtype, no floats.

use serde::{ser, Serialize};

use super::{Error, Result};

/// The main serializer.
///
/// A manifest is always a single flat map, so one `Serializer`
/// accumulates the whole output: `serialize_struct`/`serialize_map`
/// borrow it to emit one `Key: value\n` line per field, and each
/// field's value serializes through the very same type acting as a
/// scalar serializer.
pub struct Serializer {
    output: String,
}

impl Serializer {
    pub fn new() -> Self {
        Self {
            output: String::new(),
        }
    }

    pub fn into_output(self) -> String {
        self.output
    }
}

impl Default for Serializer {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> ser::Serializer for &'a mut Serializer {
    type Ok = ();
    type Error = Error;

    type SerializeSeq = ser::Impossible<(), Error>;
    type SerializeTuple = ser::Impossible<(), Error>;
    type SerializeTupleStruct = ser::Impossible<(), Error>;
    type SerializeTupleVariant = ser::Impossible<(), Error>;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = ser::Impossible<(), Error>;

    fn serialize_bool(self, _v: bool) -> Result<()> {
        Err(Error::Unsupported("Boolean (bare)"))
    }

    fn serialize_i8(self, _v: i8) -> Result<()> {
        Err(Error::Unsupported("Signed integer"))
    }

    fn serialize_i16(self, _v: i16) -> Result<()> {
        Err(Error::Unsupported("Signed integer"))
    }

    fn serialize_i32(self, _v: i32) -> Result<()> {
        Err(Error::Unsupported("Signed integer"))
    }

    fn serialize_i64(self, _v: i64) -> Result<()> {
        Err(Error::Unsupported("Signed integer"))
    }

    fn serialize_u8(self, _v: u8) -> Result<()> {
        Err(Error::Unsupported("Bare integer"))
    }

    fn serialize_u16(self, _v: u16) -> Result<()> {
        Err(Error::Unsupported("Bare integer"))
    }

    fn serialize_u32(self, _v: u32) -> Result<()> {
        Err(Error::Unsupported("Bare integer"))
    }

    fn serialize_u64(self, _v: u64) -> Result<()> {
        Err(Error::Unsupported("Bare integer"))
    }

    fn serialize_f32(self, _v: f32) -> Result<()> {
        Err(Error::FloatUnsupported)
    }

    fn serialize_f64(self, _v: f64) -> Result<()> {
        Err(Error::FloatUnsupported)
    }

    fn serialize_char(self, _v: char) -> Result<()> {
        Err(Error::Unsupported("Char"))
    }

    fn serialize_str(self, _v: &str) -> Result<()> {
        Err(Error::Unexpected("bare string at the top level"))
    }

    fn serialize_bytes(self, _v: &[u8]) -> Result<()> {
        Err(Error::Unsupported("Byte sequence"))
    }

    fn serialize_none(self) -> Result<()> {
        Err(Error::NoneUnsupported)
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<()> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<()> {
        Err(Error::Unsupported("Unit"))
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<()> {
        self.serialize_unit()
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
    ) -> Result<()> {
        Err(Error::Unexpected("bare unit variant at the top level"))
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<()> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<()> {
        Err(Error::Unsupported("Newtype variant"))
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq> {
        Err(Error::Unsupported("Sequence"))
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple> {
        Err(Error::Unsupported("Tuple"))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct> {
        Err(Error::Unsupported("Tuple struct"))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant> {
        Err(Error::Unsupported("Tuple variant"))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap> {
        Ok(self)
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Self::SerializeStruct> {
        Ok(self)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant> {
        Err(Error::Unsupported("Struct variant"))
    }
}

/// Per-field scalar values (the right-hand side of `Key: value`).
///
/// Separate from the top-level `Serializer` impl above so that, e.g.,
/// a bare string is a serialization error at the top level (there is
/// no key to attach it to) but is exactly what most fields serialize
/// to.
struct ValueSerializer<'a>(&'a mut Serializer);

impl<'a> ser::Serializer for ValueSerializer<'a> {
    type Ok = ();
    type Error = Error;

    type SerializeSeq = ser::Impossible<(), Error>;
    type SerializeTuple = ser::Impossible<(), Error>;
    type SerializeTupleStruct = ser::Impossible<(), Error>;
    type SerializeTupleVariant = ser::Impossible<(), Error>;
    type SerializeMap = ser::Impossible<(), Error>;
    type SerializeStruct = ser::Impossible<(), Error>;
    type SerializeStructVariant = ser::Impossible<(), Error>;

    fn serialize_bool(self, v: bool) -> Result<()> {
        self.0.output.push_str(if v { "1" } else { "0" });
        Ok(())
    }

    fn serialize_i8(self, _v: i8) -> Result<()> {
        Err(Error::Unsupported("Signed integer"))
    }

    fn serialize_i16(self, _v: i16) -> Result<()> {
        Err(Error::Unsupported("Signed integer"))
    }

    fn serialize_i32(self, _v: i32) -> Result<()> {
        Err(Error::Unsupported("Signed integer"))
    }

    fn serialize_i64(self, _v: i64) -> Result<()> {
        Err(Error::Unsupported("Signed integer"))
    }

    fn serialize_u8(self, v: u8) -> Result<()> {
        self.0.output.push_str(&v.to_string());
        Ok(())
    }

    fn serialize_u16(self, v: u16) -> Result<()> {
        self.0.output.push_str(&v.to_string());
        Ok(())
    }

    fn serialize_u32(self, v: u32) -> Result<()> {
        self.0.output.push_str(&v.to_string());
        Ok(())
    }

    fn serialize_u64(self, v: u64) -> Result<()> {
        self.0.output.push_str(&v.to_string());
        Ok(())
    }

    fn serialize_f32(self, _v: f32) -> Result<()> {
        Err(Error::FloatUnsupported)
    }

    fn serialize_f64(self, _v: f64) -> Result<()> {
        Err(Error::FloatUnsupported)
    }

    fn serialize_char(self, v: char) -> Result<()> {
        self.0.output.push(v);
        Ok(())
    }

    fn serialize_str(self, v: &str) -> Result<()> {
        self.0.output.push_str(v);
        Ok(())
    }

    fn serialize_bytes(self, _v: &[u8]) -> Result<()> {
        Err(Error::Unsupported("Byte sequence"))
    }

    fn serialize_none(self) -> Result<()> {
        Err(Error::NoneUnsupported)
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<()> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<()> {
        Err(Error::Unsupported("Unit"))
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<()> {
        self.serialize_unit()
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<()> {
        self.0.output.push_str(variant);
        Ok(())
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<()> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<()> {
        Err(Error::Unsupported("Newtype variant"))
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq> {
        Err(Error::Unsupported("Sequence"))
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple> {
        Err(Error::Unsupported("Tuple"))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct> {
        Err(Error::Unsupported("Tuple struct"))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant> {
        Err(Error::Unsupported("Tuple variant"))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap> {
        Err(Error::NestedMapUnsupported)
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Self::SerializeStruct> {
        Err(Error::NestedMapUnsupported)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant> {
        Err(Error::Unsupported("Struct variant"))
    }
}

impl<'a> ser::SerializeStruct for &'a mut Serializer {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<()> {
        self.output.push_str(key);
        self.output.push_str(": ");
        value.serialize(ValueSerializer(self))?;
        self.output.push('\n');
        Ok(())
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl<'a> ser::SerializeMap for &'a mut Serializer {
    type Ok = ();
    type Error = Error;

    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Result<()> {
        key.serialize(ValueSerializer(self))?;
        self.output.push_str(": ");
        Ok(())
    }

    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<()> {
        value.serialize(ValueSerializer(self))?;
        self.output.push('\n');
        Ok(())
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}
