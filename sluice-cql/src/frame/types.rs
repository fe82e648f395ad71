//! Notation types of the native protocol: `[short]`, `[int]`, `[string]`, `[bytes]` and
//! the collections built from them.
//!
//! Readers advance the given slice past what they consumed. Writers fail only when a
//! length does not fit in its prefix.

use std::collections::HashMap;
use std::convert::TryFrom;
use std::num::TryFromIntError;

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, Bytes};
use uuid::Uuid;

use super::frame_errors::LowLevelDeserializationError;
use super::TryFromPrimitiveError;

type ReadResult<T> = Result<T, LowLevelDeserializationError>;

/// Consistency level of a request.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum Consistency {
    Any = 0x0000,
    One = 0x0001,
    Two = 0x0002,
    Three = 0x0003,
    Quorum = 0x0004,
    All = 0x0005,
    #[default]
    LocalQuorum = 0x0006,
    EachQuorum = 0x0007,
    Serial = 0x0008,
    LocalSerial = 0x0009,
    LocalOne = 0x000A,
}

impl Consistency {
    const ALL: [Consistency; 11] = [
        Consistency::Any,
        Consistency::One,
        Consistency::Two,
        Consistency::Three,
        Consistency::Quorum,
        Consistency::All,
        Consistency::LocalQuorum,
        Consistency::EachQuorum,
        Consistency::Serial,
        Consistency::LocalSerial,
        Consistency::LocalOne,
    ];

    /// The serial counterpart, for `Serial` and `LocalSerial` only.
    pub fn as_serial(self) -> Option<SerialConsistency> {
        match self {
            Consistency::Serial => Some(SerialConsistency::Serial),
            Consistency::LocalSerial => Some(SerialConsistency::LocalSerial),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Consistency::Any => "ANY",
            Consistency::One => "ONE",
            Consistency::Two => "TWO",
            Consistency::Three => "THREE",
            Consistency::Quorum => "QUORUM",
            Consistency::All => "ALL",
            Consistency::LocalQuorum => "LOCAL_QUORUM",
            Consistency::EachQuorum => "EACH_QUORUM",
            Consistency::Serial => "SERIAL",
            Consistency::LocalSerial => "LOCAL_SERIAL",
            Consistency::LocalOne => "LOCAL_ONE",
        }
    }
}

impl TryFrom<u16> for Consistency {
    type Error = TryFromPrimitiveError<u16>;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|consistency| *consistency as u16 == value)
            .ok_or(TryFromPrimitiveError {
                enum_name: "Consistency",
                primitive: value,
            })
    }
}

impl std::fmt::Display for Consistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Consistency level of the Paxos phase of a conditional request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum SerialConsistency {
    Serial = 0x0008,
    LocalSerial = 0x0009,
}

impl From<SerialConsistency> for Consistency {
    fn from(serial: SerialConsistency) -> Self {
        match serial {
            SerialConsistency::Serial => Consistency::Serial,
            SerialConsistency::LocalSerial => Consistency::LocalSerial,
        }
    }
}

impl std::fmt::Display for SerialConsistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Consistency::from(*self).fmt(f)
    }
}

/// Splits `count` bytes off the front of `buf`.
pub(crate) fn read_raw_bytes<'a>(count: usize, buf: &mut &'a [u8]) -> ReadResult<&'a [u8]> {
    if buf.len() < count {
        return Err(LowLevelDeserializationError::TooFewBytesReceived {
            expected: count,
            received: buf.len(),
        });
    }
    let (head, rest) = buf.split_at(count);
    *buf = rest;
    Ok(head)
}

// [short] and [int]

pub fn read_short(buf: &mut &[u8]) -> Result<u16, std::io::Error> {
    buf.read_u16::<BigEndian>()
}

pub fn write_short(v: u16, buf: &mut impl BufMut) {
    buf.put_u16(v);
}

pub fn read_int(buf: &mut &[u8]) -> Result<i32, std::io::Error> {
    buf.read_i32::<BigEndian>()
}

pub fn write_int(v: i32, buf: &mut impl BufMut) {
    buf.put_i32(v);
}

pub fn read_long(buf: &mut &[u8]) -> Result<i64, std::io::Error> {
    buf.read_i64::<BigEndian>()
}

pub fn write_long(v: i64, buf: &mut impl BufMut) {
    buf.put_i64(v);
}

/// Reads an `[int]` that must be a non-negative length.
pub fn read_int_length(buf: &mut &[u8]) -> ReadResult<usize> {
    Ok(usize::try_from(read_int(buf)?)?)
}

fn read_short_length(buf: &mut &[u8]) -> ReadResult<usize> {
    Ok(usize::from(read_short(buf)?))
}

fn write_int_length(len: usize, buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    write_int(i32::try_from(len)?, buf);
    Ok(())
}

fn write_short_length(len: usize, buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    write_short(u16::try_from(len)?, buf);
    Ok(())
}

// [bytes]

/// Reads `[bytes]`; a negative length stands for null.
pub fn read_bytes_opt<'a>(buf: &mut &'a [u8]) -> ReadResult<Option<&'a [u8]>> {
    match read_int(buf)? {
        len if len < 0 => Ok(None),
        len => read_raw_bytes(len as usize, buf).map(Some),
    }
}

/// Reads `[bytes]` that may not be null.
pub fn read_bytes<'a>(buf: &mut &'a [u8]) -> ReadResult<&'a [u8]> {
    let len = read_int_length(buf)?;
    read_raw_bytes(len, buf)
}

pub fn write_bytes(v: &[u8], buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    write_int_length(v.len(), buf)?;
    buf.put_slice(v);
    Ok(())
}

pub fn write_bytes_opt(
    v: Option<impl AsRef<[u8]>>,
    buf: &mut impl BufMut,
) -> Result<(), TryFromIntError> {
    match v {
        Some(v) => write_bytes(v.as_ref(), buf),
        None => {
            write_int(-1, buf);
            Ok(())
        }
    }
}

// [string] and [long string]

pub fn read_string<'a>(buf: &mut &'a [u8]) -> ReadResult<&'a str> {
    let len = read_short_length(buf)?;
    Ok(std::str::from_utf8(read_raw_bytes(len, buf)?)?)
}

pub fn write_string(v: &str, buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    write_short_length(v.len(), buf)?;
    buf.put_slice(v.as_bytes());
    Ok(())
}

pub fn read_long_string<'a>(buf: &mut &'a [u8]) -> ReadResult<&'a str> {
    let len = read_int_length(buf)?;
    Ok(std::str::from_utf8(read_raw_bytes(len, buf)?)?)
}

pub fn write_long_string(v: &str, buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    write_int_length(v.len(), buf)?;
    buf.put_slice(v.as_bytes());
    Ok(())
}

// Collections are a [short] count followed by the entries.

fn read_entries<T>(
    buf: &mut &[u8],
    mut read_entry: impl FnMut(&mut &[u8]) -> ReadResult<T>,
) -> ReadResult<Vec<T>> {
    let count = read_short_length(buf)?;
    (0..count).map(|_| read_entry(buf)).collect()
}

fn write_entries<T, B: BufMut>(
    entries: impl ExactSizeIterator<Item = T>,
    buf: &mut B,
    mut write_entry: impl FnMut(T, &mut B) -> Result<(), TryFromIntError>,
) -> Result<(), TryFromIntError> {
    write_short_length(entries.len(), buf)?;
    entries.into_iter().try_for_each(|entry| write_entry(entry, buf))
}

pub fn read_string_list(buf: &mut &[u8]) -> ReadResult<Vec<String>> {
    read_entries(buf, |buf| Ok(read_string(buf)?.to_owned()))
}

pub fn write_string_list(v: &[String], buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    write_entries(v.iter(), buf, |item, buf| write_string(item, buf))
}

pub fn read_string_map(buf: &mut &[u8]) -> ReadResult<HashMap<String, String>> {
    let entries = read_entries(buf, |buf| {
        Ok((read_string(buf)?.to_owned(), read_string(buf)?.to_owned()))
    })?;
    Ok(entries.into_iter().collect())
}

pub fn write_string_map(
    v: &HashMap<impl AsRef<str>, impl AsRef<str>>,
    buf: &mut impl BufMut,
) -> Result<(), TryFromIntError> {
    write_entries(v.iter(), buf, |(key, value), buf| {
        write_string(key.as_ref(), buf)?;
        write_string(value.as_ref(), buf)
    })
}

pub fn read_string_multimap(buf: &mut &[u8]) -> ReadResult<HashMap<String, Vec<String>>> {
    let entries = read_entries(buf, |buf| {
        Ok((read_string(buf)?.to_owned(), read_string_list(buf)?))
    })?;
    Ok(entries.into_iter().collect())
}

pub fn write_string_multimap(
    v: &HashMap<String, Vec<String>>,
    buf: &mut impl BufMut,
) -> Result<(), TryFromIntError> {
    write_entries(v.iter(), buf, |(key, values), buf| {
        write_string(key, buf)?;
        write_string_list(values, buf)
    })
}

/// Reads a custom payload: a `[bytes map]`.
pub fn read_bytes_map(buf: &mut &[u8]) -> ReadResult<HashMap<String, Bytes>> {
    let entries = read_entries(buf, |buf| {
        let key = read_string(buf)?.to_owned();
        Ok((key, Bytes::copy_from_slice(read_bytes(buf)?)))
    })?;
    Ok(entries.into_iter().collect())
}

pub fn write_bytes_map<B: AsRef<[u8]>>(
    v: &HashMap<String, B>,
    buf: &mut impl BufMut,
) -> Result<(), TryFromIntError> {
    write_entries(v.iter(), buf, |(key, value), buf| {
        write_string(key, buf)?;
        write_bytes(value.as_ref(), buf)
    })
}

// [uuid] and [consistency]

pub fn read_uuid(buf: &mut &[u8]) -> ReadResult<Uuid> {
    let raw: [u8; 16] = read_raw_bytes(16, buf)?.try_into()?;
    Ok(Uuid::from_bytes(raw))
}

pub fn write_uuid(uuid: &Uuid, buf: &mut impl BufMut) {
    buf.put_slice(uuid.as_bytes());
}

pub fn read_consistency(buf: &mut &[u8]) -> ReadResult<Consistency> {
    Ok(Consistency::try_from(read_short(buf)?)?)
}

pub fn write_consistency(c: Consistency, buf: &mut impl BufMut) {
    write_short(c as u16, buf);
}

pub fn write_serial_consistency(c: SerialConsistency, buf: &mut impl BufMut) {
    write_short(c as u16, buf);
}
