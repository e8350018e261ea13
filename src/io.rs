//! Little-endian field helpers for the `.cidx` on-disk format.
//!
//! Every persisted structure is written as explicit fixed-width fields in a
//! documented order, so the readers and writers here are deliberately dumb:
//! no framing beyond what the format spells out, and every short read is an
//! error.

use std::io::{Read, Result, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// A scalar that can be written to and read from the index file.
pub trait LeField: Sized + Copy {
    fn write_le<W: Write>(self, w: &mut W) -> Result<()>;
    fn read_le<R: Read>(r: &mut R) -> Result<Self>;
}

macro_rules! impl_le_field {
    ($($t:ty => $wr:ident, $rd:ident);* $(;)?) => {$(
        impl LeField for $t {
            #[inline]
            fn write_le<W: Write>(self, w: &mut W) -> Result<()> {
                w.$wr::<LittleEndian>(self)
            }
            #[inline]
            fn read_le<R: Read>(r: &mut R) -> Result<Self> {
                r.$rd::<LittleEndian>()
            }
        }
    )*};
}

impl_le_field! {
    u16 => write_u16, read_u16;
    u32 => write_u32, read_u32;
    u64 => write_u64, read_u64;
    f32 => write_f32, read_f32;
}

impl LeField for u8 {
    #[inline]
    fn write_le<W: Write>(self, w: &mut W) -> Result<()> {
        w.write_u8(self)
    }
    #[inline]
    fn read_le<R: Read>(r: &mut R) -> Result<Self> {
        r.read_u8()
    }
}

pub fn write_slice<W: Write, T: LeField>(w: &mut W, data: &[T]) -> Result<()> {
    for &v in data {
        v.write_le(w)?;
    }
    Ok(())
}

pub fn read_vec<R: Read, T: LeField>(r: &mut R, n: usize) -> Result<Vec<T>> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(T::read_le(r)?);
    }
    Ok(out)
}

/// String table framing: count, per-entry lengths, then the concatenated
/// bytes of every entry.
pub fn write_str_table<W: Write>(w: &mut W, names: &[String]) -> Result<()> {
    (names.len() as u64).write_le(w)?;
    for name in names {
        assert!(name.len() <= u16::MAX as usize, "header too long for the name table");
        (name.len() as u16).write_le(w)?;
    }
    for name in names {
        w.write_all(name.as_bytes())?;
    }
    Ok(())
}

pub fn read_str_table<R: Read>(r: &mut R) -> Result<Vec<String>> {
    let n = u64::read_le(r)? as usize;
    let lens: Vec<u16> = read_vec(r, n)?;
    let mut names = Vec::with_capacity(n);
    for &len in &lens {
        let mut buf = vec![0u8; len as usize];
        r.read_exact(&mut buf)?;
        names.push(String::from_utf8_lossy(&buf).into_owned());
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trip() {
        let mut buf = Vec::new();
        0xdead_beefu32.write_le(&mut buf).unwrap();
        0x0123_4567_89ab_cdefu64.write_le(&mut buf).unwrap();
        1.5f32.write_le(&mut buf).unwrap();
        assert_eq!(buf.len(), 4 + 8 + 4);
        let mut r = buf.as_slice();
        assert_eq!(u32::read_le(&mut r).unwrap(), 0xdead_beef);
        assert_eq!(u64::read_le(&mut r).unwrap(), 0x0123_4567_89ab_cdef);
        assert_eq!(f32::read_le(&mut r).unwrap(), 1.5);
    }

    #[test]
    fn str_table_round_trip() {
        let names = vec!["chr1+".to_string(), String::new(), "a very long header with spaces".to_string()];
        let mut buf = Vec::new();
        write_str_table(&mut buf, &names).unwrap();
        let back = read_str_table(&mut buf.as_slice()).unwrap();
        assert_eq!(names, back);
    }

    #[test]
    fn truncated_table_is_an_error() {
        let mut buf = Vec::new();
        write_str_table(&mut buf, &["chr1".to_string()]).unwrap();
        buf.truncate(buf.len() - 2);
        assert!(read_str_table(&mut buf.as_slice()).is_err());
    }
}
