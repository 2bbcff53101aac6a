//! `#[serde(with = "serde_addr")]` for addresses: written as `"0x7f..."`
//! strings, which is how everyone reads them in a report. Plain integers are
//! accepted back too.

use std::{fmt, marker::PhantomData};

use serde::{de::Visitor, Deserializer, Serializer};

pub trait AsAddr: Copy {
    fn as_addr(self) -> usize;
}

pub trait FromAddr: Copy {
    fn from_addr(value: usize) -> Self;
}

impl AsAddr for usize {
    fn as_addr(self) -> usize {
        self
    }
}

impl FromAddr for usize {
    fn from_addr(value: usize) -> Self {
        value
    }
}

impl<T> AsAddr for *const T {
    fn as_addr(self) -> usize {
        self as usize
    }
}

impl<T> FromAddr for *const T {
    fn from_addr(value: usize) -> Self {
        value as Self
    }
}

pub fn serialize<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: AsAddr,
{
    serializer.collect_str(&format_args!("{:#x}", value.as_addr()))
}

pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromAddr,
{
    struct V<Addr>(PhantomData<Addr>);

    impl<'de, Addr> Visitor<'de> for V<Addr>
    where
        Addr: FromAddr,
    {
        type Value = Addr;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("an address, as a hex string or an integer")
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(Addr::from_addr(v as usize))
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            let digits = v.trim_start_matches("0x").trim_start_matches("0X");
            usize::from_str_radix(digits, 16)
                .map(Addr::from_addr)
                .map_err(|_| E::invalid_value(serde::de::Unexpected::Str(v), &self))
        }
    }

    deserializer.deserialize_any(V::<T>(PhantomData))
}
